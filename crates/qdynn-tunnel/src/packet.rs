//! Raw IP packets moving between the interface and the transport.

use std::fmt;

/// An immutable IP packet.
///
/// Ownership moves from producer to consumer; the bytes are never
/// mutated after creation.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Packet {
    data: Box<[u8]>,
}

impl Packet {
    /// Create a packet from owned bytes
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data: data.into_boxed_slice(),
        }
    }

    /// The zero-length packet (liveness probe from the interface)
    pub fn empty() -> Self {
        Self::default()
    }

    /// Packet bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Logical length
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Take the bytes back
    pub fn into_vec(self) -> Vec<u8> {
        self.data.into_vec()
    }
}

impl From<Vec<u8>> for Packet {
    fn from(data: Vec<u8>) -> Self {
        Self::new(data)
    }
}

impl From<&[u8]> for Packet {
    fn from(data: &[u8]) -> Self {
        Self::new(data.to_vec())
    }
}

impl AsRef<[u8]> for Packet {
    fn as_ref(&self) -> &[u8] {
        &self.data
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet").field("len", &self.data.len()).finish()
    }
}
