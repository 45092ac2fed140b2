//! Bounded inbound packet queue.
//!
//! Producers are the transport's packet sink (possibly several threads at
//! once); the single consumer is the pump's inbound worker. When full, the
//! newest packet is dropped and counted.

use crate::packet::Packet;
use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Default capacity (packets)
pub const DEFAULT_CAPACITY: usize = 1024;

/// Bounded FIFO with drop-newest overflow
pub struct InboundQueue {
    tx: Sender<Packet>,
    rx: Receiver<Packet>,
    dropped: AtomicU64,
}

impl InboundQueue {
    /// Create a queue holding at most `capacity` packets
    pub fn new(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity.max(1));
        Self {
            tx,
            rx,
            dropped: AtomicU64::new(0),
        }
    }

    /// Offer a packet without blocking. Returns false if it was dropped.
    pub fn offer(&self, packet: Packet) -> bool {
        match self.tx.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) | Err(TrySendError::Disconnected(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Wait up to `timeout` for the oldest packet
    pub fn poll(&self, timeout: Duration) -> Option<Packet> {
        match self.rx.recv_timeout(timeout) {
            Ok(packet) => Some(packet),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Discard everything queued. Returns how many packets were discarded.
    pub fn clear(&self) -> usize {
        self.rx.try_iter().count()
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.rx.capacity().unwrap_or(DEFAULT_CAPACITY)
    }

    /// Packets dropped because the queue was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl Default for InboundQueue {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
