//! Transport
//!
//! The capability interface every tunnel implementation is adapted to.
//! The pump never asks whether a transport is present: when nothing
//! active can be found it gets an [`InertTransport`].
//!
//! # Contract
//!
//! - `start` registers the inbound packet sink and the log sink
//! - `send` is fire-and-forget; failures are logged by the caller
//! - `stop` is idempotent and guarantees no sink invocation after it returns
//!
//! The packet sink may be invoked concurrently with `send`, with `stop`
//! and with itself.

use crate::config::TunnelConfig;
use crate::packet::Packet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

/// Inbound channel from the transport into the pump
pub type PacketSink = Arc<dyn Fn(Packet) + Send + Sync>;

/// Free-text diagnostics from the transport
pub type LogSink = Arc<dyn Fn(&str) + Send + Sync>;

/// A pluggable tunnel implementation
pub trait Transport: Send + Sync {
    /// Short name for logs and status
    fn name(&self) -> &str;

    /// Start the transport with the session parameters
    fn start(
        &self,
        config: &TunnelConfig,
        on_packet: PacketSink,
        on_log: LogSink,
    ) -> Result<(), TransportError>;

    /// Hand one outbound packet to the transport
    fn send(&self, packet: Packet) -> Result<(), TransportError>;

    /// Stop the transport and release its resources
    fn stop(&self);

    /// Whether this is the no-op stand-in
    fn is_inert(&self) -> bool {
        false
    }
}

/// Guards sink delivery so nothing is delivered once the gate closes.
///
/// Deliveries hold the read side; `close` takes the write side, so it
/// returns only after every in-flight delivery has finished.
#[derive(Default)]
pub struct DeliveryGate {
    sinks: RwLock<Option<(PacketSink, LogSink)>>,
}

impl DeliveryGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install sinks and open the gate
    pub fn open(&self, on_packet: PacketSink, on_log: LogSink) {
        *self.sinks.write().unwrap_or_else(PoisonError::into_inner) = Some((on_packet, on_log));
    }

    /// Drop the sinks, waiting for in-flight deliveries. Returns whether
    /// the gate was open.
    pub fn close(&self) -> bool {
        self.sinks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some()
    }

    pub fn is_open(&self) -> bool {
        self.sinks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Deliver an inbound packet. Returns false if the gate is closed.
    pub fn deliver(&self, packet: Packet) -> bool {
        let guard = self.sinks.read().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some((on_packet, _)) => {
                on_packet(packet);
                true
            }
            None => false,
        }
    }

    /// Emit a diagnostic line if the gate is open
    pub fn log(&self, msg: &str) {
        let guard = self.sinks.read().unwrap_or_else(PoisonError::into_inner);
        if let Some((_, on_log)) = guard.as_ref() {
            on_log(msg);
        }
    }
}

/// No-op transport used when nothing active is available
///
/// Accepts every call and only emits diagnostics.
#[derive(Default)]
pub struct InertTransport {
    running: AtomicBool,
    gate: DeliveryGate,
    sent: AtomicU64,
}

impl InertTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets accepted (and discarded) since creation
    pub fn packets_sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

impl Transport for InertTransport {
    fn name(&self) -> &str {
        "inert"
    }

    fn start(
        &self,
        config: &TunnelConfig,
        on_packet: PacketSink,
        on_log: LogSink,
    ) -> Result<(), TransportError> {
        self.gate.open(on_packet, on_log);
        self.running.store(true, Ordering::Release);
        self.gate.log(&format!(
            "inert start: domain={} dns={}",
            config.domain, config.dns_server
        ));
        Ok(())
    }

    fn send(&self, packet: Packet) -> Result<(), TransportError> {
        if !self.running.load(Ordering::Acquire) {
            return Ok(());
        }
        self.sent.fetch_add(1, Ordering::Relaxed);
        self.gate.log(&format!("inert send: size={}", packet.len()));
        Ok(())
    }

    fn stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.gate.log("inert stop");
        self.gate.close();
    }

    fn is_inert(&self) -> bool {
        true
    }
}

/// Active transport that echoes every packet straight back
///
/// Exercises the full relay path without a network.
#[derive(Default)]
pub struct LoopbackTransport {
    gate: DeliveryGate,
    echoed: AtomicU64,
}

impl LoopbackTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Packets echoed since creation
    pub fn packets_echoed(&self) -> u64 {
        self.echoed.load(Ordering::Relaxed)
    }
}

impl Transport for LoopbackTransport {
    fn name(&self) -> &str {
        "loopback"
    }

    fn start(
        &self,
        config: &TunnelConfig,
        on_packet: PacketSink,
        on_log: LogSink,
    ) -> Result<(), TransportError> {
        if self.gate.is_open() {
            return Err(TransportError::StartFailed("loopback already started".into()));
        }
        self.gate.open(on_packet, on_log);
        self.gate.log(&format!("loopback start: domain={}", config.domain));
        Ok(())
    }

    fn send(&self, packet: Packet) -> Result<(), TransportError> {
        if self.gate.deliver(packet) {
            self.echoed.fetch_add(1, Ordering::Relaxed);
            Ok(())
        } else {
            Err(TransportError::NotStarted)
        }
    }

    fn stop(&self) {
        if self.gate.is_open() {
            self.gate.log("loopback stop");
        }
        self.gate.close();
    }
}

/// Transport errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("Transport start failed: {0}")]
    StartFailed(String),

    #[error("Transport send failed: {0}")]
    SendFailed(String),

    #[error("Transport not started")]
    NotStarted,

    #[error("Transport library error: {0}")]
    Library(String),
}
