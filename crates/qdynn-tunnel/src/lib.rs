//! qdynn tunnel - Packet pump between a virtual interface and a DNS tunnel
//!
//! Relays raw IP packets between the host's virtual network interface
//! and a pluggable tunnel transport, and manages the session lifecycle
//! around that relay.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                    SessionController                        │
//! │                                                             │
//! │  ┌───────────────┐   outbound worker   ┌────────────────┐  │
//! │  │   Virtual     │────────────────────▶│   Transport    │  │
//! │  │  Interface    │                     │ (native/inert/ │  │
//! │  │  (tun fd)     │◀──── inbound ───────│   loopback)    │  │
//! │  └───────────────┘   worker + queue    └────────────────┘  │
//! │                                                             │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Features
//!
//! - **One thread per direction**: blocking reads never stall the other side
//! - **Bounded inbound queue**: drops newest under pressure, counts drops
//! - **Capability discovery**: runs inert when no transport library is present
//! - **Single teardown**: stop is safe from any thread, any number of times

mod config;
mod interface;
mod locator;
mod native;
mod packet;
mod pump;
mod queue;
mod session;
mod transport;

#[cfg(test)]
mod testing;

pub use config::{
    Cidr, ConfigError, InterfaceSpec, PumpSettings, Secret, TransportKind, TransportSettings,
    TunnelConfig, DEFAULT_MTU, DEFAULT_ROUTE, LOCAL_ADDRESS, MAX_WAIT_MS, MIN_MTU, SESSION_NAME,
};
pub use interface::{FdInterface, InheritedFdBuilder, InterfaceBuilder, InterfaceError, VirtualInterface};
pub use locator::{FactoryProbe, NativeLibraryProbe, TransportLocator, TransportProbe};
pub use native::{NativeTransport, DEFAULT_LIBRARY_NAME};
pub use packet::Packet;
pub use pump::{Direction, ExitCause, PacketPump, PumpError, PumpState, PumpStats, WorkerExit};
pub use queue::{InboundQueue, DEFAULT_CAPACITY};
pub use session::{
    SessionController, SessionError, SessionInfo, SessionStatus, StopOutcome, StopReason,
    REVOKED_REASON,
};
pub use transport::{
    DeliveryGate, InertTransport, LogSink, LoopbackTransport, PacketSink, Transport, TransportError,
};
