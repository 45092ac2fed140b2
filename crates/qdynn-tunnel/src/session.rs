//! Session Controller
//!
//! Owns the single live tunnel session: validates configuration, opens
//! the interface, binds and starts a transport, starts the pump, and
//! tears everything down again.
//!
//! # Usage
//!
//! ```rust,ignore
//! let controller = SessionController::new(builder);
//! controller.start(TunnelConfig::new("t.example.com", "secret", "9.9.9.9"))?;
//!
//! // From the UI, an OS revocation callback or process teardown:
//! controller.stop(StopReason::User);
//! ```
//!
//! # Teardown
//!
//! `stop` may be called concurrently and reentrantly from any trigger.
//! Only one teardown runs at a time; every other caller gets
//! [`StopOutcome::AlreadyStopped`]. A worker fault inside the pump is
//! turned into a teardown of exactly the session it belongs to.

use crate::config::{ConfigError, TunnelConfig};
use crate::interface::{InterfaceBuilder, VirtualInterface};
use crate::locator::TransportLocator;
use crate::pump::{ExitCause, PacketPump, PumpError, PumpStats, WorkerExit};
use crate::transport::{LogSink, Transport, TransportError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Failure reason published when the OS takes the interface away
pub const REVOKED_REASON: &str = "virtual interface revoked by the system";

/// Session status as seen by presentation layers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "lowercase")]
pub enum SessionStatus {
    /// No session
    Disconnected,
    /// Start in progress
    Connecting,
    /// Session relaying packets
    Connected,
    /// Teardown in progress
    Disconnecting,
    /// Disconnected after a failure
    Failed(String),
}

impl SessionStatus {
    /// Check if the tunnel is usable
    pub fn is_connected(&self) -> bool {
        matches!(self, SessionStatus::Connected)
    }

    /// Check if the session ended in a failure
    pub fn is_failed(&self) -> bool {
        matches!(self, SessionStatus::Failed(_))
    }

    /// Check if no session is live (terminal state)
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Disconnected | SessionStatus::Failed(_))
    }

    /// Failure reason, if any
    pub fn reason(&self) -> Option<&str> {
        match self {
            SessionStatus::Failed(reason) => Some(reason),
            _ => None,
        }
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionStatus::Disconnected => f.write_str("disconnected"),
            SessionStatus::Connecting => f.write_str("connecting"),
            SessionStatus::Connected => f.write_str("connected"),
            SessionStatus::Disconnecting => f.write_str("disconnecting"),
            SessionStatus::Failed(reason) => write!(f, "failed: {}", reason),
        }
    }
}

/// What triggered a teardown
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// Explicit user request
    User,
    /// The OS revoked the virtual interface
    Revoked,
    /// Process is going away
    ProcessExit,
    /// A newer session is starting
    Replaced,
    /// A pump worker died
    Fault,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::User => "user request",
            StopReason::Revoked => "revoked by the system",
            StopReason::ProcessExit => "process exit",
            StopReason::Replaced => "replaced by a new session",
            StopReason::Fault => "worker fault",
        };
        f.write_str(s)
    }
}

/// Result of a stop request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// This call tore the session down
    Stopped,
    /// Nothing to do, or another teardown is already running
    AlreadyStopped,
}

/// Session snapshot for status queries
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub id: Option<u64>,
    pub status: SessionStatus,
    pub domain: Option<String>,
    pub dns_server: Option<String>,
    pub transport: Option<String>,
    pub inert_transport: bool,
    pub connected_for: Option<Duration>,
    pub stats: PumpStats,
}

/// Session errors
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(#[from] ConfigError),

    #[error("Virtual interface unavailable: {0}")]
    InterfaceUnavailable(String),

    #[error("Transport failed to start: {0}")]
    TransportStartFailure(#[from] TransportError),

    #[error("Packet pump error: {0}")]
    Pump(#[from] PumpError),
}

/// The live session
struct Session {
    id: u64,
    interface: Arc<dyn VirtualInterface>,
    transport: Arc<dyn Transport>,
    pump: Arc<PacketPump>,
}

/// What status queries see of the live session
struct Published {
    id: u64,
    config: Arc<TunnelConfig>,
    transport: String,
    inert: bool,
    started_at: Instant,
    pump: Arc<PacketPump>,
}

/// Lifecycle owner for the single tunnel session
pub struct SessionController {
    me: Weak<SessionController>,
    builder: Arc<dyn InterfaceBuilder>,
    /// Fixed locator; `None` builds one from each session's config
    locator: Option<TransportLocator>,
    session: Mutex<Option<Session>>,
    published: RwLock<Option<Published>>,
    tearing_down: AtomicBool,
    next_id: AtomicU64,
    status: RwLock<SessionStatus>,
    watchers: Mutex<Vec<Sender<SessionStatus>>>,
    last_stats: Mutex<PumpStats>,
}

impl SessionController {
    /// Create a controller that picks transports from each session's config
    pub fn new(builder: Arc<dyn InterfaceBuilder>) -> Arc<Self> {
        Self::build(builder, None)
    }

    /// Create a controller with a fixed transport locator
    pub fn with_locator(builder: Arc<dyn InterfaceBuilder>, locator: TransportLocator) -> Arc<Self> {
        Self::build(builder, Some(locator))
    }

    fn build(builder: Arc<dyn InterfaceBuilder>, locator: Option<TransportLocator>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            builder,
            locator,
            session: Mutex::new(None),
            published: RwLock::new(None),
            tearing_down: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            status: RwLock::new(SessionStatus::Disconnected),
            watchers: Mutex::new(Vec::new()),
            last_stats: Mutex::new(PumpStats::default()),
        })
    }

    /// Current status
    pub fn status(&self) -> SessionStatus {
        self.status
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Receive every status change from now on
    pub fn subscribe(&self) -> Receiver<SessionStatus> {
        let (tx, rx) = unbounded();
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Whether a session is published as active
    pub fn is_active(&self) -> bool {
        self.published
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Snapshot of the live session (or the last one's statistics)
    pub fn info(&self) -> SessionInfo {
        let status = self.status();
        let published = self.published.read().unwrap_or_else(PoisonError::into_inner);
        match published.as_ref() {
            Some(p) => SessionInfo {
                id: Some(p.id),
                status,
                domain: Some(p.config.domain.clone()),
                dns_server: Some(p.config.dns_server.clone()),
                transport: Some(p.transport.clone()),
                inert_transport: p.inert,
                connected_for: Some(p.started_at.elapsed()),
                stats: p.pump.stats(),
            },
            None => SessionInfo {
                id: None,
                status,
                domain: None,
                dns_server: None,
                transport: None,
                inert_transport: false,
                connected_for: None,
                stats: *self.last_stats.lock().unwrap_or_else(PoisonError::into_inner),
            },
        }
    }

    /// Start a new session, replacing any existing one.
    ///
    /// Returns the new session's id.
    pub fn start(&self, config: TunnelConfig) -> Result<u64, SessionError> {
        config.validate()?;
        let spec = config.interface_spec()?;
        let config = Arc::new(config);

        let mut slot = self.lock_session();
        if let Some(previous) = slot.take() {
            info!("Replacing active session {}", previous.id);
            self.teardown(previous, StopReason::Replaced, None);
        }

        info!(
            "Starting session: domain={} dns={} mtu={}",
            config.domain, config.dns_server, config.mtu
        );
        self.publish(SessionStatus::Connecting);

        let interface = match self.builder.establish(&spec) {
            Ok(interface) => interface,
            Err(e) => {
                error!("Failed to establish virtual interface: {}", e);
                self.publish(SessionStatus::Failed(e.to_string()));
                return Err(SessionError::InterfaceUnavailable(e.to_string()));
            }
        };

        let transport = match &self.locator {
            Some(locator) => locator.locate(),
            None => TransportLocator::from_settings(&config.transport).locate(),
        };
        let pump = Arc::new(PacketPump::new(config.pump.clone()));

        if let Err(e) = transport.start(&config, pump.inbound_sink(), log_sink(transport.name())) {
            error!("Transport {} failed to start: {}", transport.name(), e);
            interface.close();
            self.publish(SessionStatus::Failed(e.to_string()));
            return Err(SessionError::TransportStartFailure(e));
        }

        if let Err(e) = pump.start(Arc::clone(&interface), Arc::clone(&transport)) {
            error!("Packet pump failed to start: {}", e);
            transport.stop();
            interface.close();
            self.publish(SessionStatus::Failed(e.to_string()));
            return Err(SessionError::Pump(e));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let session = Session {
            id,
            interface,
            transport,
            pump,
        };

        if let Err(e) = self.spawn_supervisor(id, session.pump.exits()) {
            error!("Failed to spawn session supervisor: {}", e);
            self.teardown(session, StopReason::Fault, Some(e.to_string()));
            return Err(SessionError::Pump(PumpError::Spawn(e.to_string())));
        }

        *self.published.write().unwrap_or_else(PoisonError::into_inner) = Some(Published {
            id,
            config: Arc::clone(&config),
            transport: session.transport.name().to_string(),
            inert: session.transport.is_inert(),
            started_at: Instant::now(),
            pump: Arc::clone(&session.pump),
        });

        info!(
            "Session {} connected via {} transport",
            id,
            session.transport.name()
        );
        *slot = Some(session);
        self.publish(SessionStatus::Connected);
        Ok(id)
    }

    /// Stop the session
    pub fn stop(&self, reason: StopReason) -> StopOutcome {
        self.shutdown(None, reason, None)
    }

    /// The OS revoked the interface
    pub fn revoke(&self) -> StopOutcome {
        warn!("Virtual interface revoked by the system");
        self.shutdown(None, StopReason::Revoked, None)
    }

    /// Tear down the session (only session `only`, if given)
    fn shutdown(&self, only: Option<u64>, reason: StopReason, failure: Option<String>) -> StopOutcome {
        if self
            .tearing_down
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            debug!("Teardown already in progress ({})", reason);
            return StopOutcome::AlreadyStopped;
        }

        let outcome = {
            let mut slot = self.lock_session();
            let current = match (slot.as_ref(), only) {
                (Some(session), Some(id)) => session.id == id,
                (Some(_), None) => true,
                (None, _) => false,
            };
            match slot.take() {
                Some(session) if current => {
                    self.teardown(session, reason, failure);
                    StopOutcome::Stopped
                }
                other => {
                    *slot = other;
                    StopOutcome::AlreadyStopped
                }
            }
        };

        self.tearing_down.store(false, Ordering::Release);
        outcome
    }

    /// Pump, transport, interface, published session; each step best-effort
    fn teardown(&self, session: Session, reason: StopReason, failure: Option<String>) {
        info!("Stopping session {} ({})", session.id, reason);
        self.publish(SessionStatus::Disconnecting);

        best_effort("stop packet pump", || {
            session.pump.stop();
        });
        best_effort("stop transport", || session.transport.stop());
        best_effort("close interface", || session.interface.close());

        self.published
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let stats = session.pump.stats();
        *self.last_stats.lock().unwrap_or_else(PoisonError::into_inner) = stats;
        info!("Session {} closed: {}", session.id, stats.format());

        let status = match (failure, reason) {
            (Some(failure), _) => SessionStatus::Failed(failure),
            (None, StopReason::Revoked) => SessionStatus::Failed(REVOKED_REASON.to_string()),
            (None, _) => SessionStatus::Disconnected,
        };
        self.publish(status);
    }

    fn spawn_supervisor(&self, id: u64, exits: Receiver<WorkerExit>) -> std::io::Result<()> {
        let controller = self.me.clone();
        thread::Builder::new()
            .name(format!("qdynn-session-{}", id))
            .spawn(move || {
                for WorkerExit { direction, cause } in exits.iter() {
                    let ExitCause::Fault(reason) = cause else {
                        continue;
                    };
                    let Some(controller) = controller.upgrade() else {
                        break;
                    };
                    warn!("Session {} lost its {} worker: {}", id, direction, reason);
                    controller.shutdown(Some(id), StopReason::Fault, Some(reason));
                    break;
                }
                debug!("Session {} supervisor exiting", id);
            })?;
        Ok(())
    }

    fn lock_session(&self) -> MutexGuard<'_, Option<Session>> {
        self.session.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, status: SessionStatus) {
        debug!("Session status: {}", status);
        *self.status.write().unwrap_or_else(PoisonError::into_inner) = status.clone();
        self.watchers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|tx| tx.send(status.clone()).is_ok());
    }
}

impl Drop for SessionController {
    fn drop(&mut self) {
        self.shutdown(None, StopReason::ProcessExit, None);
    }
}

fn log_sink(transport: &str) -> LogSink {
    let transport = transport.to_string();
    Arc::new(move |msg: &str| debug!(transport = %transport, "{}", msg))
}

fn best_effort(step: &str, f: impl FnOnce()) {
    if panic::catch_unwind(AssertUnwindSafe(f)).is_err() {
        warn!("Teardown step '{}' panicked, continuing", step);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportKind;
    use crate::locator::FactoryProbe;
    use crate::packet::Packet;
    use crate::testing::{wait_until, MockBuilder, MockInterface, RecordingTransport};
    use std::sync::OnceLock;

    fn config() -> TunnelConfig {
        let mut config = TunnelConfig::new("t.example.com", "p", "9.9.9.9");
        config.pump.poll_interval_ms = 20;
        config.pump.read_probe_ms = 10;
        config
    }

    fn locator_for(transport: Arc<RecordingTransport>) -> TransportLocator {
        TransportLocator::new().with_probe(FactoryProbe::new("recording", move || {
            transport.clone() as Arc<dyn Transport>
        }))
    }

    fn recording_controller() -> (Arc<SessionController>, Arc<MockBuilder>, Arc<RecordingTransport>) {
        let builder = MockBuilder::new();
        let transport = RecordingTransport::new();
        let controller = SessionController::with_locator(builder.clone(), locator_for(transport.clone()));
        (controller, builder, transport)
    }

    #[test]
    fn test_start_configures_interface() {
        let (controller, builder, _transport) = recording_controller();

        controller.start(config()).unwrap();

        let (spec, _) = builder.last().unwrap();
        assert_eq!(spec.address.to_string(), "10.0.0.2/32");
        assert_eq!(spec.route.to_string(), "0.0.0.0/0");
        assert_eq!(spec.dns.to_string(), "9.9.9.9");
        assert_eq!(spec.mtu, 1500);
        assert!(controller.status().is_connected());
        assert!(controller.is_active());

        controller.stop(StopReason::User);
    }

    #[test]
    fn test_start_then_stop_releases_everything() {
        let (controller, builder, transport) = recording_controller();

        controller.start(config()).unwrap();
        assert_eq!(controller.stop(StopReason::User), StopOutcome::Stopped);

        let (_, interface) = builder.last().unwrap();
        assert!(interface.is_closed());
        assert!(!transport.is_running());
        assert!(!transport.push(Packet::from(vec![1u8])));
        assert!(interface.written().is_empty());
        assert_eq!(controller.status(), SessionStatus::Disconnected);
        assert!(!controller.is_active());
    }

    #[test]
    fn test_empty_password_rejected() {
        let (controller, builder, transport) = recording_controller();
        let mut config = config();
        config.password = crate::config::Secret::new("");

        let err = controller.start(config).unwrap_err();
        assert!(matches!(err, SessionError::InvalidConfig(ConfigError::MissingField("password"))));
        assert_eq!(builder.establish_calls(), 0);
        assert_eq!(transport.start_calls(), 0);
        assert_eq!(controller.status(), SessionStatus::Disconnected);
    }

    #[test]
    fn test_interface_unavailable() {
        let builder = MockBuilder::new().unavailable();
        let transport = RecordingTransport::new();
        let controller = SessionController::with_locator(builder.clone(), locator_for(transport.clone()));

        let err = controller.start(config()).unwrap_err();
        assert!(matches!(err, SessionError::InterfaceUnavailable(_)));
        assert_eq!(transport.start_calls(), 0);
        assert!(controller.status().is_failed());
        assert!(!controller.is_active());
    }

    #[test]
    fn test_transport_start_failure_closes_interface() {
        let (controller, builder, transport) = recording_controller();
        transport.refuse_start();

        let err = controller.start(config()).unwrap_err();
        assert!(matches!(err, SessionError::TransportStartFailure(_)));

        let (_, interface) = builder.last().unwrap();
        assert!(interface.is_closed());
        assert!(controller.status().is_failed());
    }

    #[test]
    fn test_inert_fallback() {
        let builder = MockBuilder::new();
        let controller = SessionController::with_locator(builder.clone(), TransportLocator::new());

        controller.start(config()).unwrap();
        let info = controller.info();
        assert!(info.inert_transport);
        assert_eq!(info.transport.as_deref(), Some("inert"));

        let (_, interface) = builder.last().unwrap();
        for i in 0..5u8 {
            interface.inject(Packet::from(vec![i; 20]));
        }
        assert!(wait_until(Duration::from_secs(5), || controller.info().stats.packets_out == 5));
        assert!(controller.status().is_connected());

        controller.stop(StopReason::User);
    }

    #[test]
    fn test_read_failure_tears_session_down() {
        let interface = MockInterface::new();
        interface.fail_reads_after(10);
        for i in 0..10u8 {
            interface.inject(Packet::from(vec![0x45, i]));
        }
        let builder = MockBuilder::new().with_interface(interface.clone());
        let transport = RecordingTransport::new();
        let controller = SessionController::with_locator(builder, locator_for(transport.clone()));

        controller.start(config()).unwrap();

        assert!(wait_until(Duration::from_secs(5), || controller.status().is_failed()));
        assert_eq!(transport.sent().len(), 10);
        assert!(!transport.is_running());
        assert_eq!(transport.stop_calls(), 1);
        assert!(interface.is_closed());
        assert!(!controller.is_active());
        assert_eq!(controller.stop(StopReason::User), StopOutcome::AlreadyStopped);
    }

    #[test]
    fn test_inbound_relay() {
        let (controller, builder, transport) = recording_controller();
        controller.start(config()).unwrap();

        let (_, interface) = builder.last().unwrap();
        let delivered: Vec<Packet> = (0..10u8).map(|i| Packet::from(vec![i; 4])).collect();
        for packet in &delivered {
            assert!(transport.push(packet.clone()));
        }

        assert!(interface.wait_for_written(10, Duration::from_secs(5)));
        assert_eq!(interface.written(), delivered);
        controller.stop(StopReason::User);
    }

    #[test]
    fn test_stop_twice() {
        let (controller, builder, transport) = recording_controller();
        controller.start(config()).unwrap();

        assert_eq!(controller.stop(StopReason::User), StopOutcome::Stopped);
        assert_eq!(controller.stop(StopReason::User), StopOutcome::AlreadyStopped);

        let (_, interface) = builder.last().unwrap();
        assert_eq!(transport.stop_calls(), 1);
        assert_eq!(interface.close_calls(), 1);
    }

    #[test]
    fn test_concurrent_stops_single_teardown() {
        let (controller, builder, transport) = recording_controller();
        controller.start(config()).unwrap();

        let handles: Vec<_> = [StopReason::User, StopReason::Revoked, StopReason::ProcessExit]
            .into_iter()
            .map(|reason| {
                let controller = controller.clone();
                thread::spawn(move || controller.stop(reason))
            })
            .collect();
        let outcomes: Vec<StopOutcome> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        let stopped = outcomes.iter().filter(|o| **o == StopOutcome::Stopped).count();
        assert_eq!(stopped, 1);

        let (_, interface) = builder.last().unwrap();
        assert_eq!(transport.stop_calls(), 1);
        assert_eq!(interface.close_calls(), 1);
        assert!(controller.status().is_terminal());
    }

    /// Calls back into the controller from its own stop
    #[derive(Default)]
    struct ReentrantTransport {
        controller: OnceLock<Weak<SessionController>>,
        inner_outcome: Mutex<Option<StopOutcome>>,
    }

    impl Transport for ReentrantTransport {
        fn name(&self) -> &str {
            "reentrant"
        }

        fn start(
            &self,
            _config: &TunnelConfig,
            _on_packet: crate::transport::PacketSink,
            _on_log: LogSink,
        ) -> Result<(), TransportError> {
            Ok(())
        }

        fn send(&self, _packet: Packet) -> Result<(), TransportError> {
            Ok(())
        }

        fn stop(&self) {
            if let Some(controller) = self.controller.get().and_then(Weak::upgrade) {
                *self.inner_outcome.lock().unwrap() = Some(controller.stop(StopReason::User));
            }
        }
    }

    #[test]
    fn test_reentrant_stop() {
        let transport = Arc::new(ReentrantTransport::default());
        let bound = transport.clone();
        let locator = TransportLocator::new().with_probe(FactoryProbe::new("reentrant", move || {
            bound.clone() as Arc<dyn Transport>
        }));
        let controller = SessionController::with_locator(MockBuilder::new(), locator);
        transport
            .controller
            .set(Arc::downgrade(&controller))
            .unwrap();

        controller.start(config()).unwrap();
        assert_eq!(controller.stop(StopReason::User), StopOutcome::Stopped);
        assert_eq!(
            *transport.inner_outcome.lock().unwrap(),
            Some(StopOutcome::AlreadyStopped)
        );
    }

    #[test]
    fn test_restart_replaces_session() {
        let builder = MockBuilder::new();
        let first = RecordingTransport::new();
        let second = RecordingTransport::new();
        let transports = Mutex::new(vec![second.clone(), first.clone()]);
        let locator = TransportLocator::new().with_probe(FactoryProbe::new("sequence", move || {
            transports.lock().unwrap().pop().unwrap() as Arc<dyn Transport>
        }));
        let controller = SessionController::with_locator(builder.clone(), locator);

        let first_id = controller.start(config()).unwrap();
        let (_, first_interface) = builder.last().unwrap();
        let second_id = controller.start(config()).unwrap();
        let (_, second_interface) = builder.last().unwrap();

        assert_ne!(first_id, second_id);
        assert!(first_interface.is_closed());
        assert!(!second_interface.is_closed());
        assert_eq!(first.stop_calls(), 1);

        // The old transport can no longer reach the new session
        assert!(!first.push(Packet::from(vec![7u8])));
        assert!(second.push(Packet::from(vec![8u8])));
        assert!(second_interface.wait_for_written(1, Duration::from_secs(5)));
        assert_eq!(second_interface.written(), vec![Packet::from(vec![8u8])]);

        controller.stop(StopReason::User);
    }

    #[test]
    fn test_status_events() {
        let (controller, _builder, _transport) = recording_controller();
        let events = controller.subscribe();

        controller.start(config()).unwrap();
        controller.revoke();

        let seen: Vec<SessionStatus> = events.try_iter().collect();
        assert_eq!(
            seen,
            vec![
                SessionStatus::Connecting,
                SessionStatus::Connected,
                SessionStatus::Disconnecting,
                SessionStatus::Failed(REVOKED_REASON.into()),
            ]
        );
    }

    #[test]
    fn test_loopback_end_to_end() {
        let builder = MockBuilder::new();
        let controller = SessionController::new(builder.clone());

        controller
            .start(config().with_transport(TransportKind::Loopback))
            .unwrap();
        assert_eq!(controller.info().transport.as_deref(), Some("loopback"));

        let (_, interface) = builder.last().unwrap();
        let packets: Vec<Packet> = (0..8u8).map(|i| Packet::from(vec![0x45, i])).collect();
        for packet in &packets {
            interface.inject(packet.clone());
        }

        assert!(interface.wait_for_written(8, Duration::from_secs(5)));
        assert_eq!(interface.written(), packets);
        controller.stop(StopReason::User);
    }

    #[test]
    fn test_drop_tears_down() {
        let (controller, builder, transport) = recording_controller();
        controller.start(config()).unwrap();
        drop(controller);

        let (_, interface) = builder.last().unwrap();
        assert!(interface.is_closed());
        assert_eq!(transport.stop_calls(), 1);
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&SessionStatus::Failed("boom".into())).unwrap();
        assert_eq!(json, r#"{"state":"failed","reason":"boom"}"#);
        let json = serde_json::to_string(&SessionStatus::Connected).unwrap();
        assert_eq!(json, r#"{"state":"connected"}"#);
    }
}
