//! Packet Pump
//!
//! The bidirectional relay between the virtual interface and the
//! transport.
//!
//! ```text
//!  interface.read ──▶ [outbound worker] ──▶ transport.send
//!  transport sink ──▶ InboundQueue ──▶ [inbound worker] ──▶ interface.write
//! ```
//!
//! # Lifecycle
//!
//! `Idle → Starting → Running → Stopping → Stopped`. `Stopped` is
//! terminal; a new session builds a new pump.
//!
//! # Workers
//!
//! One thread per direction. A worker that hits an IO fault logs it and
//! exits; the exit is reported on [`PacketPump::exits`] so the session
//! controller can tear the session down. Panics are caught and reported
//! the same way.

use crate::config::PumpSettings;
use crate::interface::{InterfaceError, VirtualInterface};
use crate::packet::Packet;
use crate::queue::InboundQueue;
use crate::transport::{PacketSink, Transport};
use crossbeam_channel::{unbounded, Receiver, Sender};
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

/// How often `stop` checks whether the workers have exited
const JOIN_POLL: Duration = Duration::from_millis(10);

/// Pump lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PumpState {
    Idle,
    Starting,
    Running,
    Stopping,
    Stopped,
}

/// Relay direction handled by a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Interface to transport
    Outbound,
    /// Transport to interface
    Inbound,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Outbound => f.write_str("outbound"),
            Direction::Inbound => f.write_str("inbound"),
        }
    }
}

/// Why a worker exited
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExitCause {
    /// Running flag cleared
    Stopped,
    /// IO fault or panic; the session must be torn down
    Fault(String),
}

/// Reported once per worker when it exits
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerExit {
    pub direction: Direction,
    pub cause: ExitCause,
}

impl WorkerExit {
    pub fn is_fault(&self) -> bool {
        matches!(self.cause, ExitCause::Fault(_))
    }
}

/// Pump statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PumpStats {
    /// Packets read from the interface and handed to the transport
    pub packets_out: u64,
    pub bytes_out: u64,
    /// Packets written to the interface
    pub packets_in: u64,
    pub bytes_in: u64,
    /// Transport send calls that failed
    pub send_failures: u64,
    /// Inbound packets dropped because the queue was full
    pub dropped_full: u64,
    /// Inbound packets dropped because the pump was not accepting
    pub dropped_inactive: u64,
    /// Accepted inbound packets thrown away by `stop` instead of written
    pub discarded_on_stop: u64,
    /// Packets currently queued
    pub queued: usize,
}

impl PumpStats {
    /// Format as human-readable string
    pub fn format(&self) -> String {
        format!(
            "TX: {:.2}MB ({} pkts), RX: {:.2}MB ({} pkts), dropped: {}, send failures: {}",
            self.bytes_out as f64 / (1024.0 * 1024.0),
            self.packets_out,
            self.bytes_in as f64 / (1024.0 * 1024.0),
            self.packets_in,
            self.dropped_full + self.dropped_inactive + self.discarded_on_stop,
            self.send_failures
        )
    }
}

#[derive(Default)]
struct Counters {
    packets_out: AtomicU64,
    bytes_out: AtomicU64,
    packets_in: AtomicU64,
    bytes_in: AtomicU64,
    send_failures: AtomicU64,
    dropped_inactive: AtomicU64,
    discarded_on_stop: AtomicU64,
}

/// State shared between the pump, its workers and the inbound sink
struct Shared {
    /// Cleared by `stop`; workers wind down when they see it
    running: AtomicBool,
    /// Set once the stop grace period runs out; abandons the drain
    cancelled: AtomicBool,
    /// Whether the inbound sink enqueues or drops. Cleared by the inbound
    /// worker once it has drained, or by `stop` after the join.
    accepting: AtomicBool,
    queue: InboundQueue,
    counters: Counters,
}

impl Shared {
    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    fn accept(&self, packet: Packet) {
        if !self.accepting.load(Ordering::Acquire) {
            let dropped = self.counters.dropped_inactive.fetch_add(1, Ordering::Relaxed) + 1;
            if dropped.is_power_of_two() {
                debug!("Pump not accepting, dropped {} inbound packet(s)", dropped);
            }
            return;
        }

        let len = packet.len();
        if !self.queue.offer(packet) {
            let dropped = self.queue.dropped();
            if dropped.is_power_of_two() {
                debug!("Inbound queue full, dropped {} packet(s) so far", dropped);
            }
            return;
        }
        trace!("Queued inbound packet size={}", len);
    }

    fn discard(&self, n: u64) {
        self.counters.discarded_on_stop.fetch_add(n, Ordering::Relaxed);
    }

    fn stats(&self) -> PumpStats {
        let c = &self.counters;
        PumpStats {
            packets_out: c.packets_out.load(Ordering::Relaxed),
            bytes_out: c.bytes_out.load(Ordering::Relaxed),
            packets_in: c.packets_in.load(Ordering::Relaxed),
            bytes_in: c.bytes_in.load(Ordering::Relaxed),
            send_failures: c.send_failures.load(Ordering::Relaxed),
            dropped_full: self.queue.dropped(),
            dropped_inactive: c.dropped_inactive.load(Ordering::Relaxed),
            discarded_on_stop: c.discarded_on_stop.load(Ordering::Relaxed),
            queued: self.queue.len(),
        }
    }
}

/// The interface/transport relay
pub struct PacketPump {
    settings: PumpSettings,
    state: Mutex<PumpState>,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    exit_tx: Sender<WorkerExit>,
    exit_rx: Receiver<WorkerExit>,
}

impl PacketPump {
    /// Create an idle pump
    pub fn new(settings: PumpSettings) -> Self {
        let (exit_tx, exit_rx) = unbounded();
        let shared = Arc::new(Shared {
            running: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            accepting: AtomicBool::new(false),
            queue: InboundQueue::new(settings.queue_capacity),
            counters: Counters::default(),
        });

        Self {
            settings,
            state: Mutex::new(PumpState::Idle),
            shared,
            workers: Mutex::new(Vec::new()),
            exit_tx,
            exit_rx,
        }
    }

    /// Current state
    pub fn state(&self) -> PumpState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Statistics snapshot
    pub fn stats(&self) -> PumpStats {
        self.shared.stats()
    }

    /// Worker exit notifications
    pub fn exits(&self) -> Receiver<WorkerExit> {
        self.exit_rx.clone()
    }

    /// The transport's inbound channel into this pump.
    ///
    /// The sink is bound to this pump instance only; a sink kept by a
    /// previous session's transport can never reach a newer pump.
    pub fn inbound_sink(&self) -> PacketSink {
        let shared = Arc::clone(&self.shared);
        Arc::new(move |packet: Packet| shared.accept(packet))
    }

    /// Launch both workers
    pub fn start(
        &self,
        interface: Arc<dyn VirtualInterface>,
        transport: Arc<dyn Transport>,
    ) -> Result<(), PumpError> {
        self.transition(&[PumpState::Idle], PumpState::Starting)?;

        self.shared.queue.clear();
        self.shared.accepting.store(true, Ordering::Release);
        self.shared.running.store(true, Ordering::Release);

        let outbound = {
            let shared = Arc::clone(&self.shared);
            let interface = Arc::clone(&interface);
            spawn_worker(Direction::Outbound, self.exit_tx.clone(), move || {
                run_outbound(&shared, interface.as_ref(), transport.as_ref())
            })
        };
        match outbound {
            Ok(handle) => self.push_worker(handle),
            Err(e) => {
                self.abort_start();
                return Err(PumpError::Spawn(e.to_string()));
            }
        }

        let inbound = {
            let shared = Arc::clone(&self.shared);
            let poll_interval = self.settings.poll_interval();
            spawn_worker(Direction::Inbound, self.exit_tx.clone(), move || {
                run_inbound(&shared, interface.as_ref(), poll_interval)
            })
        };
        match inbound {
            Ok(handle) => self.push_worker(handle),
            Err(e) => {
                self.abort_start();
                return Err(PumpError::Spawn(e.to_string()));
            }
        }

        self.transition(&[PumpState::Starting], PumpState::Running)?;
        info!("Packet pump running");
        Ok(())
    }

    /// Stop both workers.
    ///
    /// Returns false when there was nothing to stop (never started, or
    /// already stopping/stopped).
    pub fn stop(&self) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match *state {
                PumpState::Starting | PumpState::Running => *state = PumpState::Stopping,
                PumpState::Idle | PumpState::Stopping | PumpState::Stopped => return false,
            }
        }

        debug!("Stopping packet pump");
        self.wind_down();
        self.set_state(PumpState::Stopped);
        info!("Packet pump stopped: {}", self.stats().format());
        true
    }

    fn wind_down(&self) {
        self.shared.running.store(false, Ordering::Release);

        let handles = std::mem::take(&mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner));
        let deadline = Instant::now() + self.settings.stop_grace();
        while handles.iter().any(|h| !h.is_finished()) && Instant::now() < deadline {
            thread::sleep(JOIN_POLL);
        }

        let hung = handles.iter().filter(|h| !h.is_finished()).count();
        if hung > 0 {
            self.shared.cancelled.store(true, Ordering::Release);
            warn!(
                "{} pump worker(s) still running after {:?}, abandoning them",
                hung,
                self.settings.stop_grace()
            );
        }

        for handle in handles.into_iter().filter(|h| h.is_finished()) {
            let _ = handle.join();
        }

        self.shared.accepting.store(false, Ordering::Release);
        let discarded = self.shared.queue.clear();
        if discarded > 0 {
            self.shared.discard(discarded as u64);
            warn!("Discarded {} queued inbound packet(s) on stop", discarded);
        }
    }

    fn abort_start(&self) {
        self.set_state(PumpState::Stopping);
        self.wind_down();
        self.set_state(PumpState::Stopped);
    }

    fn push_worker(&self, handle: JoinHandle<()>) {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    fn set_state(&self, to: PumpState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = to;
    }

    fn transition(&self, from: &[PumpState], to: PumpState) -> Result<(), PumpError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if !from.contains(&*state) {
            return Err(PumpError::InvalidState { state: *state, to });
        }
        *state = to;
        Ok(())
    }
}

impl Drop for PacketPump {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_worker<F>(
    direction: Direction,
    exit_tx: Sender<WorkerExit>,
    body: F,
) -> std::io::Result<JoinHandle<()>>
where
    F: FnOnce() -> ExitCause + Send + 'static,
{
    thread::Builder::new()
        .name(format!("qdynn-{}", direction))
        .spawn(move || {
            debug!("{} worker started", direction);

            let cause = match panic::catch_unwind(AssertUnwindSafe(body)) {
                Ok(cause) => cause,
                Err(panic_info) => {
                    let msg = if let Some(s) = panic_info.downcast_ref::<&str>() {
                        s.to_string()
                    } else if let Some(s) = panic_info.downcast_ref::<String>() {
                        s.clone()
                    } else {
                        "unknown panic".to_string()
                    };
                    ExitCause::Fault(format!("{} worker panicked: {}", direction, msg))
                }
            };

            match &cause {
                ExitCause::Stopped => debug!("{} worker stopped", direction),
                ExitCause::Fault(reason) => warn!("{} worker terminated: {}", direction, reason),
            }
            let _ = exit_tx.send(WorkerExit { direction, cause });
        })
}

fn run_outbound(
    shared: &Shared,
    interface: &dyn VirtualInterface,
    transport: &dyn Transport,
) -> ExitCause {
    while shared.is_running() {
        let packet = match interface.read_packet() {
            Ok(packet) => packet,
            Err(_) if !shared.is_running() => break,
            Err(InterfaceError::Closed) => {
                return ExitCause::Fault("interface closed or hung up".into());
            }
            Err(e) => return ExitCause::Fault(format!("interface read failed: {}", e)),
        };

        if packet.is_empty() {
            continue;
        }

        let len = packet.len() as u64;
        shared.counters.packets_out.fetch_add(1, Ordering::Relaxed);
        shared.counters.bytes_out.fetch_add(len, Ordering::Relaxed);
        trace!("Outbound packet size={}", len);

        if let Err(e) = transport.send(packet) {
            let failures = shared.counters.send_failures.fetch_add(1, Ordering::Relaxed) + 1;
            if failures == 1 || failures % 1000 == 0 {
                warn!("Transport send failed ({} so far): {}", failures, e);
            }
        }
    }
    ExitCause::Stopped
}

fn run_inbound(shared: &Shared, interface: &dyn VirtualInterface, poll_interval: Duration) -> ExitCause {
    loop {
        // Keep draining after the running flag clears, unless stop gave up on us.
        if !shared.is_running() {
            if shared.is_cancelled() {
                break;
            }
            if shared.queue.is_empty() {
                // Close the sink, then write whatever slipped in before it closed.
                if shared.accepting.swap(false, Ordering::AcqRel) {
                    continue;
                }
                break;
            }
        }

        let Some(packet) = shared.queue.poll(poll_interval) else {
            continue;
        };
        if packet.is_empty() {
            continue;
        }
        if shared.is_cancelled() {
            shared.discard(1);
            break;
        }

        let len = packet.len() as u64;
        if let Err(e) = interface.write_packet(&packet) {
            return ExitCause::Fault(format!("interface write failed: {}", e));
        }
        shared.counters.packets_in.fetch_add(1, Ordering::Relaxed);
        shared.counters.bytes_in.fetch_add(len, Ordering::Relaxed);
        trace!("Inbound packet size={}", len);
    }
    ExitCause::Stopped
}

/// Pump errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PumpError {
    #[error("Invalid pump state transition: {state:?} -> {to:?}")]
    InvalidState { state: PumpState, to: PumpState },

    #[error("Failed to spawn pump worker: {0}")]
    Spawn(String),
}
