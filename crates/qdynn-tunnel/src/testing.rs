//! Test doubles for the interface and the transport.

use crate::config::{InterfaceSpec, TunnelConfig};
use crate::interface::{InterfaceBuilder, InterfaceError, VirtualInterface};
use crate::packet::Packet;
use crate::transport::{DeliveryGate, LogSink, PacketSink, Transport, TransportError};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::collections::VecDeque;
use std::io;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, OnceLock};
use std::thread;
use std::time::{Duration, Instant};

/// How long an idle mock read waits before returning a probe
const READ_PROBE: Duration = Duration::from_millis(10);

/// Poll `cond` until it holds or `timeout` elapses
pub fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(2));
    }
    cond()
}

fn test_spec() -> InterfaceSpec {
    TunnelConfig::new("t.example.com", "p", "9.9.9.9")
        .interface_spec()
        .unwrap()
}

/// Scripted in-memory interface
pub struct MockInterface {
    spec: OnceLock<InterfaceSpec>,
    inject_tx: Sender<Packet>,
    inject_rx: Receiver<Packet>,
    reads: AtomicUsize,
    fail_reads_after: AtomicUsize,
    written: Mutex<Vec<Packet>>,
    write_attempted: AtomicBool,
    writes_blocked: Mutex<bool>,
    writes_unblocked: Condvar,
    fail_writes: AtomicBool,
    closed: AtomicBool,
    close_calls: AtomicUsize,
}

impl MockInterface {
    pub fn new() -> Arc<Self> {
        let (inject_tx, inject_rx) = unbounded();
        Arc::new(Self {
            spec: OnceLock::new(),
            inject_tx,
            inject_rx,
            reads: AtomicUsize::new(0),
            fail_reads_after: AtomicUsize::new(usize::MAX),
            written: Mutex::new(Vec::new()),
            write_attempted: AtomicBool::new(false),
            writes_blocked: Mutex::new(false),
            writes_unblocked: Condvar::new(),
            fail_writes: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            close_calls: AtomicUsize::new(0),
        })
    }

    /// Queue a packet for the reader
    pub fn inject(&self, packet: Packet) {
        self.inject_tx.send(packet).unwrap();
    }

    /// Fail every read after `n` packets were returned
    pub fn fail_reads_after(&self, n: usize) {
        self.fail_reads_after.store(n, Ordering::SeqCst);
    }

    pub fn fail_writes(&self) {
        self.fail_writes.store(true, Ordering::SeqCst);
    }

    pub fn block_writes(&self) {
        *self.writes_blocked.lock().unwrap() = true;
    }

    pub fn unblock_writes(&self) {
        *self.writes_blocked.lock().unwrap() = false;
        self.writes_unblocked.notify_all();
    }

    pub fn written(&self) -> Vec<Packet> {
        self.written.lock().unwrap().clone()
    }

    pub fn close_calls(&self) -> usize {
        self.close_calls.load(Ordering::SeqCst)
    }

    pub fn wait_for_written(&self, n: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.written.lock().unwrap().len() >= n)
    }

    pub fn wait_for_write_attempt(&self, timeout: Duration) -> bool {
        wait_until(timeout, || self.write_attempted.load(Ordering::SeqCst))
    }

    pub fn wait_until_drained(&self, timeout: Duration) -> bool {
        wait_until(timeout, || self.inject_rx.is_empty())
    }
}

impl VirtualInterface for MockInterface {
    fn read_packet(&self) -> Result<Packet, InterfaceError> {
        if self.is_closed() {
            return Err(InterfaceError::Closed);
        }
        if self.reads.load(Ordering::SeqCst) >= self.fail_reads_after.load(Ordering::SeqCst) {
            return Err(InterfaceError::Io(io::Error::other("scripted read failure")));
        }
        match self.inject_rx.recv_timeout(READ_PROBE) {
            Ok(packet) => {
                self.reads.fetch_add(1, Ordering::SeqCst);
                Ok(packet)
            }
            Err(_) => Ok(Packet::empty()),
        }
    }

    fn write_packet(&self, packet: &Packet) -> Result<(), InterfaceError> {
        self.write_attempted.store(true, Ordering::SeqCst);
        {
            let mut blocked = self.writes_blocked.lock().unwrap();
            while *blocked {
                blocked = self.writes_unblocked.wait(blocked).unwrap();
            }
        }
        if self.is_closed() {
            return Err(InterfaceError::Closed);
        }
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(InterfaceError::Io(io::Error::other("scripted write failure")));
        }
        self.written.lock().unwrap().push(packet.clone());
        Ok(())
    }

    fn close(&self) {
        self.close_calls.fetch_add(1, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn spec(&self) -> &InterfaceSpec {
        self.spec.get_or_init(test_spec)
    }
}

/// Builder handing out mock interfaces
pub struct MockBuilder {
    pending: Mutex<VecDeque<Arc<MockInterface>>>,
    established: Mutex<Vec<(InterfaceSpec, Arc<MockInterface>)>>,
    unavailable: AtomicBool,
}

impl MockBuilder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pending: Mutex::new(VecDeque::new()),
            established: Mutex::new(Vec::new()),
            unavailable: AtomicBool::new(false),
        })
    }

    /// Hand out `interface` on the next establish
    pub fn with_interface(self: Arc<Self>, interface: Arc<MockInterface>) -> Arc<Self> {
        self.pending.lock().unwrap().push_back(interface);
        self
    }

    /// Decline every establish
    pub fn unavailable(self: Arc<Self>) -> Arc<Self> {
        self.unavailable.store(true, Ordering::SeqCst);
        self
    }

    pub fn establish_calls(&self) -> usize {
        self.established.lock().unwrap().len()
    }

    pub fn last(&self) -> Option<(InterfaceSpec, Arc<MockInterface>)> {
        self.established.lock().unwrap().last().cloned()
    }
}

impl InterfaceBuilder for MockBuilder {
    fn establish(&self, spec: &InterfaceSpec) -> Result<Arc<dyn VirtualInterface>, InterfaceError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(InterfaceError::Unavailable("permission not granted".into()));
        }
        let interface = self
            .pending
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(MockInterface::new);
        let _ = interface.spec.set(spec.clone());
        self.established
            .lock()
            .unwrap()
            .push((spec.clone(), interface.clone()));
        Ok(interface)
    }
}

/// Transport that records sends and lets tests push inbound packets
#[derive(Default)]
pub struct RecordingTransport {
    gate: DeliveryGate,
    sent: Mutex<Vec<Packet>>,
    running: AtomicBool,
    refuse_start: AtomicBool,
    fail_sends: AtomicBool,
    start_calls: AtomicUsize,
    stop_calls: AtomicUsize,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn refuse_start(&self) {
        self.refuse_start.store(true, Ordering::SeqCst);
    }

    pub fn fail_sends(&self) {
        self.fail_sends.store(true, Ordering::SeqCst);
    }

    /// Deliver an inbound packet as the transport would
    pub fn push(&self, packet: Packet) -> bool {
        self.gate.deliver(packet)
    }

    pub fn sent(&self) -> Vec<Packet> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn start_calls(&self) -> usize {
        self.start_calls.load(Ordering::SeqCst)
    }

    pub fn stop_calls(&self) -> usize {
        self.stop_calls.load(Ordering::SeqCst)
    }

    pub fn wait_for_sent(&self, n: usize, timeout: Duration) -> bool {
        wait_until(timeout, || self.sent.lock().unwrap().len() >= n)
    }
}

impl Transport for RecordingTransport {
    fn name(&self) -> &str {
        "recording"
    }

    fn start(
        &self,
        _config: &TunnelConfig,
        on_packet: PacketSink,
        on_log: LogSink,
    ) -> Result<(), TransportError> {
        self.start_calls.fetch_add(1, Ordering::SeqCst);
        if self.refuse_start.load(Ordering::SeqCst) {
            return Err(TransportError::StartFailed("refused".into()));
        }
        self.gate.open(on_packet, on_log);
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn send(&self, packet: Packet) -> Result<(), TransportError> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("scripted send failure".into()));
        }
        self.sent.lock().unwrap().push(packet);
        Ok(())
    }

    fn stop(&self) {
        self.stop_calls.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        self.gate.close();
    }
}
