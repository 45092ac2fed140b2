//! Native Transport Adapter
//!
//! Binds a transport shipped as a shared library and loaded at runtime,
//! so the pump never links against a specific implementation.
//!
//! # Foreign Contract
//!
//! ```c
//! typedef void (*qdynn_packet_fn)(void *ctx, const uint8_t *data, size_t len);
//! typedef void (*qdynn_log_fn)(void *ctx, const char *msg);
//!
//! int32_t qdynn_transport_start(const char *domain, const char *password,
//!                               const char *dns, qdynn_packet_fn on_packet,
//!                               qdynn_log_fn on_log, void *ctx);
//! int32_t qdynn_transport_send(const uint8_t *data, size_t len);
//! void    qdynn_transport_stop(void);
//! ```
//!
//! Non-zero return codes are failures. The library must not invoke either
//! callback after `qdynn_transport_stop` returns, and must copy nothing it
//! expects to outlive a callback: the packet bytes are copied on entry.

use crate::config::TunnelConfig;
use crate::packet::Packet;
use crate::transport::{DeliveryGate, LogSink, PacketSink, Transport, TransportError};
use libloading::Library;
use std::ffi::{c_char, c_void, CStr, CString};
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

const START_SYMBOL: &[u8] = b"qdynn_transport_start\0";
const SEND_SYMBOL: &[u8] = b"qdynn_transport_send\0";
const STOP_SYMBOL: &[u8] = b"qdynn_transport_stop\0";

/// Library name probed when no explicit path is configured
pub const DEFAULT_LIBRARY_NAME: &str = "qdynn_dnstt";

type PacketCallback = extern "C" fn(ctx: *mut c_void, data: *const u8, len: usize);
type LogCallback = extern "C" fn(ctx: *mut c_void, msg: *const c_char);

type StartFn = unsafe extern "C" fn(
    domain: *const c_char,
    password: *const c_char,
    dns: *const c_char,
    on_packet: PacketCallback,
    on_log: LogCallback,
    ctx: *mut c_void,
) -> i32;
type SendFn = unsafe extern "C" fn(data: *const u8, len: usize) -> i32;
type StopFn = unsafe extern "C" fn();

/// Transport living in a dynamically loaded library
pub struct NativeTransport {
    path: PathBuf,
    start_fn: StartFn,
    send_fn: SendFn,
    stop_fn: StopFn,
    /// Callback context handed to the library; outlives every callback
    /// because `stop` runs before drop.
    gate: Arc<DeliveryGate>,
    running: AtomicBool,
    // Declared last: the function pointers above borrow from it.
    _library: Library,
}

impl NativeTransport {
    /// Load the library at `path` and resolve the transport symbols
    pub fn load(path: &Path) -> Result<Self, TransportError> {
        // SAFETY: loading runs the library's initialisers; the library is
        // trusted to be a transport built against the contract above.
        let library = unsafe { Library::new(path) }
            .map_err(|e| TransportError::Library(format!("{}: {}", path.display(), e)))?;

        // SAFETY: the symbol types match the documented C signatures.
        let (start_fn, send_fn, stop_fn) = unsafe {
            let start = library.get::<StartFn>(START_SYMBOL).map(|s| *s);
            let send = library.get::<SendFn>(SEND_SYMBOL).map(|s| *s);
            let stop = library.get::<StopFn>(STOP_SYMBOL).map(|s| *s);
            match (start, send, stop) {
                (Ok(start), Ok(send), Ok(stop)) => (start, send, stop),
                (Err(e), _, _) | (_, Err(e), _) | (_, _, Err(e)) => {
                    return Err(TransportError::Library(format!("{}: {}", path.display(), e)));
                }
            }
        };

        debug!("Resolved native transport symbols in {}", path.display());

        Ok(Self {
            path: path.to_path_buf(),
            start_fn,
            send_fn,
            stop_fn,
            gate: Arc::new(DeliveryGate::new()),
            running: AtomicBool::new(false),
            _library: library,
        })
    }

    /// Where the library was loaded from
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn context(&self) -> *mut c_void {
        Arc::as_ptr(&self.gate) as *mut c_void
    }
}

fn c_string(field: &str, value: &str) -> Result<CString, TransportError> {
    CString::new(value)
        .map_err(|_| TransportError::StartFailed(format!("{} contains a NUL byte", field)))
}

impl Transport for NativeTransport {
    fn name(&self) -> &str {
        "native"
    }

    fn start(
        &self,
        config: &TunnelConfig,
        on_packet: PacketSink,
        on_log: LogSink,
    ) -> Result<(), TransportError> {
        if self.running.load(Ordering::Acquire) {
            return Err(TransportError::StartFailed("native transport already started".into()));
        }

        let domain = c_string("domain", &config.domain)?;
        let password = c_string("password", config.password.expose())?;
        let dns = c_string("dns_server", &config.dns_server)?;

        self.gate.open(on_packet, on_log);

        // SAFETY: strings outlive the call, the trampolines match the
        // callback types and the context stays valid until `stop` returns.
        let rc = unsafe {
            (self.start_fn)(
                domain.as_ptr(),
                password.as_ptr(),
                dns.as_ptr(),
                packet_trampoline,
                log_trampoline,
                self.context(),
            )
        };

        if rc != 0 {
            self.gate.close();
            return Err(TransportError::StartFailed(format!(
                "{} returned {}",
                self.path.display(),
                rc
            )));
        }

        self.running.store(true, Ordering::Release);
        info!("Native transport started from {}", self.path.display());
        Ok(())
    }

    fn send(&self, packet: Packet) -> Result<(), TransportError> {
        if !self.running.load(Ordering::Acquire) {
            return Err(TransportError::NotStarted);
        }

        // SAFETY: the slice is valid for the duration of the call.
        let rc = unsafe { (self.send_fn)(packet.as_bytes().as_ptr(), packet.len()) };
        if rc != 0 {
            return Err(TransportError::SendFailed(format!("native send returned {}", rc)));
        }
        Ok(())
    }

    fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            // SAFETY: plain call into the library; it stops delivering
            // callbacks before returning.
            unsafe { (self.stop_fn)() };
            info!("Native transport stopped");
        }
        self.gate.close();
    }
}

impl Drop for NativeTransport {
    fn drop(&mut self) {
        self.stop();
    }
}

extern "C" fn packet_trampoline(ctx: *mut c_void, data: *const u8, len: usize) {
    if ctx.is_null() || data.is_null() || len == 0 {
        return;
    }

    // SAFETY: ctx is the gate pointer passed to start and is alive until
    // stop returns; data points to len readable bytes for this call.
    let gate = unsafe { &*(ctx as *const DeliveryGate) };
    let packet = Packet::from(unsafe { std::slice::from_raw_parts(data, len) });

    if panic::catch_unwind(AssertUnwindSafe(|| gate.deliver(packet))).is_err() {
        warn!("Inbound packet sink panicked");
    }
}

extern "C" fn log_trampoline(ctx: *mut c_void, msg: *const c_char) {
    if ctx.is_null() || msg.is_null() {
        return;
    }

    // SAFETY: as above; msg is a NUL-terminated string valid for this call.
    let gate = unsafe { &*(ctx as *const DeliveryGate) };
    let msg = unsafe { CStr::from_ptr(msg) }.to_string_lossy();

    if panic::catch_unwind(AssertUnwindSafe(|| gate.log(&msg))).is_err() {
        warn!("Transport log sink panicked");
    }
}
