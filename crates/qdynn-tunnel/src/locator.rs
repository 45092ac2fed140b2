//! Transport Locator
//!
//! Decides, once per session, which transport the pump is bound to.
//! Probes are tried in order; the first hit wins and a complete miss
//! yields an [`InertTransport`]. Nothing is cached between sessions.

use crate::config::{TransportKind, TransportSettings};
use crate::native::{NativeTransport, DEFAULT_LIBRARY_NAME};
use crate::transport::{InertTransport, LoopbackTransport, Transport};
use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// One way of finding an active transport
pub trait TransportProbe: Send + Sync {
    /// Name for logs
    fn name(&self) -> &str;

    /// Return a bound transport if this probe's implementation is present
    fn probe(&self) -> Option<Arc<dyn Transport>>;
}

/// Looks for the native transport library
pub struct NativeLibraryProbe {
    candidates: Vec<OsString>,
}

impl NativeLibraryProbe {
    /// Probe an explicit path (if any), then the platform default name
    pub fn new(library: Option<PathBuf>) -> Self {
        let mut candidates = Vec::new();
        if let Some(path) = library {
            candidates.push(path.into_os_string());
        }
        candidates.push(libloading::library_filename(DEFAULT_LIBRARY_NAME));
        Self { candidates }
    }

    /// Probe only the given path
    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self {
            candidates: vec![path.into().into_os_string()],
        }
    }
}

impl TransportProbe for NativeLibraryProbe {
    fn name(&self) -> &str {
        "native-library"
    }

    fn probe(&self) -> Option<Arc<dyn Transport>> {
        for candidate in &self.candidates {
            match NativeTransport::load(candidate.as_ref()) {
                Ok(transport) => {
                    info!("Found native transport at {}", transport.path().display());
                    return Some(Arc::new(transport));
                }
                Err(e) => debug!("Native transport not usable: {}", e),
            }
        }
        None
    }
}

/// Always succeeds with a freshly built transport
pub struct FactoryProbe<F> {
    name: &'static str,
    factory: F,
}

impl<F> FactoryProbe<F>
where
    F: Fn() -> Arc<dyn Transport> + Send + Sync,
{
    pub fn new(name: &'static str, factory: F) -> Self {
        Self { name, factory }
    }
}

impl<F> TransportProbe for FactoryProbe<F>
where
    F: Fn() -> Arc<dyn Transport> + Send + Sync,
{
    fn name(&self) -> &str {
        self.name
    }

    fn probe(&self) -> Option<Arc<dyn Transport>> {
        Some((self.factory)())
    }
}

/// Capability discovery for transports
#[derive(Default)]
pub struct TransportLocator {
    probes: Vec<Box<dyn TransportProbe>>,
}

impl TransportLocator {
    /// A locator with no probes (always inert)
    pub fn new() -> Self {
        Self::default()
    }

    /// Build the probe list for the configured transport kind
    pub fn from_settings(settings: &TransportSettings) -> Self {
        let locator = Self::new();
        match settings.kind {
            TransportKind::Auto | TransportKind::Native => {
                locator.with_probe(NativeLibraryProbe::new(settings.library.clone()))
            }
            TransportKind::Loopback => locator.with_probe(FactoryProbe::new("loopback", || {
                Arc::new(LoopbackTransport::new()) as Arc<dyn Transport>
            })),
            TransportKind::Inert => locator,
        }
    }

    /// Append a probe
    pub fn with_probe(mut self, probe: impl TransportProbe + 'static) -> Self {
        self.probes.push(Box::new(probe));
        self
    }

    /// Probe names in order
    pub fn probe_names(&self) -> Vec<&str> {
        self.probes.iter().map(|p| p.name()).collect()
    }

    /// Find a transport, falling back to the inert one
    pub fn locate(&self) -> Arc<dyn Transport> {
        for probe in &self.probes {
            if let Some(transport) = probe.probe() {
                info!("Transport located via {}: {}", probe.name(), transport.name());
                return transport;
            }
            debug!("Probe {} found nothing", probe.name());
        }

        info!("No active transport available, using inert transport");
        Arc::new(InertTransport::new())
    }
}
