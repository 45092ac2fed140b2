//! Tunnel Configuration
//!
//! Session parameters supplied by the user plus the fixed virtual
//! interface layout every session uses.
//!
//! # File Format
//!
//! ```toml
//! domain = "t.example.com"
//! password = "secret"
//! dns_server = "9.9.9.9"
//! mtu = 1500
//!
//! [transport]
//! kind = "auto"
//! library = "/opt/qdynn/libqdynn_dnstt.so"
//!
//! [pump]
//! queue_capacity = 1024
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Session name reported to the OS when the interface is established
pub const SESSION_NAME: &str = "qdynn";

/// Default interface MTU
pub const DEFAULT_MTU: u16 = 1500;

/// Smallest MTU an IPv4 host must accept
pub const MIN_MTU: u16 = 576;

/// Address assigned to the virtual interface
pub const LOCAL_ADDRESS: Cidr = Cidr::new(Ipv4Addr::new(10, 0, 0, 2), 32);

/// Route captured by the virtual interface (all IPv4 traffic)
pub const DEFAULT_ROUTE: Cidr = Cidr::new(Ipv4Addr::UNSPECIFIED, 0);

/// IPv4 network in CIDR notation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Cidr {
    /// Network address
    pub addr: Ipv4Addr,
    /// Prefix length (0-32)
    pub prefix: u8,
}

impl Cidr {
    /// Create a new CIDR block
    pub const fn new(addr: Ipv4Addr, prefix: u8) -> Self {
        Self { addr, prefix }
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| ConfigError::InvalidCidr(s.to_string()))?;
        let addr: Ipv4Addr = addr
            .parse()
            .map_err(|_| ConfigError::InvalidCidr(s.to_string()))?;
        let prefix: u8 = prefix
            .parse()
            .map_err(|_| ConfigError::InvalidCidr(s.to_string()))?;
        if prefix > 32 {
            return Err(ConfigError::InvalidCidr(s.to_string()));
        }
        Ok(Self::new(addr, prefix))
    }
}

impl TryFrom<String> for Cidr {
    type Error = ConfigError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Cidr> for String {
    fn from(cidr: Cidr) -> Self {
        cidr.to_string()
    }
}

/// A string that never shows up in logs or debug output
///
/// Serializes as `***`; only deserialization carries the real value.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    /// Wrap a secret value
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the raw value (only for handing to the transport)
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Whether the secret is empty or whitespace
    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(***)")
    }
}

impl Serialize for Secret {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***")
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

/// Which transport the locator should try to bind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    /// Probe for a native transport, fall back to inert
    #[default]
    Auto,
    /// Native library only (still falls back to inert if missing)
    Native,
    /// Echo transport for end-to-end diagnostics
    Loopback,
    /// Skip probing entirely
    Inert,
}

/// `[transport]` table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Transport selection
    pub kind: TransportKind,
    /// Explicit path to the native transport library
    pub library: Option<PathBuf>,
}

/// Upper bound for the pump's wait intervals (poll(2) takes a u16 timeout)
pub const MAX_WAIT_MS: u64 = u16::MAX as u64;

/// `[pump]` table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PumpSettings {
    /// Inbound queue capacity (packets)
    pub queue_capacity: usize,
    /// How long the inbound worker waits on an empty queue
    pub poll_interval_ms: u64,
    /// How long an interface read waits before returning a liveness probe
    pub read_probe_ms: u64,
    /// How long `stop` waits for workers before giving up on them
    pub stop_grace_ms: u64,
}

impl PumpSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn read_probe(&self) -> Duration {
        Duration::from_millis(self.read_probe_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            poll_interval_ms: 500,
            read_probe_ms: 250,
            stop_grace_ms: 2000,
        }
    }
}

fn default_mtu() -> u16 {
    DEFAULT_MTU
}

/// Complete tunnel session configuration
///
/// Immutable once handed to the session controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Tunnel domain served by the transport
    pub domain: String,
    /// Transport password
    pub password: Secret,
    /// DNS server pushed to the interface and used by the transport
    pub dns_server: String,
    /// Interface MTU
    #[serde(default = "default_mtu")]
    pub mtu: u16,
    /// Transport selection
    #[serde(default)]
    pub transport: TransportSettings,
    /// Packet pump tuning
    #[serde(default)]
    pub pump: PumpSettings,
}

impl TunnelConfig {
    /// Create a configuration with default MTU and tuning
    pub fn new(
        domain: impl Into<String>,
        password: impl Into<String>,
        dns_server: impl Into<String>,
    ) -> Self {
        Self {
            domain: domain.into(),
            password: Secret::new(password),
            dns_server: dns_server.into(),
            mtu: DEFAULT_MTU,
            transport: TransportSettings::default(),
            pump: PumpSettings::default(),
        }
    }

    /// Select a transport kind
    pub fn with_transport(mut self, kind: TransportKind) -> Self {
        self.transport.kind = kind;
        self
    }

    /// Load from TOML file
    pub fn from_toml_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_toml(&content)
    }

    /// Load from TOML string
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from JSON file
    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&content)
    }

    /// Load from JSON string
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        serde_json::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load by file extension (`.json` is JSON, anything else TOML)
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_file(path),
            _ => Self::from_toml_file(path),
        }
    }

    /// Validate configuration
    ///
    /// Must pass before any resource of a session is touched.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.domain.trim().is_empty() {
            return Err(ConfigError::MissingField("domain"));
        }
        if self.password.is_blank() {
            return Err(ConfigError::MissingField("password"));
        }
        if self.dns_server.trim().is_empty() {
            return Err(ConfigError::MissingField("dns_server"));
        }
        self.dns_addr()?;
        if self.mtu < MIN_MTU {
            return Err(ConfigError::MtuTooSmall(self.mtu));
        }
        if self.pump.queue_capacity == 0 {
            return Err(ConfigError::ZeroQueueCapacity);
        }
        let waits = [
            ("poll_interval_ms", self.pump.poll_interval_ms),
            ("read_probe_ms", self.pump.read_probe_ms),
            ("stop_grace_ms", self.pump.stop_grace_ms),
        ];
        for (field, value) in waits {
            if !(1..=MAX_WAIT_MS).contains(&value) {
                return Err(ConfigError::InvalidInterval { field, value });
            }
        }
        Ok(())
    }

    /// DNS server as an address
    pub fn dns_addr(&self) -> Result<IpAddr, ConfigError> {
        self.dns_server
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidDns(self.dns_server.clone()))
    }

    /// Interface layout for this session
    pub fn interface_spec(&self) -> Result<InterfaceSpec, ConfigError> {
        Ok(InterfaceSpec {
            session_name: SESSION_NAME.to_string(),
            address: LOCAL_ADDRESS,
            route: DEFAULT_ROUTE,
            mtu: self.mtu,
            dns: self.dns_addr()?,
        })
    }
}

/// What the OS is asked to establish
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterfaceSpec {
    /// Session label shown by the OS
    pub session_name: String,
    /// Interface address
    pub address: Cidr,
    /// Captured route
    pub route: Cidr,
    /// MTU
    pub mtu: u16,
    /// DNS server
    pub dns: IpAddr,
}

/// Configuration errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("DNS server is not an IP address: {0:?}")]
    InvalidDns(String),

    #[error("MTU {0} is below the minimum of 576")]
    MtuTooSmall(u16),

    #[error("Inbound queue capacity must be non-zero")]
    ZeroQueueCapacity,

    #[error("{field} must be between 1 and 65535 ms, got {value}")]
    InvalidInterval { field: &'static str, value: u64 },

    #[error("Invalid CIDR block: {0}")]
    InvalidCidr(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("Parse error: {0}")]
    Parse(String),
}
