//! qdynn: DNS tunnel client
//!
//! Main entry point. Initializes the global allocator, sets up logging,
//! binds the inherited virtual interface descriptor and runs one tunnel
//! session until a signal arrives or the session fails.

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use qdynn_tunnel::{
    InheritedFdBuilder, Secret, SessionController, SessionStatus, StopReason, TransportKind,
    TunnelConfig,
};
use std::os::fd::{FromRawFd, OwnedFd, RawFd};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// Use mimalloc as the global allocator for reduced memory fragmentation
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "qdynn", version, about = "DNS tunnel client for a host virtual interface")]
struct Args {
    /// Configuration file (TOML, or JSON with a .json extension)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Tunnel domain
    #[arg(long)]
    domain: Option<String>,

    /// Tunnel password
    #[arg(long)]
    password: Option<String>,

    /// DNS resolver address handed to the interface
    #[arg(long)]
    dns: Option<String>,

    /// Transport selection
    #[arg(long, value_enum)]
    transport: Option<TransportArg>,

    /// Native transport library path
    #[arg(long)]
    library: Option<PathBuf>,

    /// Inherited virtual interface descriptor
    #[arg(long)]
    tun_fd: RawFd,
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum TransportArg {
    Auto,
    Native,
    Loopback,
    Inert,
}

impl From<TransportArg> for TransportKind {
    fn from(arg: TransportArg) -> Self {
        match arg {
            TransportArg::Auto => TransportKind::Auto,
            TransportArg::Native => TransportKind::Native,
            TransportArg::Loopback => TransportKind::Loopback,
            TransportArg::Inert => TransportKind::Inert,
        }
    }
}

impl Args {
    /// File configuration with command-line overrides applied
    fn tunnel_config(&self) -> Result<TunnelConfig> {
        let mut config = match &self.config {
            Some(path) => TunnelConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => TunnelConfig::new("", "", ""),
        };

        if let Some(domain) = &self.domain {
            config.domain = domain.clone();
        }
        if let Some(password) = &self.password {
            config.password = Secret::new(password.clone());
        }
        if let Some(dns) = &self.dns {
            config.dns_server = dns.clone();
        }
        if let Some(kind) = self.transport {
            config.transport.kind = kind.into();
        }
        if let Some(library) = &self.library {
            config.transport.library = Some(library.clone());
        }
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let config = args.tunnel_config()?;

    info!("qdynn starting...");
    info!("Using mimalloc allocator");

    // SAFETY: the launching process hands this descriptor to us and does
    // not use it afterwards; nothing else in this process owns it.
    let fd = unsafe { OwnedFd::from_raw_fd(args.tun_fd) };
    let builder = Arc::new(InheritedFdBuilder::new(fd, config.pump.read_probe()));
    let controller = SessionController::new(builder);

    let events = controller.subscribe();
    controller.start(config).context("starting tunnel session")?;

    // Resolves once the session ends on its own
    let mut ended = tokio::task::spawn_blocking(move || {
        events.iter().find(SessionStatus::is_terminal)
    });

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("installing SIGHUP handler")?;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C - stopping session");
            controller.stop(StopReason::User);
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM - shutting down");
            controller.stop(StopReason::ProcessExit);
        }
        _ = sighup.recv() => {
            warn!("Received SIGHUP - interface revoked");
            controller.revoke();
        }
        status = &mut ended => {
            match status {
                Ok(Some(status)) => info!("Session ended: {}", status),
                Ok(None) => warn!("Status channel closed"),
                Err(e) => error!("Status watcher failed: {}", e),
            }
        }
    }

    let info = controller.info();
    println!("{}", info.stats.format());

    let failure = info.status.reason().map(str::to_string);
    drop(controller);
    info!("qdynn shutting down");

    match failure {
        Some(reason) => anyhow::bail!("session failed: {}", reason),
        None => Ok(()),
    }
}
