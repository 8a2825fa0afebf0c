//! relayd
//!
//! Runs one endpoint of the relay:
//! - local mode (default): listens on `local_address:local_port` and forwards
//!   every connection to the configured server
//! - server mode (`--server`): listens on `server:server_port`, reads each
//!   connection's destination header and forwards to it
//!
//! Settings come from a JSON profile, overridden by command-line flags.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use shroud_header::header_self_test;
use shroud_relay::{
    probe, BanList, DispatchEvent, Dispatcher, DispatcherError, LogFormat, PlainSession, Profile,
    RelayEvent,
};
use tokio::sync::mpsc;
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Deadline for the startup reachability probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Parser)]
#[command(name = "relayd", version, about = "Encrypted proxy relay endpoint")]
struct Cli {
    /// JSON profile to load
    #[arg(short = 'c', long, env = "SHROUD_CONFIG")]
    config: Option<PathBuf>,

    /// Run as the remote endpoint
    #[arg(short = 'S', long)]
    server: bool,

    /// Ban peers that send malformed headers (server mode)
    #[arg(long)]
    auto_ban: bool,

    /// Require authenticated headers
    #[arg(short = 'A', long)]
    auth: bool,

    /// Verbose logging and a codec self-test before starting
    #[arg(short = 'd', long)]
    debug: bool,

    /// Worker threads (default: available parallelism)
    #[arg(long, env = "SHROUD_WORKERS")]
    workers: Option<usize>,

    /// Server host
    #[arg(short = 's', long)]
    server_addr: Option<String>,

    /// Server port
    #[arg(short = 'p', long)]
    server_port: Option<u16>,

    /// Local bind address
    #[arg(short = 'b', long)]
    local_addr: Option<String>,

    /// Local port
    #[arg(short = 'l', long)]
    local_port: Option<u16>,

    /// Shared password
    #[arg(short = 'k', long, env = "SHROUD_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Cipher method
    #[arg(short = 'm', long)]
    method: Option<String>,

    /// Idle timeout in seconds
    #[arg(short = 't', long)]
    timeout: Option<u64>,

    /// Forward connections with malformed headers to host:port
    #[arg(long)]
    http_redirect: Option<String>,

    /// Log output format
    #[arg(long, value_enum)]
    log_format: Option<LogFormat>,
}

impl Cli {
    /// Load the profile, if any, and apply flag overrides.
    fn profile(&self) -> Result<Profile> {
        let mut profile = match &self.config {
            Some(path) => Profile::from_file(path)
                .with_context(|| format!("failed to load profile {}", path.display()))?,
            None => Profile::default(),
        };

        if let Some(server) = &self.server_addr {
            profile.server = server.clone();
        }
        if let Some(port) = self.server_port {
            profile.server_port = port;
        }
        if let Some(addr) = &self.local_addr {
            profile.local_address = addr.clone();
        }
        if let Some(port) = self.local_port {
            profile.local_port = port;
        }
        if let Some(password) = &self.password {
            profile.password = password.clone();
        }
        if let Some(method) = &self.method {
            profile.method = method.clone();
        }
        if let Some(timeout) = self.timeout {
            profile.timeout = timeout;
        }
        if let Some(redirect) = &self.http_redirect {
            profile.http_redirect = Some(redirect.clone());
        }
        if let Some(workers) = self.workers {
            profile.workers = Some(workers);
        }
        if let Some(format) = self.log_format {
            profile.log_format = format;
        }
        if self.auth {
            profile.auth = true;
        }
        if self.debug {
            profile.log_level = "debug".to_string();
        }

        Ok(profile)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let server_mode = cli.server;
    let profile = cli.profile()?;

    // Prefer RUST_LOG, fall back to the profile's level
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| profile.log_level.clone().into());
    let registry = tracing_subscriber::registry().with(filter);
    match profile.log_format {
        LogFormat::Json => registry.with(tracing_subscriber::fmt::layer().json()).init(),
        LogFormat::Pretty => registry.with(tracing_subscriber::fmt::layer()).init(),
    }

    profile.validate(server_mode)?;

    if cli.debug {
        if let Err(failures) = header_self_test() {
            for failure in &failures {
                error!(vector = %failure, "Header self-test mismatch");
            }
            bail!("header self-test failed");
        }
        debug!("Header self-test passed");
    }

    info!(
        mode = if server_mode { "server" } else { "local" },
        server = %profile.server,
        server_port = profile.server_port,
        method = %profile.method,
        auth = profile.auth,
        auto_ban = cli.auto_ban,
        "Configuration loaded"
    );

    let bans = Arc::new(BanList::new(profile.ban_ttl()));
    let session = PlainSession::new().with_ban_list(Arc::clone(&bans));
    let settings = profile.to_settings(server_mode, cli.auto_ban)?;
    let bind_addr = profile.bind_addr(server_mode)?;

    let mut dispatcher = Dispatcher::new(settings, bans, Arc::new(session));
    let logger = tokio::spawn(log_events(dispatcher.subscribe()));

    let local_addr = dispatcher
        .start(bind_addr)
        .await
        .context("failed to start relay")?;
    info!(bind_addr = %local_addr, "Relay started");

    if !server_mode {
        let server = profile.server_address()?;
        tokio::spawn(async move {
            match probe::reachability(&server, PROBE_TIMEOUT).await {
                Ok(latency) => info!(
                    server = %server,
                    latency_ms = latency.as_millis() as u64,
                    "Server is reachable"
                ),
                Err(e) => warn!(
                    server = %server,
                    error = %e,
                    "Server is not reachable; check the network, firewall and profile"
                ),
            }
        });
    }

    shutdown_signal().await;
    info!("Received shutdown signal");

    match dispatcher.stop().await {
        Ok(()) => {}
        Err(e @ DispatcherError::ShutdownTimeout { .. }) => {
            warn!(error = %e, "Shutdown did not complete cleanly");
        }
        Err(e) => return Err(e).context("failed to stop relay"),
    }

    // Dropping the dispatcher closes the event stream and ends the logger
    drop(dispatcher);
    match logger.await {
        Ok(totals) => info!(
            bytes_read = totals.bytes_read,
            bytes_sent = totals.bytes_sent,
            connections = totals.finished,
            "Relay stopped"
        ),
        Err(e) => error!(error = %e, "Event logger failed"),
    }

    Ok(())
}

/// Traffic seen by the event logger.
#[derive(Debug, Default)]
struct Totals {
    bytes_read: u64,
    bytes_sent: u64,
    finished: u64,
}

/// Render dispatcher events through tracing until the dispatcher goes away.
async fn log_events(mut events: mpsc::UnboundedReceiver<DispatchEvent>) -> Totals {
    let mut totals = Totals::default();

    while let Some(event) = events.recv().await {
        match event {
            DispatchEvent::Relay { handle, event } => match event {
                RelayEvent::Info(message) => info!(handle = %handle, "{}", message),
                RelayEvent::Debug(message) => debug!(handle = %handle, "{}", message),
                RelayEvent::BytesRead(n) => {
                    totals.bytes_read += n;
                    trace!(handle = %handle, bytes = n, "Read from client");
                }
                RelayEvent::BytesSent(n) => {
                    totals.bytes_sent += n;
                    trace!(handle = %handle, bytes = n, "Sent to client");
                }
                RelayEvent::Latency(latency) => debug!(
                    handle = %handle,
                    latency_ms = latency.as_millis() as u64,
                    "Upstream connected"
                ),
                RelayEvent::Finished => {
                    totals.finished += 1;
                    debug!(handle = %handle, "Connection finished");
                }
            },
            DispatchEvent::Banned { peer } => {
                info!(peer = %peer, "Banned address attempted to connect");
            }
            DispatchEvent::Rejected { peer, reason } => {
                warn!(peer = %peer, reason = %reason, "Connection rejected");
            }
        }
    }

    totals
}

/// Resolve on Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
