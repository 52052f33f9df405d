// src/daemon/mod.rs

//! The pakd daemon
//!
//! Owns the daemon singleton lock, the Unix socket listener, and the wiring
//! between sessions and the resolver/orchestrator core. Connections arrive,
//! present a start-session handshake, and are claimed against the session
//! registry (create or rejoin); everything after that flows through the
//! session's processing worker.
//!
//! ```text
//! client                                pakd
//!   │                                     │
//!   ├── start-session ───────────────────►│ claim session (create/rejoin)
//!   │◄── session-started ─────────────────┤
//!   ├── install-package ─────────────────►│ orchestration worker
//!   │◄── installing-progress / events ────┤
//!   │◄── done ────────────────────────────┤
//! ```
//!
//! When the last session ends and nothing arrives for the configured idle
//! delay, the daemon requests its own shutdown.

pub mod lock;
pub mod status;

pub use lock::DaemonLock;
pub use status::{DaemonStatus, StatusSnapshot, read_status};

use crate::download::Downloader;
use crate::error::Result;
use crate::feed::{FeedRegistry, PackageFeed};
use crate::identity::CanonicalIdentity;
use crate::orchestrator::{Installer, Orchestrator};
use crate::package::InstalledProbe;
use crate::registry::{PackageRegistry, RegistryEvent};
use crate::resolver::Resolver;
use crate::session::dispatch::{parse_handshake, policy};
use crate::session::message::{Event, OutboundMessage, Request};
use crate::session::{ClaimOutcome, Dispatcher, PermissionCheck, SessionRegistry};
use crate::signature::SignatureVerifier;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tracing::{debug, error, info, warn};

/// Daemon configuration
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    /// Path to the Unix socket (default: /run/pakd/pakd.sock)
    pub socket_path: PathBuf,
    /// Socket file mode (default: 0o660)
    pub socket_mode: u32,
    /// Package store root
    pub store_path: PathBuf,
    /// Path to the daemon lock file
    pub lock_path: PathBuf,
    /// Path to the readiness status file
    pub status_path: PathBuf,
    /// How long a disconnected session waits for a rejoin
    pub reconnect_window: Duration,
    /// Orchestration retry poll interval
    pub poll_interval: Duration,
    /// Idle time after the last session ends before the daemon asks to shut
    /// down
    pub idle_shutdown_delay: Duration,
    /// The daemon's own package identity, enabling the self-restart check
    pub own_identity: Option<CanonicalIdentity>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            socket_path: PathBuf::from("/run/pakd/pakd.sock"),
            socket_mode: 0o660,
            store_path: PathBuf::from("/var/lib/pakd/store"),
            lock_path: PathBuf::from(DaemonLock::DEFAULT_PATH),
            status_path: PathBuf::from(DaemonStatus::DEFAULT_PATH),
            reconnect_window: Duration::from_secs(60),
            poll_interval: Duration::from_secs(5),
            idle_shutdown_delay: Duration::from_secs(300),
            own_identity: None,
        }
    }
}

impl DaemonConfig {
    pub fn with_socket_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.socket_path = path.into();
        self
    }

    pub fn with_store_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.store_path = path.into();
        self
    }

    pub fn with_lock_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.lock_path = path.into();
        self
    }

    pub fn with_status_path<P: Into<PathBuf>>(mut self, path: P) -> Self {
        self.status_path = path.into();
        self
    }

    pub fn with_reconnect_window(mut self, window: Duration) -> Self {
        self.reconnect_window = window;
        self
    }

    pub fn with_idle_shutdown_delay(mut self, delay: Duration) -> Self {
        self.idle_shutdown_delay = delay;
        self
    }

    pub fn with_own_identity(mut self, identity: CanonicalIdentity) -> Self {
        self.own_identity = Some(identity);
        self
    }
}

/// External collaborators the daemon core consumes
pub struct DaemonCapabilities {
    pub probe: Arc<dyn InstalledProbe>,
    pub verifier: Arc<dyn SignatureVerifier>,
    pub downloader: Arc<dyn Downloader>,
    pub installer: Arc<dyn Installer>,
    pub permissions: Arc<dyn PermissionCheck>,
    /// Feeds supplied by the one-time system feed load
    pub system_feeds: Vec<Arc<dyn PackageFeed>>,
}

/// Run the daemon until shutdown is requested
///
/// Acquires the singleton lock, loads the system feeds, binds the socket,
/// and accepts connections until a shutdown signal, a shutdown request, or
/// the idle timeout.
pub async fn run_daemon(config: DaemonConfig, capabilities: DaemonCapabilities) -> Result<()> {
    info!(version = env!("CARGO_PKG_VERSION"), "starting pakd");

    let lock = DaemonLock::try_acquire(&config.lock_path)?;
    lock.write_pid()?;

    let status = Arc::new(DaemonStatus::new(&config.status_path));
    status.publish();

    let registry = Arc::new(PackageRegistry::new(capabilities.probe));
    let feeds = Arc::new(FeedRegistry::new());
    status.set_startup_percent(20);

    // One-time system feed load; later callers take the fast path.
    let system_feeds = capabilities.system_feeds;
    feeds
        .ensure_loaded(move || async move { Ok(system_feeds) })
        .await?;
    status.set_startup_percent(60);

    // Installed transitions make feeds rescan on their next query.
    spawn_feed_invalidation(registry.clone(), feeds.clone());

    let resolver = Arc::new(Resolver::new(
        registry.clone(),
        feeds.clone(),
        capabilities.verifier.clone(),
    ));
    let mut orchestrator = Orchestrator::new(
        registry.clone(),
        resolver,
        capabilities.verifier,
        capabilities.downloader,
        capabilities.installer,
        config.store_path.join("files"),
    )
    .with_poll_interval(config.poll_interval)
    .with_service_control(status.clone());
    if let Some(ref own) = config.own_identity {
        orchestrator = orchestrator.with_own_identity(own.clone());
    }

    let dispatcher = Arc::new(Dispatcher::new(
        registry,
        feeds,
        Arc::new(orchestrator),
        capabilities.permissions,
    ));
    let sessions = Arc::new(SessionRegistry::new(config.reconnect_window));

    let listener = bind_unix_socket(&config)?;
    status.set_available();
    info!(socket = %config.socket_path.display(), "accepting connections");

    let tick = Duration::from_secs(5);
    let mut idle_since = Instant::now();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);

    loop {
        if status.is_shutdown_requested() {
            info!("shutdown requested");
            break;
        }

        tokio::select! {
            accepted = tokio::time::timeout(tick, listener.accept()) => {
                match accepted {
                    Ok(Ok((stream, _addr))) => {
                        idle_since = Instant::now();
                        let dispatcher = dispatcher.clone();
                        let sessions = sessions.clone();
                        tokio::spawn(async move {
                            handle_connection(stream, dispatcher, sessions).await;
                        });
                    }
                    Ok(Err(err)) => {
                        error!(error = %err, "accept failed");
                    }
                    Err(_) => {
                        // Housekeeping tick: idle shutdown policy.
                        if sessions.active_count() > 0 {
                            idle_since = Instant::now();
                        } else if idle_since.elapsed() >= config.idle_shutdown_delay {
                            info!("idle timeout elapsed with no sessions");
                            status.request_shutdown();
                        }
                    }
                }
            }
            _ = &mut shutdown => {
                info!("received shutdown signal");
                break;
            }
        }
    }

    status.set_shutting_down();
    sessions.end_all().await;
    let _ = std::fs::remove_file(&config.socket_path);
    info!("daemon stopped");
    Ok(())
}

/// Bind the daemon's Unix socket, replacing any stale socket file
fn bind_unix_socket(config: &DaemonConfig) -> Result<UnixListener> {
    if config.socket_path.exists() {
        std::fs::remove_file(&config.socket_path)?;
    }
    if let Some(parent) = config.socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let listener = UnixListener::bind(&config.socket_path)?;
    let perms = std::fs::Permissions::from_mode(config.socket_mode);
    std::fs::set_permissions(&config.socket_path, perms)?;
    info!(
        socket = %config.socket_path.display(),
        mode = %format!("{:o}", config.socket_mode),
        "bound unix socket"
    );
    Ok(listener)
}

/// Forward installed-package transitions into feed staleness
fn spawn_feed_invalidation(registry: Arc<PackageRegistry>, feeds: Arc<FeedRegistry>) {
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            let RegistryEvent::Installed { identity } = event;
            debug!(package = %identity, "invalidating feeds after install");
            feeds.set_all_stale();
        }
    });
}

/// Drive one inbound connection through handshake and into a session
///
/// The first message must be a well-formed start-session carrying the
/// connect permission; anything else abandons the connection silently (no
/// error reply).
async fn handle_connection(
    stream: UnixStream,
    dispatcher: Arc<Dispatcher>,
    sessions: Arc<SessionRegistry>,
) {
    let (peer_uid, peer_elevated) = match stream.peer_cred() {
        Ok(cred) => (cred.uid(), cred.uid() == 0),
        Err(err) => {
            debug!(error = %err, "no peer credentials, abandoning connection");
            return;
        }
    };

    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let mut line = String::new();
    let handshake =
        tokio::time::timeout(Duration::from_secs(10), reader.read_line(&mut line)).await;
    match handshake {
        Ok(Ok(n)) if n > 0 => {}
        _ => return,
    }

    let Ok(request) = serde_json::from_str::<Request>(line.trim()) else {
        debug!("unparsable first message, abandoning connection");
        return;
    };
    let Some((key, synchronous)) = parse_handshake(&request, peer_uid, peer_elevated) else {
        debug!("first message was not a session handshake, abandoning connection");
        return;
    };

    if !dispatcher.permissions().is_allowed(&key, policy::CONNECT) {
        warn!(client = %key.client_id, uid = key.user_id, "connect permission denied");
        return;
    }

    let (session, fresh) = match sessions.claim(key, synchronous) {
        ClaimOutcome::Created(session) => (session, true),
        ClaimOutcome::Rejoined(session) => (session, false),
    };

    session
        .clone()
        .attach(Box::new(reader), Box::new(write_half))
        .await;
    session.enqueue(OutboundMessage::new(
        request.correlation_id.clone(),
        Event::SessionStarted {
            session_id: session.key().session_id.clone(),
        },
    ));

    if fresh {
        let session = session.clone();
        tokio::spawn(async move {
            session.run(dispatcher).await;
        });
    }
}

/// Whether a daemon currently serves this host
pub fn is_daemon_running(lock_path: impl AsRef<std::path::Path>) -> bool {
    DaemonLock::is_held(lock_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DaemonConfig::default();
        assert_eq!(config.socket_path, PathBuf::from("/run/pakd/pakd.sock"));
        assert_eq!(config.socket_mode, 0o660);
        assert_eq!(config.reconnect_window, Duration::from_secs(60));
    }

    #[test]
    fn test_config_builders() {
        let config = DaemonConfig::default()
            .with_socket_path("/tmp/test.sock")
            .with_reconnect_window(Duration::from_secs(5))
            .with_idle_shutdown_delay(Duration::from_secs(30));
        assert_eq!(config.socket_path, PathBuf::from("/tmp/test.sock"));
        assert_eq!(config.reconnect_window, Duration::from_secs(5));
        assert_eq!(config.idle_shutdown_delay, Duration::from_secs(30));
    }
}
