// src/main.rs

use anyhow::Result;
use clap::{Parser, Subcommand};
use pakd::daemon::{self, DaemonCapabilities, DaemonConfig, DaemonLock, DaemonStatus};
use pakd::download::NoDownloader;
use pakd::session::dispatch::AllowAll;
use pakd::signature::PermissiveVerifier;
use pakd::store::LocalStore;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

#[derive(Parser)]
#[command(name = "pakd")]
#[command(author, version, about = "Package management daemon with dependency resolution and supersedence", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the daemon
    Run {
        /// Unix socket path
        #[arg(long, default_value = "/run/pakd/pakd.sock")]
        socket: String,
        /// Package store root
        #[arg(long, default_value = "/var/lib/pakd/store")]
        store: String,
        /// Daemon lock file
        #[arg(long, default_value = DaemonLock::DEFAULT_PATH)]
        lock: String,
        /// Readiness status file
        #[arg(long, default_value = DaemonStatus::DEFAULT_PATH)]
        status: String,
        /// Reconnect window for disconnected sessions, in seconds
        #[arg(long, default_value_t = 60)]
        reconnect_window: u64,
        /// Idle seconds after the last session before shutting down
        #[arg(long, default_value_t = 300)]
        idle_shutdown: u64,
    },
    /// Report daemon readiness
    Status {
        /// Readiness status file
        #[arg(long, default_value = DaemonStatus::DEFAULT_PATH)]
        status: String,
        /// Daemon lock file
        #[arg(long, default_value = DaemonLock::DEFAULT_PATH)]
        lock: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            socket,
            store,
            lock,
            status,
            reconnect_window,
            idle_shutdown,
        } => {
            let config = DaemonConfig::default()
                .with_socket_path(socket)
                .with_store_path(&store)
                .with_lock_path(lock)
                .with_status_path(status)
                .with_reconnect_window(Duration::from_secs(reconnect_window))
                .with_idle_shutdown_delay(Duration::from_secs(idle_shutdown));

            let local_store = Arc::new(LocalStore::new(&store));
            local_store.ensure_layout()?;

            let capabilities = DaemonCapabilities {
                probe: local_store.clone(),
                verifier: Arc::new(PermissiveVerifier),
                downloader: Arc::new(NoDownloader),
                installer: local_store,
                permissions: Arc::new(AllowAll),
                system_feeds: Vec::new(),
            };

            daemon::run_daemon(config, capabilities).await?;
            Ok(())
        }
        Commands::Status { status, lock } => {
            if !DaemonLock::is_held(&lock) {
                println!("pakd is not running");
                return Ok(());
            }
            match daemon::read_status(&status) {
                Ok(snapshot) => {
                    info!(pid = snapshot.pid, "read daemon status");
                    println!(
                        "pakd pid {}: available={} starting_up={} ({}%) shutting_down={} shutdown_requested={}",
                        snapshot.pid,
                        snapshot.available,
                        snapshot.starting_up,
                        snapshot.startup_percent,
                        snapshot.shutting_down,
                        snapshot.shutdown_requested,
                    );
                }
                Err(err) => {
                    println!("pakd is running but its status file is unreadable: {}", err);
                }
            }
            Ok(())
        }
    }
}
