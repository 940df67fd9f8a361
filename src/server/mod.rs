// src/server/mod.rs

use crate::config::Config;
use crate::core::FlomError;
use crate::core::introspection::StatusMirror;
use anyhow::{Result, anyhow};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

pub mod classifier;
mod context;
mod dispatcher;
mod initialization;
pub mod management;
mod metrics_server;
mod stream;
mod tls;

pub use context::BoundAddresses;
pub use stream::{AnyStream, Domain};

/// A running daemon: where it listens and how to stop it.
pub struct DaemonHandle {
    pub bound: BoundAddresses,
    pub mirror: Arc<StatusMirror>,
    shutdown_tx: broadcast::Sender<()>,
    task: JoinHandle<Result<(), FlomError>>,
}

impl DaemonHandle {
    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.bound.tcp
    }

    pub fn unix_path(&self) -> Option<&PathBuf> {
        self.bound.unix.as_ref()
    }

    pub fn discovery_addr(&self) -> Option<SocketAddr> {
        self.bound.discovery
    }

    /// Asks the dispatcher and every locker to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Waits for the dispatcher to return.
    pub async fn wait(self) -> Result<(), FlomError> {
        self.task
            .await
            .map_err(|e| FlomError::Internal(format!("dispatcher task failed: {e}")))?
    }
}

/// Binds every socket, then runs the dispatcher in the background. Once this
/// returns, the daemon accepts connections.
pub async fn spawn(config: Config) -> Result<DaemonHandle> {
    let ctx = initialization::setup(config).await?;
    let bound = ctx.bound.clone();
    let mirror = ctx.mirror.clone();
    let shutdown_tx = ctx.shutdown_tx.clone();

    if ctx.config.metrics.enabled {
        let port = ctx.config.metrics.port;
        tokio::spawn(metrics_server::run_metrics_server(
            mirror.clone(),
            port,
            shutdown_tx.subscribe(),
        ));
    } else {
        info!("Prometheus metrics server is disabled in the configuration.");
    }

    let dispatcher = dispatcher::Dispatcher::new(ctx);
    let exit_tx = shutdown_tx.clone();
    let socket_file = bound.unix.clone();
    let task = tokio::spawn(async move {
        let result = dispatcher.run().await;
        let _ = exit_tx.send(());
        if let Some(path) = socket_file
            && let Err(e) = std::fs::remove_file(&path)
        {
            warn!("Failed to remove socket file '{}': {}", path.display(), e);
        }
        result
    });

    Ok(DaemonHandle {
        bound,
        mirror,
        shutdown_tx,
        task,
    })
}

/// Runs the daemon in the foreground until it exits on its own or a signal arrives.
pub async fn run(config: Config) -> Result<()> {
    let pid_file = config.pid_file.clone();
    let handle = spawn(config).await?;
    log_readiness(&handle.bound);

    if let Some(path) = &pid_file {
        std::fs::write(path, format!("{}\n", std::process::id()))
            .map_err(|e| anyhow!("Failed to write pid file '{}': {}", path, e))?;
    }

    let mut sigint = signal(SignalKind::interrupt())
        .map_err(|e| anyhow!("Failed to register SIGINT handler: {}", e))?;
    let mut sigterm = signal(SignalKind::terminate())
        .map_err(|e| anyhow!("Failed to register SIGTERM handler: {}", e))?;

    let DaemonHandle {
        shutdown_tx,
        mut task,
        ..
    } = handle;
    let joined = tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT received, initiating graceful shutdown.");
            let _ = shutdown_tx.send(());
            (&mut task).await
        }
        _ = sigterm.recv() => {
            info!("SIGTERM received, initiating graceful shutdown.");
            let _ = shutdown_tx.send(());
            (&mut task).await
        }
        joined = &mut task => joined,
    };
    let result = joined
        .map_err(|e| FlomError::Internal(format!("dispatcher task failed: {e}")))
        .and_then(|r| r);

    if let Some(path) = &pid_file
        && let Err(e) = std::fs::remove_file(path)
    {
        warn!("Failed to remove pid file '{}': {}", path, e);
    }
    match result {
        Ok(()) => {
            info!("flomd exited cleanly.");
            Ok(())
        }
        Err(e) => {
            error!("flomd stopped on error: {}", e);
            Err(e.into())
        }
    }
}

fn log_readiness(bound: &BoundAddresses) {
    if let Some(addr) = bound.tcp {
        info!("Ready to accept connections on tcp {}", addr);
    }
    if let Some(path) = &bound.unix {
        info!("Ready to accept connections on {}", path.display());
    }
    if let Some(addr) = bound.discovery {
        info!("Answering discovery requests on udp {}", addr);
    }
}
