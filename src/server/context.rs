// src/server/context.rs

use crate::config::Config;
use crate::connection::ConnectionTable;
use crate::core::introspection::StatusMirror;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Semaphore, broadcast};
use tokio_rustls::TlsAcceptor;

/// Where the daemon ended up listening.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoundAddresses {
    pub tcp: Option<SocketAddr>,
    pub unix: Option<PathBuf>,
    pub discovery: Option<SocketAddr>,
}

/// Holds all the initialized state required to run the dispatcher.
pub struct ServerContext {
    pub config: Config,
    /// Listener at index 0, discovery socket at index 1 when configured.
    pub table: ConnectionTable,
    pub bound: BoundAddresses,
    pub shutdown_tx: broadcast::Sender<()>,
    pub acceptor: Option<TlsAcceptor>,
    pub mirror: Arc<StatusMirror>,
    pub connection_permits: Arc<Semaphore>,
}
