// src/connection/guard.rs

//! Defines `ConnectionGuard`, an RAII guard for connection accounting.

use crate::core::metrics;
use tokio::sync::OwnedSemaphorePermit;
use tracing::debug;

/// Keeps the connected-clients gauge in step with the lifetime of a client
/// connection. The guard travels with the connection when it is transferred to
/// a locker, so the gauge drops exactly once, wherever the connection ends.
#[derive(Debug)]
pub struct ConnectionGuard {
    /// The unique identifier for the client session.
    pub(crate) conn_id: u64,
    /// The address of the client, as printed in logs.
    pub(crate) peer: String,
    /// The slot this connection takes from the `max_clients` budget.
    _permit: Option<OwnedSemaphorePermit>,
}

impl ConnectionGuard {
    pub(crate) fn new(conn_id: u64, peer: String, permit: Option<OwnedSemaphorePermit>) -> Self {
        metrics::CONNECTED_CLIENTS.inc();
        metrics::CONNECTIONS_RECEIVED_TOTAL.inc();
        Self {
            conn_id,
            peer,
            _permit: permit,
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        metrics::CONNECTED_CLIENTS.dec();
        debug!(
            "ConnectionGuard dropping, connection {} from {} is closed",
            self.conn_id, self.peer
        );
    }
}
