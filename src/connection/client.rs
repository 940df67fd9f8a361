// src/connection/client.rs

use super::guard::ConnectionGuard;
use crate::core::FlomError;
use crate::core::protocol::{FlomCodec, Message, Verb};
use crate::server::{AnyStream, Domain};
use futures::SinkExt;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::io::AsyncWriteExt;
use tokio::sync::OwnedSemaphorePermit;
use tokio_util::codec::Framed;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Returns a fresh, process-wide unique connection id.
pub fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// An accepted client and its protocol state. Owned either by the dispatcher's
/// table or by exactly one locker.
pub struct ClientConnection {
    pub id: u64,
    pub peer: String,
    pub domain: Domain,
    pub framed: Framed<AnyStream, FlomCodec>,
    /// Verb and step of the last message received or sent.
    pub last_verb: Option<Verb>,
    pub last_step: u32,
    /// The locker key this connection waits for while parked in the incubator.
    pub waiting_for: Option<String>,
    /// The lock request that has not been answered by a locker yet.
    pub pending: Option<Message>,
    pub half_closed: bool,
    /// Hex SHA-256 of the client certificate, for TLS connections.
    pub fingerprint: Option<String>,
    _guard: ConnectionGuard,
}

impl std::fmt::Debug for ClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConnection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("domain", &self.domain)
            .field("waiting_for", &self.waiting_for)
            .field("half_closed", &self.half_closed)
            .finish()
    }
}

impl ClientConnection {
    pub fn new(stream: AnyStream, peer: String, permit: Option<OwnedSemaphorePermit>) -> Self {
        let id = next_connection_id();
        let domain = stream.domain();
        let fingerprint = stream.peer_fingerprint();
        Self {
            id,
            domain,
            fingerprint,
            framed: Framed::new(stream, FlomCodec),
            last_verb: None,
            last_step: 0,
            waiting_for: None,
            pending: None,
            half_closed: false,
            _guard: ConnectionGuard::new(id, peer.clone(), permit),
            peer,
        }
    }

    pub fn is_waiting(&self) -> bool {
        self.waiting_for.is_some()
    }

    /// Records the position of a received message in its exchange.
    pub fn record(&mut self, message: &Message) {
        self.last_verb = Some(message.verb);
        self.last_step = message.step;
    }

    /// Writes one message and flushes it.
    pub async fn send(&mut self, message: Message) -> Result<(), FlomError> {
        self.last_verb = Some(message.verb);
        self.last_step = message.step;
        self.framed.send(message).await
    }

    /// Shuts down the write side only. The connection stays readable so that
    /// the peer's close is still observed.
    pub async fn half_close(&mut self) -> Result<(), FlomError> {
        if self.half_closed {
            return Ok(());
        }
        self.half_closed = true;
        self.framed.get_mut().shutdown().await?;
        Ok(())
    }
}
