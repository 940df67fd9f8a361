// src/server/dispatcher.rs

//! The event loop that owns every connection not yet handed to a locker.
//!
//! One iteration waits for readiness (bounded by the sweep interval), drains
//! every ready endpoint, then sweeps the lockers for idleness.

use super::classifier::{self, Route};
use super::context::ServerContext;
use super::management::{self, Directive};
use super::stream::AnyStream;
use super::tls;
use crate::config::Config;
use crate::connection::{Accepted, ClientConnection, ConnectionTable, Endpoint, Event};
use crate::core::FlomError;
use crate::core::errors::ErrorClass;
use crate::core::admission::{self, Admission};
use crate::core::introspection::{LockerObserver, StatusMirror};
use crate::core::locker::{LockerSet, transfer};
use crate::core::metrics;
use crate::core::protocol::{
    ANSWER_STEP, FlomCodec, Message, ReplyCode, ResourceRequest, Verb,
};
use crate::core::resource::{self, ResourceKind};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Semaphore, broadcast};
use tokio::task::{JoinError, JoinSet};
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

pub struct Dispatcher {
    config: Config,
    table: ConnectionTable,
    lockers: LockerSet,
    acceptor: Option<TlsAcceptor>,
    handshakes: JoinSet<Result<ClientConnection, FlomError>>,
    permits: Arc<Semaphore>,
    mirror: Arc<StatusMirror>,
    shutdown_rx: broadcast::Receiver<()>,
    /// Address and port announced to discovery requests.
    announce: Option<(String, u16)>,
    /// Current idle lifespan; a quiesce request shortens it.
    idle_lifespan: Duration,
    idle_since: Instant,
    /// Sweep again without waiting, because a locker was just reaped.
    recheck: bool,
    stop: bool,
}

impl Dispatcher {
    pub fn new(ctx: ServerContext) -> Self {
        let observer: Arc<dyn LockerObserver> = ctx.mirror.clone();
        let announce = ctx
            .bound
            .tcp
            .map(|addr| (announce_address(&ctx.config, addr), addr.port()));
        Self {
            idle_lifespan: ctx.config.idle_lifespan,
            lockers: LockerSet::new(observer, ctx.shutdown_tx.clone()),
            shutdown_rx: ctx.shutdown_tx.subscribe(),
            config: ctx.config,
            table: ctx.table,
            acceptor: ctx.acceptor,
            handshakes: JoinSet::new(),
            permits: ctx.connection_permits,
            mirror: ctx.mirror,
            announce,
            idle_since: Instant::now(),
            recheck: false,
            stop: false,
        }
    }

    /// Runs until shutdown, then stops every locker.
    pub async fn run(mut self) -> Result<(), FlomError> {
        info!("Dispatcher started.");
        let result = self.event_loop().await;
        if let Err(e) = &result {
            error!("Dispatcher stopped on error: {}", e);
        }
        self.lockers.shutdown().await;
        self.handshakes.shutdown().await;
        info!("Dispatcher stopped.");
        result
    }

    fn sweep_interval(&self) -> Duration {
        if self.idle_lifespan.is_zero() {
            self.config.locker_sweep_interval
        } else {
            self.idle_lifespan / 3
        }
    }

    async fn event_loop(&mut self) -> Result<(), FlomError> {
        loop {
            let timeout = if self.recheck {
                Duration::ZERO
            } else {
                self.sweep_interval()
            };
            self.recheck = false;
            let handshaking = !self.handshakes.is_empty();

            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Dispatcher received shutdown signal.");
                    return Ok(());
                }
                Some(joined) = self.handshakes.join_next(), if handshaking => {
                    self.handshake_done(joined);
                }
                polled = tokio::time::timeout(timeout, self.table.ready()) => match polled {
                    Ok(events) => self.drain(events).await?,
                    Err(_) => {
                        if self.should_exit() {
                            info!(
                                "Idle for {:?} with no lockers and no clients, shutting down.",
                                self.idle_lifespan
                            );
                            return Ok(());
                        }
                    }
                },
            }

            if self.stop {
                return Ok(());
            }
            self.recheck = self.lockers.sweep(self.config.locker_idle_periods).await?;
            if !self.is_quiescent() {
                self.idle_since = Instant::now();
            }
        }
    }

    fn is_quiescent(&self) -> bool {
        self.lockers.is_empty() && self.table.client_count() == 0 && self.handshakes.is_empty()
    }

    fn should_exit(&self) -> bool {
        !self.idle_lifespan.is_zero()
            && self.is_quiescent()
            && self.idle_since.elapsed() >= self.idle_lifespan
    }

    async fn drain(&mut self, events: Vec<(usize, Event)>) -> Result<(), FlomError> {
        self.idle_since = Instant::now();
        self.table.begin_pass();
        let mut result = Ok(());
        for (idx, event) in events {
            let outcome = match event {
                Event::Accepted(accepted) => {
                    self.accept(accepted);
                    Ok(())
                }
                Event::Datagram { data, from } => {
                    self.discovery(idx, &data, from).await;
                    Ok(())
                }
                Event::Message(message) => self.handle_message(idx, message).await,
                Event::Closed => {
                    debug!("Connection at slot {} closed by peer", idx);
                    self.close_client(idx);
                    Ok(())
                }
                Event::ClientError(e) => self.fail(idx, e).await,
                Event::ListenerError(e) => self.fail(idx, FlomError::Listener(e.to_string())).await,
            };
            if let Err(e) = outcome {
                result = Err(e);
                break;
            }
            if self.stop {
                break;
            }
        }
        self.table.end_pass();
        result
    }

    fn accept(&mut self, accepted: Accepted) {
        let Ok(permit) = self.permits.clone().try_acquire_owned() else {
            warn!(
                "Refusing connection: max_clients ({}) reached",
                self.config.max_clients
            );
            return;
        };
        match accepted {
            Accepted::Tcp(stream, addr) => match self.acceptor.clone() {
                Some(acceptor) => {
                    self.handshakes
                        .spawn(tls::handshake(acceptor, stream, addr, permit));
                }
                None => {
                    let conn =
                        ClientConnection::new(AnyStream::Tcp(stream), addr.to_string(), Some(permit));
                    self.register(conn);
                }
            },
            Accepted::Unix(stream) => {
                let conn = ClientConnection::new(AnyStream::Unix(stream), "unix".to_string(), Some(permit));
                self.register(conn);
            }
        }
    }

    fn register(&mut self, conn: ClientConnection) {
        let (id, peer, domain) = (conn.id, conn.peer.clone(), conn.domain);
        let idx = self.table.add(Endpoint::Client(conn));
        debug!(
            "Accepted connection {} from {} ({}) at slot {}",
            id, peer, domain, idx
        );
    }

    fn handshake_done(&mut self, joined: Result<Result<ClientConnection, FlomError>, JoinError>) {
        match joined {
            Ok(Ok(conn)) => self.register(conn),
            Ok(Err(e)) => warn!("{}", e),
            Err(e) => warn!("TLS handshake task failed: {}", e),
        }
    }

    /// Answers one discovery datagram. Malformed datagrams are ignored.
    async fn discovery(&mut self, idx: usize, data: &[u8], from: SocketAddr) {
        let message = match FlomCodec::decode_datagram(data) {
            Ok(message) => message,
            Err(e) => {
                debug!("Ignoring datagram from {}: {}", from, e);
                return;
            }
        };
        if message.verb != Verb::Discover || !message.is_request() {
            debug!("Ignoring {} datagram from {}", message.verb, from);
            return;
        }
        let Some((address, port)) = self.announce.clone() else {
            return;
        };
        let reply = match FlomCodec::encode_to_vec(&Message::discover_reply(address, port)) {
            Ok(reply) => reply,
            Err(e) => {
                warn!("Failed to encode discovery reply: {}", e);
                return;
            }
        };
        if let Some(Endpoint::Discovery(socket)) = self.table.get(idx) {
            match socket.send_to(&reply, from).await {
                Ok(_) => debug!("Answered discovery request from {}", from),
                Err(e) => warn!("Failed to answer discovery request from {}: {}", from, e),
            }
        }
    }

    async fn handle_message(&mut self, idx: usize, message: Message) -> Result<(), FlomError> {
        let check_peer_id = self.config.tls.check_peer_id;
        let Some(conn) = self.table.client_mut(idx) else {
            return Ok(());
        };
        if conn.half_closed {
            debug!("Ignoring message from half-closed connection {}", conn.id);
            return Ok(());
        }
        conn.record(&message);
        if conn.is_waiting() {
            let e = FlomError::ProtocolViolation("message while waiting for a resource".to_string());
            return self.fail(idx, e).await;
        }

        let route = match classifier::classify(&message, conn.fingerprint.as_deref(), check_peer_id)
        {
            Ok(route) => route,
            Err(e) => return self.fail(idx, e).await,
        };

        match route {
            Route::Ping => {
                let reply = Message::answer(Verb::Ping, ANSWER_STEP, ReplyCode::Ok, None);
                self.reply(idx, reply).await;
            }
            Route::Management(action) => {
                let (reply, directive) = management::handle(&action, &self.mirror);
                self.reply(idx, reply).await;
                match directive {
                    Directive::Continue => {}
                    Directive::StopNow => self.stop = true,
                    Directive::Quiesce => {
                        self.idle_lifespan = management::quiesced_lifespan(
                            self.idle_lifespan,
                            self.config.quiesce_grace,
                        );
                    }
                }
            }
            Route::Lock(request) => self.admit(idx, message, request).await?,
        }
        Ok(())
    }

    /// Applies the admission decision for a lock request read at `idx`.
    async fn admit(
        &mut self,
        idx: usize,
        message: Message,
        request: ResourceRequest,
    ) -> Result<(), FlomError> {
        let mut decision = self.decide(&request);
        if let Admission::Attach(id) = decision
            && self.lockers.reap_if_closing(id).await
        {
            // The closing worker held nothing; decide again now that its key is free.
            self.recheck = true;
            decision = self.decide(&request);
        }
        debug!("Admission for '{}': {:?}", request.name, decision);

        match decision {
            Admission::Reject(e) => return self.fail(idx, e).await,
            Admission::Queue { key } => self.incubate(idx, message, key).await,
            Admission::Attach(id) => self.hand_over(idx, id, Some(message)),
            Admission::StartNew { key, kind } => {
                return self.start_locker(idx, message, &request, key, kind).await;
            }
        }
        Ok(())
    }

    fn decide(&self, request: &ResourceRequest) -> Admission {
        admission::decide(request, |key| self.lockers.find(key).map(|l| l.id))
    }

    async fn start_locker(
        &mut self,
        idx: usize,
        message: Message,
        request: &ResourceRequest,
        key: String,
        kind: ResourceKind,
    ) -> Result<(), FlomError> {
        let resource = match resource::build(kind, &request.name) {
            Ok(resource) => resource,
            Err(e) => return self.fail(idx, e).await,
        };
        let id = self.lockers.start(&key, resource).id;
        self.hand_over(idx, id, Some(message));

        let waiting = self.table.waiting_on(&key);
        if !waiting.is_empty() {
            info!(
                "Locker {} adopts {} incubated connection(s) for '{}'",
                id,
                waiting.len(),
                key
            );
        }
        for waiter in waiting {
            self.hand_over(waiter, id, None);
        }
        Ok(())
    }

    /// Moves the client at `idx` to locker `id`. `message` becomes the pending
    /// request unless the connection already carries one from the incubator.
    fn hand_over(&mut self, idx: usize, id: u64, message: Option<Message>) {
        let Some(mut conn) = self.table.take_client(idx) else {
            return;
        };
        if conn.is_waiting() {
            metrics::INCUBATING_CLIENTS.dec();
        }
        if let Some(message) = message {
            conn.pending = Some(message);
        }
        let Some(locker) = self.lockers.get_mut(id) else {
            warn!("Dropping connection {}: {}", conn.id, FlomError::LockerGone(id));
            return;
        };
        if let Err(e) = transfer(locker, conn) {
            warn!("Dropping transferred connection: {}", e);
        }
    }

    async fn incubate(&mut self, idx: usize, message: Message, key: String) {
        let reply = Message::answer(Verb::Lock, ANSWER_STEP, ReplyCode::WaitingResource, None);
        count_outcome(ReplyCode::WaitingResource);
        let Some(conn) = self.table.client_mut(idx) else {
            return;
        };
        if let Err(e) = conn.send(reply).await {
            warn!("Closing connection {}: {}", conn.id, e);
            self.close_client(idx);
            return;
        }
        debug!("Connection {} waits for resource '{}'", conn.id, key);
        conn.waiting_for = Some(key);
        conn.pending = Some(message);
        metrics::INCUBATING_CLIENTS.inc();
    }

    /// Tears down as far as the class of `e` reaches. Request-scoped failures
    /// are answered before the write side is shut.
    async fn fail(&mut self, idx: usize, e: FlomError) -> Result<(), FlomError> {
        if e.is_fatal() {
            return Err(e);
        }
        match e.class() {
            ErrorClass::Request => {
                warn!("Rejecting request at slot {}: {}", idx, e);
                let rc = e.reply_code().unwrap_or(ReplyCode::ProtocolError);
                self.reject(idx, rc).await;
            }
            _ => {
                warn!("Closing connection at slot {}: {}", idx, e);
                self.close_client(idx);
            }
        }
        Ok(())
    }

    /// Answers with `rc` and shuts down the write side of the connection.
    async fn reject(&mut self, idx: usize, rc: ReplyCode) {
        count_outcome(rc);
        let Some(conn) = self.table.client_mut(idx) else {
            return;
        };
        let reply = Message::answer(Verb::Lock, ANSWER_STEP, rc, None);
        let sent = match conn.send(reply).await {
            Ok(()) => conn.half_close().await,
            Err(e) => Err(e),
        };
        if let Err(e) = sent {
            warn!("Closing connection {}: {}", conn.id, e);
            self.close_client(idx);
        }
    }

    async fn reply(&mut self, idx: usize, message: Message) {
        let Some(conn) = self.table.client_mut(idx) else {
            return;
        };
        if let Err(e) = conn.send(message).await {
            warn!("Closing connection {}: {}", conn.id, e);
            self.close_client(idx);
        }
    }

    fn close_client(&mut self, idx: usize) {
        if self.table.client(idx).is_some_and(|c| c.is_waiting()) {
            metrics::INCUBATING_CLIENTS.dec();
        }
        self.table.remove(idx);
    }
}

fn count_outcome(rc: ReplyCode) {
    let label: &str = rc.as_ref();
    metrics::LOCK_OUTCOMES_TOTAL.with_label_values(&[label]).inc();
}

/// The address clients should connect to: the configured one, or the bound
/// one when the configured address is a wildcard.
fn announce_address(config: &Config, bound: SocketAddr) -> String {
    match &config.unicast_address {
        Some(address) if !bound.ip().is_unspecified() => address.clone(),
        _ => bound.ip().to_string(),
    }
}
