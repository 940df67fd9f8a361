// src/core/locker/worker.rs

//! The task behind one locker. It owns the resource and every client
//! connection transferred to it, and serializes all grants and releases.

use super::{LockerCounters, TransferToken};
use crate::connection::{ConnectionTable, Endpoint, Event};
use crate::core::FlomError;
use crate::core::introspection::LockerObserver;
use crate::core::metrics;
use crate::core::protocol::{
    ANSWER_STEP, Body, DEFERRED_STEP, Message, PROTOCOL_LEVEL, ReplyCode, Verb,
};
use crate::core::resource::{self, Acquire, LockRequest, LockResource, Wakeup};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub(super) fn spawn(worker: Worker) -> JoinHandle<()> {
    tokio::spawn(worker.run())
}

pub(super) struct Worker {
    id: u64,
    key: String,
    resource: Box<dyn LockResource>,
    counters: Arc<LockerCounters>,
    observer: Arc<dyn LockerObserver>,
    inbound: mpsc::UnboundedReceiver<TransferToken>,
    shutdown_rx: broadcast::Receiver<()>,
    table: ConnectionTable,
    /// Table index of every held connection, by connection id.
    index_of: HashMap<u64, usize>,
    /// When each current holder was granted its lock.
    granted_at: HashMap<u64, Instant>,
}

impl Worker {
    pub(super) fn new(
        id: u64,
        key: String,
        resource: Box<dyn LockResource>,
        counters: Arc<LockerCounters>,
        observer: Arc<dyn LockerObserver>,
        inbound: mpsc::UnboundedReceiver<TransferToken>,
        shutdown_rx: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            id,
            key,
            resource,
            counters,
            observer,
            inbound,
            shutdown_rx,
            table: ConnectionTable::new(),
            index_of: HashMap::new(),
            granted_at: HashMap::new(),
        }
    }

    async fn run(mut self) {
        let mut inbound_open = true;
        loop {
            if !inbound_open && self.table.is_empty() {
                break;
            }
            let has_clients = !self.table.is_empty();
            let deadline = self.resource.next_deadline();

            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("Locker {} received shutdown signal", self.id);
                    break;
                }
                token = self.inbound.recv(), if inbound_open => match token {
                    Some(token) => self.accept(token).await,
                    None => {
                        debug!("Locker {} inbound channel closed", self.id);
                        inbound_open = false;
                    }
                },
                _ = tokio::time::sleep(deadline.unwrap_or_default()), if deadline.is_some() => {
                    let wakeups = self.resource.on_deadline();
                    self.deliver(wakeups).await;
                }
                events = self.table.ready(), if has_clients => {
                    self.table.begin_pass();
                    for (idx, event) in events {
                        self.handle_event(idx, event).await;
                    }
                    self.table.end_pass();
                }
            }
        }

        for idx in self.table.client_indices() {
            if let Some(conn) = self.table.take_client(idx) {
                self.observer.connection_detached(self.id, conn.id);
            }
        }
        self.counters.held.store(0, Ordering::Release);
        debug!("Locker {} for '{}' exited", self.id, self.key);
    }

    /// Takes ownership of a transferred connection and runs its pending request.
    async fn accept(&mut self, token: TransferToken) {
        let TransferToken {
            domain,
            conn_id,
            sequence,
            mut connection,
        } = token;
        let deferred = connection.waiting_for.take().is_some();
        let pending = connection.pending.take();

        let idx = self.table.add(Endpoint::Client(connection));
        self.index_of.insert(conn_id, idx);
        self.counters.held.fetch_add(1, Ordering::AcqRel);
        self.counters.read_seq.store(sequence, Ordering::Release);
        self.observer.connection_attached(self.id, conn_id);
        debug!(
            "Locker {} took connection {} ({}) at sequence {}",
            self.id, conn_id, domain, sequence
        );

        match pending {
            Some(message) => {
                let step = if deferred { DEFERRED_STEP } else { ANSWER_STEP };
                self.lock(idx, &message, step).await;
            }
            None => warn!(
                "Connection {} reached locker {} without a pending request",
                conn_id, self.id
            ),
        }
    }

    async fn handle_event(&mut self, idx: usize, event: Event) {
        match event {
            Event::Message(message) => self.handle_message(idx, message).await,
            Event::Closed => {
                debug!("Locker {}: connection at slot {} closed by peer", self.id, idx);
                self.drop_connection(idx).await;
            }
            Event::ClientError(e) => {
                warn!("Locker {}: client error: {}", self.id, e);
                self.drop_connection(idx).await;
            }
            Event::Accepted(_) | Event::Datagram { .. } | Event::ListenerError(_) => {}
        }
    }

    async fn handle_message(&mut self, idx: usize, message: Message) {
        let Some(conn) = self.table.client_mut(idx) else {
            return;
        };
        if conn.half_closed {
            return;
        }
        conn.record(&message);
        if message.level != PROTOCOL_LEVEL {
            warn!(
                "{}",
                FlomError::ProtocolLevel {
                    expected: PROTOCOL_LEVEL,
                    found: message.level
                }
            );
            self.drop_connection(idx).await;
            return;
        }
        if !message.is_request() {
            self.protocol_error(idx, message.verb, "unexpected step").await;
            return;
        }

        match (&message.verb, &message.body) {
            (Verb::Unlock, Body::Unlock { name, rollback }) => {
                if !self.owns_name(name) {
                    self.protocol_error(idx, Verb::Unlock, "unlock for another resource")
                        .await;
                    return;
                }
                self.unlock(idx, *rollback).await;
            }
            (Verb::Lock, Body::LockRequest { resource, .. }) => {
                if !self.owns_name(&resource.name) {
                    self.protocol_error(idx, Verb::Lock, "lock for another resource")
                        .await;
                    return;
                }
                self.lock(idx, &message, ANSWER_STEP).await;
            }
            (Verb::Ping, Body::Ping) => {
                let reply = Message::answer(Verb::Ping, ANSWER_STEP, ReplyCode::Ok, None);
                self.send_or_drop(idx, reply).await;
            }
            (verb, _) => {
                let verb = *verb;
                self.protocol_error(idx, verb, "verb not accepted by a locker")
                    .await;
            }
        }
    }

    fn owns_name(&self, name: &str) -> bool {
        resource::classify(name).is_some_and(|kind| resource::locker_key(name, kind) == self.key)
    }

    /// Runs one lock request against the resource and answers it at `step`.
    async fn lock(&mut self, idx: usize, message: &Message, step: u32) {
        let Some(conn_id) = self.table.client(idx).map(|c| c.id) else {
            return;
        };
        let Body::LockRequest { resource, .. } = &message.body else {
            self.protocol_error(idx, Verb::Lock, "lock without a resource").await;
            return;
        };

        let request = LockRequest::from(resource);
        let (rc, element) = match self.resource.acquire(conn_id, &request) {
            Acquire::Granted { element } => {
                self.granted_at.insert(conn_id, Instant::now());
                (ReplyCode::Ok, element)
            }
            Acquire::Enqueued => (ReplyCode::Enqueued, None),
            Acquire::Busy => (ReplyCode::Busy, None),
            Acquire::Impossible => (ReplyCode::Impossible, None),
        };
        let label: &str = rc.as_ref();
        metrics::LOCK_OUTCOMES_TOTAL.with_label_values(&[label]).inc();
        debug!(
            "Locker {}: '{}' for connection {} -> {}",
            self.id, request.name, conn_id, rc
        );

        // A client coming from the incubator was already told it is waiting.
        if rc == ReplyCode::Enqueued && step == DEFERRED_STEP {
            return;
        }
        self.send_or_drop(idx, Message::answer(Verb::Lock, step, rc, element))
            .await;
    }

    async fn unlock(&mut self, idx: usize, rollback: bool) {
        let Some(conn_id) = self.table.client(idx).map(|c| c.id) else {
            return;
        };
        self.observe_hold_time(conn_id);
        let wakeups = self.resource.release(conn_id, rollback);
        self.deliver(wakeups).await;
    }

    fn observe_hold_time(&mut self, conn_id: u64) {
        if let Some(since) = self.granted_at.remove(&conn_id) {
            metrics::LOCK_HOLD_SECONDS.observe(since.elapsed().as_secs_f64());
        }
    }

    /// Sends the deferred grants. Connections that fail to receive theirs are
    /// dropped, which may in turn wake further waiters.
    async fn deliver(&mut self, wakeups: Vec<Wakeup>) {
        let mut queue: VecDeque<Wakeup> = wakeups.into();
        while let Some(wakeup) = queue.pop_front() {
            let Some(&idx) = self.index_of.get(&wakeup.holder) else {
                continue;
            };
            self.granted_at.insert(wakeup.holder, Instant::now());
            let label: &str = ReplyCode::Ok.as_ref();
            metrics::LOCK_OUTCOMES_TOTAL.with_label_values(&[label]).inc();
            let grant = Message::answer(Verb::Lock, DEFERRED_STEP, ReplyCode::Ok, wakeup.element);
            let sent = match self.table.client_mut(idx) {
                Some(conn) => conn.send(grant).await,
                None => continue,
            };
            if let Err(e) = sent {
                warn!(
                    "Locker {}: failed to deliver grant to connection {}: {}",
                    self.id, wakeup.holder, e
                );
                queue.extend(self.detach(idx));
            }
        }
    }

    async fn send_or_drop(&mut self, idx: usize, message: Message) {
        let sent = match self.table.client_mut(idx) {
            Some(conn) => conn.send(message).await,
            None => return,
        };
        if let Err(e) = sent {
            warn!("Locker {}: write failed: {}", self.id, e);
            self.drop_connection(idx).await;
        }
    }

    async fn protocol_error(&mut self, idx: usize, verb: Verb, reason: &str) {
        warn!(
            "Locker {}: {}",
            self.id,
            FlomError::ProtocolViolation(reason.to_string())
        );
        if let Some(conn) = self.table.client_mut(idx) {
            let reply = Message::answer(verb, ANSWER_STEP, ReplyCode::ProtocolError, None);
            if let Err(e) = conn.send(reply).await {
                debug!("Locker {}: failed to report protocol error: {}", self.id, e);
            }
        }
        self.drop_connection(idx).await;
    }

    /// Closes a held connection, releasing whatever it held or waited for.
    async fn drop_connection(&mut self, idx: usize) {
        let wakeups = self.detach(idx);
        self.deliver(wakeups).await;
    }

    fn detach(&mut self, idx: usize) -> Vec<Wakeup> {
        let Some(conn) = self.table.take_client(idx) else {
            return Vec::new();
        };
        self.index_of.remove(&conn.id);
        self.observe_hold_time(conn.id);
        self.counters.held.fetch_sub(1, Ordering::AcqRel);
        self.observer.connection_detached(self.id, conn.id);
        debug!("Locker {} released connection {}", self.id, conn.id);
        // Transactional resources give back what a vanished holder took.
        self.resource.release(conn.id, true)
    }
}
