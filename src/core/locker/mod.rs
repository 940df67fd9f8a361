// src/core/locker/mod.rs

//! Lockers: one task per actively locked resource, and the set the dispatcher
//! keeps of them.
//!
//! A locker goes through `Active -> FlaggedIdle -> Closing -> Joinable` and is
//! then reaped. Only the dispatcher moves a locker between states, once per
//! sweep, based on the counters the worker publishes.

mod transfer;
mod worker;

pub use transfer::{TransferToken, transfer};

use crate::core::FlomError;
use crate::core::introspection::LockerObserver;
use crate::core::metrics;
use crate::core::resource::{LockResource, ResourceKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use strum_macros::Display;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum LockerState {
    Active,
    FlaggedIdle,
    Closing,
    Joinable,
}

/// Counters shared between the dispatcher and one worker.
#[derive(Debug, Default)]
pub struct LockerCounters {
    /// Transfers handed to the worker. Written by the dispatcher only.
    pub write_seq: AtomicU64,
    /// Sequence of the last transfer the worker acknowledged.
    pub read_seq: AtomicU64,
    /// Client connections the worker currently owns.
    pub held: AtomicUsize,
}

impl LockerCounters {
    /// True when every transfer was acknowledged and no client is held.
    pub fn is_idle(&self) -> Result<bool, FlomError> {
        let written = self.write_seq.load(Ordering::Acquire);
        let read = self.read_seq.load(Ordering::Acquire);
        if read > written {
            return Err(FlomError::Corruption(format!(
                "read sequence {read} is ahead of write sequence {written}"
            )));
        }
        Ok(read == written && self.held.load(Ordering::Acquire) == 0)
    }
}

/// The dispatcher's handle on one worker task.
pub struct Locker {
    pub id: u64,
    /// The name the locker is registered under.
    pub key: String,
    pub kind: ResourceKind,
    pub state: LockerState,
    pub idle_periods: u32,
    pub counters: Arc<LockerCounters>,
    inbound: Option<mpsc::UnboundedSender<TransferToken>>,
    handle: JoinHandle<()>,
}

impl std::fmt::Debug for Locker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Locker")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("kind", &self.kind)
            .field("state", &self.state)
            .field("idle_periods", &self.idle_periods)
            .finish()
    }
}

impl Locker {
    fn close_inbound(&mut self) {
        self.inbound = None;
        self.state = LockerState::Closing;
    }

    fn has_exited(&self) -> bool {
        self.handle.is_finished()
    }
}

/// The live lockers, scanned linearly by key.
pub struct LockerSet {
    lockers: Vec<Locker>,
    next_id: u64,
    observer: Arc<dyn LockerObserver>,
    shutdown_tx: broadcast::Sender<()>,
}

impl LockerSet {
    pub fn new(observer: Arc<dyn LockerObserver>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            lockers: Vec::new(),
            next_id: 1,
            observer,
            shutdown_tx,
        }
    }

    pub fn len(&self) -> usize {
        self.lockers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lockers.is_empty()
    }

    pub fn find(&self, key: &str) -> Option<&Locker> {
        self.lockers.iter().find(|l| l.key == key)
    }

    pub fn get_mut(&mut self, id: u64) -> Option<&mut Locker> {
        self.lockers.iter_mut().find(|l| l.id == id)
    }

    /// Spawns a worker that owns `resource` and registers it under `key`.
    pub fn start(&mut self, key: &str, resource: Box<dyn LockResource>) -> &mut Locker {
        let id = self.next_id;
        self.next_id += 1;
        let kind = resource.kind();
        let counters = Arc::new(LockerCounters::default());
        let (tx, rx) = mpsc::unbounded_channel();

        self.observer.locker_created(id, key, kind);
        let handle = worker::spawn(worker::Worker::new(
            id,
            key.to_string(),
            resource,
            counters.clone(),
            self.observer.clone(),
            rx,
            self.shutdown_tx.subscribe(),
        ));

        metrics::LOCKERS_STARTED_TOTAL.inc();
        metrics::ACTIVE_LOCKERS.inc();
        info!("Locker {} started for resource '{}' ({})", id, key, kind);

        self.lockers.push(Locker {
            id,
            key: key.to_string(),
            kind,
            state: LockerState::Active,
            idle_periods: 0,
            counters,
            inbound: Some(tx),
            handle,
        });
        let last = self.lockers.len() - 1;
        &mut self.lockers[last]
    }

    /// Waits for the worker of locker `id` to exit and removes it from the set.
    /// The inbound channel is closed first if it still is open.
    pub async fn reap(&mut self, id: u64) {
        let Some(pos) = self.lockers.iter().position(|l| l.id == id) else {
            return;
        };
        let mut locker = self.lockers.swap_remove(pos);
        if locker.inbound.is_some() {
            locker.close_inbound();
        }
        locker.state = LockerState::Joinable;
        if let Err(e) = locker.handle.await {
            warn!("Locker {} worker ended abnormally: {}", locker.id, e);
        }
        self.observer.locker_destroyed(locker.id);
        metrics::LOCKERS_REAPED_TOTAL.inc();
        metrics::ACTIVE_LOCKERS.dec();
        info!("Locker {} for resource '{}' reaped", locker.id, locker.key);
    }

    /// Reaps locker `id` when it no longer accepts transfers, freeing its key
    /// for a new locker. Returns true when it was reaped.
    pub async fn reap_if_closing(&mut self, id: u64) -> bool {
        let closing = self
            .lockers
            .iter()
            .any(|l| l.id == id && matches!(l.state, LockerState::Closing | LockerState::Joinable));
        if closing {
            self.reap(id).await;
        }
        closing
    }

    /// Runs one idleness sweep over every locker. Returns true when a locker
    /// was reaped, in which case the caller should sweep again right away.
    pub async fn sweep(&mut self, max_idle_periods: u32) -> Result<bool, FlomError> {
        let mut joinable = Vec::new();
        for locker in self.lockers.iter_mut() {
            match locker.state {
                LockerState::Active => {
                    if locker.counters.is_idle()? {
                        locker.idle_periods += 1;
                        if locker.idle_periods > max_idle_periods {
                            debug!("Locker {} flagged idle", locker.id);
                            locker.state = LockerState::FlaggedIdle;
                        }
                    } else {
                        locker.idle_periods = 0;
                    }
                }
                LockerState::FlaggedIdle => {
                    if locker.counters.is_idle()? {
                        debug!("Locker {} is closing", locker.id);
                        locker.close_inbound();
                    } else {
                        locker.state = LockerState::Active;
                        locker.idle_periods = 0;
                    }
                }
                LockerState::Closing => {
                    if locker.has_exited() {
                        locker.state = LockerState::Joinable;
                        joinable.push(locker.id);
                    }
                }
                LockerState::Joinable => joinable.push(locker.id),
            }
        }

        let reaped = !joinable.is_empty();
        for id in joinable {
            self.reap(id).await;
        }
        Ok(reaped)
    }

    /// Tells every worker to drop its connections and waits for all of them to exit.
    pub async fn shutdown(&mut self) {
        let _ = self.shutdown_tx.send(());
        let ids: Vec<u64> = self.lockers.iter().map(|l| l.id).collect();
        for id in ids {
            self.reap(id).await;
        }
    }
}
