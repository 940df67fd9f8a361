// src/core/introspection.rs

//! Receive-only hooks that report the lifecycle of lockers and their connections.

use crate::core::resource::ResourceKind;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A point-in-time view of one live locker, as returned by the `Status` action.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct LockerSnapshot {
    pub id: u64,
    pub name: String,
    pub kind: ResourceKind,
    /// Client connections currently owned by the locker.
    pub connections: usize,
    /// Unix timestamp in milliseconds.
    pub created_at: i64,
}

/// Observes locker lifecycle events. Implementations must not block; they are
/// called from the dispatcher and from locker tasks.
pub trait LockerObserver: Send + Sync {
    fn locker_created(&self, id: u64, name: &str, kind: ResourceKind);
    fn locker_destroyed(&self, id: u64);
    fn connection_attached(&self, locker_id: u64, conn_id: u64);
    fn connection_detached(&self, locker_id: u64, conn_id: u64);
}

/// The default observer: an in-memory mirror of the live lockers.
#[derive(Debug, Default)]
pub struct StatusMirror {
    lockers: DashMap<u64, LockerSnapshot>,
}

impl StatusMirror {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Returns the live lockers ordered by id.
    pub fn snapshot(&self) -> Vec<LockerSnapshot> {
        let mut lockers: Vec<LockerSnapshot> =
            self.lockers.iter().map(|e| e.value().clone()).collect();
        lockers.sort_by_key(|l| l.id);
        lockers
    }

    pub fn len(&self) -> usize {
        self.lockers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lockers.is_empty()
    }
}

impl LockerObserver for StatusMirror {
    fn locker_created(&self, id: u64, name: &str, kind: ResourceKind) {
        self.lockers.insert(
            id,
            LockerSnapshot {
                id,
                name: name.to_string(),
                kind,
                connections: 0,
                created_at: chrono::Utc::now().timestamp_millis(),
            },
        );
    }

    fn locker_destroyed(&self, id: u64) {
        self.lockers.remove(&id);
    }

    fn connection_attached(&self, locker_id: u64, _conn_id: u64) {
        if let Some(mut entry) = self.lockers.get_mut(&locker_id) {
            entry.connections += 1;
        }
    }

    fn connection_detached(&self, locker_id: u64, _conn_id: u64) {
        if let Some(mut entry) = self.lockers.get_mut(&locker_id) {
            entry.connections = entry.connections.saturating_sub(1);
        }
    }
}
