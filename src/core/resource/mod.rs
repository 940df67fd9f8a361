// src/core/resource/mod.rs

//! Resource types and the uniform acquire/release capability lockers drive.
//!
//! A resource name is classified into a `ResourceKind` by its shape alone:
//!
//! | shape          | kind          | example      |
//! |----------------|---------------|--------------|
//! | `_s_<id>[N]`   | sequence      | `_s_ids[4]`  |
//! | `_S_<id>[N]`   | transactional sequence | `_S_ids[4]` |
//! | `_t_<fmt>[N]`  | timestamp     | `_t_%H%M%S#ff[1]` |
//! | `<id>[N]`      | numeric       | `pool[10]`   |
//! | `/a/b/c`       | hierarchical  | `/db/users`  |
//! | `a.b.c`        | set           | `red.green`  |
//! | `<id>`         | simple        | `printer`    |
//!
//! Waiters are always served in arrival order: a new request queues behind
//! existing waiters even if it could be granted right away.

mod hier;
mod numeric;
mod sequence;
mod set;
mod simple;
mod timestamp;

pub use hier::HierResource;
pub use numeric::NumericResource;
pub use sequence::SequenceResource;
pub use set::SetResource;
pub use simple::SimpleResource;
pub use timestamp::TimestampResource;

use crate::core::FlomError;
use crate::core::protocol::ResourceRequest;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use strum_macros::Display;

/// Identifies the connection holding or waiting for a lock.
pub type HolderId = u64;

static SEQUENCE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^_([sS])_[A-Za-z0-9_]+\[([0-9]+)\]$").expect("valid regex"));
static TIMESTAMP_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^_t_([^\[\]]+)\[([0-9]+)\]$").expect("valid regex"));
static NUMERIC_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+\[([0-9]+)\]$").expect("valid regex"));
static HIER_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(/[A-Za-z0-9_.\-]+)+$").expect("valid regex"));
static SET_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+(\.[A-Za-z0-9_]+)+$").expect("valid regex"));
static SIMPLE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_]+$").expect("valid regex"));

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ResourceKind {
    Simple,
    Numeric,
    Sequence,
    Timestamp,
    Set,
    Hierarchical,
}

/// Lock modes of simple and hierarchical resources.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LockMode {
    NullLock,
    ConcurrentRead,
    ConcurrentWrite,
    ProtectedRead,
    ProtectedWrite,
    #[default]
    Exclusive,
}

/// `COMPATIBILITY[held][requested]`.
const COMPATIBILITY: [[bool; 6]; 6] = [
    [true, true, true, true, true, true],
    [true, true, true, true, true, false],
    [true, true, true, false, false, false],
    [true, true, false, true, false, false],
    [true, true, false, false, false, false],
    [true, false, false, false, false, false],
];

impl LockMode {
    fn index(self) -> usize {
        match self {
            LockMode::NullLock => 0,
            LockMode::ConcurrentRead => 1,
            LockMode::ConcurrentWrite => 2,
            LockMode::ProtectedRead => 3,
            LockMode::ProtectedWrite => 4,
            LockMode::Exclusive => 5,
        }
    }

    /// Whether `requested` can be granted while `self` is held.
    pub fn is_compatible_with(self, requested: LockMode) -> bool {
        COMPATIBILITY[self.index()][requested.index()]
    }
}

/// The parameters a locker passes to its resource for one acquisition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockRequest {
    /// The full requested name; differs from the locker key for hierarchical resources.
    pub name: String,
    pub mode: LockMode,
    pub wait: bool,
    pub quantity: u32,
}

impl From<&ResourceRequest> for LockRequest {
    fn from(r: &ResourceRequest) -> Self {
        Self {
            name: r.name.clone(),
            mode: r.mode,
            wait: r.wait,
            quantity: r.quantity,
        }
    }
}

/// Result of one acquisition attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquire {
    /// Granted; some resource kinds hand out a value (sequence number, set element).
    Granted { element: Option<String> },
    /// Queued; a `Wakeup` follows when the lock is granted.
    Enqueued,
    /// Not available and the requester did not want to wait.
    Busy,
    /// The request can never be satisfied.
    Impossible,
}

/// A queued requester that has just been granted its lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Wakeup {
    pub holder: HolderId,
    pub element: Option<String>,
}

/// The per-type locking algorithm a locker serializes access to.
pub trait LockResource: Send + std::fmt::Debug {
    fn name(&self) -> &str;
    fn kind(&self) -> ResourceKind;
    fn acquire(&mut self, holder: HolderId, request: &LockRequest) -> Acquire;
    /// Drops the lock or queue slot of `holder`. `rollback` is set when the holder
    /// vanished or asked to undo, which transactional resources honor.
    fn release(&mut self, holder: HolderId, rollback: bool) -> Vec<Wakeup>;
    fn holder_count(&self) -> usize;
    fn waiter_count(&self) -> usize;

    /// How long until queued requests may be served without a release. Only
    /// resources whose availability follows the clock return `Some`.
    fn next_deadline(&self) -> Option<Duration> {
        None
    }

    /// Serves the waiters that became grantable once `next_deadline` passed.
    fn on_deadline(&mut self) -> Vec<Wakeup> {
        Vec::new()
    }
}

/// Classifies a resource name. `None` means the name is invalid.
pub fn classify(name: &str) -> Option<ResourceKind> {
    if name.is_empty() {
        None
    } else if SEQUENCE_NAME.is_match(name) {
        Some(ResourceKind::Sequence)
    } else if TIMESTAMP_NAME.is_match(name) {
        Some(ResourceKind::Timestamp)
    } else if NUMERIC_NAME.is_match(name) {
        Some(ResourceKind::Numeric)
    } else if HIER_NAME.is_match(name) {
        Some(ResourceKind::Hierarchical)
    } else if SET_NAME.is_match(name) {
        Some(ResourceKind::Set)
    } else if SIMPLE_NAME.is_match(name) {
        Some(ResourceKind::Simple)
    } else {
        None
    }
}

/// The name a locker is registered under. Hierarchical names share one locker
/// per top-level component so that conflicts along a path are visible to it.
pub fn locker_key(name: &str, kind: ResourceKind) -> String {
    match kind {
        ResourceKind::Hierarchical => hier::root_of(name).to_string(),
        _ => name.to_string(),
    }
}

/// Creates the resource instance a new locker will own.
pub fn build(kind: ResourceKind, name: &str) -> Result<Box<dyn LockResource>, FlomError> {
    let resource: Box<dyn LockResource> = match kind {
        ResourceKind::Simple => Box::new(SimpleResource::new(name)),
        ResourceKind::Numeric => Box::new(NumericResource::new(name)?),
        ResourceKind::Sequence => Box::new(SequenceResource::new(name)?),
        ResourceKind::Timestamp => Box::new(TimestampResource::new(name)?),
        ResourceKind::Set => Box::new(SetResource::new(name)?),
        ResourceKind::Hierarchical => Box::new(HierResource::new(name)),
    };
    Ok(resource)
}

/// Extracts `N` from a `...[N]` name and rejects zero.
fn bracketed_quantity(name: &str, pattern: &Regex, group: usize) -> Result<u32, FlomError> {
    let reason = |reason: &str| FlomError::ResourceInit {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    let captures = pattern
        .captures(name)
        .ok_or_else(|| reason("name does not carry a quantity"))?;
    let quantity: u32 = captures[group]
        .parse()
        .map_err(|_| reason("quantity is out of range"))?;
    if quantity == 0 {
        return Err(reason("quantity must be greater than zero"));
    }
    Ok(quantity)
}

/// Pops waiters from the front of `queue` for as long as `grant` accepts them.
fn drain_waiters<T>(
    queue: &mut VecDeque<(HolderId, T)>,
    mut grant: impl FnMut(HolderId, &T) -> Option<Option<String>>,
) -> Vec<Wakeup> {
    let mut wakeups = Vec::new();
    while let Some((holder, params)) = queue.front() {
        match grant(*holder, params) {
            Some(element) => {
                wakeups.push(Wakeup {
                    holder: *holder,
                    element,
                });
                queue.pop_front();
            }
            None => break,
        }
    }
    wakeups
}

/// Removes `holder` from a waiter queue, returning whether it was there.
fn forget_waiter<T>(queue: &mut VecDeque<(HolderId, T)>, holder: HolderId) -> bool {
    match queue.iter().position(|(h, _)| *h == holder) {
        Some(pos) => {
            queue.remove(pos);
            true
        }
        None => false,
    }
}

/// Shared tail of every `acquire`: queue or refuse when the grant is not possible now.
/// A holder owns at most one queue slot.
fn defer<T>(
    queue: &mut VecDeque<(HolderId, T)>,
    holder: HolderId,
    wait: bool,
    params: T,
) -> Acquire {
    if queue.iter().any(|(h, _)| *h == holder) {
        Acquire::Impossible
    } else if wait {
        queue.push_back((holder, params));
        Acquire::Enqueued
    } else {
        Acquire::Busy
    }
}
