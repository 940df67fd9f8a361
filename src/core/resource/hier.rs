// src/core/resource/hier.rs

use super::{
    Acquire, HolderId, LockMode, LockRequest, LockResource, ResourceKind, Wakeup, defer,
    drain_waiters, forget_waiter,
};
use std::collections::VecDeque;

/// Returns the top-level component of a hierarchical name, e.g. `/a` for `/a/b/c`.
pub(super) fn root_of(name: &str) -> &str {
    match name.get(1..).and_then(|rest| rest.find('/')) {
        Some(pos) => &name[..pos + 1],
        None => name,
    }
}

fn components(name: &str) -> Vec<String> {
    name.split('/')
        .filter(|c| !c.is_empty())
        .map(str::to_string)
        .collect()
}

/// True when one path is an ancestor of (or equal to) the other.
fn overlaps(a: &[String], b: &[String]) -> bool {
    a.iter().zip(b.iter()).all(|(x, y)| x == y)
}

type PathLock = (Vec<String>, LockMode);

/// A tree of path-named locks rooted at one top-level component.
///
/// Locking `/a/b` conflicts with locks on `/a` and on `/a/b/...` according to
/// the lock mode table, while siblings such as `/a/c` are independent.
#[derive(Debug)]
pub struct HierResource {
    name: String,
    holders: Vec<(HolderId, PathLock)>,
    waiters: VecDeque<(HolderId, PathLock)>,
}

impl HierResource {
    pub fn new(name: &str) -> Self {
        Self {
            name: root_of(name).to_string(),
            holders: Vec::new(),
            waiters: VecDeque::new(),
        }
    }

    fn can_lock(holders: &[(HolderId, PathLock)], path: &[String], mode: LockMode) -> bool {
        holders
            .iter()
            .filter(|(_, (held_path, _))| overlaps(held_path, path))
            .all(|(_, (_, held_mode))| held_mode.is_compatible_with(mode))
    }
}

impl LockResource for HierResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Hierarchical
    }

    fn acquire(&mut self, holder: HolderId, request: &LockRequest) -> Acquire {
        if root_of(&request.name) != self.name || self.holders.iter().any(|(h, _)| *h == holder) {
            return Acquire::Impossible;
        }
        let path = components(&request.name);
        if self.waiters.is_empty() && Self::can_lock(&self.holders, &path, request.mode) {
            self.holders.push((holder, (path, request.mode)));
            return Acquire::Granted { element: None };
        }
        defer(&mut self.waiters, holder, request.wait, (path, request.mode))
    }

    fn release(&mut self, holder: HolderId, _rollback: bool) -> Vec<Wakeup> {
        if let Some(pos) = self.holders.iter().position(|(h, _)| *h == holder) {
            self.holders.swap_remove(pos);
        } else if !forget_waiter(&mut self.waiters, holder) {
            return Vec::new();
        }

        let holders = &mut self.holders;
        drain_waiters(&mut self.waiters, |waiter, (path, mode)| {
            if Self::can_lock(holders, path, *mode) {
                holders.push((waiter, (path.clone(), *mode)));
                Some(None)
            } else {
                None
            }
        })
    }

    fn holder_count(&self) -> usize {
        self.holders.len()
    }

    fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}
