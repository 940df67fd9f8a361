// src/core/resource/simple.rs

use super::{
    Acquire, HolderId, LockMode, LockRequest, LockResource, ResourceKind, Wakeup, defer,
    drain_waiters, forget_waiter,
};
use std::collections::VecDeque;

/// A named lock with the six classic lock modes.
#[derive(Debug)]
pub struct SimpleResource {
    name: String,
    holders: Vec<(HolderId, LockMode)>,
    waiters: VecDeque<(HolderId, LockMode)>,
}

impl SimpleResource {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            holders: Vec::new(),
            waiters: VecDeque::new(),
        }
    }

    fn can_lock(holders: &[(HolderId, LockMode)], mode: LockMode) -> bool {
        holders.iter().all(|(_, held)| held.is_compatible_with(mode))
    }
}

impl LockResource for SimpleResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Simple
    }

    fn acquire(&mut self, holder: HolderId, request: &LockRequest) -> Acquire {
        if self.holders.iter().any(|(h, _)| *h == holder) {
            return Acquire::Impossible;
        }
        if self.waiters.is_empty() && Self::can_lock(&self.holders, request.mode) {
            self.holders.push((holder, request.mode));
            return Acquire::Granted { element: None };
        }
        defer(&mut self.waiters, holder, request.wait, request.mode)
    }

    fn release(&mut self, holder: HolderId, _rollback: bool) -> Vec<Wakeup> {
        if let Some(pos) = self.holders.iter().position(|(h, _)| *h == holder) {
            self.holders.swap_remove(pos);
        } else if !forget_waiter(&mut self.waiters, holder) {
            return Vec::new();
        }

        let holders = &mut self.holders;
        drain_waiters(&mut self.waiters, |waiter, mode| {
            if Self::can_lock(holders, *mode) {
                holders.push((waiter, *mode));
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
