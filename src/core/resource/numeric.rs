// src/core/resource/numeric.rs

use super::{
    Acquire, HolderId, LockRequest, LockResource, NUMERIC_NAME, ResourceKind, Wakeup,
    bracketed_quantity, defer, drain_waiters, forget_waiter,
};
use crate::core::FlomError;
use std::collections::VecDeque;

/// A pool of `N` interchangeable units; each request takes `quantity` of them.
#[derive(Debug)]
pub struct NumericResource {
    name: String,
    total: u32,
    locked: u32,
    holders: Vec<(HolderId, u32)>,
    waiters: VecDeque<(HolderId, u32)>,
}

impl NumericResource {
    pub fn new(name: &str) -> Result<Self, FlomError> {
        let total = bracketed_quantity(name, &NUMERIC_NAME, 1)?;
        Ok(Self {
            name: name.to_string(),
            total,
            locked: 0,
            holders: Vec::new(),
            waiters: VecDeque::new(),
        })
    }

    pub fn available(&self) -> u32 {
        self.total - self.locked
    }
}

impl LockResource for NumericResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Numeric
    }

    fn acquire(&mut self, holder: HolderId, request: &LockRequest) -> Acquire {
        if request.quantity == 0
            || request.quantity > self.total
            || self.holders.iter().any(|(h, _)| *h == holder)
        {
            return Acquire::Impossible;
        }
        if self.waiters.is_empty() && request.quantity <= self.available() {
            self.locked += request.quantity;
            self.holders.push((holder, request.quantity));
            return Acquire::Granted { element: None };
        }
        defer(&mut self.waiters, holder, request.wait, request.quantity)
    }

    fn release(&mut self, holder: HolderId, _rollback: bool) -> Vec<Wakeup> {
        if let Some(pos) = self.holders.iter().position(|(h, _)| *h == holder) {
            let (_, quantity) = self.holders.swap_remove(pos);
            self.locked -= quantity;
        } else if !forget_waiter(&mut self.waiters, holder) {
            return Vec::new();
        }

        let total = self.total;
        let locked = &mut self.locked;
        let holders = &mut self.holders;
        drain_waiters(&mut self.waiters, |waiter, quantity| {
            if *quantity <= total - *locked {
                *locked += *quantity;
                holders.push((waiter, *quantity));
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
