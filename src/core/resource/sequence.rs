// src/core/resource/sequence.rs

use super::{
    Acquire, HolderId, LockRequest, LockResource, ResourceKind, SEQUENCE_NAME, Wakeup,
    bracketed_quantity, defer, drain_waiters, forget_waiter,
};
use crate::core::FlomError;
use std::collections::VecDeque;

/// Hands out increasing integers starting at 1, at most `N` outstanding at once.
///
/// The transactional variant (`_S_` prefix) gives values released with
/// rollback back to the next requesters before drawing new ones.
#[derive(Debug)]
pub struct SequenceResource {
    name: String,
    total: u32,
    transactional: bool,
    next_value: u64,
    recycled: VecDeque<u64>,
    holders: Vec<(HolderId, u64)>,
    waiters: VecDeque<(HolderId, ())>,
}

impl SequenceResource {
    pub fn new(name: &str) -> Result<Self, FlomError> {
        let total = bracketed_quantity(name, &SEQUENCE_NAME, 2)?;
        let transactional = name.starts_with("_S_");
        Ok(Self {
            name: name.to_string(),
            total,
            transactional,
            next_value: 1,
            recycled: VecDeque::new(),
            holders: Vec::new(),
            waiters: VecDeque::new(),
        })
    }

    pub fn is_transactional(&self) -> bool {
        self.transactional
    }

    fn draw(next_value: &mut u64, recycled: &mut VecDeque<u64>) -> u64 {
        if let Some(value) = recycled.pop_front() {
            return value;
        }
        let value = *next_value;
        *next_value += 1;
        value
    }
}

impl LockResource for SequenceResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Sequence
    }

    fn acquire(&mut self, holder: HolderId, request: &LockRequest) -> Acquire {
        if self.holders.iter().any(|(h, _)| *h == holder) {
            return Acquire::Impossible;
        }
        if self.waiters.is_empty() && self.holders.len() < self.total as usize {
            let value = Self::draw(&mut self.next_value, &mut self.recycled);
            self.holders.push((holder, value));
            return Acquire::Granted {
                element: Some(value.to_string()),
            };
        }
        defer(&mut self.waiters, holder, request.wait, ())
    }

    fn release(&mut self, holder: HolderId, rollback: bool) -> Vec<Wakeup> {
        if let Some(pos) = self.holders.iter().position(|(h, _)| *h == holder) {
            let (_, value) = self.holders.swap_remove(pos);
            if rollback && self.transactional {
                self.recycled.push_back(value);
            }
        } else if !forget_waiter(&mut self.waiters, holder) {
            return Vec::new();
        }

        let total = self.total as usize;
        let next_value = &mut self.next_value;
        let recycled = &mut self.recycled;
        let holders = &mut self.holders;
        drain_waiters(&mut self.waiters, |waiter, _| {
            if holders.len() < total {
                let value = Self::draw(next_value, recycled);
                holders.push((waiter, value));
                Some(Some(value.to_string()))
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
