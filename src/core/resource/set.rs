// src/core/resource/set.rs

use super::{
    Acquire, HolderId, LockRequest, LockResource, ResourceKind, Wakeup, defer, drain_waiters,
    forget_waiter,
};
use crate::core::FlomError;
use std::collections::VecDeque;

/// A set of named elements (`red.green.blue`); each holder gets one free element.
#[derive(Debug)]
pub struct SetResource {
    name: String,
    elements: Vec<String>,
    owners: Vec<Option<HolderId>>,
    waiters: VecDeque<(HolderId, ())>,
}

impl SetResource {
    pub fn new(name: &str) -> Result<Self, FlomError> {
        let elements: Vec<String> = name.split('.').map(str::to_string).collect();
        if elements.len() < 2 || elements.iter().any(String::is_empty) {
            return Err(FlomError::ResourceInit {
                name: name.to_string(),
                reason: "a set needs at least two non-empty elements".to_string(),
            });
        }
        let owners = vec![None; elements.len()];
        Ok(Self {
            name: name.to_string(),
            elements,
            owners,
            waiters: VecDeque::new(),
        })
    }

    fn assign(elements: &[String], owners: &mut [Option<HolderId>], holder: HolderId) -> Option<String> {
        let slot = owners.iter().position(Option::is_none)?;
        owners[slot] = Some(holder);
        Some(elements[slot].clone())
    }
}

impl LockResource for SetResource {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::Set
    }

    fn acquire(&mut self, holder: HolderId, request: &LockRequest) -> Acquire {
        if self.owners.contains(&Some(holder)) {
            return Acquire::Impossible;
        }
        if self.waiters.is_empty()
            && let Some(element) = Self::assign(&self.elements, &mut self.owners, holder)
        {
            return Acquire::Granted {
                element: Some(element),
            };
        }
        defer(&mut self.waiters, holder, request.wait, ())
    }

    fn release(&mut self, holder: HolderId, _rollback: bool) -> Vec<Wakeup> {
        if let Some(slot) = self.owners.iter().position(|o| *o == Some(holder)) {
            self.owners[slot] = None;
        } else if !forget_waiter(&mut self.waiters, holder) {
            return Vec::new();
        }

        let elements = &self.elements;
        let owners = &mut self.owners;
        drain_waiters(&mut self.waiters, |waiter, _| {
            Self::assign(elements, owners, waiter).map(Some)
        })
    }

    fn holder_count(&self) -> usize {
        self.owners.iter().filter(|o| o.is_some()).count()
    }

    fn waiter_count(&self) -> usize {
        self.waiters.len()
    }
}
