// src/core/admission.rs

//! Decides what happens to a lock request arriving at the dispatcher.

use crate::core::FlomError;
use crate::core::protocol::ResourceRequest;
use crate::core::resource::{self, ResourceKind};

/// The outcome of admission for one lock request.
#[derive(Debug, Clone, PartialEq)]
pub enum Admission {
    /// A request-scoped failure: answer with its reply code, then half-close.
    Reject(FlomError),
    /// Park the connection until a locker for `key` is created.
    Queue { key: String },
    /// Hand the connection to the existing locker with this id.
    Attach(u64),
    /// Start a locker for `key`, hand it the connection, then rescan the incubator.
    StartNew { key: String, kind: ResourceKind },
}

/// Maps a request and the current locker set to an admission decision.
///
/// `find` looks up the locker registered under a key. It is only consulted for
/// valid names.
pub fn decide(request: &ResourceRequest, find: impl FnOnce(&str) -> Option<u64>) -> Admission {
    let Some(kind) = resource::classify(&request.name) else {
        return Admission::Reject(FlomError::InvalidResourceName(request.name.clone()));
    };
    let key = resource::locker_key(&request.name, kind);

    if let Some(id) = find(&key) {
        return Admission::Attach(id);
    }
    match (request.create, request.wait) {
        (true, _) => Admission::StartNew { key, kind },
        (false, true) => Admission::Queue { key },
        (false, false) => Admission::Reject(FlomError::CantWait(request.name.clone())),
    }
}
