// src/core/protocol/message.rs

//! The typed protocol messages exchanged between clients and the daemon.
//!
//! Every exchange is a short sequence of messages sharing one verb. The `step`
//! field positions a message inside that sequence: requests travel at
//! `STEP_INCR`, the first answer at `2 * STEP_INCR`, and a deferred answer
//! (a grant that arrives after the client was queued) at `3 * STEP_INCR`.

use crate::core::introspection::LockerSnapshot;
use crate::core::resource::LockMode;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display};

/// The communication level spoken by this daemon. Peers using another level are dropped.
pub const PROTOCOL_LEVEL: u32 = 1;

/// Distance between two consecutive steps of one verb.
pub const STEP_INCR: u32 = 8;

/// Step carried by every request.
pub const REQUEST_STEP: u32 = STEP_INCR;

/// Step carried by the first answer to a request.
pub const ANSWER_STEP: u32 = 2 * STEP_INCR;

/// Step carried by a deferred answer.
pub const DEFERRED_STEP: u32 = 3 * STEP_INCR;

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Verb {
    Lock,
    Unlock,
    Ping,
    Discover,
    Management,
}

/// Outcome codes carried by an `Answer` body.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ReplyCode {
    /// The lock is granted (or the administrative command succeeded).
    Ok,
    /// The resource is busy; the request waits in the resource queue.
    Enqueued,
    /// The resource is busy and the request did not want to wait.
    Busy,
    /// The request can never be satisfied by this resource.
    Impossible,
    /// The resource does not exist and the request did not want to wait for it.
    CantWait,
    /// The resource does not exist yet; the request waits for its creation.
    WaitingResource,
    InvalidResourceName,
    ResourceInitFailed,
    ProtocolError,
}

fn default_true() -> bool {
    true
}

fn default_quantity() -> u32 {
    1
}

/// The resource part of a lock request.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct ResourceRequest {
    pub name: String,
    #[serde(default)]
    pub mode: LockMode,
    #[serde(default = "default_true")]
    pub wait: bool,
    #[serde(default = "default_true")]
    pub create: bool,
    #[serde(default = "default_quantity")]
    pub quantity: u32,
}

impl ResourceRequest {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            mode: LockMode::default(),
            wait: true,
            create: true,
            quantity: default_quantity(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ManagementAction {
    /// Stops the daemon. A non-immediate shutdown lets it drain until idle.
    Shutdown { immediate: bool },
    /// Returns a snapshot of the live lockers.
    Status,
}

/// The verb-specific payload of a message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Body {
    LockRequest {
        resource: ResourceRequest,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        peer_id: Option<String>,
    },
    Unlock {
        name: String,
        #[serde(default)]
        rollback: bool,
    },
    Answer {
        rc: ReplyCode,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        element: Option<String>,
    },
    Ping,
    Discover,
    DiscoverReply {
        address: String,
        port: u16,
    },
    Management {
        action: ManagementAction,
    },
    Status {
        lockers: Vec<LockerSnapshot>,
    },
}

/// One protocol message.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Message {
    pub level: u32,
    pub verb: Verb,
    pub step: u32,
    pub body: Body,
}

impl Message {
    pub fn new(verb: Verb, step: u32, body: Body) -> Self {
        Self {
            level: PROTOCOL_LEVEL,
            verb,
            step,
            body,
        }
    }

    pub fn lock_request(resource: ResourceRequest, peer_id: Option<String>) -> Self {
        Self::new(
            Verb::Lock,
            REQUEST_STEP,
            Body::LockRequest { resource, peer_id },
        )
    }

    pub fn unlock(name: impl Into<String>, rollback: bool) -> Self {
        Self::new(
            Verb::Unlock,
            REQUEST_STEP,
            Body::Unlock {
                name: name.into(),
                rollback,
            },
        )
    }

    pub fn answer(verb: Verb, step: u32, rc: ReplyCode, element: Option<String>) -> Self {
        Self::new(verb, step, Body::Answer { rc, element })
    }

    pub fn ping() -> Self {
        Self::new(Verb::Ping, REQUEST_STEP, Body::Ping)
    }

    pub fn discover() -> Self {
        Self::new(Verb::Discover, REQUEST_STEP, Body::Discover)
    }

    pub fn discover_reply(address: impl Into<String>, port: u16) -> Self {
        Self::new(
            Verb::Discover,
            ANSWER_STEP,
            Body::DiscoverReply {
                address: address.into(),
                port,
            },
        )
    }

    pub fn management(action: ManagementAction) -> Self {
        Self::new(Verb::Management, REQUEST_STEP, Body::Management { action })
    }

    pub fn status(lockers: Vec<LockerSnapshot>) -> Self {
        Self::new(Verb::Management, ANSWER_STEP, Body::Status { lockers })
    }

    /// True when the message opens an exchange.
    pub fn is_request(&self) -> bool {
        self.step == REQUEST_STEP
    }

    /// The reply code, when the body is an answer.
    pub fn reply_code(&self) -> Option<ReplyCode> {
        match &self.body {
            Body::Answer { rc, .. } => Some(*rc),
            _ => None,
        }
    }

    /// The resource named by a lock or unlock message.
    pub fn resource_name(&self) -> Option<&str> {
        match &self.body {
            Body::LockRequest { resource, .. } => Some(&resource.name),
            Body::Unlock { name, .. } => Some(name),
            _ => None,
        }
    }
}
