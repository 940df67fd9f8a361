// src/core/errors.rs

//! Defines the primary error type of the daemon and its failure classes.

use crate::core::protocol::ReplyCode;
use std::sync::Arc;
use thiserror::Error;

/// How far a failure reaches. The dispatcher decides what to tear down from this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The daemon cannot continue (listener or poll failure).
    Fatal,
    /// Only the originating connection is closed.
    Connection,
    /// The client gets an explicit reply code followed by a half-close.
    Request,
    /// Locker bookkeeping is inconsistent. Treated like `Fatal`, never retried.
    Internal,
}

/// The main error enum, representing all possible failures within the daemon.
#[derive(Error, Debug, Clone)]
pub enum FlomError {
    #[error("IO Error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("Frame of {0} bytes exceeds the maximum frame size")]
    FrameTooLarge(usize),

    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    #[error("Protocol level mismatch: expected {expected}, received {found}")]
    ProtocolLevel { expected: u32, found: u32 },

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    #[error("Peer identity '{0}' does not match the channel identity")]
    PeerIdentityMismatch(String),

    #[error("Invalid resource name '{0}'")]
    InvalidResourceName(String),

    #[error("Resource '{0}' does not exist and the request can not wait")]
    CantWait(String),

    #[error("Resource '{name}' could not be initialized: {reason}")]
    ResourceInit { name: String, reason: String },

    #[error("Locker {0} is no longer accepting connections")]
    LockerGone(u64),

    #[error("Listener failure: {0}")]
    Listener(String),

    #[error("Locker bookkeeping corrupted: {0}")]
    Corruption(String),

    #[error("Internal Error: {0}")]
    Internal(String),
}

impl FlomError {
    /// Classifies the error per component boundary.
    pub fn class(&self) -> ErrorClass {
        match self {
            FlomError::Listener(_) => ErrorClass::Fatal,
            FlomError::InvalidResourceName(_)
            | FlomError::CantWait(_)
            | FlomError::ResourceInit { .. } => ErrorClass::Request,
            FlomError::Corruption(_) | FlomError::Internal(_) => ErrorClass::Internal,
            FlomError::Io(_)
            | FlomError::FrameTooLarge(_)
            | FlomError::InvalidFrame(_)
            | FlomError::ProtocolLevel { .. }
            | FlomError::ProtocolViolation(_)
            | FlomError::TlsHandshake(_)
            | FlomError::PeerIdentityMismatch(_)
            | FlomError::LockerGone(_) => ErrorClass::Connection,
        }
    }

    /// True for the failures that should stop the daemon.
    pub fn is_fatal(&self) -> bool {
        matches!(self.class(), ErrorClass::Fatal | ErrorClass::Internal)
    }

    /// The code a request-scoped failure is answered with.
    pub fn reply_code(&self) -> Option<ReplyCode> {
        match self {
            FlomError::InvalidResourceName(_) => Some(ReplyCode::InvalidResourceName),
            FlomError::CantWait(_) => Some(ReplyCode::CantWait),
            FlomError::ResourceInit { .. } => Some(ReplyCode::ResourceInitFailed),
            _ => None,
        }
    }
}

impl PartialEq for FlomError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FlomError::Io(e1), FlomError::Io(e2)) => e1.kind() == e2.kind(),
            (FlomError::FrameTooLarge(a), FlomError::FrameTooLarge(b)) => a == b,
            (FlomError::InvalidFrame(a), FlomError::InvalidFrame(b)) => a == b,
            (
                FlomError::ProtocolLevel {
                    expected: e1,
                    found: f1,
                },
                FlomError::ProtocolLevel {
                    expected: e2,
                    found: f2,
                },
            ) => e1 == e2 && f1 == f2,
            (FlomError::ProtocolViolation(a), FlomError::ProtocolViolation(b)) => a == b,
            (FlomError::InvalidResourceName(a), FlomError::InvalidResourceName(b)) => a == b,
            (FlomError::CantWait(a), FlomError::CantWait(b)) => a == b,
            (FlomError::LockerGone(a), FlomError::LockerGone(b)) => a == b,
            _ => core::mem::discriminant(self) == core::mem::discriminant(other),
        }
    }
}

// --- From trait implementations for easy error conversion ---

impl From<std::io::Error> for FlomError {
    fn from(e: std::io::Error) -> Self {
        FlomError::Io(Arc::new(e))
    }
}

impl From<serde_json::Error> for FlomError {
    fn from(e: serde_json::Error) -> Self {
        FlomError::InvalidFrame(e.to_string())
    }
}
