// src/server/management.rs

use crate::core::introspection::StatusMirror;
use crate::core::protocol::{ANSWER_STEP, ManagementAction, Message, ReplyCode, Verb};
use std::time::Duration;
use tracing::info;

/// What the dispatcher must do after answering a management request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Directive {
    Continue,
    /// Stop the dispatcher right after the answer is written.
    StopNow,
    /// Shrink the idle lifespan to the quiesce grace period.
    Quiesce,
}

/// Answers a management action.
pub fn handle(action: &ManagementAction, mirror: &StatusMirror) -> (Message, Directive) {
    match action {
        ManagementAction::Shutdown { immediate: true } => {
            info!("Immediate shutdown requested by a client.");
            (ok(), Directive::StopNow)
        }
        ManagementAction::Shutdown { immediate: false } => {
            info!("Quiesce requested by a client; exiting once idle.");
            (ok(), Directive::Quiesce)
        }
        ManagementAction::Status => (Message::status(mirror.snapshot()), Directive::Continue),
    }
}

/// The idle lifespan in force after a quiesce request. A quiesce never
/// lengthens a finite lifespan; zero means the daemon had none.
pub fn quiesced_lifespan(current: Duration, grace: Duration) -> Duration {
    if current.is_zero() {
        grace
    } else {
        current.min(grace)
    }
}

fn ok() -> Message {
    Message::answer(Verb::Management, ANSWER_STEP, ReplyCode::Ok, None)
}
