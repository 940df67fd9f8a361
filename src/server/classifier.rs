// src/server/classifier.rs

//! Routes a message read from a dispatcher-owned stream connection.

use crate::core::FlomError;
use crate::core::protocol::{Body, ManagementAction, Message, PROTOCOL_LEVEL, ResourceRequest, Verb};

/// Where a message goes next.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    Lock(ResourceRequest),
    Ping,
    Management(ManagementAction),
}

/// Checks level, verb and step, then the asserted peer identity.
///
/// `channel_identity` is the fingerprint of the client certificate, and is only
/// compared when `check_peer_id` is set.
pub fn classify(
    message: &Message,
    channel_identity: Option<&str>,
    check_peer_id: bool,
) -> Result<Route, FlomError> {
    if message.level != PROTOCOL_LEVEL {
        return Err(FlomError::ProtocolLevel {
            expected: PROTOCOL_LEVEL,
            found: message.level,
        });
    }
    if !message.is_request() {
        return Err(FlomError::ProtocolViolation(format!(
            "unexpected step {} for verb {}",
            message.step, message.verb
        )));
    }

    match (&message.verb, &message.body) {
        (Verb::Lock, Body::LockRequest { resource, peer_id }) => {
            if check_peer_id {
                verify_peer(peer_id.as_deref(), channel_identity)?;
            }
            Ok(Route::Lock(resource.clone()))
        }
        (Verb::Ping, Body::Ping) => Ok(Route::Ping),
        (Verb::Management, Body::Management { action }) => Ok(Route::Management(action.clone())),
        (Verb::Discover, _) => Err(FlomError::ProtocolViolation(
            "discover is only accepted on the discovery socket".to_string(),
        )),
        (verb, _) => Err(FlomError::ProtocolViolation(format!(
            "verb {verb} is not expected here"
        ))),
    }
}

fn verify_peer(asserted: Option<&str>, channel: Option<&str>) -> Result<(), FlomError> {
    match (asserted, channel) {
        (Some(asserted), Some(channel)) if asserted.eq_ignore_ascii_case(channel) => Ok(()),
        (asserted, _) => Err(FlomError::PeerIdentityMismatch(
            asserted.unwrap_or_default().to_string(),
        )),
    }
}
