// src/core/locker/transfer.rs

//! Hands a client connection from the dispatcher to a locker.
//!
//! The connection has already been taken out of the dispatcher's table when it
//! gets here, so it is never reachable from both sides. One token carries it.

use super::{Locker, LockerState};
use crate::connection::ClientConnection;
use crate::core::FlomError;
use crate::core::metrics;
use crate::server::Domain;
use std::sync::atomic::Ordering;
use tracing::debug;

/// The message that moves a connection into a locker.
#[derive(Debug)]
pub struct TransferToken {
    pub domain: Domain,
    pub conn_id: u64,
    /// Write sequence of the locker after this transfer.
    pub sequence: u64,
    pub connection: ClientConnection,
}

/// Sends `connection` to `locker`. If the worker is gone the connection is
/// dropped, which closes it, and `LockerGone` is returned.
pub fn transfer(locker: &mut Locker, connection: ClientConnection) -> Result<(), FlomError> {
    let Some(inbound) = locker.inbound.as_ref() else {
        return Err(FlomError::LockerGone(locker.id));
    };

    let sequence = locker.counters.write_seq.fetch_add(1, Ordering::AcqRel) + 1;
    let conn_id = connection.id;
    let token = TransferToken {
        domain: connection.domain,
        conn_id,
        sequence,
        connection,
    };
    if inbound.send(token).is_err() {
        // Nobody will ever acknowledge this sequence.
        locker.counters.write_seq.fetch_sub(1, Ordering::AcqRel);
        return Err(FlomError::LockerGone(locker.id));
    }

    if locker.state == LockerState::FlaggedIdle {
        locker.state = LockerState::Active;
    }
    locker.idle_periods = 0;
    metrics::TRANSFERS_TOTAL.inc();
    debug!(
        "Connection {} transferred to locker {} (sequence {})",
        conn_id, locker.id, sequence
    );
    Ok(())
}
