// src/connection/mod.rs

//! Client connections and the endpoint table tasks multiplex them in.

mod client;
mod guard;
mod table;

pub use client::{ClientConnection, next_connection_id};
pub use guard::ConnectionGuard;
pub use table::{Accepted, ConnectionTable, Endpoint, Event};
