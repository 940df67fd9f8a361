// src/core/mod.rs

//! The central module containing the locking engine of flomd.

pub mod admission;
pub mod errors;
pub mod introspection;
pub mod locker;
pub mod metrics;
pub mod protocol;
pub mod resource;

pub use errors::FlomError;
pub use protocol::Message;
