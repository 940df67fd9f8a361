// src/core/protocol/mod.rs

pub mod codec;
pub mod message;
pub use codec::{FlomCodec, MAX_FRAME_SIZE};
pub use message::{
    ANSWER_STEP, Body, DEFERRED_STEP, ManagementAction, Message, PROTOCOL_LEVEL, REQUEST_STEP,
    ReplyCode, ResourceRequest, STEP_INCR, Verb,
};
