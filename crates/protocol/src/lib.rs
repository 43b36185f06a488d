//! Wire types for the inspector session protocol.
//!
//! The session router treats domain payloads as opaque JSON. The types here
//! cover only what the routing layer actually inspects: the message envelope
//! (`id`, `method`, `sessionId`, `result`, `error`), the chunked-delivery
//! sibling envelope, and the target-lifecycle payloads exchanged over the
//! `Target` domain.

pub mod message;
pub mod target;

pub use message::{CONNECTION_LOST_ERROR_CODE, ErrorObject, Message, MessageChunk};
pub use target::{
    AttachToTargetParams, AttachToTargetResponse, AttachedToTargetParams,
    DetachedFromTargetParams, GetTargetInfoResponse, SetAutoAttachParams, TargetCreatedParams,
    TargetDestroyedParams, TargetInfo, TargetInfoChangedParams,
};
