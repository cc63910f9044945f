//! Session wire protocol
//!
//! Event envelope types and the stateless codec that maps them to and from
//! websocket text frames.

mod codec;
mod event;

pub use codec::{decode_client, encode_server, summarize, trace_outgoing, truncate_string};
pub use event::{
    ApprovalResponse, ClientEvent, EventRecord, ServerEvent, StatusKind, UserMessage,
};
