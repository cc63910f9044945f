//! Message conversion between the wire protocol and the engine
//!
//! - `user_message` → engine prompt text
//! - engine stream message → server events

mod event;
mod prompt;

pub use event::EventConverter;
pub use prompt::{PromptConverter, build_query_content};
