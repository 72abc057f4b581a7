//! Shared domain types for all Valet crates: the message/content-block model,
//! capability sets, cancellation tokens, provider stream events, configuration,
//! and the common error type.

pub mod cancel;
pub mod capability;
pub mod config;
pub mod error;
pub mod message;
pub mod stream;
pub mod trace;

pub use cancel::CancelToken;
pub use capability::{Capability, CapabilitySet};
pub use error::{Error, Result};
pub use message::{ContentBlock, MediaSource, Message, MessageContent, Role, ToolCall, ToolDefinition};
pub use stream::{BoxStream, ProviderEvent, Usage};
