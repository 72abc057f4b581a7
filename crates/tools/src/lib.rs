//! Tool layer: the handler registry (direct set + catalog), structured tool
//! errors, the batch executor, and the built-in filesystem/shell handlers.

pub mod builtin;
pub mod error;
pub mod executor;
pub mod registry;

pub use error::{ToolError, ToolErrorType};
pub use executor::{ToolExecutor, ToolResultPayload, OVERFLOW_MARKER};
pub use registry::{ToolHandler, ToolRegistry, ToolSpec};
