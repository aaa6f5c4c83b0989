//! Function tools
//!
//! Tools are declared with a JSON schema, registered per session, exposed
//! to the LLM, and dispatched on demand. Handlers return explicit
//! outcomes; the dispatcher encodes errors as payloads the model can read
//! and recover from.

pub mod builtin;
pub mod registry;
pub mod schema;

pub use builtin::{
    default_call_tools, CallActions, ConfirmAppointmentTool, DetectedAnsweringMachineTool,
    EndCallTool, LookUpAvailabilityTool, TransferCallTool, CALL_CONTROL_TOOLS,
};
pub use registry::{ToolContext, ToolHandler, ToolOutcome, ToolRegistry};
pub use schema::{InputSchema, PropertySchema, ToolSchema};

use thiserror::Error;

/// Tool errors
#[derive(Error, Debug, Clone)]
pub enum ToolError {
    #[error("unknown tool '{0}'")]
    NotFound(String),

    #[error("invalid parameters: {0}")]
    InvalidParams(String),

    #[error("tool '{name}' timed out after {timeout_ms}ms")]
    Timeout { name: String, timeout_ms: u64 },

    #[error("execution failed: {0}")]
    Execution(String),
}

impl From<ToolError> for callagent_core::Error {
    fn from(err: ToolError) -> Self {
        callagent_core::Error::Tool(err.to_string())
    }
}
