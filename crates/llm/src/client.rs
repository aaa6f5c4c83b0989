//! LLM client interface

use async_trait::async_trait;
use tokio::sync::mpsc;

use callagent_config::LlmSpec;
use callagent_core::{ChatMessage, ToolCall};
use callagent_tools::ToolSchema;

use crate::LlmError;

/// Why a completion stream finished
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// Natural end of the response
    Stop,
    /// The model wants tool results before continuing
    ToolCalls,
    /// Token budget exhausted
    Length,
}

/// Events streamed back from a completion
#[derive(Debug, Clone)]
pub enum LlmEvent {
    /// A text token
    Token { text: String },
    /// A complete tool call request
    ToolCall(ToolCall),
    /// Stream finished
    Done { finish_reason: FinishReason },
    /// Stream failed
    Error { message: String, fatal: bool },
}

/// Streaming completion client
///
/// `complete` returns a bounded event channel; the provider task behind it
/// stops when the receiver is dropped.
#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn complete(
        &self,
        spec: &LlmSpec,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> Result<mpsc::Receiver<LlmEvent>, LlmError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_reason_eq() {
        assert_eq!(FinishReason::Stop, FinishReason::Stop);
        assert_ne!(FinishReason::Stop, FinishReason::ToolCalls);
    }
}
