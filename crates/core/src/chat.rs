//! Chat context and message types
//!
//! The chat context is an ordered message log owned by a single session.
//! It enforces the tool pairing invariant on every mutation: a tool result
//! must follow the assistant message that requested it, and every tool call
//! id resolves to at most one result.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Chat context errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChatError {
    #[error("tool result '{0}' does not follow an assistant message with a matching tool call")]
    UnpairedToolResult(String),

    #[error("duplicate tool result for call id '{0}'")]
    DuplicateToolResult(String),

    #[error("tool message is missing a tool call id")]
    MissingToolCallId,
}

/// Message roles, closed set
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatRole {
    System,
    User,
    Assistant,
    Tool,
}

/// A tool invocation requested by the assistant
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Call id, unique within the context
    pub id: String,
    /// Tool name
    pub name: String,
    /// JSON arguments
    pub arguments: serde_json::Value,
}

/// A single chat message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Message id
    pub id: String,
    /// Role
    pub role: ChatRole,
    /// Text content (may be empty for tool-call-only assistant messages)
    pub content: String,
    /// Tool calls requested by an assistant message
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// For tool messages: the call this result answers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// For tool messages: the tool name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    /// Creation time
    pub timestamp: DateTime<Utc>,
}

impl ChatMessage {
    fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            role,
            content: content.into(),
            tool_calls: Vec::new(),
            tool_call_id: None,
            tool_name: None,
            timestamp: Utc::now(),
        }
    }

    /// Create a system message
    pub fn system(content: impl Into<String>) -> Self {
        Self::new(ChatRole::System, content)
    }

    /// Create a user message
    pub fn user(content: impl Into<String>) -> Self {
        Self::new(ChatRole::User, content)
    }

    /// Create an assistant message
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(ChatRole::Assistant, content)
    }

    /// Create an assistant message carrying tool calls
    pub fn assistant_with_tool_calls(content: impl Into<String>, calls: Vec<ToolCall>) -> Self {
        let mut msg = Self::new(ChatRole::Assistant, content);
        msg.tool_calls = calls;
        msg
    }

    /// Create a tool result message
    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        payload: &serde_json::Value,
    ) -> Self {
        let mut msg = Self::new(ChatRole::Tool, payload.to_string());
        msg.tool_call_id = Some(call_id.into());
        msg.tool_name = Some(tool_name.into());
        msg
    }
}

/// Ordered message log with tool pairing invariants
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatContext {
    messages: Vec<ChatMessage>,
}

impl ChatContext {
    /// Create an empty context
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a context from a message list, re-validating the invariants
    pub fn from_messages(messages: Vec<ChatMessage>) -> Result<Self, ChatError> {
        let mut ctx = Self::new();
        for msg in messages {
            ctx.append(msg)?;
        }
        Ok(ctx)
    }

    /// Number of messages
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Whether the context is empty
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Append a message, enforcing the tool pairing invariant
    pub fn append(&mut self, message: ChatMessage) -> Result<(), ChatError> {
        if message.role == ChatRole::Tool {
            self.validate_tool_result(&message)?;
        }
        self.messages.push(message);
        Ok(())
    }

    fn validate_tool_result(&self, message: &ChatMessage) -> Result<(), ChatError> {
        let call_id = message
            .tool_call_id
            .as_deref()
            .ok_or(ChatError::MissingToolCallId)?;

        // Walk back over the current run of tool results to the assistant
        // message that requested them.
        let mut idx = self.messages.len();
        while idx > 0 && self.messages[idx - 1].role == ChatRole::Tool {
            if self.messages[idx - 1].tool_call_id.as_deref() == Some(call_id) {
                return Err(ChatError::DuplicateToolResult(call_id.to_string()));
            }
            idx -= 1;
        }

        let assistant = (idx > 0)
            .then(|| &self.messages[idx - 1])
            .filter(|m| m.role == ChatRole::Assistant);
        match assistant {
            Some(m) if m.tool_calls.iter().any(|c| c.id == call_id) => Ok(()),
            _ => Err(ChatError::UnpairedToolResult(call_id.to_string())),
        }
    }

    /// Immutable snapshot of the current messages
    pub fn snapshot(&self) -> Vec<ChatMessage> {
        self.messages.clone()
    }

    /// Last message, if any
    pub fn last(&self) -> Option<&ChatMessage> {
        self.messages.last()
    }

    /// Drop trailing messages matching the predicate
    ///
    /// Removes messages from the tail while the predicate holds. Removing
    /// from the tail cannot break the pairing invariant (results are always
    /// removed before the assistant message that requested them). Repeated
    /// application with the same predicate is a no-op.
    pub fn truncate<F>(&mut self, predicate: F) -> usize
    where
        F: Fn(&ChatMessage) -> bool,
    {
        let mut removed = 0;
        while let Some(last) = self.messages.last() {
            if predicate(last) {
                self.messages.pop();
                removed += 1;
            } else {
                break;
            }
        }
        removed
    }

    /// Rewrite the content of the last assistant message
    ///
    /// Used on barge-in to shrink the assistant message to the portion that
    /// was actually spoken. Tool calls on the message are preserved.
    pub fn rewrite_last_assistant(&mut self, content: impl Into<String>) -> bool {
        for msg in self.messages.iter_mut().rev() {
            if msg.role == ChatRole::Assistant {
                msg.content = content.into();
                return true;
            }
        }
        false
    }

    /// Messages in provider order
    ///
    /// System messages lead, everything else keeps insertion order. Tool
    /// results already sit directly behind their assistant message, which
    /// is the ordering streaming providers require.
    pub fn messages_for_llm(&self) -> Vec<ChatMessage> {
        let mut ordered: Vec<ChatMessage> = self
            .messages
            .iter()
            .filter(|m| m.role == ChatRole::System)
            .cloned()
            .collect();
        ordered.extend(
            self.messages
                .iter()
                .filter(|m| m.role != ChatRole::System)
                .cloned(),
        );
        ordered
    }

    /// Iterate messages in insertion order
    pub fn iter(&self) -> impl Iterator<Item = &ChatMessage> {
        self.messages.iter()
    }
}
