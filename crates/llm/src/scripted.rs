//! Scripted LLM for tests
//!
//! Streams pre-scripted turns: text tokens, tool calls, delays, hangs, and
//! errors. Each `complete` call pops the next scripted turn and records
//! what it was asked, so tests can assert on the conversation the model saw.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration};

use callagent_config::LlmSpec;
use callagent_core::{ChatMessage, ToolCall};
use callagent_tools::ToolSchema;

use crate::client::{FinishReason, LlmClient, LlmEvent};
use crate::LlmError;

/// One scripted streaming step
#[derive(Debug, Clone)]
pub enum ScriptedStep {
    /// Emit a text token
    Token(String),
    /// Emit a complete tool call
    ToolCall {
        name: String,
        arguments: serde_json::Value,
    },
    /// Wait before the next step
    Delay(u64),
    /// Never produce anything again (timeout scenarios)
    Hang,
    /// Emit a stream error
    Error { message: String, fatal: bool },
}

/// A recorded completion request
#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub messages: Vec<ChatMessage>,
    pub tool_names: Vec<String>,
}

/// Scripted completion client
pub struct ScriptedLlm {
    turns: Arc<Mutex<VecDeque<Vec<ScriptedStep>>>>,
    calls: Arc<Mutex<Vec<RecordedCall>>>,
    call_counter: Arc<Mutex<u64>>,
}

impl ScriptedLlm {
    pub fn new(turns: Vec<Vec<ScriptedStep>>) -> Self {
        Self {
            turns: Arc::new(Mutex::new(turns.into())),
            calls: Arc::new(Mutex::new(Vec::new())),
            call_counter: Arc::new(Mutex::new(0)),
        }
    }

    /// Queue another scripted turn
    pub fn push_turn(&self, steps: Vec<ScriptedStep>) {
        self.turns.lock().push_back(steps);
    }

    /// Turn plain text into word-level token steps
    pub fn say(text: &str) -> Vec<ScriptedStep> {
        let words: Vec<&str> = text.split_inclusive(' ').collect();
        words
            .into_iter()
            .map(|w| ScriptedStep::Token(w.to_string()))
            .collect()
    }

    /// Requests recorded so far
    pub fn recorded_calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().clone()
    }

    /// Number of completion requests served
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(
        &self,
        _spec: &LlmSpec,
        messages: &[ChatMessage],
        tools: &[ToolSchema],
    ) -> Result<mpsc::Receiver<LlmEvent>, LlmError> {
        self.calls.lock().push(RecordedCall {
            messages: messages.to_vec(),
            tool_names: tools.iter().map(|t| t.name.clone()).collect(),
        });

        let steps = self.turns.lock().pop_front().unwrap_or_default();
        let counter = Arc::clone(&self.call_counter);
        let (tx, rx) = mpsc::channel(32);

        tokio::spawn(async move {
            let mut emitted_tool_call = false;
            for step in steps {
                match step {
                    ScriptedStep::Token(text) => {
                        if tx.send(LlmEvent::Token { text }).await.is_err() {
                            return;
                        }
                    }
                    ScriptedStep::ToolCall { name, arguments } => {
                        emitted_tool_call = true;
                        let id = {
                            let mut c = counter.lock();
                            *c += 1;
                            format!("call_{}", *c)
                        };
                        let call = ToolCall {
                            id,
                            name,
                            arguments,
                        };
                        if tx.send(LlmEvent::ToolCall(call)).await.is_err() {
                            return;
                        }
                    }
                    ScriptedStep::Delay(ms) => {
                        sleep(Duration::from_millis(ms)).await;
                    }
                    ScriptedStep::Hang => {
                        tx.closed().await;
                        return;
                    }
                    ScriptedStep::Error { message, fatal } => {
                        let _ = tx.send(LlmEvent::Error { message, fatal }).await;
                        return;
                    }
                }
            }

            let finish_reason = if emitted_tool_call {
                FinishReason::ToolCalls
            } else {
                FinishReason::Stop
            };
            let _ = tx.send(LlmEvent::Done { finish_reason }).await;
        });

        Ok(rx)
    }
}
