//! Tool registry and dispatcher
//!
//! Tools register once at session construction. The registry advertises
//! stage-scoped schema subsets to the LLM and dispatches invocations under
//! the session's cancellation scope with a hard grace timeout.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;

use callagent_core::{ConversationStage, JobMetadata};

use crate::schema::ToolSchema;
use crate::ToolError;

/// Execution context handed to tool handlers
#[derive(Clone)]
pub struct ToolContext {
    /// Cancellation scope of the owning session
    pub cancel: CancellationToken,
    /// Job metadata (custom fields flow through here)
    pub metadata: Arc<JobMetadata>,
}

impl ToolContext {
    pub fn new(cancel: CancellationToken, metadata: Arc<JobMetadata>) -> Self {
        Self { cancel, metadata }
    }
}

/// Explicit tool result
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    /// Successful result value
    Ok(Value),
    /// Structured failure the model can read and recover from
    Err { kind: String, message: String },
}

impl ToolOutcome {
    pub fn ok(value: Value) -> Self {
        ToolOutcome::Ok(value)
    }

    pub fn err(kind: impl Into<String>, message: impl Into<String>) -> Self {
        ToolOutcome::Err {
            kind: kind.into(),
            message: message.into(),
        }
    }

    /// Encode as the tool-result message payload
    pub fn into_payload(self) -> Value {
        match self {
            ToolOutcome::Ok(value) => json!({ "ok": value }),
            ToolOutcome::Err { kind, message } => json!({
                "error": { "kind": kind, "message": message }
            }),
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, ToolOutcome::Ok(_))
    }
}

/// Tool handler
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn invoke(&self, ctx: ToolContext, params: Value) -> ToolOutcome;
}

struct RegisteredTool {
    schema: ToolSchema,
    /// Stages this tool is advertised in; None means all stages
    stages: Option<Vec<ConversationStage>>,
    handler: Arc<dyn ToolHandler>,
}

/// Session-scoped tool registry
#[derive(Default)]
pub struct ToolRegistry {
    tools: HashMap<String, RegisteredTool>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool advertised in every stage
    pub fn register(&mut self, schema: ToolSchema, handler: Arc<dyn ToolHandler>) {
        self.register_for_stages(schema, handler, None);
    }

    /// Register a tool advertised only in the given stages
    pub fn register_for_stages(
        &mut self,
        schema: ToolSchema,
        handler: Arc<dyn ToolHandler>,
        stages: Option<Vec<ConversationStage>>,
    ) {
        let name = schema.name.clone();
        if self
            .tools
            .insert(name.clone(), RegisteredTool { schema, stages, handler })
            .is_some()
        {
            tracing::warn!(tool = %name, "tool re-registered, previous handler replaced");
        }
    }

    /// Number of registered tools
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Restrict optional tools to an enabled set
    ///
    /// Call-control tools always survive. With a non-empty `enabled`
    /// list, every other tool must be named in it to stay registered.
    pub fn retain_enabled(&mut self, enabled: &[String]) {
        if enabled.is_empty() {
            return;
        }
        self.tools.retain(|name, _| {
            crate::builtin::CALL_CONTROL_TOOLS.contains(&name.as_str())
                || enabled.iter().any(|e| e == name)
        });
    }

    /// Schemas advertised for the given stage
    pub fn schemas_for(&self, stage: ConversationStage) -> Vec<ToolSchema> {
        let mut schemas: Vec<ToolSchema> = self
            .tools
            .values()
            .filter(|t| match &t.stages {
                None => true,
                Some(stages) => stages.contains(&stage),
            })
            .map(|t| t.schema.clone())
            .collect();
        schemas.sort_by(|a, b| a.name.cmp(&b.name));
        schemas
    }

    /// Dispatch an invocation
    ///
    /// Validates parameters, runs the handler under the session's
    /// cancellation scope, and converts timeouts and unknown tools into
    /// error outcomes. Never panics, never returns a raw handler error.
    pub async fn dispatch(
        &self,
        name: &str,
        params: Value,
        ctx: ToolContext,
        grace: Duration,
    ) -> ToolOutcome {
        let Some(tool) = self.tools.get(name) else {
            return ToolOutcome::err("unknown_tool", format!("no tool named '{}'", name));
        };

        if let Err(err) = tool.schema.validate(&params) {
            tracing::warn!(tool = %name, error = %err, "tool parameters rejected");
            return ToolOutcome::err("invalid_params", err.to_string());
        }

        let handler = Arc::clone(&tool.handler);
        let cancel = ctx.cancel.clone();
        let invocation = handler.invoke(ctx, params);

        tokio::select! {
            _ = cancel.cancelled() => {
                ToolOutcome::err("cancelled", "session is shutting down")
            }
            result = timeout(grace, invocation) => match result {
                Ok(outcome) => outcome,
                Err(_) => {
                    tracing::warn!(tool = %name, grace_ms = grace.as_millis() as u64,
                        "tool exceeded grace period, result discarded");
                    ToolOutcome::err(
                        "timeout",
                        format!("tool '{}' did not finish in time", name),
                    )
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{InputSchema, PropertySchema};

    struct EchoTool;

    #[async_trait]
    impl ToolHandler for EchoTool {
        async fn invoke(&self, _ctx: ToolContext, params: Value) -> ToolOutcome {
            ToolOutcome::ok(params)
        }
    }

    struct SlowTool;

    #[async_trait]
    impl ToolHandler for SlowTool {
        async fn invoke(&self, _ctx: ToolContext, _params: Value) -> ToolOutcome {
            tokio::time::sleep(Duration::from_secs(60)).await;
            ToolOutcome::ok(json!("too late"))
        }
    }

    fn ctx() -> ToolContext {
        ToolContext::new(
            CancellationToken::new(),
            Arc::new(JobMetadata::default()),
        )
    }

    fn echo_schema() -> ToolSchema {
        ToolSchema::new("echo", "Echo the input").with_input(
            InputSchema::object().property("text", PropertySchema::string("Text"), true),
        )
    }

    #[tokio::test]
    async fn test_dispatch_happy() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_schema(), Arc::new(EchoTool));

        let outcome = registry
            .dispatch("echo", json!({"text": "hi"}), ctx(), Duration::from_secs(1))
            .await;
        assert_eq!(outcome, ToolOutcome::Ok(json!({"text": "hi"})));
    }

    #[tokio::test]
    async fn test_dispatch_validation_failure_is_outcome() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_schema(), Arc::new(EchoTool));

        let outcome = registry
            .dispatch("echo", json!({}), ctx(), Duration::from_secs(1))
            .await;
        match outcome {
            ToolOutcome::Err { kind, .. } => assert_eq!(kind, "invalid_params"),
            other => panic!("expected error outcome, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_dispatch_unknown_tool() {
        let registry = ToolRegistry::new();
        let outcome = registry
            .dispatch("nope", json!({}), ctx(), Duration::from_secs(1))
            .await;
        assert!(matches!(outcome, ToolOutcome::Err { ref kind, .. } if kind == "unknown_tool"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dispatch_timeout_discards_result() {
        let mut registry = ToolRegistry::new();
        registry.register(ToolSchema::new("slow", "Slow tool"), Arc::new(SlowTool));

        let outcome = registry
            .dispatch("slow", json!({}), ctx(), Duration::from_secs(2))
            .await;
        assert!(matches!(outcome, ToolOutcome::Err { ref kind, .. } if kind == "timeout"));
    }

    #[tokio::test]
    async fn test_stage_scoped_advertisement() {
        let mut registry = ToolRegistry::new();
        registry.register(echo_schema(), Arc::new(EchoTool));
        registry.register_for_stages(
            ToolSchema::new("book", "Book an appointment"),
            Arc::new(EchoTool),
            Some(vec![ConversationStage::AppAction]),
        );

        let greeting = registry.schemas_for(ConversationStage::Greeting);
        assert_eq!(greeting.len(), 1);
        assert_eq!(greeting[0].name, "echo");

        let app = registry.schemas_for(ConversationStage::AppAction);
        assert_eq!(app.len(), 2);
    }

    #[test]
    fn test_outcome_payload_encoding() {
        let ok = ToolOutcome::ok(json!({"slots": ["9am"]})).into_payload();
        assert_eq!(ok["ok"]["slots"][0], "9am");

        let err = ToolOutcome::err("sip_failure", "busy").into_payload();
        assert_eq!(err["error"]["kind"], "sip_failure");
    }
}
