//! Built-in call tools
//!
//! The tools every outbound voice agent carries: transferring the call to
//! a human, hanging up gracefully, and bailing out on answering machines,
//! plus the scheduling lookups the appointment flows use. Call-control
//! side effects go through the `CallActions` port, implemented by the
//! worker over the room-server control plane.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use callagent_core::ConversationStage;

use crate::registry::{ToolContext, ToolHandler, ToolOutcome, ToolRegistry};
use crate::schema::{InputSchema, PropertySchema, ToolSchema};
use crate::ToolError;

/// Tools that are always registered, regardless of per-call tool config
pub const CALL_CONTROL_TOOLS: &[&str] =
    &["transfer_call", "end_call", "detected_answering_machine"];

/// Call-control side effects available to tools
#[async_trait]
pub trait CallActions: Send + Sync {
    /// Ask the media server to transfer the SIP participant
    async fn transfer_call(&self, transfer_to: &str) -> Result<(), ToolError>;

    /// Hang up the call. With `after_current_speech`, the session finishes
    /// the utterance in flight first.
    async fn hangup(&self, after_current_speech: bool);
}

/// Transfer the call to a human operator
pub struct TransferCallTool {
    actions: Arc<dyn CallActions>,
}

impl TransferCallTool {
    pub fn new(actions: Arc<dyn CallActions>) -> Self {
        Self { actions }
    }

    pub fn schema() -> ToolSchema {
        ToolSchema::new(
            "transfer_call",
            "Transfer the call to a human operator or another number",
        )
        .with_input(InputSchema::object().property(
            "transfer_to",
            PropertySchema::string("Number to transfer to (E.164); defaults to the configured one"),
            false,
        ))
    }
}

#[async_trait]
impl ToolHandler for TransferCallTool {
    async fn invoke(&self, ctx: ToolContext, params: Value) -> ToolOutcome {
        let target = params
            .get("transfer_to")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .or_else(|| ctx.metadata.transfer_to.clone());

        let Some(target) = target else {
            return ToolOutcome::err(
                "no_transfer_number",
                "no transfer number is configured for this call",
            );
        };

        match self.actions.transfer_call(&target).await {
            Ok(()) => ToolOutcome::ok(json!({
                "message": format!("Transferring the caller to {}. Ask them to hold on.", target)
            })),
            Err(err) => {
                tracing::warn!(target = %target, error = %err, "call transfer failed");
                ToolOutcome::err("transfer_failed", err.to_string())
            }
        }
    }
}

/// End the call gracefully after the current utterance
pub struct EndCallTool {
    actions: Arc<dyn CallActions>,
}

impl EndCallTool {
    pub fn new(actions: Arc<dyn CallActions>) -> Self {
        Self { actions }
    }

    pub fn schema() -> ToolSchema {
        ToolSchema::new("end_call", "End the call gracefully once you have said goodbye")
    }
}

#[async_trait]
impl ToolHandler for EndCallTool {
    async fn invoke(&self, _ctx: ToolContext, _params: Value) -> ToolOutcome {
        self.actions.hangup(true).await;
        ToolOutcome::ok(json!({
            "message": "Thank you for your time. Have a great day! Goodbye."
        }))
    }
}

/// Hang up immediately when an answering machine picked up
pub struct DetectedAnsweringMachineTool {
    actions: Arc<dyn CallActions>,
}

impl DetectedAnsweringMachineTool {
    pub fn new(actions: Arc<dyn CallActions>) -> Self {
        Self { actions }
    }

    pub fn schema() -> ToolSchema {
        ToolSchema::new(
            "detected_answering_machine",
            "Call this when an answering machine or voicemail picked up instead of a person",
        )
    }
}

#[async_trait]
impl ToolHandler for DetectedAnsweringMachineTool {
    async fn invoke(&self, _ctx: ToolContext, _params: Value) -> ToolOutcome {
        self.actions.hangup(false).await;
        ToolOutcome::ok(json!({ "message": "Answering machine detected, hanging up." }))
    }
}

/// Look up open appointment slots
pub struct LookUpAvailabilityTool;

impl LookUpAvailabilityTool {
    pub fn schema() -> ToolSchema {
        ToolSchema::new("look_up_availability", "Look up available appointments for a date")
            .with_input(InputSchema::object().property(
                "date",
                PropertySchema::string("The date to check"),
                true,
            ))
    }
}

#[async_trait]
impl ToolHandler for LookUpAvailabilityTool {
    async fn invoke(&self, ctx: ToolContext, params: Value) -> ToolOutcome {
        let date = params.get("date").and_then(|v| v.as_str()).unwrap_or_default();
        tracing::info!(date = %date, "availability lookup requested");

        // Per-job slot overrides ride in on metadata custom fields.
        let slots = ctx
            .metadata
            .custom_fields
            .get("available_slots")
            .cloned()
            .unwrap_or_else(|| json!(["9:00 AM", "2:00 PM", "4:30 PM"]));

        ToolOutcome::ok(json!({ "date": date, "slots": slots }))
    }
}

/// Confirm an appointment
pub struct ConfirmAppointmentTool;

impl ConfirmAppointmentTool {
    pub fn schema() -> ToolSchema {
        ToolSchema::new("confirm_appointment", "Confirm an appointment for a date and time")
            .with_input(
                InputSchema::object()
                    .property("date", PropertySchema::string("The date"), true)
                    .property("time", PropertySchema::string("The time"), true),
            )
    }
}

#[async_trait]
impl ToolHandler for ConfirmAppointmentTool {
    async fn invoke(&self, _ctx: ToolContext, params: Value) -> ToolOutcome {
        let date = params.get("date").and_then(|v| v.as_str()).unwrap_or_default();
        let time = params.get("time").and_then(|v| v.as_str()).unwrap_or_default();
        tracing::info!(date = %date, time = %time, "appointment confirmed");
        ToolOutcome::ok(json!({
            "confirmed": true,
            "date": date,
            "time": time,
        }))
    }
}

/// Build a registry with the built-in call tools
pub fn default_call_tools(actions: Arc<dyn CallActions>) -> ToolRegistry {
    let mut registry = ToolRegistry::new();

    registry.register(
        TransferCallTool::schema(),
        Arc::new(TransferCallTool::new(Arc::clone(&actions))),
    );
    registry.register(
        EndCallTool::schema(),
        Arc::new(EndCallTool::new(Arc::clone(&actions))),
    );
    registry.register_for_stages(
        DetectedAnsweringMachineTool::schema(),
        Arc::new(DetectedAnsweringMachineTool::new(actions)),
        Some(vec![ConversationStage::Greeting, ConversationStage::Conversation]),
    );
    registry.register_for_stages(
        LookUpAvailabilityTool::schema(),
        Arc::new(LookUpAvailabilityTool),
        Some(vec![ConversationStage::Conversation, ConversationStage::AppAction]),
    );
    registry.register_for_stages(
        ConfirmAppointmentTool::schema(),
        Arc::new(ConfirmAppointmentTool),
        Some(vec![ConversationStage::Conversation, ConversationStage::AppAction]),
    );

    registry
}

#[cfg(test)]
mod tests {
    use super::*;
    use callagent_core::JobMetadata;
    use parking_lot::Mutex;
    use tokio::time::Duration;
    use tokio_util::sync::CancellationToken;

    #[derive(Default)]
    struct RecordingActions {
        transfers: Mutex<Vec<String>>,
        hangups: Mutex<Vec<bool>>,
        fail_transfer: bool,
    }

    #[async_trait]
    impl CallActions for RecordingActions {
        async fn transfer_call(&self, transfer_to: &str) -> Result<(), ToolError> {
            if self.fail_transfer {
                return Err(ToolError::Execution("SIP 503 service unavailable".into()));
            }
            self.transfers.lock().push(transfer_to.to_string());
            Ok(())
        }

        async fn hangup(&self, after_current_speech: bool) {
            self.hangups.lock().push(after_current_speech);
        }
    }

    fn ctx_with_transfer(transfer_to: Option<&str>) -> ToolContext {
        let metadata = JobMetadata {
            phone_number: "+14155550123".into(),
            transfer_to: transfer_to.map(str::to_string),
            ..Default::default()
        };
        ToolContext::new(CancellationToken::new(), Arc::new(metadata))
    }

    #[tokio::test]
    async fn test_transfer_uses_metadata_number() {
        let actions = Arc::new(RecordingActions::default());
        let registry = default_call_tools(actions.clone());

        let outcome = registry
            .dispatch(
                "transfer_call",
                json!({}),
                ctx_with_transfer(Some("+14155559999")),
                Duration::from_secs(1),
            )
            .await;

        assert!(outcome.is_ok());
        assert_eq!(actions.transfers.lock().as_slice(), ["+14155559999"]);
    }

    #[tokio::test]
    async fn test_transfer_without_number_is_structured_error() {
        let actions = Arc::new(RecordingActions::default());
        let registry = default_call_tools(actions);

        let outcome = registry
            .dispatch(
                "transfer_call",
                json!({}),
                ctx_with_transfer(None),
                Duration::from_secs(1),
            )
            .await;

        assert!(matches!(
            outcome,
            ToolOutcome::Err { ref kind, .. } if kind == "no_transfer_number"
        ));
    }

    #[tokio::test]
    async fn test_transfer_failure_surfaces_reason() {
        let actions = Arc::new(RecordingActions {
            fail_transfer: true,
            ..Default::default()
        });
        let registry = default_call_tools(actions);

        let outcome = registry
            .dispatch(
                "transfer_call",
                json!({}),
                ctx_with_transfer(Some("+14155559999")),
                Duration::from_secs(1),
            )
            .await;

        match outcome {
            ToolOutcome::Err { kind, message } => {
                assert_eq!(kind, "transfer_failed");
                assert!(message.contains("503"));
            }
            other => panic!("expected error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_end_call_requests_graceful_hangup() {
        let actions = Arc::new(RecordingActions::default());
        let registry = default_call_tools(actions.clone());

        let outcome = registry
            .dispatch("end_call", json!({}), ctx_with_transfer(None), Duration::from_secs(1))
            .await;

        assert!(outcome.is_ok());
        assert_eq!(actions.hangups.lock().as_slice(), [true]);
    }

    #[tokio::test]
    async fn test_answering_machine_hangs_up_immediately() {
        let actions = Arc::new(RecordingActions::default());
        let registry = default_call_tools(actions.clone());

        registry
            .dispatch(
                "detected_answering_machine",
                json!({}),
                ctx_with_transfer(None),
                Duration::from_secs(1),
            )
            .await;

        assert_eq!(actions.hangups.lock().as_slice(), [false]);
    }

    #[tokio::test]
    async fn test_retain_enabled_keeps_call_control() {
        let mut registry = default_call_tools(Arc::new(RecordingActions::default()));
        registry.retain_enabled(&["look_up_availability".to_string()]);

        let names: Vec<String> = registry
            .schemas_for(ConversationStage::AppAction)
            .iter()
            .map(|s| s.name.clone())
            .collect();
        assert!(names.contains(&"transfer_call".to_string()));
        assert!(names.contains(&"look_up_availability".to_string()));
        assert!(!names.contains(&"confirm_appointment".to_string()));
    }

    #[tokio::test]
    async fn test_availability_reads_metadata_slots() {
        let metadata = JobMetadata {
            phone_number: "+14155550123".into(),
            custom_fields: [(
                "available_slots".to_string(),
                json!(["10:00 AM"]),
            )]
            .into_iter()
            .collect(),
            ..Default::default()
        };
        let ctx = ToolContext::new(CancellationToken::new(), Arc::new(metadata));

        let registry = default_call_tools(Arc::new(RecordingActions::default()));
        let outcome = registry
            .dispatch(
                "look_up_availability",
                json!({"date": "Tuesday"}),
                ctx,
                Duration::from_secs(1),
            )
            .await;

        match outcome {
            ToolOutcome::Ok(value) => assert_eq!(value["slots"][0], "10:00 AM"),
            other => panic!("expected ok, got {:?}", other),
        }
    }
}
