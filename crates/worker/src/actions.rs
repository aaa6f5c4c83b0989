//! Call-control actions backed by the room server
//!
//! Implements the tool-facing `CallActions` port: transfers go through
//! the control plane, hangups go through the session.

use std::sync::Arc;

use async_trait::async_trait;

use callagent_control::{RoomControl, SipResult};
use callagent_session::SessionHandle;
use callagent_tools::{CallActions, ToolError};

/// `CallActions` implementation for one call
pub struct WorkerCallActions {
    control: Arc<dyn RoomControl>,
    room_name: String,
    participant_identity: String,
    session: SessionHandle,
}

impl WorkerCallActions {
    pub fn new(
        control: Arc<dyn RoomControl>,
        room_name: impl Into<String>,
        participant_identity: impl Into<String>,
        session: SessionHandle,
    ) -> Self {
        Self {
            control,
            room_name: room_name.into(),
            participant_identity: participant_identity.into(),
            session,
        }
    }
}

#[async_trait]
impl CallActions for WorkerCallActions {
    async fn transfer_call(&self, transfer_to: &str) -> Result<(), ToolError> {
        let result = self
            .control
            .transfer_sip_participant(&self.room_name, &self.participant_identity, transfer_to)
            .await
            .map_err(|err| ToolError::Execution(err.to_string()))?;

        match result {
            SipResult::Ok { .. } => Ok(()),
            SipResult::Failed { sip_status, reason } => Err(ToolError::Execution(format!(
                "SIP {}: {}",
                sip_status, reason
            ))),
        }
    }

    async fn hangup(&self, after_current_speech: bool) {
        self.session.request_hangup(after_current_speech).await;
    }
}
