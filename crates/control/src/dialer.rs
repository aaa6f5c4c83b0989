//! Outbound dialer
//!
//! Requests an outbound SIP participant and blocks until the called party
//! answers, a terminal SIP status arrives, or the call is cancelled. No
//! automatic retry: the dispatcher decides what a transient status is
//! worth.

use std::sync::Arc;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use callagent_core::Participant;

use crate::client::RoomControl;
use crate::protocol::{CreateSipParticipant, SipResult};
use crate::ControlError;

/// Identity assigned to the remote phone participant
pub const PHONE_PARTICIPANT_IDENTITY: &str = "phone_user";

/// Dial failures
#[derive(Error, Debug, Clone)]
pub enum DialError {
    #[error("callee busy")]
    Busy,

    #[error("no answer")]
    NoAnswer,

    #[error("call rejected with SIP {sip_status}: {reason}")]
    Rejected { sip_status: u16, reason: String },

    #[error("dial cancelled")]
    Cancelled,

    #[error("control plane error: {0}")]
    Control(#[from] ControlError),
}

/// Outbound SIP dialer
pub struct Dialer {
    control: Arc<dyn RoomControl>,
    trunk_id: String,
}

impl Dialer {
    pub fn new(control: Arc<dyn RoomControl>, trunk_id: impl Into<String>) -> Self {
        Self {
            control,
            trunk_id: trunk_id.into(),
        }
    }

    /// Place an outbound call into `room_name`
    ///
    /// Resolves once the callee answers. Terminal SIP statuses map to
    /// typed errors with the status code preserved.
    pub async fn dial(
        &self,
        callee: &str,
        room_name: &str,
        cancel: &CancellationToken,
    ) -> Result<Participant, DialError> {
        let request = CreateSipParticipant {
            room_name: room_name.to_string(),
            trunk_id: self.trunk_id.clone(),
            callee: callee.to_string(),
            identity: PHONE_PARTICIPANT_IDENTITY.to_string(),
            wait_until_answered: true,
        };

        tracing::info!(callee = %callee, room = %room_name, trunk = %self.trunk_id, "dialing");

        let result = tokio::select! {
            _ = cancel.cancelled() => return Err(DialError::Cancelled),
            result = self.control.create_sip_participant(request) => result?,
        };

        match result {
            SipResult::Ok { participant_identity } => {
                let identity =
                    participant_identity.unwrap_or_else(|| PHONE_PARTICIPANT_IDENTITY.to_string());
                tracing::info!(identity = %identity, "callee answered");
                Ok(Participant::sip_remote(identity))
            }
            SipResult::Failed { sip_status, reason } => {
                tracing::warn!(sip_status, reason = %reason, "dial failed");
                Err(match sip_status {
                    486 | 600 => DialError::Busy,
                    480 | 487 | 408 => DialError::NoAnswer,
                    _ => DialError::Rejected { sip_status, reason },
                })
            }
        }
    }
}
