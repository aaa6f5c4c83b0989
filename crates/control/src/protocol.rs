//! Control plane wire protocol
//!
//! JSON messages over the worker's WebSocket, tagged by `type`. SIP
//! operations are correlated request/response pairs; everything else is
//! fire-and-forget.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Job assignment payload as it crosses the wire
///
/// Metadata stays a raw JSON string here; the dispatcher parses and
/// validates it before a session exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobPayload {
    pub id: String,
    pub room_name: String,
    pub metadata: String,
    pub dispatched_at: DateTime<Utc>,
}

/// Job lifecycle states reported back to the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Running,
    Completed,
    Failed,
}

/// SIP operations the worker can request
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SipCommand {
    CreateParticipant {
        room_name: String,
        trunk_id: String,
        callee: String,
        identity: String,
        wait_until_answered: bool,
    },
    TransferParticipant {
        room_name: String,
        identity: String,
        transfer_to: String,
    },
    DeleteRoom {
        room_name: String,
    },
}

/// Result of a SIP operation
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SipResult {
    Ok {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        participant_identity: Option<String>,
    },
    Failed {
        sip_status: u16,
        reason: String,
    },
}

/// Parameters for an outbound SIP participant
#[derive(Debug, Clone)]
pub struct CreateSipParticipant {
    pub room_name: String,
    pub trunk_id: String,
    pub callee: String,
    pub identity: String,
    pub wait_until_answered: bool,
}

/// Messages sent by the worker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Register {
        worker_name: String,
        capabilities: Vec<String>,
    },
    JobStatus {
        job_id: String,
        state: JobState,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
        completed_at: DateTime<Utc>,
    },
    SipRequest {
        request_id: String,
        command: SipCommand,
    },
    Pong,
}

/// Messages sent by the room server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Registered {
        worker_id: String,
    },
    JobAssignment {
        job: JobPayload,
    },
    SipResponse {
        request_id: String,
        result: SipResult,
    },
    ParticipantLeft {
        room_name: String,
        identity: String,
    },
    Ping,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_round_trip() {
        let msg = ClientMessage::SipRequest {
            request_id: "r1".into(),
            command: SipCommand::CreateParticipant {
                room_name: "call-1".into(),
                trunk_id: "ST_trunk".into(),
                callee: "+14155550123".into(),
                identity: "phone_user".into(),
                wait_until_answered: true,
            },
        };

        let encoded = serde_json::to_string(&msg).unwrap();
        assert!(encoded.contains("\"type\":\"sip_request\""));
        assert!(encoded.contains("\"op\":\"create_participant\""));

        let decoded: ClientMessage = serde_json::from_str(&encoded).unwrap();
        match decoded {
            ClientMessage::SipRequest { request_id, command } => {
                assert_eq!(request_id, "r1");
                assert!(matches!(command, SipCommand::CreateParticipant { .. }));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_server_message_round_trip() {
        let msg = ServerMessage::SipResponse {
            request_id: "r2".into(),
            result: SipResult::Failed {
                sip_status: 486,
                reason: "busy here".into(),
            },
        };
        let encoded = serde_json::to_string(&msg).unwrap();
        let decoded: ServerMessage = serde_json::from_str(&encoded).unwrap();
        match decoded {
            ServerMessage::SipResponse { result: SipResult::Failed { sip_status, .. }, .. } => {
                assert_eq!(sip_status, 486);
            }
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn test_job_state_wire_names() {
        assert_eq!(serde_json::to_string(&JobState::Failed).unwrap(), "\"failed\"");
    }
}
