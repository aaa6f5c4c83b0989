//! Stub control plane for tests
//!
//! Records every operation and lets tests script dial results, assign
//! jobs, and emit room events. A transfer makes the phone participant
//! leave the room, mirroring what the media server does.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::client::{ControlEvent, RoomControl};
use crate::protocol::{CreateSipParticipant, JobPayload, JobState, SipResult};
use crate::ControlError;

/// Recorded job status report
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub job_id: String,
    pub state: JobState,
    pub reason: Option<String>,
}

/// In-memory control plane
pub struct StubControlPlane {
    events_tx: mpsc::Sender<ControlEvent>,
    statuses: Mutex<Vec<StatusReport>>,
    dials: Mutex<Vec<CreateSipParticipant>>,
    scripted_dials: Mutex<VecDeque<SipResult>>,
    transfers: Mutex<Vec<(String, String, String)>>,
    deleted_rooms: Mutex<Vec<String>>,
    hold_dials: Mutex<bool>,
    fail_transfers: Mutex<Option<SipResult>>,
}

impl StubControlPlane {
    /// Create the stub and its event stream
    pub fn new() -> (Arc<Self>, mpsc::Receiver<ControlEvent>) {
        let (events_tx, events_rx) = mpsc::channel(32);
        (
            Arc::new(Self {
                events_tx,
                statuses: Mutex::new(Vec::new()),
                dials: Mutex::new(Vec::new()),
                scripted_dials: Mutex::new(VecDeque::new()),
                transfers: Mutex::new(Vec::new()),
                deleted_rooms: Mutex::new(Vec::new()),
                hold_dials: Mutex::new(false),
                fail_transfers: Mutex::new(None),
            }),
            events_rx,
        )
    }

    /// Assign a job to the worker
    pub async fn assign_job(&self, job: JobPayload) {
        let _ = self.events_tx.send(ControlEvent::JobAssigned(job)).await;
    }

    /// Emit a participant-left room event
    pub async fn emit_participant_left(&self, room_name: &str, identity: &str) {
        let _ = self
            .events_tx
            .send(ControlEvent::ParticipantLeft {
                room_name: room_name.to_string(),
                identity: identity.to_string(),
            })
            .await;
    }

    /// Script the next dial to fail with a SIP status
    pub fn script_dial_failure(&self, sip_status: u16, reason: &str) {
        self.scripted_dials.lock().push_back(SipResult::Failed {
            sip_status,
            reason: reason.to_string(),
        });
    }

    /// Make dials hang until cancelled
    pub fn hold_dials(&self) {
        *self.hold_dials.lock() = true;
    }

    /// Make transfers fail with the given SIP status
    pub fn fail_transfers(&self, sip_status: u16, reason: &str) {
        *self.fail_transfers.lock() = Some(SipResult::Failed {
            sip_status,
            reason: reason.to_string(),
        });
    }

    /// Status reports received so far
    pub fn statuses(&self) -> Vec<StatusReport> {
        self.statuses.lock().clone()
    }

    /// Numbers dialed so far
    pub fn dialed_numbers(&self) -> Vec<String> {
        self.dials.lock().iter().map(|d| d.callee.clone()).collect()
    }

    /// Transfers requested so far as (room, identity, target)
    pub fn transfers(&self) -> Vec<(String, String, String)> {
        self.transfers.lock().clone()
    }

    /// Rooms deleted so far
    pub fn deleted_rooms(&self) -> Vec<String> {
        self.deleted_rooms.lock().clone()
    }
}

#[async_trait]
impl RoomControl for StubControlPlane {
    async fn register_worker(
        &self,
        name: &str,
        _capabilities: &[String],
    ) -> Result<String, ControlError> {
        Ok(format!("worker-{}", name))
    }

    async fn send_job_status(
        &self,
        job_id: &str,
        state: JobState,
        reason: Option<&str>,
    ) -> Result<(), ControlError> {
        self.statuses.lock().push(StatusReport {
            job_id: job_id.to_string(),
            state,
            reason: reason.map(str::to_string),
        });
        Ok(())
    }

    async fn create_sip_participant(
        &self,
        request: CreateSipParticipant,
    ) -> Result<SipResult, ControlError> {
        if *self.hold_dials.lock() {
            // Ringing forever; only cancellation gets the caller out.
            std::future::pending::<()>().await;
        }

        let identity = request.identity.clone();
        self.dials.lock().push(request);

        if let Some(scripted) = self.scripted_dials.lock().pop_front() {
            return Ok(scripted);
        }
        Ok(SipResult::Ok {
            participant_identity: Some(identity),
        })
    }

    async fn transfer_sip_participant(
        &self,
        room_name: &str,
        identity: &str,
        transfer_to: &str,
    ) -> Result<SipResult, ControlError> {
        self.transfers.lock().push((
            room_name.to_string(),
            identity.to_string(),
            transfer_to.to_string(),
        ));

        if let Some(result) = self.fail_transfers.lock().clone() {
            return Ok(result);
        }

        // A successful transfer moves the participant out of the room.
        self.emit_participant_left(room_name, identity).await;
        Ok(SipResult::Ok {
            participant_identity: None,
        })
    }

    async fn delete_room(&self, room_name: &str) -> Result<(), ControlError> {
        self.deleted_rooms.lock().push(room_name.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_stub_records_statuses() {
        let (stub, _events) = StubControlPlane::new();
        stub.send_job_status("job-1", JobState::Completed, Some("normal"))
            .await
            .unwrap();

        let statuses = stub.statuses();
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].job_id, "job-1");
        assert_eq!(statuses[0].reason.as_deref(), Some("normal"));
    }

    #[tokio::test]
    async fn test_transfer_emits_participant_left() {
        let (stub, mut events) = StubControlPlane::new();
        stub.transfer_sip_participant("call-1", "phone_user", "+14155559999")
            .await
            .unwrap();

        match events.recv().await.unwrap() {
            ControlEvent::ParticipantLeft { room_name, identity } => {
                assert_eq!(room_name, "call-1");
                assert_eq!(identity, "phone_user");
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }
}
