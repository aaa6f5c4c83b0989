//! Worker dispatcher
//!
//! Consumes control plane events, validates job metadata, dials, and
//! spawns one session task per job. Control channel loss never touches
//! running sessions; a panicking session is contained and reported as a
//! fatal job outcome.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::time::{timeout, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use callagent_config::Settings;
use callagent_control::{
    ControlEvent, DialError, Dialer, JobPayload, JobState, RoomControl,
};
use callagent_core::{EndReason, Job, JobMetadata, MetricsEvent};
use callagent_llm::LlmClient;
use callagent_pipeline::{
    AudioSink, NullSink, SimulatedSttClient, SimulatedTtsClient, SimulatedVadClient, SttClient,
    TtsClient, VadClient,
};
use callagent_session::{Session, SessionConfig, SessionHandle};
use callagent_tools::default_call_tools;

use crate::actions::WorkerCallActions;
use crate::WorkerError;

/// Provider clients shared by all sessions
#[derive(Clone)]
pub struct ProviderSet {
    pub stt: Arc<dyn SttClient>,
    pub vad: Arc<dyn VadClient>,
    pub tts: Arc<dyn TtsClient>,
    pub llm: Arc<dyn LlmClient>,
    pub sink: Arc<dyn AudioSink>,
}

impl ProviderSet {
    /// Credential-free wiring with the simulated providers
    pub fn simulated() -> Self {
        Self {
            stt: Arc::new(SimulatedSttClient::new(Vec::new())),
            vad: Arc::new(SimulatedVadClient),
            tts: Arc::new(SimulatedTtsClient::new()),
            llm: Arc::new(callagent_llm::ScriptedLlm::new(Vec::new())),
            sink: Arc::new(NullSink),
        }
    }
}

/// Job dispatcher
pub struct Dispatcher {
    settings: Settings,
    control: Arc<dyn RoomControl>,
    events: Mutex<Option<mpsc::Receiver<ControlEvent>>>,
    providers: ProviderSet,
    metrics_tx: mpsc::Sender<MetricsEvent>,
    sessions: Arc<Mutex<HashMap<String, SessionHandle>>>,
    tracker: TaskTracker,
}

impl Dispatcher {
    pub fn new(
        settings: Settings,
        control: Arc<dyn RoomControl>,
        events: mpsc::Receiver<ControlEvent>,
        providers: ProviderSet,
        metrics_tx: mpsc::Sender<MetricsEvent>,
    ) -> Self {
        Self {
            settings,
            control,
            events: Mutex::new(Some(events)),
            providers,
            metrics_tx,
            sessions: Arc::new(Mutex::new(HashMap::new())),
            tracker: TaskTracker::new(),
        }
    }

    /// Handle to the session owning `room_name`, if any
    ///
    /// The media layer uses this to push inbound room audio.
    pub fn session_for_room(&self, room_name: &str) -> Option<SessionHandle> {
        self.sessions.lock().get(room_name).cloned()
    }

    /// Number of sessions currently running
    pub fn active_sessions(&self) -> usize {
        self.sessions.lock().len()
    }

    /// Register and serve jobs until cancelled
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), WorkerError> {
        let worker_id = self
            .control
            .register_worker(&self.settings.worker.name, &["voice".to_string()])
            .await
            .map_err(|err| match err {
                callagent_control::ControlError::Auth(message) => WorkerError::Auth(message),
                other => WorkerError::Control(other),
            })?;
        tracing::info!(worker_id = %worker_id, name = %self.settings.worker.name, "worker registered");

        let mut events = self
            .events
            .lock()
            .take()
            .ok_or(WorkerError::AlreadyRunning)?;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tracing::info!("dispatcher shutting down");
                    break;
                }
                event = events.recv() => match event {
                    Some(ControlEvent::Connected) => {
                        tracing::info!("control plane connected");
                    }
                    Some(ControlEvent::Disconnected { reason }) => {
                        // Running sessions are unaffected; the client
                        // reconnects with backoff on its own.
                        tracing::warn!(reason = %reason, "control plane disconnected");
                    }
                    Some(ControlEvent::JobAssigned(payload)) => {
                        self.handle_job(payload, &cancel).await;
                    }
                    Some(ControlEvent::ParticipantLeft { room_name, identity }) => {
                        tracing::info!(room = %room_name, identity = %identity, "participant left");
                        let handle = self.sessions.lock().get(&room_name).cloned();
                        if let Some(handle) = handle {
                            handle.participant_left().await;
                        }
                    }
                    None => {
                        tracing::error!("control event stream closed");
                        break;
                    }
                }
            }
        }

        // Sessions get the shutdown grace to drain, then are cut off.
        let handles: Vec<SessionHandle> = self.sessions.lock().values().cloned().collect();
        for handle in handles {
            handle.cancel();
        }
        self.tracker.close();
        let grace = Duration::from_millis(self.settings.worker.shutdown_grace_ms);
        if timeout(grace, self.tracker.wait()).await.is_err() {
            tracing::warn!("sessions did not drain within shutdown grace");
        }

        Ok(())
    }

    async fn handle_job(&self, payload: JobPayload, cancel: &CancellationToken) {
        tracing::info!(job_id = %payload.id, room = %payload.room_name, "job assigned");

        let metadata = match JobMetadata::parse(&payload.metadata) {
            Ok(metadata) => metadata,
            Err(err) => {
                tracing::warn!(job_id = %payload.id, error = %err, "rejecting job with bad metadata");
                let _ = self
                    .control
                    .send_job_status(&payload.id, JobState::Failed, Some("fatal_error"))
                    .await;
                return;
            }
        };

        if self.sessions.lock().len() >= self.settings.worker.max_sessions {
            tracing::warn!(job_id = %payload.id, "at session capacity, rejecting job");
            let _ = self
                .control
                .send_job_status(&payload.id, JobState::Failed, Some("fatal_error"))
                .await;
            return;
        }

        let job = Job {
            id: payload.id,
            room_name: payload.room_name,
            metadata,
            dispatched_at: payload.dispatched_at,
        };
        let _ = self
            .control
            .send_job_status(&job.id, JobState::Running, None)
            .await;

        let control = Arc::clone(&self.control);
        let providers = self.providers.clone();
        let metrics_tx = self.metrics_tx.clone();
        let sessions = Arc::clone(&self.sessions);
        let settings = self.settings.clone();
        let job_cancel = cancel.child_token();

        self.tracker.spawn(async move {
            let dialer = Dialer::new(Arc::clone(&control), settings.control.sip_trunk_id.clone());
            let participant = match dialer
                .dial(&job.metadata.phone_number, &job.room_name, &job_cancel)
                .await
            {
                Ok(participant) => participant,
                Err(err) => {
                    let reason = match &err {
                        DialError::Cancelled => "timeout",
                        _ => "fatal_error",
                    };
                    tracing::warn!(job_id = %job.id, error = %err, "outbound dial failed");
                    let _ = control
                        .send_job_status(&job.id, JobState::Failed, Some(reason))
                        .await;
                    return;
                }
            };

            let session_config = SessionConfig {
                agent: settings.agent.for_job(&job.metadata),
                timeouts: settings.session.clone(),
                shutdown_grace_ms: settings.worker.shutdown_grace_ms,
                call_time_limit_ms: settings.worker.call_time_limit_ms,
            };

            let session_id = format!("sess-{}", job.id);
            let enabled_tools = session_config.agent.tools.clone();
            let deps = callagent_session::SessionDeps {
                stt: providers.stt,
                vad: providers.vad,
                tts: providers.tts,
                llm: providers.llm,
                sink: providers.sink,
                metrics: metrics_tx,
            };
            let (mut session, handle) = Session::new(session_id, job.clone(), session_config, deps);

            // Worker shutdown flows into the session.
            let link = {
                let job_cancel = job_cancel.clone();
                let session_cancel = handle.cancellation_token();
                tokio::spawn(async move {
                    job_cancel.cancelled().await;
                    session_cancel.cancel();
                })
            };

            let actions = Arc::new(WorkerCallActions::new(
                Arc::clone(&control),
                job.room_name.clone(),
                participant.identity.clone(),
                handle.clone(),
            ));
            let mut tools = default_call_tools(actions);
            tools.retain_enabled(&enabled_tools);
            session.set_tools(tools);

            sessions.lock().insert(job.room_name.clone(), handle);

            let outcome = tokio::spawn(session.run()).await;
            link.abort();
            sessions.lock().remove(&job.room_name);

            let reason = match outcome {
                Ok(reason) => reason,
                Err(err) => {
                    // A panicking session must not take the worker down.
                    tracing::error!(job_id = %job.id, error = %err, "session task failed");
                    EndReason::FatalError
                }
            };

            let state = match reason {
                EndReason::FatalError => JobState::Failed,
                _ => JobState::Completed,
            };
            let _ = control
                .send_job_status(&job.id, state, Some(reason.as_str()))
                .await;
            // Deleting the room hangs up whatever is left in it.
            let _ = control.delete_room(&job.room_name).await;

            tracing::info!(job_id = %job.id, reason = reason.as_str(), "job finished");
        });
    }
}
