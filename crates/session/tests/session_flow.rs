//! End-to-end session scenarios with scripted providers
//!
//! Audio is pushed through the real pipeline (simulated VAD + STT), the
//! LLM is scripted per turn, and synthesized audio lands in a capturing
//! sink so playout timing can be asserted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};

use callagent_config::SessionTimeouts;
use callagent_core::{
    AudioFrame, Channels, ChatRole, EndReason, Job, JobMetadata, MetricsEvent, SampleRate,
};
use callagent_llm::{ScriptedLlm, ScriptedStep};
use callagent_pipeline::{
    CapturingSink, SimulatedSttClient, SimulatedTtsClient, SimulatedVadClient,
};
use callagent_session::{Session, SessionConfig, SessionDeps, SessionHandle};
use callagent_tools::{default_call_tools, CallActions, ToolError};

/// Test `CallActions`: records transfers and simulates the room kicking
/// the participant after a successful transfer.
struct TestCallActions {
    session: SessionHandle,
    transfers: Mutex<Vec<String>>,
    fail_transfer: bool,
}

impl TestCallActions {
    fn new(session: SessionHandle) -> Self {
        Self {
            session,
            transfers: Mutex::new(Vec::new()),
            fail_transfer: false,
        }
    }
}

#[async_trait]
impl CallActions for TestCallActions {
    async fn transfer_call(&self, transfer_to: &str) -> Result<(), ToolError> {
        if self.fail_transfer {
            return Err(ToolError::Execution("SIP 503: service unavailable".into()));
        }
        self.transfers.lock().push(transfer_to.to_string());
        self.session.participant_left().await;
        Ok(())
    }

    async fn hangup(&self, after_current_speech: bool) {
        self.session.request_hangup(after_current_speech).await;
    }
}

struct Harness {
    handle: SessionHandle,
    metrics: mpsc::Receiver<MetricsEvent>,
    llm: Arc<ScriptedLlm>,
    sink: CapturingSink,
    actions: Arc<TestCallActions>,
    join: tokio::task::JoinHandle<EndReason>,
    clock: u64,
}

fn test_job(transfer_to: Option<&str>) -> Job {
    Job {
        id: "job-1".to_string(),
        room_name: "call-1".to_string(),
        metadata: JobMetadata {
            phone_number: "+14155550123".to_string(),
            transfer_to: transfer_to.map(str::to_string),
            customer_name: Some("Jayden".to_string()),
            ..Default::default()
        },
        dispatched_at: chrono::Utc::now(),
    }
}

fn spawn_session(
    utterances: Vec<&str>,
    turns: Vec<Vec<ScriptedStep>>,
    configure: impl FnOnce(&mut SessionConfig),
) -> Harness {
    let llm = Arc::new(ScriptedLlm::new(turns));
    let sink = CapturingSink::new();
    let (metrics_tx, metrics_rx) = mpsc::channel(64);

    let mut config = SessionConfig {
        timeouts: SessionTimeouts::default(),
        ..Default::default()
    };
    configure(&mut config);

    let deps = SessionDeps {
        stt: Arc::new(SimulatedSttClient::new(
            utterances.into_iter().map(str::to_string).collect(),
        )),
        vad: Arc::new(SimulatedVadClient),
        tts: Arc::new(SimulatedTtsClient::new()),
        llm: llm.clone(),
        sink: Arc::new(sink.clone()),
        metrics: metrics_tx,
    };

    let job = test_job(Some("+14155559999"));
    let (mut session, handle) = Session::new("sess-test", job, config, deps);
    let actions = Arc::new(TestCallActions::new(handle.clone()));
    session.set_tools(default_call_tools(actions.clone()));

    let join = tokio::spawn(session.run());

    Harness {
        handle,
        metrics: metrics_rx,
        llm,
        sink,
        actions,
        join,
        clock: 0,
    }
}

impl Harness {
    /// Push voiced audio for `ms` milliseconds in 20ms frames
    async fn speak_ms(&mut self, ms: u64) {
        for _ in 0..(ms / 20) {
            let samples: Vec<f32> = (0..320).map(|i| (i as f32 * 0.3).sin() * 0.5).collect();
            self.handle.push_audio(AudioFrame::new(
                samples,
                SampleRate::Hz16000,
                Channels::Mono,
                self.clock,
            ));
            self.clock += 20;
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Push silence for `ms` milliseconds in 20ms frames
    async fn silence_ms(&mut self, ms: u64) {
        for _ in 0..(ms / 20) {
            self.handle.push_audio(AudioFrame::new(
                vec![0.0; 320],
                SampleRate::Hz16000,
                Channels::Mono,
                self.clock,
            ));
            self.clock += 20;
            sleep(Duration::from_millis(20)).await;
        }
    }

    /// Wait for the next turn record
    async fn next_turn_record(&mut self) -> callagent_core::TurnRecord {
        loop {
            match timeout(Duration::from_secs(120), self.metrics.recv())
                .await
                .expect("metrics channel stalled")
                .expect("metrics channel closed")
            {
                MetricsEvent::Turn { record, .. } => return record,
                _ => continue,
            }
        }
    }

    /// Wait for the session-ended event
    async fn session_ended(&mut self) -> (EndReason, usize) {
        loop {
            match timeout(Duration::from_secs(120), self.metrics.recv())
                .await
                .expect("metrics channel stalled")
                .expect("metrics channel closed")
            {
                MetricsEvent::SessionEnded { reason, turn_count, .. } => {
                    return (reason, turn_count)
                }
                _ => continue,
            }
        }
    }
}

/// Scenario: happy path appointment confirmation. One turn, full latency
/// record, clean hangup.
#[tokio::test(start_paused = true)]
async fn test_happy_path_turn_and_metrics() {
    let mut h = spawn_session(
        vec!["yes I'll be there"],
        vec![ScriptedLlm::say("Great, see you Tuesday at 3pm.")],
        |_| {},
    );

    h.speak_ms(400).await;
    h.silence_ms(400).await;

    let record = h.next_turn_record().await;
    assert_eq!(record.user_text, "yes I'll be there");
    assert_eq!(record.assistant_text, "Great, see you Tuesday at 3pm.");
    assert!(!record.interrupted);
    assert!(record.error.is_none());
    assert!(record.stt_final_at.is_some());
    assert!(record.llm_first_token_at.is_some());
    assert!(record.tts_first_byte_at.is_some());
    assert!(record.tts_done_at.is_some());
    assert!(record.is_ordered());
    assert_eq!(
        record.total_latency_ms,
        Some(record.tts_first_byte_at.unwrap() - record.stt_final_at.unwrap())
    );

    // Synthesized audio reached the room.
    assert!(!h.sink.frames().is_empty());

    h.handle.request_hangup(false).await;
    let (reason, turn_count) = h.session_ended().await;
    assert_eq!(reason, EndReason::Normal);
    assert_eq!(turn_count, 1);
    assert_eq!(h.join.await.unwrap(), EndReason::Normal);
}

/// Scenario: the caller asks for a human; the transfer tool fires and the
/// session ends when the participant leaves the room.
#[tokio::test(start_paused = true)]
async fn test_transfer_to_human() {
    let mut h = spawn_session(
        vec!["can I talk to a person"],
        vec![
            vec![ScriptedStep::ToolCall {
                name: "transfer_call".to_string(),
                arguments: json!({}),
            }],
            ScriptedLlm::say("Of course, transferring you now."),
        ],
        |_| {},
    );

    h.speak_ms(400).await;
    h.silence_ms(400).await;

    let (reason, _) = h.session_ended().await;
    assert_eq!(reason, EndReason::ParticipantLeft);
    assert_eq!(
        h.actions.transfers.lock().as_slice(),
        ["+14155559999".to_string()]
    );
    assert_eq!(h.join.await.unwrap(), EndReason::ParticipantLeft);
}

/// Scenario: answering machine detected; the session ends within the
/// turn and produces no further speech.
#[tokio::test(start_paused = true)]
async fn test_answering_machine_ends_session() {
    let mut h = spawn_session(
        vec!["please leave a message after the tone"],
        vec![vec![ScriptedStep::ToolCall {
            name: "detected_answering_machine".to_string(),
            arguments: json!({}),
        }]],
        |_| {},
    );

    h.speak_ms(400).await;
    h.silence_ms(400).await;

    let (reason, _) = h.session_ended().await;
    assert_eq!(reason, EndReason::Normal);
    // The tool-call-only turn produced no synthesized speech, and no
    // continuation request was made after hangup.
    assert!(h.sink.frames().is_empty());
    assert_eq!(h.llm.call_count(), 1);
    assert_eq!(h.join.await.unwrap(), EndReason::Normal);
}

/// Scenario: barge-in. TTS stops within 100ms of the interruption, the
/// assistant message shrinks to what was spoken, and the next turn runs
/// normally.
#[tokio::test(start_paused = true)]
async fn test_barge_in_cancels_speech_and_truncates() {
    let long_response = "Let me walk you through all of it. \
         The first thing to know is that the plan has many parts. \
         After that there are several more details to cover.";
    let mut h = spawn_session(
        vec!["tell me everything", "wait stop"],
        vec![
            ScriptedLlm::say(long_response),
            ScriptedLlm::say("Sure, go ahead."),
        ],
        |_| {},
    );

    h.speak_ms(400).await;
    h.silence_ms(400).await;

    // Wait for agent speech to start flowing.
    let speech_started = Instant::now();
    while h.sink.frames().is_empty() {
        assert!(speech_started.elapsed() < Duration::from_secs(30), "no speech started");
        sleep(Duration::from_millis(50)).await;
    }

    // 2 seconds into the utterance, the user barges in.
    sleep(Duration::from_secs(2)).await;
    let barge_at = Instant::now();
    h.speak_ms(200).await;

    // Playout was flushed promptly after the interruption was detected.
    let clears = h.sink.clears();
    assert!(!clears.is_empty(), "sink never cleared on barge-in");
    assert!(
        clears[0].duration_since(barge_at) <= Duration::from_millis(300),
        "barge-in took too long to stop playout"
    );
    // Nothing played out after the flush.
    if let Some(last) = h.sink.last_frame_at() {
        assert!(last <= clears[0]);
    }

    let record = h.next_turn_record().await;
    assert!(record.interrupted);
    assert_eq!(record.user_text, "tell me everything");
    // Only the first sentence had been spoken.
    assert!(record.assistant_text.starts_with("Let me walk you through all of it."));
    assert!(record.assistant_text.len() < long_response.len());

    // The second utterance finishes and the next turn proceeds normally.
    h.silence_ms(400).await;
    let record = h.next_turn_record().await;
    assert!(!record.interrupted);
    assert_eq!(record.user_text, "wait stop");
    assert_eq!(record.assistant_text, "Sure, go ahead.");

    // The truncated assistant message is what the model sees next.
    let calls = h.llm.recorded_calls();
    let second_call = &calls[1];
    let truncated = second_call
        .messages
        .iter()
        .find(|m| m.role == ChatRole::Assistant)
        .expect("assistant message present");
    assert!(truncated.content.len() < long_response.len());

    h.handle.request_hangup(false).await;
    h.join.await.unwrap();
}

/// Scenario: the LLM hangs past its timeout; the session apologizes,
/// emits an errored record with null LLM timings, and keeps listening.
#[tokio::test(start_paused = true)]
async fn test_llm_timeout_recovers_with_apology() {
    let mut h = spawn_session(
        vec!["hello are you there", "yes I'll be there"],
        vec![
            vec![ScriptedStep::Hang],
            ScriptedLlm::say("I'm here! See you Tuesday."),
        ],
        |config| {
            config.agent.llm.timeout_ms = 1_000;
        },
    );

    h.speak_ms(400).await;
    h.silence_ms(400).await;

    let record = h.next_turn_record().await;
    assert_eq!(record.error.as_deref(), Some("llm_timeout"));
    assert!(record.llm_first_token_at.is_none());
    assert!(record.llm_done_at.is_none());

    // The apology was synthesized.
    let apology_frames = {
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            if !h.sink.frames().is_empty() {
                break h.sink.frames().len();
            }
            assert!(Instant::now() < deadline, "no apology spoken");
            sleep(Duration::from_millis(50)).await;
        }
    };
    assert!(apology_frames > 0);

    // Allow the apology to finish, then the next turn works.
    sleep(Duration::from_secs(10)).await;
    h.speak_ms(400).await;
    h.silence_ms(400).await;

    let record = h.next_turn_record().await;
    assert!(record.error.is_none());
    assert_eq!(record.assistant_text, "I'm here! See you Tuesday.");

    h.handle.request_hangup(false).await;
    h.join.await.unwrap();
}

/// Boundary: pure silence starts no turn and makes no LLM call.
#[tokio::test(start_paused = true)]
async fn test_empty_utterance_makes_no_llm_call() {
    // Voice energy but nothing the recognizer turns into text.
    let mut h = spawn_session(vec![], vec![], |_| {});

    h.speak_ms(300).await;
    h.silence_ms(600).await;

    assert_eq!(h.llm.call_count(), 0);

    h.handle.request_hangup(false).await;
    let (reason, turn_count) = h.session_ended().await;
    assert_eq!(reason, EndReason::Normal);
    assert_eq!(turn_count, 0);
    h.join.await.unwrap();
}

/// The configured greeting is spoken before any user input and lands in
/// the context the model sees.
#[tokio::test(start_paused = true)]
async fn test_greeting_is_spoken_first() {
    let mut h = spawn_session(
        vec!["hi"],
        vec![ScriptedLlm::say("Nice to hear from you.")],
        |config| {
            config.agent.greeting = Some("Hello Jayden, calling about your appointment.".into());
        },
    );

    // Greeting audio flows with no user input at all.
    let deadline = Instant::now() + Duration::from_secs(30);
    while h.sink.frames().is_empty() {
        assert!(Instant::now() < deadline, "greeting never spoken");
        sleep(Duration::from_millis(50)).await;
    }

    // Let the greeting finish, then run a turn.
    sleep(Duration::from_secs(5)).await;
    h.speak_ms(400).await;
    h.silence_ms(400).await;

    let _ = h.next_turn_record().await;
    let calls = h.llm.recorded_calls();
    let greeting_seen = calls[0]
        .messages
        .iter()
        .any(|m| m.role == ChatRole::Assistant && m.content.contains("Hello Jayden"));
    assert!(greeting_seen, "greeting missing from model context");

    h.handle.request_hangup(false).await;
    h.join.await.unwrap();
}

/// Cancelling the session tears everything down within the grace period.
#[tokio::test(start_paused = true)]
async fn test_cancellation_drains_quickly() {
    let mut h = spawn_session(
        vec!["hello"],
        vec![ScriptedLlm::say("Hi there.")],
        |_| {},
    );

    h.speak_ms(200).await;
    h.handle.cancel();

    let started = Instant::now();
    let reason = timeout(Duration::from_secs(10), h.join)
        .await
        .expect("session did not stop")
        .unwrap();
    assert_eq!(reason, EndReason::Timeout);
    assert!(started.elapsed() <= Duration::from_secs(6));
}
