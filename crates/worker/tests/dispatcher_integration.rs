//! Dispatcher integration tests over the stub control plane.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{sleep, timeout, Instant};
use tokio_util::sync::CancellationToken;

use callagent_config::Settings;
use callagent_control::{JobPayload, JobState, StubControlPlane};
use callagent_core::{AudioFrame, Channels, SampleRate};
use callagent_llm::ScriptedLlm;
use callagent_pipeline::{NullSink, SimulatedSttClient, SimulatedTtsClient, SimulatedVadClient};
use callagent_worker::{Dispatcher, ProviderSet};

fn test_settings() -> Settings {
    let mut settings = Settings::default();
    settings.control.url = "ws://127.0.0.1:1".to_string();
    settings.control.api_key = "key".to_string();
    settings.control.api_secret = "secret".to_string();
    settings.control.sip_trunk_id = "ST_test".to_string();
    settings
}

fn job_payload(id: &str, room: &str, metadata: &str) -> JobPayload {
    JobPayload {
        id: id.to_string(),
        room_name: room.to_string(),
        metadata: metadata.to_string(),
        dispatched_at: chrono::Utc::now(),
    }
}

fn providers(utterances: Vec<&str>, llm: Arc<ScriptedLlm>) -> ProviderSet {
    ProviderSet {
        stt: Arc::new(SimulatedSttClient::new(
            utterances.into_iter().map(str::to_string).collect(),
        )),
        vad: Arc::new(SimulatedVadClient),
        tts: Arc::new(SimulatedTtsClient::new()),
        llm,
        sink: Arc::new(NullSink),
    }
}

async fn wait_for<F: Fn() -> bool>(what: &str, condition: F) {
    let deadline = Instant::now() + Duration::from_secs(120);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        sleep(Duration::from_millis(50)).await;
    }
}

/// A full job: dial, converse one turn, hang up via handle, report
/// completion, delete the room.
#[tokio::test(start_paused = true)]
async fn test_job_runs_session_to_completion() {
    let (control, events) = StubControlPlane::new();
    let llm = Arc::new(ScriptedLlm::new(vec![ScriptedLlm::say(
        "You're confirmed for Tuesday.",
    )]));
    let (metrics_tx, _metrics_rx) = mpsc::channel(64);

    let dispatcher = Arc::new(Dispatcher::new(
        test_settings(),
        control.clone(),
        events,
        providers(vec!["yes that works"], llm),
        metrics_tx,
    ));

    let cancel = CancellationToken::new();
    let run = {
        let dispatcher = Arc::clone(&dispatcher);
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.run(cancel).await })
    };

    control
        .assign_job(job_payload(
            "job-1",
            "call-1",
            r#"{"phone_number": "+14155550123", "customer_name": "Jayden"}"#,
        ))
        .await;

    // The dial goes out and a session appears for the room.
    wait_for("dial", || !control.dialed_numbers().is_empty()).await;
    assert_eq!(control.dialed_numbers(), vec!["+14155550123".to_string()]);
    wait_for("session", || dispatcher.session_for_room("call-1").is_some()).await;
    let handle = dispatcher.session_for_room("call-1").unwrap();

    // Drive one conversational turn through the room audio path.
    let mut ts = 0u64;
    for _ in 0..20 {
        let samples: Vec<f32> = (0..320).map(|i| (i as f32 * 0.3).sin() * 0.5).collect();
        handle.push_audio(AudioFrame::new(samples, SampleRate::Hz16000, Channels::Mono, ts));
        ts += 20;
        sleep(Duration::from_millis(20)).await;
    }
    for _ in 0..20 {
        handle.push_audio(AudioFrame::new(
            vec![0.0; 320],
            SampleRate::Hz16000,
            Channels::Mono,
            ts,
        ));
        ts += 20;
        sleep(Duration::from_millis(20)).await;
    }

    // End the call and wait for the outcome report.
    sleep(Duration::from_secs(5)).await;
    handle.request_hangup(false).await;

    wait_for("completion report", || {
        control
            .statuses()
            .iter()
            .any(|s| s.job_id == "job-1" && s.state == JobState::Completed)
    })
    .await;

    let statuses = control.statuses();
    let completed = statuses
        .iter()
        .find(|s| s.state == JobState::Completed)
        .unwrap();
    assert_eq!(completed.reason.as_deref(), Some("normal"));
    assert!(statuses.iter().any(|s| s.state == JobState::Running));
    assert_eq!(control.deleted_rooms(), vec!["call-1".to_string()]);
    assert_eq!(dispatcher.active_sessions(), 0);

    cancel.cancel();
    run.await.unwrap().unwrap();
}

/// Malformed metadata is rejected as a fatal error without a session.
#[tokio::test(start_paused = true)]
async fn test_malformed_metadata_rejected() {
    let (control, events) = StubControlPlane::new();
    let (metrics_tx, _metrics_rx) = mpsc::channel(64);
    let dispatcher = Arc::new(Dispatcher::new(
        test_settings(),
        control.clone(),
        events,
        providers(vec![], Arc::new(ScriptedLlm::new(vec![]))),
        metrics_tx,
    ));

    let cancel = CancellationToken::new();
    let run = {
        let dispatcher = Arc::clone(&dispatcher);
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.run(cancel).await })
    };

    control
        .assign_job(job_payload("job-bad", "call-bad", r#"{"customer_name": "x"}"#))
        .await;

    wait_for("rejection", || {
        control
            .statuses()
            .iter()
            .any(|s| s.job_id == "job-bad" && s.state == JobState::Failed)
    })
    .await;

    let statuses = control.statuses();
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].reason.as_deref(), Some("fatal_error"));
    assert!(control.dialed_numbers().is_empty());
    assert_eq!(dispatcher.active_sessions(), 0);

    cancel.cancel();
    run.await.unwrap().unwrap();
}

/// A terminal SIP status on the dial marks the job fatal.
#[tokio::test(start_paused = true)]
async fn test_dial_failure_marks_job_fatal() {
    let (control, events) = StubControlPlane::new();
    control.script_dial_failure(486, "busy here");

    let (metrics_tx, _metrics_rx) = mpsc::channel(64);
    let dispatcher = Arc::new(Dispatcher::new(
        test_settings(),
        control.clone(),
        events,
        providers(vec![], Arc::new(ScriptedLlm::new(vec![]))),
        metrics_tx,
    ));

    let cancel = CancellationToken::new();
    let run = {
        let dispatcher = Arc::clone(&dispatcher);
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.run(cancel).await })
    };

    control
        .assign_job(job_payload(
            "job-busy",
            "call-busy",
            r#"{"phone_number": "+14155550123"}"#,
        ))
        .await;

    wait_for("fatal report", || {
        control
            .statuses()
            .iter()
            .any(|s| s.job_id == "job-busy" && s.state == JobState::Failed)
    })
    .await;

    let statuses = control.statuses();
    let failed = statuses.iter().find(|s| s.state == JobState::Failed).unwrap();
    assert_eq!(failed.reason.as_deref(), Some("fatal_error"));
    assert_eq!(dispatcher.active_sessions(), 0);

    cancel.cancel();
    run.await.unwrap().unwrap();
}

/// Worker shutdown cancels running sessions within the grace period.
#[tokio::test(start_paused = true)]
async fn test_shutdown_drains_sessions() {
    let (control, events) = StubControlPlane::new();
    let (metrics_tx, _metrics_rx) = mpsc::channel(64);
    let dispatcher = Arc::new(Dispatcher::new(
        test_settings(),
        control.clone(),
        events,
        providers(vec![], Arc::new(ScriptedLlm::new(vec![]))),
        metrics_tx,
    ));

    let cancel = CancellationToken::new();
    let run = {
        let dispatcher = Arc::clone(&dispatcher);
        let cancel = cancel.clone();
        tokio::spawn(async move { dispatcher.run(cancel).await })
    };

    control
        .assign_job(job_payload(
            "job-2",
            "call-2",
            r#"{"phone_number": "+14155550123"}"#,
        ))
        .await;
    wait_for("session", || dispatcher.session_for_room("call-2").is_some()).await;

    cancel.cancel();
    timeout(Duration::from_secs(30), run)
        .await
        .expect("dispatcher did not stop")
        .unwrap()
        .unwrap();

    // The cancelled session still reported an outcome.
    wait_for("outcome", || {
        control
            .statuses()
            .iter()
            .any(|s| s.job_id == "job-2" && s.state == JobState::Completed)
    })
    .await;
    assert_eq!(dispatcher.active_sessions(), 0);
}
