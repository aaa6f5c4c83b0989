//! Session orchestration
//!
//! One task owns the state machine. Provider streams run as producer
//! tasks feeding a single event queue; the orchestrator consumes it,
//! serializing every transition. Cancellation is hierarchical: the
//! session token parents every provider and pump task.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{sleep_until, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use callagent_config::{AgentConfig, SessionTimeouts};
use callagent_core::{
    AudioFrame, ChatContext, ChatMessage, EndReason, Job, JobMetadata, MetricsEvent, ToolCall,
    TurnRecord,
};
use callagent_llm::{FinishReason, LlmClient, LlmEvent, SentenceBuffer};
use callagent_pipeline::{
    spawn_turn_detector, AudioSink, SttClient, TtsClient, TtsParams, TurnDetectorConfig,
    TurnEvent, VadClient,
};
use callagent_tools::{ToolContext, ToolRegistry};

use crate::adaptation::VoiceAdaptationEngine;
use crate::events::SessionEvent;
use crate::metrics::MetricsSink;
use crate::state::SessionState;

const EVENT_QUEUE_CAPACITY: usize = 64;
const AUDIO_FANOUT_CAPACITY: usize = 64;
const TURN_EVENT_CAPACITY: usize = 32;

const TRANSIENT_APOLOGY: &str = "I'm having trouble hearing you; could you repeat that?";
const TIMEOUT_APOLOGY: &str =
    "I'm sorry, I'm having a little trouble right now. Could you say that again?";
const EMPTY_FALLBACK: &str = "I'm sorry, could you say that again?";
const TTS_ERROR_NOTE: &str = "Sorry, I lost my voice for a second. Could you repeat that?";
const FATAL_FAREWELL: &str = "I'm sorry, something went wrong; goodbye.";
const FAREWELL_BUDGET_MS: u64 = 2_000;

/// Per-session configuration
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Agent configuration for this call
    pub agent: AgentConfig,
    /// Turn and tool timing
    pub timeouts: SessionTimeouts,
    /// Drain budget on shutdown (ms)
    pub shutdown_grace_ms: u64,
    /// Hard cap on call duration (ms)
    pub call_time_limit_ms: Option<u64>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            agent: AgentConfig::default(),
            timeouts: SessionTimeouts::default(),
            shutdown_grace_ms: 5_000,
            call_time_limit_ms: None,
        }
    }
}

/// Provider clients and shared channels injected into a session
pub struct SessionDeps {
    pub stt: Arc<dyn SttClient>,
    pub vad: Arc<dyn VadClient>,
    pub tts: Arc<dyn TtsClient>,
    pub llm: Arc<dyn LlmClient>,
    pub sink: Arc<dyn AudioSink>,
    pub metrics: mpsc::Sender<MetricsEvent>,
}

/// External handle to a running session
///
/// The worker pushes room audio and lifecycle signals through this; tool
/// `CallActions` implementations use it to request hangup.
#[derive(Clone)]
pub struct SessionHandle {
    audio_tx: broadcast::Sender<AudioFrame>,
    events_tx: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
    hangup: Arc<Mutex<Option<bool>>>,
}

impl SessionHandle {
    /// Forward an inbound audio frame from the room
    pub fn push_audio(&self, frame: AudioFrame) {
        // No receivers just means the session has not opened streams yet.
        let _ = self.audio_tx.send(frame);
    }

    /// Notify the session that the remote participant left
    pub async fn participant_left(&self) {
        let _ = self.events_tx.send(SessionEvent::ParticipantLeft).await;
    }

    /// Request hangup. Immediate hangup wins over a graceful one.
    pub async fn request_hangup(&self, after_current_speech: bool) {
        {
            let mut pending = self.hangup.lock();
            match *pending {
                Some(false) => {}
                _ => *pending = Some(after_current_speech),
            }
        }
        let _ = self
            .events_tx
            .send(SessionEvent::HangupRequested {
                after_speech: after_current_speech,
            })
            .await;
    }

    /// Report a fatal failure from outside the session
    pub async fn report_fatal(&self, message: impl Into<String>) {
        let _ = self
            .events_tx
            .send(SessionEvent::FatalError {
                message: message.into(),
            })
            .await;
    }

    /// Token cancelling this session and all its children
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel the session
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// An utterance in flight
struct SpeechHandle {
    id: u64,
    /// Queue into the feeder task; None once finalized
    chunk_tx: Option<mpsc::UnboundedSender<String>>,
    cancel: CancellationToken,
    /// Whether this speech belongs to the active turn (vs canned speech)
    tracked: bool,
    /// Whether this speech is itself a recovery utterance
    recovery: bool,
    /// Ledger of chunk text already forwarded to the sink
    spoken: String,
    /// First-byte deadline, cleared once audio flows
    first_byte_deadline: Option<Instant>,
}

/// State of the turn currently being answered
struct ActiveTurn {
    record: TurnRecord,
    sentence: SentenceBuffer,
    assistant_text: String,
    tool_calls: Vec<ToolCall>,
    pending_tools: Option<Vec<ToolCall>>,
    llm_active: bool,
    llm_deadline: Instant,
    assistant_appended: bool,
    retried: bool,
}

impl ActiveTurn {
    fn new(speech_id: String, user_text: String, stt_final_at: u64, llm_deadline: Instant) -> Self {
        let mut record = TurnRecord::new(speech_id, user_text);
        record.stt_final_at = Some(stt_final_at);
        Self {
            record,
            sentence: SentenceBuffer::new(),
            assistant_text: String::new(),
            tool_calls: Vec::new(),
            pending_tools: None,
            llm_active: false,
            llm_deadline,
            assistant_appended: false,
            retried: false,
        }
    }
}

/// Per-call conversation session
pub struct Session {
    id: String,
    job: Job,
    metadata: Arc<JobMetadata>,
    config: SessionConfig,
    deps: SessionDeps,
    tools: ToolRegistry,

    chat: ChatContext,
    state: SessionState,
    adaptation: VoiceAdaptationEngine,
    metrics: MetricsSink,

    cancel: CancellationToken,
    children: CancellationToken,
    tasks: TaskTracker,
    events_rx: mpsc::Receiver<SessionEvent>,
    events_tx: mpsc::Sender<SessionEvent>,
    audio_tx: broadcast::Sender<AudioFrame>,
    agent_speaking: watch::Sender<bool>,
    hangup: Arc<Mutex<Option<bool>>>,

    started: Instant,
    call_deadline: Option<Instant>,
    generation: u64,
    llm_cancel: CancellationToken,
    speech_seq: u64,
    speech: Option<SpeechHandle>,
    turn: Option<ActiveTurn>,
    pending_turn: Option<(String, u64)>,
    end_reason: Option<EndReason>,
    turn_count: usize,
    current_params: TtsParams,
}

impl Session {
    /// Create a session and its external handle
    pub fn new(
        session_id: impl Into<String>,
        job: Job,
        config: SessionConfig,
        deps: SessionDeps,
    ) -> (Self, SessionHandle) {
        let session_id = session_id.into();
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let (audio_tx, _) = broadcast::channel(AUDIO_FANOUT_CAPACITY);
        let (agent_speaking, _) = watch::channel(false);
        let cancel = CancellationToken::new();
        let hangup = Arc::new(Mutex::new(None));

        let handle = SessionHandle {
            audio_tx: audio_tx.clone(),
            events_tx: events_tx.clone(),
            cancel: cancel.clone(),
            hangup: Arc::clone(&hangup),
        };

        let metadata = Arc::new(job.metadata.clone());
        let metrics = MetricsSink::new(session_id.clone(), deps.metrics.clone());
        let adaptation = VoiceAdaptationEngine::new(config.agent.voice_adaptation.clone());
        let children = cancel.child_token();

        let session = Self {
            id: session_id,
            job,
            metadata,
            config,
            deps,
            tools: ToolRegistry::new(),
            chat: ChatContext::new(),
            state: SessionState::Idle,
            adaptation,
            metrics,
            cancel,
            children,
            tasks: TaskTracker::new(),
            events_rx,
            events_tx,
            audio_tx,
            agent_speaking,
            hangup,
            started: Instant::now(),
            call_deadline: None,
            generation: 0,
            llm_cancel: CancellationToken::new(),
            speech_seq: 0,
            speech: None,
            turn: None,
            pending_turn: None,
            end_reason: None,
            turn_count: 0,
            current_params: TtsParams::default(),
        };

        (session, handle)
    }

    /// Install the tool registry (built against this session's handle)
    pub fn set_tools(&mut self, tools: ToolRegistry) {
        self.tools = tools;
    }

    /// Session id
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Job driving this session
    pub fn job(&self) -> &Job {
        &self.job
    }

    /// Run the session to completion
    pub async fn run(mut self) -> EndReason {
        self.started = Instant::now();
        self.call_deadline = self
            .config
            .call_time_limit_ms
            .map(|ms| self.started + Duration::from_millis(ms));
        self.metrics.session_started();
        tracing::info!(session_id = %self.id, room = %self.job.room_name, "session started");

        if let Err(message) = self.open_pipeline().await {
            tracing::error!(session_id = %self.id, error = %message, "pipeline startup failed");
            self.end_reason = Some(EndReason::FatalError);
            self.teardown(EndReason::FatalError).await;
            return EndReason::FatalError;
        }

        self.set_state(SessionState::Listening);
        if let Err(err) = self.chat.append(ChatMessage::system(self.config.agent.instructions.clone())) {
            tracing::error!(session_id = %self.id, error = %err, "system prompt rejected");
        }

        if let Some(greeting) = self.config.agent.greeting.clone() {
            self.speak_canned(&greeting, false).await;
        }

        while self.state != SessionState::Ending {
            let deadline = self.next_deadline();
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => {
                    tracing::info!(session_id = %self.id, "session cancelled");
                    self.begin_ending(EndReason::Timeout);
                }
                event = self.events_rx.recv() => match event {
                    Some(event) => self.handle_event(event).await,
                    None => self.begin_ending(EndReason::FatalError),
                },
                _ = async { sleep_until(deadline.unwrap()).await }, if deadline.is_some() => {
                    self.handle_deadline().await;
                }
            }
        }

        let reason = self.end_reason.unwrap_or(EndReason::Normal);
        self.teardown(reason).await;
        reason
    }

    // ------------------------------------------------------------------
    // Startup and teardown
    // ------------------------------------------------------------------

    async fn open_pipeline(&mut self) -> Result<(), String> {
        let stt = self
            .deps
            .stt
            .open(&self.config.agent.stt)
            .await
            .map_err(|e| format!("stt open: {}", e))?;
        let vad = self
            .deps
            .vad
            .open(&self.config.agent.vad)
            .await
            .map_err(|e| format!("vad open: {}", e))?;

        // Inbound audio fans out to STT and VAD. A lagging consumer loses
        // the oldest frames, never the newest.
        let mut stt_audio = self.audio_tx.subscribe();
        let stt_frames = stt.frames.clone();
        let cancel = self.children.clone();
        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = stt_audio.recv() => match frame {
                        Ok(frame) => {
                            if stt_frames.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::trace!(dropped = n, "stt feed lagged, oldest frames dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        let mut vad_audio = self.audio_tx.subscribe();
        let vad_frames = vad.frames.clone();
        let cancel = self.children.clone();
        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    frame = vad_audio.recv() => match frame {
                        Ok(frame) => {
                            if vad_frames.send(frame).await.is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::trace!(dropped = n, "vad feed lagged, oldest frames dropped");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        // Turn detector fuses the two event streams.
        let (turn_tx, mut turn_rx) = mpsc::channel::<TurnEvent>(TURN_EVENT_CAPACITY);
        let detector_config = TurnDetectorConfig {
            endpointing_silence_ms: self.config.timeouts.endpointing_silence_ms,
            final_debounce_ms: self.config.timeouts.final_debounce_ms,
        };
        spawn_turn_detector(
            detector_config,
            vad.events,
            stt.events,
            turn_tx,
            self.agent_speaking.subscribe(),
            self.children.clone(),
            self.started,
        );

        let events_tx = self.events_tx.clone();
        let cancel = self.children.clone();
        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    ev = turn_rx.recv() => match ev {
                        Some(ev) => {
                            if events_tx.send(SessionEvent::Turn(ev)).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(())
    }

    async fn teardown(&mut self, reason: EndReason) {
        self.set_state(SessionState::Ending);

        if let Some(speech) = self.speech.take() {
            speech.cancel.cancel();
        }
        self.llm_cancel.cancel();
        self.children.cancel();

        // An in-flight turn still gets its record out, marked interrupted.
        if let Some(turn) = self.turn.take() {
            let mut record = turn.record;
            record.assistant_text = turn.assistant_text;
            record.interrupted = true;
            self.metrics.turn(record);
            self.turn_count += 1;
        }

        self.tasks.close();
        let grace = Duration::from_millis(self.config.shutdown_grace_ms);
        if timeout(grace, self.tasks.wait()).await.is_err() {
            tracing::warn!(session_id = %self.id, "session tasks did not drain within grace");
        }

        let duration_ms = self.started.elapsed().as_millis() as u64;
        self.metrics.session_ended(reason, duration_ms, self.turn_count);
        self.set_state(SessionState::Terminated);
        tracing::info!(
            session_id = %self.id,
            reason = reason.as_str(),
            duration_ms,
            turns = self.turn_count,
            "session ended"
        );
    }

    // ------------------------------------------------------------------
    // Event handling
    // ------------------------------------------------------------------

    async fn handle_event(&mut self, event: SessionEvent) {
        match event {
            SessionEvent::Turn(turn_event) => self.handle_turn_event(turn_event).await,
            SessionEvent::Llm { generation, event } => {
                if generation == self.generation {
                    self.handle_llm_event(event).await;
                } else {
                    tracing::trace!(generation, current = self.generation, "stale llm event");
                }
            }
            SessionEvent::TtsStarted { speech_id } => {
                if self.speech.as_ref().map(|s| s.id) == Some(speech_id) {
                    let now = self.now_ms();
                    if let Some(speech) = self.speech.as_mut() {
                        speech.first_byte_deadline = None;
                        if speech.tracked {
                            if let Some(turn) = self.turn.as_mut() {
                                turn.record.tts_first_byte_at.get_or_insert(now);
                            }
                        }
                    }
                }
            }
            SessionEvent::TtsProgress { speech_id, text } => {
                if let Some(speech) = self.speech.as_mut() {
                    if speech.id == speech_id {
                        if !speech.spoken.is_empty() {
                            speech.spoken.push(' ');
                        }
                        speech.spoken.push_str(text.trim());
                    }
                }
            }
            SessionEvent::TtsFinished { speech_id, completed } => {
                if self.speech.as_ref().map(|s| s.id) == Some(speech_id) {
                    self.handle_tts_finished(completed).await;
                }
            }
            SessionEvent::ParticipantLeft => {
                tracing::info!(session_id = %self.id, "remote participant left");
                self.begin_ending(EndReason::ParticipantLeft);
            }
            SessionEvent::HangupRequested { after_speech } => {
                if !after_speech {
                    self.begin_ending(EndReason::Normal);
                } else if self.turn.is_none() && self.speech.is_none() {
                    self.begin_ending(EndReason::Normal);
                }
                // Otherwise the pending flag resolves at turn end.
            }
            SessionEvent::FatalError { message } => self.fatal(&message).await,
        }
    }

    async fn handle_turn_event(&mut self, event: TurnEvent) {
        match event {
            TurnEvent::UserTurnStarted { .. } => {
                if self.state == SessionState::Listening {
                    self.set_state(SessionState::UserSpeaking);
                }
            }
            TurnEvent::PartialTranscript { text } => {
                tracing::debug!(session_id = %self.id, partial = %text, "partial transcript");
            }
            TurnEvent::UserTurnEnded { text, ended_at_ms } => {
                if text.trim().is_empty() {
                    return;
                }
                match self.state {
                    SessionState::Listening | SessionState::UserSpeaking => {
                        self.start_turn(text, ended_at_ms).await;
                    }
                    SessionState::Thinking
                    | SessionState::Speaking
                    | SessionState::ToolRunning => {
                        // Serialize: the previous turn finishes first.
                        self.pending_turn = Some((text, ended_at_ms));
                    }
                    _ => {}
                }
            }
            TurnEvent::BargeInRequested { at_ms } => {
                if self.state == SessionState::Speaking {
                    self.handle_barge_in(at_ms).await;
                }
            }
        }
    }

    async fn handle_llm_event(&mut self, event: LlmEvent) {
        match event {
            LlmEvent::Token { text } => {
                let now = self.now_ms();
                let chunks = {
                    let Some(turn) = self.turn.as_mut() else { return };
                    turn.record.llm_first_token_at.get_or_insert(now);
                    turn.assistant_text.push_str(&text);
                    turn.sentence.push(&text)
                };

                if self.speech.is_none() && !text.trim().is_empty() {
                    if !self.open_speech(true, false).await {
                        self.abort_turn_with_error("tts_error", TTS_ERROR_NOTE).await;
                        return;
                    }
                }
                for chunk in chunks {
                    self.feed_speech(chunk);
                }
            }
            LlmEvent::ToolCall(call) => {
                if let Some(turn) = self.turn.as_mut() {
                    tracing::info!(session_id = %self.id, tool = %call.name, "tool call requested");
                    turn.tool_calls.push(call);
                }
            }
            LlmEvent::Done { finish_reason } => self.handle_llm_done(finish_reason).await,
            LlmEvent::Error { message, fatal } => {
                if fatal {
                    self.fatal(&message).await;
                    return;
                }
                let retried = self.turn.as_ref().map(|t| t.retried).unwrap_or(true);
                if retried {
                    tracing::warn!(session_id = %self.id, error = %message, "llm failed twice, giving up on turn");
                    self.abort_turn_with_error("provider_error", TRANSIENT_APOLOGY).await;
                } else {
                    tracing::warn!(session_id = %self.id, error = %message, "llm transient failure, retrying once");
                    if let Some(turn) = self.turn.as_mut() {
                        turn.retried = true;
                    }
                    self.reopen_llm().await;
                }
            }
        }
    }

    async fn handle_llm_done(&mut self, finish_reason: FinishReason) {
        let now = self.now_ms();
        let Some(turn) = self.turn.as_mut() else { return };
        turn.llm_active = false;
        turn.record.llm_done_at = Some(now);
        tracing::debug!(session_id = %self.id, ?finish_reason, "llm stream done");

        if !turn.tool_calls.is_empty() {
            let calls = std::mem::take(&mut turn.tool_calls);
            let content = turn.assistant_text.clone();
            turn.assistant_appended = true;
            if let Err(err) = self
                .chat
                .append(ChatMessage::assistant_with_tool_calls(content, calls.clone()))
            {
                self.invariant_violation(&format!("assistant append failed: {}", err));
                return;
            }

            if self.speech.is_some() {
                // Finish speaking the text segment, then dispatch.
                let rest = match self.turn.as_mut() {
                    Some(turn) => {
                        turn.pending_tools = Some(calls);
                        turn.sentence.flush()
                    }
                    None => None,
                };
                if let Some(rest) = rest {
                    self.feed_speech(rest);
                }
                self.finish_speech_input();
            } else {
                self.run_tools(calls).await;
            }
            return;
        }

        if self.speech.is_some() {
            let (rest, content) = match self.turn.as_mut() {
                Some(turn) => {
                    turn.assistant_appended = true;
                    (turn.sentence.flush(), turn.assistant_text.clone())
                }
                None => (None, String::new()),
            };
            if let Some(rest) = rest {
                self.feed_speech(rest);
            }
            self.finish_speech_input();
            if let Err(err) = self.chat.append(ChatMessage::assistant(content)) {
                self.invariant_violation(&format!("assistant append failed: {}", err));
            }
            return;
        }

        // A hangup is already pending (end_call ran and the follow-up had
        // nothing to add): close the turn out quietly.
        if self.pending_hangup().is_some() {
            self.finish_turn().await;
            return;
        }

        // No tool calls and nothing spoken: canned fallback keeps the
        // conversation alive.
        tracing::warn!(session_id = %self.id, "llm produced no speakable output, using fallback");
        if let Some(turn) = self.turn.as_mut() {
            turn.assistant_text = EMPTY_FALLBACK.to_string();
            turn.assistant_appended = true;
        }
        if let Err(err) = self.chat.append(ChatMessage::assistant(EMPTY_FALLBACK)) {
            self.invariant_violation(&format!("assistant append failed: {}", err));
            return;
        }
        if !self.open_speech(true, false).await {
            self.abort_turn_with_error("tts_error", TTS_ERROR_NOTE).await;
            return;
        }
        self.feed_speech(EMPTY_FALLBACK.to_string());
        self.finish_speech_input();
    }

    async fn handle_tts_finished(&mut self, completed: bool) {
        let Some(speech) = self.speech.take() else { return };
        let _ = self.agent_speaking.send(false);
        let now = self.now_ms();

        if speech.tracked && self.turn.is_some() {
            if completed {
                if let Some(turn) = self.turn.as_mut() {
                    turn.record.tts_done_at = Some(now);
                }
            }
            let pending_tools = self.turn.as_mut().and_then(|t| t.pending_tools.take());
            if let Some(calls) = pending_tools {
                self.run_tools(calls).await;
                return;
            }
            self.finish_turn().await;
        } else {
            // Canned speech finished.
            if self.pending_hangup().is_some() {
                self.begin_ending(EndReason::Normal);
                return;
            }
            self.set_state(SessionState::Listening);
            if let Some((text, at)) = self.pending_turn.take() {
                self.start_turn(text, at).await;
            }
        }
    }

    async fn handle_barge_in(&mut self, at_ms: u64) {
        let Some(speech) = self.speech.take() else { return };
        tracing::info!(session_id = %self.id, at_ms, "barge-in: cancelling agent speech");

        speech.cancel.cancel();
        self.deps.sink.clear().await;
        let _ = self.agent_speaking.send(false);

        // Any in-flight generation is stale now.
        self.llm_cancel.cancel();
        self.generation += 1;

        let spoken = speech.spoken.trim().to_string();

        if speech.tracked {
            if let Some(turn) = self.turn.take() {
                if turn.assistant_appended {
                    self.chat.rewrite_last_assistant(spoken.clone());
                } else if !spoken.is_empty() {
                    if let Err(err) = self.chat.append(ChatMessage::assistant(spoken.clone())) {
                        self.invariant_violation(&format!("assistant append failed: {}", err));
                        return;
                    }
                }
                let mut record = turn.record;
                record.assistant_text = spoken;
                record.interrupted = true;
                self.metrics.turn(record);
                self.turn_count += 1;
            }
        } else {
            // Interrupted canned speech shrinks to what was heard.
            self.chat.rewrite_last_assistant(spoken);
        }

        self.set_state(SessionState::Listening);
    }

    // ------------------------------------------------------------------
    // Turn lifecycle
    // ------------------------------------------------------------------

    async fn start_turn(&mut self, text: String, ended_at_ms: u64) {
        tracing::info!(session_id = %self.id, text = %text, "user turn ended");
        self.set_state(SessionState::Thinking);

        if let Err(err) = self.chat.append(ChatMessage::user(text.clone())) {
            self.invariant_violation(&format!("user append failed: {}", err));
            return;
        }

        let decision = self.adaptation.decide(&text);
        tracing::debug!(
            session_id = %self.id,
            speed = decision.params.speed,
            stage = decision.stage.display_name(),
            "voice adaptation decision"
        );
        self.current_params = decision.params.clone();

        let llm_deadline =
            Instant::now() + Duration::from_millis(self.config.agent.llm.timeout_ms);
        self.turn = Some(ActiveTurn::new(
            uuid::Uuid::new_v4().to_string(),
            text,
            ended_at_ms,
            llm_deadline,
        ));

        self.reopen_llm().await;
    }

    async fn reopen_llm(&mut self) {
        self.generation += 1;
        self.llm_cancel.cancel();
        self.llm_cancel = self.children.child_token();

        let generation = self.generation;
        let messages = self.chat.messages_for_llm();
        let schemas = self.tools.schemas_for(self.adaptation.stage());

        let stream = self
            .deps
            .llm
            .complete(&self.config.agent.llm, &messages, &schemas)
            .await;

        let mut rx = match stream {
            Ok(rx) => rx,
            Err(err) => {
                let retried = self.turn.as_ref().map(|t| t.retried).unwrap_or(true);
                if retried {
                    self.abort_turn_with_error("provider_error", TRANSIENT_APOLOGY).await;
                } else {
                    if let Some(turn) = self.turn.as_mut() {
                        turn.retried = true;
                    }
                    tracing::warn!(session_id = %self.id, error = %err, "llm open failed, retrying once");
                    Box::pin(self.reopen_llm()).await;
                }
                return;
            }
        };

        if let Some(turn) = self.turn.as_mut() {
            turn.llm_active = true;
            turn.llm_deadline =
                Instant::now() + Duration::from_millis(self.config.agent.llm.timeout_ms);
        }

        let events_tx = self.events_tx.clone();
        let cancel = self.llm_cancel.clone();
        self.tasks.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    event = rx.recv() => match event {
                        Some(event) => {
                            let wrapped = SessionEvent::Llm { generation, event };
                            if events_tx.send(wrapped).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
        });
    }

    async fn run_tools(&mut self, calls: Vec<ToolCall>) {
        self.set_state(SessionState::ToolRunning);
        let grace = Duration::from_millis(self.config.timeouts.tool_shutdown_grace_ms);

        for call in calls {
            let ctx = ToolContext::new(self.children.child_token(), Arc::clone(&self.metadata));
            let outcome = self
                .tools
                .dispatch(&call.name, call.arguments.clone(), ctx, grace)
                .await;
            tracing::info!(
                session_id = %self.id,
                tool = %call.name,
                ok = outcome.is_ok(),
                "tool dispatched"
            );

            let result = ChatMessage::tool_result(&call.id, &call.name, &outcome.into_payload());
            if let Err(err) = self.chat.append(result) {
                self.invariant_violation(&format!("tool result append failed: {}", err));
                return;
            }

            // An immediate hangup (answering machine) stops the turn here.
            if self.pending_hangup() == Some(false) {
                self.begin_ending(EndReason::Normal);
                return;
            }
        }

        // Continue the same turn with the tool results in context.
        self.set_state(SessionState::Thinking);
        if let Some(turn) = self.turn.as_mut() {
            turn.assistant_appended = false;
        }
        self.reopen_llm().await;
    }

    async fn finish_turn(&mut self) {
        let Some(turn) = self.turn.take() else {
            self.set_state(SessionState::Listening);
            return;
        };

        let mut record = turn.record;
        record.assistant_text = turn.assistant_text;
        self.metrics.turn(record);
        self.turn_count += 1;

        if self.pending_hangup().is_some() {
            self.begin_ending(EndReason::Normal);
            return;
        }

        self.set_state(SessionState::Listening);
        if let Some((text, at)) = self.pending_turn.take() {
            self.start_turn(text, at).await;
        }
    }

    // ------------------------------------------------------------------
    // Speech plumbing
    // ------------------------------------------------------------------

    /// Open a synthesis stream for a new utterance
    ///
    /// On failure no state changes; the caller decides how to recover.
    async fn open_speech(&mut self, tracked: bool, recovery: bool) -> bool {
        self.speech_seq += 1;
        let speech_id = self.speech_seq;

        let stream = self
            .deps
            .tts
            .synthesize(&self.config.agent.tts, &self.current_params)
            .await;

        let mut stream = match stream {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(session_id = %self.id, error = %err, "tts open failed");
                return false;
            }
        };

        let cancel = self.children.child_token();
        // Bind the provider stream's lifetime to this speech.
        let provider_cancel = stream.cancel.clone();
        let watch_cancel = cancel.clone();
        tokio::spawn(async move {
            watch_cancel.cancelled().await;
            provider_cancel.cancel();
        });

        // Feeder: orchestrator-queued chunks flow into the provider with
        // its own backpressure, off the orchestrator task.
        let (chunk_tx, mut chunk_rx) = mpsc::unbounded_channel::<String>();
        let text_tx = stream.text.take();
        let feeder_cancel = cancel.clone();
        self.tasks.spawn(async move {
            let Some(text_tx) = text_tx else { return };
            loop {
                tokio::select! {
                    _ = feeder_cancel.cancelled() => break,
                    chunk = chunk_rx.recv() => match chunk {
                        Some(chunk) => {
                            if text_tx.send(chunk).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            // Dropping text_tx finalizes the provider's input.
        });

        // Pump: synthesized chunks flow to the sink; progress and
        // completion come back as events.
        let events_tx = self.events_tx.clone();
        let sink = Arc::clone(&self.deps.sink);
        let pump_cancel = cancel.clone();
        self.tasks.spawn(async move {
            let mut started = false;
            let completed = loop {
                tokio::select! {
                    _ = pump_cancel.cancelled() => break false,
                    chunk = stream.audio.recv() => match chunk {
                        Some(chunk) => {
                            if !started {
                                started = true;
                                let _ = events_tx
                                    .send(SessionEvent::TtsStarted { speech_id })
                                    .await;
                            }
                            if sink.send(chunk.frame).await.is_err() {
                                break false;
                            }
                            let _ = events_tx
                                .send(SessionEvent::TtsProgress {
                                    speech_id,
                                    text: chunk.text,
                                })
                                .await;
                        }
                        None => break true,
                    },
                }
            };
            let _ = events_tx
                .send(SessionEvent::TtsFinished { speech_id, completed })
                .await;
        });

        let first_byte_deadline = Instant::now()
            + Duration::from_millis(self.config.agent.tts.first_byte_timeout_ms);

        self.speech = Some(SpeechHandle {
            id: speech_id,
            chunk_tx: Some(chunk_tx),
            cancel,
            tracked,
            recovery,
            spoken: String::new(),
            first_byte_deadline: Some(first_byte_deadline),
        });

        let _ = self.agent_speaking.send(true);
        self.set_state(SessionState::Speaking);
        true
    }

    fn feed_speech(&mut self, chunk: String) {
        if let Some(speech) = self.speech.as_ref() {
            if let Some(tx) = &speech.chunk_tx {
                let _ = tx.send(chunk);
            }
        }
    }

    fn finish_speech_input(&mut self) {
        if let Some(speech) = self.speech.as_mut() {
            speech.chunk_tx = None;
        }
    }

    /// Speak a canned utterance outside any turn
    async fn speak_canned(&mut self, text: &str, recovery: bool) {
        if let Err(err) = self.chat.append(ChatMessage::assistant(text)) {
            self.invariant_violation(&format!("canned append failed: {}", err));
            return;
        }
        if !self.open_speech(false, recovery).await {
            // Nothing to say it with; keep listening.
            if self.state != SessionState::Ending {
                self.set_state(SessionState::Listening);
            }
            return;
        }
        self.feed_speech(text.to_string());
        self.finish_speech_input();
    }

    // ------------------------------------------------------------------
    // Deadlines and failure paths
    // ------------------------------------------------------------------

    fn next_deadline(&self) -> Option<Instant> {
        let mut deadline: Option<Instant> = self.call_deadline;

        if let Some(turn) = &self.turn {
            if turn.llm_active {
                deadline = Some(match deadline {
                    Some(d) => d.min(turn.llm_deadline),
                    None => turn.llm_deadline,
                });
            }
        }
        if let Some(speech) = &self.speech {
            if let Some(fb) = speech.first_byte_deadline {
                deadline = Some(match deadline {
                    Some(d) => d.min(fb),
                    None => fb,
                });
            }
        }
        deadline
    }

    async fn handle_deadline(&mut self) {
        let now = Instant::now();

        if let Some(limit) = self.call_deadline {
            if now >= limit {
                tracing::warn!(session_id = %self.id, "call time limit reached");
                self.begin_ending(EndReason::Timeout);
                return;
            }
        }

        let llm_timed_out = self
            .turn
            .as_ref()
            .map(|t| t.llm_active && now >= t.llm_deadline)
            .unwrap_or(false);
        if llm_timed_out {
            tracing::warn!(session_id = %self.id, "llm call timed out");
            self.abort_turn_with_error("llm_timeout", TIMEOUT_APOLOGY).await;
            return;
        }

        let tts_timed_out = self
            .speech
            .as_ref()
            .and_then(|s| s.first_byte_deadline)
            .map(|d| now >= d)
            .unwrap_or(false);
        if tts_timed_out {
            tracing::warn!(session_id = %self.id, "tts first byte timed out");
            let Some(speech) = self.speech.take() else {
                return;
            };
            speech.cancel.cancel();
            self.deps.sink.clear().await;
            let _ = self.agent_speaking.send(false);

            self.llm_cancel.cancel();
            self.generation += 1;

            if speech.tracked {
                if let Some(turn) = self.turn.take() {
                    let mut record = turn.record;
                    record.assistant_text = String::new();
                    record.error = Some("tts_timeout".to_string());
                    self.metrics.turn(record);
                    self.turn_count += 1;
                }
            }

            if speech.recovery {
                // The recovery utterance itself failed; stop trying.
                self.set_state(SessionState::Listening);
            } else {
                self.speak_canned(TTS_ERROR_NOTE, true).await;
            }
        }
    }

    /// Abandon the active turn, emit its record with an error tag, and
    /// recover with a canned apology.
    async fn abort_turn_with_error(&mut self, tag: &str, apology: &str) {
        self.llm_cancel.cancel();
        self.generation += 1;

        if let Some(speech) = self.speech.take() {
            speech.cancel.cancel();
            self.deps.sink.clear().await;
        }
        let _ = self.agent_speaking.send(false);

        if let Some(turn) = self.turn.take() {
            let mut record = turn.record;
            record.error = Some(tag.to_string());
            self.metrics.turn(record);
            self.turn_count += 1;
        }

        self.speak_canned(apology, true).await;
    }

    async fn fatal(&mut self, message: &str) {
        tracing::error!(session_id = %self.id, error = %message, "fatal session error");

        self.llm_cancel.cancel();
        self.generation += 1;
        if let Some(speech) = self.speech.take() {
            speech.cancel.cancel();
            self.deps.sink.clear().await;
        }
        let _ = self.agent_speaking.send(false);

        if let Some(turn) = self.turn.take() {
            let mut record = turn.record;
            record.assistant_text = turn.assistant_text;
            record.error = Some("fatal".to_string());
            self.metrics.turn(record);
            self.turn_count += 1;
        }

        self.try_farewell().await;
        self.begin_ending(EndReason::FatalError);
    }

    /// One last goodbye on a strict budget before hanging up.
    async fn try_farewell(&mut self) {
        let tts = Arc::clone(&self.deps.tts);
        let sink = Arc::clone(&self.deps.sink);
        let spec = self.config.agent.tts.clone();

        let farewell = async move {
            let Ok(mut stream) = tts.synthesize(&spec, &TtsParams::default()).await else {
                return;
            };
            if let Some(tx) = stream.text.take() {
                let _ = tx.send(FATAL_FAREWELL.to_string()).await;
            }
            while let Some(chunk) = stream.audio.recv().await {
                if sink.send(chunk.frame).await.is_err() {
                    break;
                }
            }
        };

        if timeout(Duration::from_millis(FAREWELL_BUDGET_MS), farewell)
            .await
            .is_err()
        {
            tracing::warn!(session_id = %self.id, "farewell exceeded its budget");
        }
    }

    // ------------------------------------------------------------------
    // Small helpers
    // ------------------------------------------------------------------

    fn pending_hangup(&self) -> Option<bool> {
        *self.hangup.lock()
    }

    fn begin_ending(&mut self, reason: EndReason) {
        if self.end_reason.is_none() {
            self.end_reason = Some(reason);
        }
        if self.state != SessionState::Ending && self.state != SessionState::Terminated {
            self.state = SessionState::Ending;
        }
    }

    fn set_state(&mut self, to: SessionState) {
        if self.state == to {
            return;
        }
        if !self.state.can_transition(to) {
            self.invariant_violation(&format!(
                "illegal transition {:?} -> {:?}",
                self.state, to
            ));
            return;
        }
        tracing::debug!(session_id = %self.id, from = ?self.state, to = ?to, "state transition");
        self.state = to;
    }

    fn invariant_violation(&mut self, message: &str) {
        tracing::error!(session_id = %self.id, error = %message, "invariant violation");
        self.begin_ending(EndReason::FatalError);
    }

    fn now_ms(&self) -> u64 {
        self.started.elapsed().as_millis() as u64
    }
}
