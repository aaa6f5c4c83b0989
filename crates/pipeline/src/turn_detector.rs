//! Turn detection
//!
//! Fuses VAD activity with STT endpointing into turn boundaries. The core
//! is synchronous and clock-agnostic (`on_vad` / `on_stt` / `on_tick`);
//! `spawn_turn_detector` wraps it in a task driven by the session clock.
//!
//! Rules:
//! - After VAD silence, wait `endpointing_silence_ms` before declaring
//!   turn end, unless STT already finalized (the final short-circuits).
//! - A final that arrives while voice is still active is held for
//!   `final_debounce_ms`; a new partial inside the hold means the speaker
//!   continued, and the held text stays part of the ongoing turn. The
//!   turn then ends on the next silence.
//! - Voice during agent speech raises a barge-in request.
//! - A turn whose accumulated transcript is empty emits nothing.

use tokio::sync::{mpsc, watch};
use tokio::time::{sleep_until, Duration, Instant};
use tokio_util::sync::CancellationToken;

use crate::ports::{SttEvent, VadEvent};

/// Turn detector configuration
#[derive(Debug, Clone)]
pub struct TurnDetectorConfig {
    /// Silence hangover before turn end (ms)
    pub endpointing_silence_ms: u64,
    /// Hold window for a final that arrives mid-voice (ms)
    pub final_debounce_ms: u64,
}

impl Default for TurnDetectorConfig {
    fn default() -> Self {
        Self {
            endpointing_silence_ms: 200,
            final_debounce_ms: 200,
        }
    }
}

/// Events produced by the turn detector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    UserTurnStarted { at_ms: u64 },
    PartialTranscript { text: String },
    UserTurnEnded { text: String, ended_at_ms: u64 },
    BargeInRequested { at_ms: u64 },
}

/// Turn boundary detector, clock-agnostic core
pub struct TurnDetector {
    config: TurnDetectorConfig,
    agent_speaking: bool,
    voice_active: bool,
    turn_active: bool,
    finals: Vec<String>,
    last_partial: String,
    silence_deadline_ms: Option<u64>,
    final_held_since_ms: Option<u64>,
}

impl TurnDetector {
    pub fn new(config: TurnDetectorConfig) -> Self {
        Self {
            config,
            agent_speaking: false,
            voice_active: false,
            turn_active: false,
            finals: Vec::new(),
            last_partial: String::new(),
            silence_deadline_ms: None,
            final_held_since_ms: None,
        }
    }

    /// Inform the detector whether the agent is currently speaking
    pub fn set_agent_speaking(&mut self, speaking: bool) {
        self.agent_speaking = speaking;
    }

    /// Process a VAD event
    pub fn on_vad(&mut self, event: VadEvent, now_ms: u64) -> Vec<TurnEvent> {
        let mut out = Vec::new();
        match event {
            VadEvent::VoiceStarted { at_ms } => {
                self.voice_active = true;
                self.silence_deadline_ms = None;

                if self.agent_speaking {
                    out.push(TurnEvent::BargeInRequested { at_ms });
                    self.agent_speaking = false;
                }
                if !self.turn_active {
                    self.turn_active = true;
                    out.push(TurnEvent::UserTurnStarted { at_ms });
                }
                // The speaker resumed; a held final folds into the turn.
                self.final_held_since_ms = None;
            }
            VadEvent::VoiceStopped { at_ms } => {
                self.voice_active = false;
                if self.turn_active {
                    if !self.finals.is_empty() {
                        // STT already finalized, no hangover needed.
                        out.extend(self.end_turn(at_ms.max(now_ms)));
                    } else {
                        self.silence_deadline_ms =
                            Some(now_ms + self.config.endpointing_silence_ms);
                    }
                }
            }
        }
        out
    }

    /// Process an STT event
    pub fn on_stt(&mut self, event: SttEvent, now_ms: u64) -> Vec<TurnEvent> {
        let mut out = Vec::new();
        match event {
            SttEvent::Partial { text } => {
                if text.trim().is_empty() {
                    return out;
                }
                if !self.turn_active {
                    // STT can lead VAD by a frame or two.
                    self.turn_active = true;
                    out.push(TurnEvent::UserTurnStarted { at_ms: now_ms });
                }
                self.final_held_since_ms = None;
                self.last_partial = text.clone();
                out.push(TurnEvent::PartialTranscript { text });
            }
            SttEvent::Final { text } => {
                if !text.trim().is_empty() {
                    if !self.turn_active {
                        self.turn_active = true;
                        out.push(TurnEvent::UserTurnStarted { at_ms: now_ms });
                    }
                    self.finals.push(text);
                    self.last_partial.clear();
                }
                if self.turn_active {
                    if self.voice_active {
                        self.final_held_since_ms = Some(now_ms);
                    } else {
                        out.extend(self.end_turn(now_ms));
                    }
                }
            }
        }
        out
    }

    /// Fire any expired timers
    pub fn on_tick(&mut self, now_ms: u64) -> Vec<TurnEvent> {
        if let Some(deadline) = self.silence_deadline_ms {
            if now_ms >= deadline {
                self.silence_deadline_ms = None;
                return self.end_turn(now_ms);
            }
        }
        if let Some(held) = self.final_held_since_ms {
            if now_ms >= held + self.config.final_debounce_ms {
                // Hold expired without a new partial; the final now ends
                // the turn on the next silence.
                self.final_held_since_ms = None;
            }
        }
        Vec::new()
    }

    /// Next timer deadline, if any
    pub fn next_deadline_ms(&self) -> Option<u64> {
        let debounce = self
            .final_held_since_ms
            .map(|t| t + self.config.final_debounce_ms);
        match (self.silence_deadline_ms, debounce) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Reset all turn state
    pub fn reset(&mut self) {
        self.turn_active = false;
        self.finals.clear();
        self.last_partial.clear();
        self.silence_deadline_ms = None;
        self.final_held_since_ms = None;
    }

    fn end_turn(&mut self, at_ms: u64) -> Vec<TurnEvent> {
        let mut text = self.finals.join(" ");
        if text.is_empty() {
            text = self.last_partial.clone();
        }
        self.reset();

        let trimmed = text.trim();
        if trimmed.is_empty() {
            // Pure silence or noise: no turn happened.
            return Vec::new();
        }
        vec![TurnEvent::UserTurnEnded {
            text: trimmed.to_string(),
            ended_at_ms: at_ms,
        }]
    }
}

/// Run a turn detector over live VAD and STT event streams
///
/// `agent_speaking` mirrors the session's speaking state; `clock_start`
/// anchors all emitted timestamps to the session clock.
pub fn spawn_turn_detector(
    config: TurnDetectorConfig,
    mut vad_events: mpsc::Receiver<VadEvent>,
    mut stt_events: mpsc::Receiver<SttEvent>,
    out: mpsc::Sender<TurnEvent>,
    mut agent_speaking: watch::Receiver<bool>,
    cancel: CancellationToken,
    clock_start: Instant,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut detector = TurnDetector::new(config);
        detector.set_agent_speaking(*agent_speaking.borrow());

        loop {
            let now_ms = clock_start.elapsed().as_millis() as u64;
            let deadline = detector
                .next_deadline_ms()
                .map(|d| clock_start + Duration::from_millis(d));

            let events = tokio::select! {
                _ = cancel.cancelled() => break,
                changed = agent_speaking.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    detector.set_agent_speaking(*agent_speaking.borrow());
                    continue;
                }
                ev = vad_events.recv() => match ev {
                    Some(ev) => detector.on_vad(ev, now_ms),
                    None => break,
                },
                ev = stt_events.recv() => match ev {
                    Some(ev) => detector.on_stt(ev, now_ms),
                    None => break,
                },
                _ = async {
                    match deadline {
                        Some(d) => sleep_until(d).await,
                        None => std::future::pending().await,
                    }
                } => {
                    let now_ms = clock_start.elapsed().as_millis() as u64;
                    detector.on_tick(now_ms)
                }
            };

            for event in events {
                if out.send(event).await.is_err() {
                    return;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> TurnDetector {
        TurnDetector::new(TurnDetectorConfig::default())
    }

    #[test]
    fn test_turn_start_on_voice() {
        let mut d = detector();
        let out = d.on_vad(VadEvent::VoiceStarted { at_ms: 100 }, 100);
        assert_eq!(out, vec![TurnEvent::UserTurnStarted { at_ms: 100 }]);
    }

    #[test]
    fn test_silence_hangover_ends_turn() {
        let mut d = detector();
        d.on_vad(VadEvent::VoiceStarted { at_ms: 0 }, 0);
        d.on_stt(SttEvent::Partial { text: "hello there".into() }, 400);
        d.on_vad(VadEvent::VoiceStopped { at_ms: 900 }, 900);

        // Before the hangover expires, nothing fires.
        assert!(d.on_tick(1_000).is_empty());
        let out = d.on_tick(1_100);
        assert_eq!(
            out,
            vec![TurnEvent::UserTurnEnded {
                text: "hello there".into(),
                ended_at_ms: 1_100,
            }]
        );
    }

    #[test]
    fn test_final_short_circuits_hangover() {
        let mut d = detector();
        d.on_vad(VadEvent::VoiceStarted { at_ms: 0 }, 0);
        d.on_stt(SttEvent::Final { text: "yes".into() }, 500);

        // Final arrived after silence (voice_active false only after stop);
        // here voice is still active, so the final is held.
        let out = d.on_vad(VadEvent::VoiceStopped { at_ms: 600 }, 600);
        assert_eq!(
            out,
            vec![TurnEvent::UserTurnEnded { text: "yes".into(), ended_at_ms: 600 }]
        );
    }

    #[test]
    fn test_final_after_silence_ends_immediately() {
        let mut d = detector();
        d.on_vad(VadEvent::VoiceStarted { at_ms: 0 }, 0);
        d.on_vad(VadEvent::VoiceStopped { at_ms: 500 }, 500);
        let out = d.on_stt(SttEvent::Final { text: "done now".into() }, 550);
        assert_eq!(
            out,
            vec![TurnEvent::UserTurnEnded { text: "done now".into(), ended_at_ms: 550 }]
        );
    }

    #[test]
    fn test_held_final_folds_into_continuing_turn() {
        let mut d = detector();
        d.on_vad(VadEvent::VoiceStarted { at_ms: 0 }, 0);
        d.on_stt(SttEvent::Final { text: "I think".into() }, 300);
        // New partial within the hold: the speaker continued.
        d.on_stt(SttEvent::Partial { text: "I think we should".into() }, 400);
        d.on_stt(SttEvent::Final { text: "we should go".into() }, 900);
        let out = d.on_vad(VadEvent::VoiceStopped { at_ms: 1_000 }, 1_000);

        assert_eq!(
            out,
            vec![TurnEvent::UserTurnEnded {
                text: "I think we should go".into(),
                ended_at_ms: 1_000,
            }]
        );
    }

    #[test]
    fn test_barge_in_while_agent_speaking() {
        let mut d = detector();
        d.set_agent_speaking(true);
        let out = d.on_vad(VadEvent::VoiceStarted { at_ms: 2_000 }, 2_000);
        assert_eq!(
            out,
            vec![
                TurnEvent::BargeInRequested { at_ms: 2_000 },
                TurnEvent::UserTurnStarted { at_ms: 2_000 },
            ]
        );
    }

    #[test]
    fn test_empty_turn_emits_nothing() {
        let mut d = detector();
        d.on_vad(VadEvent::VoiceStarted { at_ms: 0 }, 0);
        d.on_vad(VadEvent::VoiceStopped { at_ms: 300 }, 300);
        let out = d.on_tick(600);
        assert!(out.is_empty());

        // Detector is reusable after the empty turn.
        let out = d.on_vad(VadEvent::VoiceStarted { at_ms: 700 }, 700);
        assert_eq!(out, vec![TurnEvent::UserTurnStarted { at_ms: 700 }]);
    }

    #[test]
    fn test_new_voice_cancels_pending_silence() {
        let mut d = detector();
        d.on_vad(VadEvent::VoiceStarted { at_ms: 0 }, 0);
        d.on_stt(SttEvent::Partial { text: "wait".into() }, 100);
        d.on_vad(VadEvent::VoiceStopped { at_ms: 200 }, 200);
        assert!(d.next_deadline_ms().is_some());

        let out = d.on_vad(VadEvent::VoiceStarted { at_ms: 250 }, 250);
        // Turn already active: no duplicate start event.
        assert!(out.is_empty());
        assert!(d.next_deadline_ms().is_none());
        assert!(d.on_tick(1_000).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_spawned_detector_end_to_end() {
        let (vad_tx, vad_rx) = mpsc::channel(8);
        let (stt_tx, stt_rx) = mpsc::channel(8);
        let (out_tx, mut out_rx) = mpsc::channel(8);
        let (_speak_tx, speak_rx) = watch::channel(false);
        let cancel = CancellationToken::new();

        let handle = spawn_turn_detector(
            TurnDetectorConfig::default(),
            vad_rx,
            stt_rx,
            out_tx,
            speak_rx,
            cancel.clone(),
            Instant::now(),
        );

        vad_tx.send(VadEvent::VoiceStarted { at_ms: 0 }).await.unwrap();
        assert!(matches!(
            out_rx.recv().await,
            Some(TurnEvent::UserTurnStarted { .. })
        ));

        stt_tx
            .send(SttEvent::Partial { text: "yes I'll be there".into() })
            .await
            .unwrap();
        assert!(matches!(
            out_rx.recv().await,
            Some(TurnEvent::PartialTranscript { .. })
        ));

        vad_tx.send(VadEvent::VoiceStopped { at_ms: 800 }).await.unwrap();
        // The hangover timer runs on virtual time.
        let ended = out_rx.recv().await;
        assert!(matches!(
            ended,
            Some(TurnEvent::UserTurnEnded { ref text, .. }) if text == "yes I'll be there"
        ));

        cancel.cancel();
        handle.await.unwrap();
    }
}
