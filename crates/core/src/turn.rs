//! Turn records and metrics events
//!
//! A turn record is built incrementally while a turn is in flight and
//! emitted exactly once on turn completion. All timing fields are
//! millisecond offsets from session start on the session's monotonic clock.

use serde::{Deserialize, Serialize};

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndReason {
    /// Conversation completed and the agent hung up
    Normal,
    /// The remote participant left (hangup or transfer)
    ParticipantLeft,
    /// Call duration or shutdown grace exceeded
    Timeout,
    /// Unrecoverable provider or invariant failure
    FatalError,
}

impl EndReason {
    pub fn as_str(self) -> &'static str {
        match self {
            EndReason::Normal => "normal",
            EndReason::ParticipantLeft => "participant_left",
            EndReason::Timeout => "timeout",
            EndReason::FatalError => "fatal_error",
        }
    }
}

/// Per-turn latency record
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnRecord {
    /// Unique id for this turn's speech
    pub speech_id: String,
    /// Final user transcript for the turn
    pub user_text: String,
    /// Assistant response text (possibly truncated on barge-in)
    pub assistant_text: String,
    /// When STT finalized the user utterance
    pub stt_final_at: Option<u64>,
    /// First LLM token
    pub llm_first_token_at: Option<u64>,
    /// LLM stream done
    pub llm_done_at: Option<u64>,
    /// First synthesized audio byte
    pub tts_first_byte_at: Option<u64>,
    /// TTS stream done
    pub tts_done_at: Option<u64>,
    /// End-to-end latency: tts_first_byte_at - stt_final_at
    pub total_latency_ms: Option<u64>,
    /// Whether the user barged in on the response
    pub interrupted: bool,
    /// Error tag for failed turns (e.g. "llm_timeout")
    pub error: Option<String>,
}

impl TurnRecord {
    /// Create a new record for a turn
    pub fn new(speech_id: impl Into<String>, user_text: impl Into<String>) -> Self {
        Self {
            speech_id: speech_id.into(),
            user_text: user_text.into(),
            ..Default::default()
        }
    }

    /// Recompute total latency from the recorded milestones
    pub fn finalize(&mut self) {
        if let (Some(first_byte), Some(stt_final)) = (self.tts_first_byte_at, self.stt_final_at) {
            self.total_latency_ms = Some(first_byte.saturating_sub(stt_final));
        }
    }

    /// Whether the recorded milestones are monotonically ordered
    pub fn is_ordered(&self) -> bool {
        let stamps = [
            self.stt_final_at,
            self.llm_first_token_at,
            self.tts_first_byte_at,
            self.tts_done_at,
        ];
        stamps
            .iter()
            .flatten()
            .zip(stamps.iter().flatten().skip(1))
            .all(|(a, b)| a <= b)
    }
}

/// Events emitted on the metrics channel
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum MetricsEvent {
    /// Session started handling a call
    SessionStarted { session_id: String },
    /// A turn completed (normally, interrupted, or with error)
    Turn {
        session_id: String,
        #[serde(flatten)]
        record: TurnRecord,
    },
    /// Session ended
    SessionEnded {
        session_id: String,
        reason: EndReason,
        duration_ms: u64,
        turn_count: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finalize_latency() {
        let mut record = TurnRecord::new("s1", "hello");
        record.stt_final_at = Some(1_000);
        record.llm_first_token_at = Some(1_200);
        record.tts_first_byte_at = Some(1_450);
        record.tts_done_at = Some(2_900);
        record.finalize();

        assert_eq!(record.total_latency_ms, Some(450));
        assert!(record.is_ordered());
    }

    #[test]
    fn test_ordering_with_gaps() {
        let mut record = TurnRecord::new("s2", "hi");
        record.stt_final_at = Some(100);
        record.tts_first_byte_at = Some(90);
        assert!(!record.is_ordered());

        record.tts_first_byte_at = None;
        assert!(record.is_ordered());
    }

    #[test]
    fn test_metrics_event_serializes_tagged() {
        let ev = MetricsEvent::SessionEnded {
            session_id: "s".into(),
            reason: EndReason::ParticipantLeft,
            duration_ms: 42_000,
            turn_count: 7,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "session_ended");
        assert_eq!(json["reason"], "participant_left");
    }
}
