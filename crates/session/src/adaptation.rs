//! Voice adaptation engine
//!
//! Derives TTS delivery parameters from lightweight lexicon analysis of
//! the user's latest utterance: faster for urgency and energy, slower for
//! complexity and negative sentiment. Decisions are rate limited and
//! blended against a bounded history so delivery shifts stay gradual.
//! The engine is advisory: it cannot fail, it only clamps.

use tokio::time::Instant;

use callagent_core::ConversationStage;
use callagent_pipeline::{Emotion, TtsParams};
use callagent_config::VoiceAdaptationSpec;

/// Weight of the history average when blending a new decision
const HISTORY_INFLUENCE: f32 = 0.3;
/// Smoothing window over the recorded history
const SMOOTHING_WINDOW: usize = 5;
/// Speed bounds
const MIN_SPEED: f32 = 0.7;
const MAX_SPEED: f32 = 1.4;
/// Pre-speech delay bounds in milliseconds
const MIN_DELAY_MS: u64 = 10;
const MAX_DELAY_MS: u64 = 100;

const POSITIVE_WORDS: &[&str] = &[
    "great", "good", "awesome", "perfect", "thanks", "thank you", "love", "excellent", "amazing",
];
const NEGATIVE_WORDS: &[&str] = &[
    "bad", "terrible", "awful", "hate", "angry", "upset", "frustrated", "annoyed", "sad",
];
const URGENCY_WORDS: &[&str] = &["urgent", "asap", "now", "immediately", "right away", "soon"];
const FAREWELL_WORDS: &[&str] = &["goodbye", "bye", "that's all", "hang up", "talk later"];
const APP_ACTION_WORDS: &[&str] = &[
    "appointment", "schedule", "book", "reschedule", "availability", "calendar", "transfer",
];

/// Lightweight analysis of one utterance
#[derive(Debug, Clone, PartialEq)]
pub struct MessageAnalysis {
    /// [-1.0, 1.0] negative to positive
    pub sentiment: f32,
    /// [0.0, 1.0]
    pub urgency: f32,
    /// [0.0, 1.0]
    pub complexity: f32,
    /// [0.0, 1.0]
    pub energy: f32,
    pub contains_question: bool,
    pub token_count: usize,
}

/// One adaptation decision
#[derive(Debug, Clone)]
pub struct AdaptationDecision {
    pub analysis: MessageAnalysis,
    pub params: TtsParams,
    pub stage: ConversationStage,
}

/// Derives delivery parameters per user turn
pub struct VoiceAdaptationEngine {
    spec: VoiceAdaptationSpec,
    stage: ConversationStage,
    sentiment_history: Vec<f32>,
    energy_history: Vec<f32>,
    last_update: Option<Instant>,
    last_params: TtsParams,
    user_turns_seen: usize,
}

impl VoiceAdaptationEngine {
    pub fn new(spec: VoiceAdaptationSpec) -> Self {
        Self {
            spec,
            stage: ConversationStage::Greeting,
            sentiment_history: Vec::new(),
            energy_history: Vec::new(),
            last_update: None,
            last_params: TtsParams::default(),
            user_turns_seen: 0,
        }
    }

    /// Current conversation stage
    pub fn stage(&self) -> ConversationStage {
        self.stage
    }

    /// Decide delivery parameters for the response to `text`
    pub fn decide(&mut self, text: &str) -> AdaptationDecision {
        self.user_turns_seen += 1;
        let stage = self.advance_stage(text);

        if !self.spec.enabled {
            return AdaptationDecision {
                analysis: Self::analyze(text),
                params: TtsParams::default(),
                stage,
            };
        }

        let mut analysis = Self::analyze(text);

        // Inside the rate limit window, coalesce: keep the last parameters
        // but still record the interaction for mirroring.
        let rate_limited = self
            .last_update
            .map(|at| at.elapsed().as_secs_f64() < self.spec.rate_limit_seconds)
            .unwrap_or(false);

        self.record(&analysis);

        if rate_limited {
            return AdaptationDecision {
                analysis,
                params: self.last_params.clone(),
                stage,
            };
        }
        self.last_update = Some(Instant::now());

        // Mirror against the recent history so delivery shifts stay gradual.
        analysis.sentiment = blend(analysis.sentiment, smoothed(&self.sentiment_history));
        analysis.energy = blend(analysis.energy, smoothed(&self.energy_history));

        let params = self.map_params(&analysis, stage);
        self.last_params = params.clone();

        AdaptationDecision {
            analysis,
            params,
            stage,
        }
    }

    fn analyze(text: &str) -> MessageAnalysis {
        let trimmed = text.trim();
        let lower = trimmed.to_lowercase();
        let token_count = trimmed.split_whitespace().count().max(1);

        let contains_question = trimmed.contains('?')
            || ["who", "what", "when", "where", "why", "how"]
                .iter()
                .any(|q| lower.starts_with(q));

        let pos_hits = POSITIVE_WORDS.iter().filter(|w| lower.contains(**w)).count() as f32;
        let neg_hits = NEGATIVE_WORDS.iter().filter(|w| lower.contains(**w)).count() as f32;
        let urg_hits = URGENCY_WORDS.iter().filter(|w| lower.contains(**w)).count() as f32;

        let sentiment = if pos_hits + neg_hits > 0.0 {
            ((pos_hits - neg_hits) / (pos_hits + neg_hits)).clamp(-1.0, 1.0)
        } else {
            0.0
        };

        let urgency = (0.2 * urg_hits).clamp(0.0, 1.0);

        let punctuation = trimmed.chars().filter(|c| matches!(c, ',' | ';' | ':' | '.')).count();
        let length_score = (token_count as f32 / 40.0).clamp(0.0, 1.0);
        let punctuation_score = (punctuation as f32 / 10.0).clamp(0.0, 1.0);
        let complexity = (0.6 * length_score + 0.4 * punctuation_score).clamp(0.0, 1.0);

        let exclamations = trimmed.chars().filter(|c| *c == '!').count() as f32;
        let letters = trimmed.chars().filter(|c| c.is_alphabetic()).count().max(1);
        let caps = trimmed.chars().filter(|c| c.is_uppercase()).count();
        let caps_ratio = caps as f32 / letters as f32;
        let energy = (0.15 * exclamations + 0.8 * caps_ratio + 0.2 * urgency).clamp(0.0, 1.0);

        MessageAnalysis {
            sentiment,
            urgency,
            complexity,
            energy,
            contains_question,
            token_count,
        }
    }

    fn advance_stage(&mut self, text: &str) -> ConversationStage {
        let lower = text.to_lowercase();

        if FAREWELL_WORDS.iter().any(|w| lower.contains(w)) {
            self.stage = ConversationStage::EndCall;
        } else if APP_ACTION_WORDS.iter().any(|w| lower.contains(w)) {
            self.stage = ConversationStage::AppAction;
        } else if self.stage == ConversationStage::Greeting && self.user_turns_seen > 1 {
            self.stage = ConversationStage::Conversation;
        } else if self.stage == ConversationStage::AppAction {
            self.stage = ConversationStage::Conversation;
        }

        self.stage
    }

    fn map_params(&self, analysis: &MessageAnalysis, stage: ConversationStage) -> TtsParams {
        let mut speed = 1.0
            + 0.15 * (analysis.energy - 0.5)
            + 0.10 * (analysis.urgency - 0.3)
            - 0.20 * analysis.complexity
            - 0.10 * (-analysis.sentiment).max(0.0);

        speed += match stage {
            ConversationStage::Greeting => 0.05,
            ConversationStage::AppAction => -0.05,
            _ => 0.0,
        };
        let speed = speed.clamp(MIN_SPEED, MAX_SPEED);

        let emotions = vec![
            Emotion::new("positivity", (analysis.sentiment + 1.0) / 2.0),
            Emotion::new("empathy", (-analysis.sentiment).max(0.0)),
            Emotion::new(
                "curiosity",
                if analysis.contains_question { 0.55 } else { 0.35 },
            ),
            Emotion::new("calmness", (1.0 - analysis.energy * 0.7).clamp(0.2, 0.95)),
        ];

        let mut delay = 20.0 + 100.0 * analysis.complexity + 50.0 * (-analysis.sentiment).max(0.0)
            - 100.0 * analysis.urgency;
        if stage == ConversationStage::Greeting {
            delay -= 10.0;
        }
        let pre_speech_delay_ms =
            (delay as i64).clamp(MIN_DELAY_MS as i64, MAX_DELAY_MS as i64) as u64;

        TtsParams {
            speed,
            emotions,
            pre_speech_delay_ms,
        }
    }

    fn record(&mut self, analysis: &MessageAnalysis) {
        self.sentiment_history.push(analysis.sentiment);
        self.energy_history.push(analysis.energy);
        let limit = self.spec.memory_limit.max(1);
        if self.sentiment_history.len() > limit {
            self.sentiment_history.remove(0);
        }
        if self.energy_history.len() > limit {
            self.energy_history.remove(0);
        }
    }
}

fn smoothed(history: &[f32]) -> Option<f32> {
    if history.is_empty() {
        return None;
    }
    let window = &history[history.len().saturating_sub(SMOOTHING_WINDOW)..];
    Some(window.iter().sum::<f32>() / window.len() as f32)
}

fn blend(new_value: f32, history: Option<f32>) -> f32 {
    match history {
        Some(h) => (1.0 - HISTORY_INFLUENCE) * new_value + HISTORY_INFLUENCE * h,
        None => new_value,
    }
}
