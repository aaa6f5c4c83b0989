//! Metrics emission
//!
//! Wraps the process-wide metrics channel. Emission never blocks the
//! orchestrator: a full channel drops the event with a warning.

use tokio::sync::mpsc;

use callagent_core::{EndReason, MetricsEvent, TurnRecord};

/// Session-scoped metrics sink
#[derive(Clone)]
pub struct MetricsSink {
    session_id: String,
    tx: mpsc::Sender<MetricsEvent>,
}

impl MetricsSink {
    pub fn new(session_id: impl Into<String>, tx: mpsc::Sender<MetricsEvent>) -> Self {
        Self {
            session_id: session_id.into(),
            tx,
        }
    }

    /// Session started handling a call
    pub fn session_started(&self) {
        self.emit(MetricsEvent::SessionStarted {
            session_id: self.session_id.clone(),
        });
    }

    /// A turn completed
    pub fn turn(&self, mut record: TurnRecord) {
        record.finalize();
        self.emit(MetricsEvent::Turn {
            session_id: self.session_id.clone(),
            record,
        });
    }

    /// Session ended
    pub fn session_ended(&self, reason: EndReason, duration_ms: u64, turn_count: usize) {
        self.emit(MetricsEvent::SessionEnded {
            session_id: self.session_id.clone(),
            reason,
            duration_ms,
            turn_count,
        });
    }

    fn emit(&self, event: MetricsEvent) {
        if let Err(err) = self.tx.try_send(event) {
            tracing::warn!(session_id = %self.session_id, error = %err, "metrics event dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_turn_emission_finalizes_latency() {
        let (tx, mut rx) = mpsc::channel(4);
        let sink = MetricsSink::new("s1", tx);

        let mut record = TurnRecord::new("speech", "hello");
        record.stt_final_at = Some(100);
        record.tts_first_byte_at = Some(400);
        sink.turn(record);

        match rx.recv().await.unwrap() {
            MetricsEvent::Turn { record, .. } => {
                assert_eq!(record.total_latency_ms, Some(300));
            }
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_full_channel_drops_without_blocking() {
        let (tx, _rx) = mpsc::channel(1);
        let sink = MetricsSink::new("s1", tx);

        sink.session_started();
        // Channel is now full; the next emission must not block.
        sink.session_ended(EndReason::Normal, 1_000, 0);
    }
}
