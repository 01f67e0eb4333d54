//! Normalizes raw adapter deltas into the wire event schema.
//!
//! Guarantees, per request: strictly increasing sequence numbers starting
//! at 1, exactly one terminal event, stop-string enforcement across chunk
//! boundaries, and cancellation surfaced as `finish(cancel)`.

use std::time::Instant;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::adapter::{RawDelta, RawFinish};
use crate::stream::event::{
    EventPayload, FinishReason, GenerationStats, RequestId, StreamEvent,
};
use crate::stream::stop::{StopMatcher, StopScan};

/// Configuration for one normalized stream.
#[derive(Debug, Clone, Default)]
pub struct NormalizerConfig {
    pub stop_strings: Vec<String>,
    pub emit_stop_fragment: bool,
    /// Emit an interim `metrics` event every N completion tokens.
    pub metrics_every_n_tokens: Option<u32>,
}

struct Emitter {
    request_id: RequestId,
    tx: mpsc::Sender<StreamEvent>,
    sequence: u64,
}

impl Emitter {
    async fn send(&mut self, payload: EventPayload) -> bool {
        self.sequence += 1;
        let event = StreamEvent {
            request_id: self.request_id.clone(),
            sequence: self.sequence,
            payload,
        };
        self.tx.send(event).await.is_ok()
    }
}

/// Drive a raw delta stream to completion, forwarding normalized events
/// into `tx`. Returns the terminal reason that was emitted.
pub async fn normalize_into(
    request_id: RequestId,
    config: NormalizerConfig,
    mut raw: mpsc::Receiver<RawDelta>,
    tx: mpsc::Sender<StreamEvent>,
    cancel: CancellationToken,
) -> FinishReason {
    let mut emitter = Emitter {
        request_id: request_id.clone(),
        tx,
        sequence: 0,
    };
    let mut matcher = StopMatcher::new(config.stop_strings, config.emit_stop_fragment);
    let started = Instant::now();
    let mut first_token_at: Option<Instant> = None;
    let mut completion_tokens: u64 = 0;
    let mut prompt_tokens: u64 = 0;

    let stats = |completion_tokens: u64,
                 prompt_tokens: u64,
                 first_token_at: Option<Instant>| {
        let time_to_first_token_ms =
            first_token_at.map(|t| (t - started).as_secs_f64() * 1000.0);
        let ms_per_token = first_token_at.filter(|_| completion_tokens > 0).map(|t| {
            t.elapsed().as_secs_f64() * 1000.0 / completion_tokens as f64
        });
        GenerationStats {
            prompt_tokens,
            completion_tokens,
            time_to_first_token_ms,
            ms_per_token,
        }
    };

    loop {
        let delta = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(request_id = %request_id, "generation cancelled");
                let payload = EventPayload::Finish {
                    finish_reason: FinishReason::Cancel,
                    stats: stats(completion_tokens, prompt_tokens, first_token_at),
                };
                let _ = emitter.send(payload).await;
                return FinishReason::Cancel;
            }
            delta = raw.recv() => delta,
        };

        let Some(delta) = delta else {
            // Adapter dropped its stream without a terminal marker.
            let error = crate::Error::RuntimeNotAvailable {
                message: "backend stream ended without a terminal".into(),
                details: Box::default(),
            }
            .to_wire();
            let _ = emitter
                .send(EventPayload::Error {
                    error,
                    finish_reason: FinishReason::Error,
                })
                .await;
            return FinishReason::Error;
        };

        if let Some(terminal) = delta.terminal {
            let remainder = matcher.flush();
            if !remainder.is_empty() {
                let _ = emitter
                    .send(EventPayload::Delta {
                        delta_text: remainder,
                        token_ids: None,
                    })
                    .await;
            }
            if terminal.stats.prompt_tokens > 0 {
                prompt_tokens = terminal.stats.prompt_tokens;
            }
            let final_stats = stats(completion_tokens, prompt_tokens, first_token_at);
            let reason = match terminal.reason {
                RawFinish::Eos => FinishReason::Eos,
                RawFinish::Length => FinishReason::Length,
                RawFinish::Cancelled => FinishReason::Cancel,
                RawFinish::Failed(error) => {
                    let _ = emitter
                        .send(EventPayload::Error {
                            error,
                            finish_reason: FinishReason::Error,
                        })
                        .await;
                    return FinishReason::Error;
                }
            };
            let _ = emitter
                .send(EventPayload::Finish {
                    finish_reason: reason,
                    stats: final_stats,
                })
                .await;
            return reason;
        }

        if first_token_at.is_none() {
            first_token_at = Some(Instant::now());
        }
        let before = completion_tokens;
        completion_tokens += delta.token_ids.len().max(1) as u64;
        let token_ids = if delta.token_ids.is_empty() {
            None
        } else {
            Some(delta.token_ids)
        };

        let metrics_due = config
            .metrics_every_n_tokens
            .map(|n| {
                let n = n.max(1) as u64;
                completion_tokens / n > before / n
            })
            .unwrap_or(false);

        match matcher.push(&delta.text) {
            StopScan::Continue { emit } => {
                if !emit.is_empty() {
                    if !emitter
                        .send(EventPayload::Delta {
                            delta_text: emit,
                            token_ids,
                        })
                        .await
                    {
                        // Consumer went away; stop the backend too.
                        cancel.cancel();
                        return FinishReason::Cancel;
                    }
                }
                if metrics_due {
                    let _ = emitter
                        .send(EventPayload::Metrics {
                            stats: stats(completion_tokens, prompt_tokens, first_token_at),
                        })
                        .await;
                }
            }
            StopScan::Stopped { emit } => {
                if !emit.is_empty() {
                    let _ = emitter
                        .send(EventPayload::Delta {
                            delta_text: emit,
                            token_ids,
                        })
                        .await;
                }
                // Anything the backend produces past the stop is discarded.
                cancel.cancel();
                let _ = emitter
                    .send(EventPayload::Finish {
                        finish_reason: FinishReason::Stop,
                        stats: stats(completion_tokens, prompt_tokens, first_token_at),
                    })
                    .await;
                return FinishReason::Stop;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::RawTerminal;

    async fn run_normalizer(
        config: NormalizerConfig,
        deltas: Vec<RawDelta>,
    ) -> Vec<StreamEvent> {
        let (raw_tx, raw_rx) = mpsc::channel(16);
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        tokio::spawn(async move {
            for d in deltas {
                if raw_tx.send(d).await.is_err() {
                    break;
                }
            }
        });
        normalize_into("req-1".into(), config, raw_rx, tx, cancel).await;
        let mut events = Vec::new();
        while let Ok(e) = rx.try_recv() {
            events.push(e);
        }
        events
    }

    #[tokio::test]
    async fn test_sequences_start_at_one_and_increase() {
        let events = run_normalizer(
            NormalizerConfig::default(),
            vec![
                RawDelta::text("a"),
                RawDelta::text("b"),
                RawDelta::terminal(RawFinish::Eos, GenerationStats::default()),
            ],
        )
        .await;
        assert_eq!(events.len(), 3);
        for (i, event) in events.iter().enumerate() {
            assert_eq!(event.sequence, i as u64 + 1);
        }
        assert!(events.last().unwrap().is_terminal());
        assert_eq!(
            events.iter().filter(|e| e.is_terminal()).count(),
            1,
            "exactly one terminal event"
        );
    }

    #[tokio::test]
    async fn test_cross_chunk_stop_emits_clean_prefix() {
        let config = NormalizerConfig {
            stop_strings: vec!["\n\nUser:".into()],
            ..Default::default()
        };
        let events = run_normalizer(
            config,
            vec![RawDelta::text("Hi there.\n"), RawDelta::text("\nUser:")],
        )
        .await;
        // One delta with the clean prefix, one finish(stop).
        assert_eq!(events.len(), 2);
        assert_eq!(
            events[0].payload,
            EventPayload::Delta {
                delta_text: "Hi there.".into(),
                token_ids: None,
            }
        );
        match &events[1].payload {
            EventPayload::Finish { finish_reason, .. } => {
                assert_eq!(*finish_reason, FinishReason::Stop)
            }
            other => panic!("expected finish, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cancellation_finishes_with_cancel() {
        let (raw_tx, raw_rx) = mpsc::channel::<RawDelta>(16);
        let (tx, mut rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(normalize_into(
            "req-2".into(),
            NormalizerConfig::default(),
            raw_rx,
            tx,
            cancel.clone(),
        ));

        raw_tx.send(RawDelta::text("partial")).await.unwrap();
        let first = rx.recv().await.unwrap();
        assert!(matches!(first.payload, EventPayload::Delta { .. }));

        cancel.cancel();
        let reason = handle.await.unwrap();
        assert_eq!(reason, FinishReason::Cancel);
        let last = rx.recv().await.unwrap();
        match last.payload {
            EventPayload::Finish { finish_reason, .. } => {
                assert_eq!(finish_reason, FinishReason::Cancel)
            }
            other => panic!("expected finish(cancel), got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_adapter_error_becomes_error_event() {
        let wire = crate::Error::download("connection reset").to_wire();
        let events = run_normalizer(
            NormalizerConfig::default(),
            vec![
                RawDelta::text("x"),
                RawDelta {
                    text: String::new(),
                    token_ids: Vec::new(),
                    terminal: Some(RawTerminal {
                        reason: RawFinish::Failed(wire.clone()),
                        stats: GenerationStats::default(),
                    }),
                },
            ],
        )
        .await;
        match &events.last().unwrap().payload {
            EventPayload::Error {
                error,
                finish_reason,
            } => {
                assert_eq!(*finish_reason, FinishReason::Error);
                assert_eq!(error.code, wire.code);
            }
            other => panic!("expected error event, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_interim_metrics_events() {
        let config = NormalizerConfig {
            metrics_every_n_tokens: Some(2),
            ..Default::default()
        };
        let mut deltas: Vec<RawDelta> = (0..6).map(|i| RawDelta::text(format!("t{i}"))).collect();
        deltas.push(RawDelta::terminal(RawFinish::Eos, GenerationStats::default()));
        let events = run_normalizer(config, deltas).await;

        let metrics: Vec<&StreamEvent> = events
            .iter()
            .filter(|e| matches!(e.payload, EventPayload::Metrics { .. }))
            .collect();
        assert_eq!(metrics.len(), 3, "one metrics event per two tokens");
        match &metrics[0].payload {
            EventPayload::Metrics { stats } => assert_eq!(stats.completion_tokens, 2),
            _ => unreachable!(),
        }
        // Metrics never terminate a stream.
        assert!(events.last().unwrap().is_terminal());
    }

    #[tokio::test]
    async fn test_held_back_tail_flushed_at_eos() {
        let config = NormalizerConfig {
            stop_strings: vec!["<|end|>".into()],
            ..Default::default()
        };
        let events = run_normalizer(
            config,
            vec![
                RawDelta::text("answer<"),
                RawDelta::terminal(RawFinish::Eos, GenerationStats::default()),
            ],
        )
        .await;
        let text: String = events
            .iter()
            .filter_map(|e| match &e.payload {
                EventPayload::Delta { delta_text, .. } => Some(delta_text.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(text, "answer<");
    }
}
