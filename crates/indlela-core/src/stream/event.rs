//! Wire event schema for LLM generation streams.
//!
//! Every stream carries a stable `requestId` and a strictly increasing
//! `sequence` starting at 1, and ends with exactly one terminal event.

use serde::{Deserialize, Serialize};

use crate::error::WireError;

/// Unique identifier for a request.
pub type RequestId = String;

/// Reason a generation stream terminated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FinishReason {
    /// Model emitted its end-of-sequence token.
    Eos,
    /// Token limit reached.
    Length,
    /// A configured stop string matched.
    Stop,
    /// Caller cancelled the request.
    Cancel,
    /// Generation failed.
    Error,
}

/// Token accounting for a request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationStats {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_to_first_token_ms: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ms_per_token: Option<f64>,
}

/// Event payload, discriminated by `eventType` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType", rename_all = "lowercase")]
pub enum EventPayload {
    #[serde(rename_all = "camelCase")]
    Delta {
        /// Always present, possibly empty.
        delta_text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        token_ids: Option<Vec<u32>>,
    },
    Metrics { stats: GenerationStats },
    #[serde(rename_all = "camelCase")]
    Finish {
        finish_reason: FinishReason,
        stats: GenerationStats,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error: WireError,
        /// Always [`FinishReason::Error`] on the wire.
        finish_reason: FinishReason,
    },
}

impl EventPayload {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finish { .. } | Self::Error { .. })
    }
}

/// One event on a generation stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamEvent {
    pub request_id: RequestId,
    /// Strictly increasing per request, starting at 1.
    pub sequence: u64,
    #[serde(flatten)]
    pub payload: EventPayload,
}

impl StreamEvent {
    pub fn is_terminal(&self) -> bool {
        self.payload.is_terminal()
    }
}

/// Non-streaming result, losslessly derivable from the event stream by
/// concatenating delta text and carrying the terminal reason and stats.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletedGeneration {
    pub text: String,
    pub finish_reason: FinishReason,
    pub stats: GenerationStats,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

/// Drain a stream into its non-streaming form.
pub async fn collect_stream(
    mut events: tokio::sync::mpsc::Receiver<StreamEvent>,
) -> crate::Result<CompletedGeneration> {
    let mut text = String::new();
    while let Some(event) = events.recv().await {
        match event.payload {
            EventPayload::Delta { delta_text, .. } => text.push_str(&delta_text),
            EventPayload::Metrics { .. } => {}
            EventPayload::Finish {
                finish_reason,
                stats,
            } => {
                return Ok(CompletedGeneration {
                    text,
                    finish_reason,
                    stats,
                    error: None,
                });
            }
            EventPayload::Error { error, .. } => {
                return Ok(CompletedGeneration {
                    text,
                    finish_reason: FinishReason::Error,
                    stats: GenerationStats::default(),
                    error: Some(error),
                });
            }
        }
    }
    Err(crate::Error::RuntimeNotAvailable {
        message: "event stream ended without a terminal event".into(),
        details: Box::default(),
    })
}
