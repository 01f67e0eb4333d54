//! Streaming protocol core.
//!
//! Raw backend deltas enter, ordered wire events leave. See [`event`] for
//! the schema, [`stop`] for cross-chunk stop matching, and [`normalizer`]
//! for the sequencing and terminal-event guarantees.

mod event;
mod normalizer;
mod stop;

pub use event::{
    collect_stream, CompletedGeneration, EventPayload, FinishReason, GenerationStats, RequestId,
    StreamEvent,
};
pub use normalizer::{normalize_into, NormalizerConfig};
pub use stop::{StopMatcher, StopScan};
