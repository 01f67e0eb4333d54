//! Backend adapter interface.
//!
//! The core never links inference libraries directly; it talks to backends
//! through this narrow capability surface. An adapter advertises what it
//! supports, loads model artifacts into sessions, and executes tasks.
//! Backends that are not compiled in are represented as an explicit
//! [`AdapterSlot::Absent`] so callers can never invoke a method that
//! always fails; the selector reports `RUNTIME_NOT_AVAILABLE` instead.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use semver::Version;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::{Result, WireError};
use crate::manifest::{BackendKind, GenerationParams, Platform, Provider};
use crate::selector::SelectedRuntime;
use crate::stream::GenerationStats;

/// Hardware acceleration probe result for a (backend, provider) pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccelSupport {
    pub available: bool,
    /// Accelerated paths are only preferred when the adapter marks them
    /// stable; an available-but-unstable provider stays a fallback.
    pub stable: bool,
}

/// Opaque handle to a loaded model session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    pub id: Uuid,
    pub backend: BackendKind,
    pub model_dir: PathBuf,
}

/// One raw delta from a backend's token stream. The terminal marker is
/// carried in-band; a stream yields exactly one delta with `terminal` set.
#[derive(Debug, Clone)]
pub struct RawDelta {
    pub text: String,
    pub token_ids: Vec<u32>,
    pub terminal: Option<RawTerminal>,
}

impl RawDelta {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            token_ids: Vec::new(),
            terminal: None,
        }
    }

    pub fn terminal(reason: RawFinish, stats: GenerationStats) -> Self {
        Self {
            text: String::new(),
            token_ids: Vec::new(),
            terminal: Some(RawTerminal { reason, stats }),
        }
    }
}

/// Terminal marker on a raw stream.
#[derive(Debug, Clone)]
pub struct RawTerminal {
    pub reason: RawFinish,
    pub stats: GenerationStats,
}

/// Why the backend stopped generating.
#[derive(Debug, Clone)]
pub enum RawFinish {
    Eos,
    Length,
    Cancelled,
    Failed(WireError),
}

/// Request payload for non-streaming task types.
#[derive(Debug, Clone)]
pub enum TaskRequest {
    Ocr { image: Vec<u8> },
    Stt { audio: Vec<f32>, sample_rate: u32 },
    Tts { text: String },
    Embedding { text: String },
}

/// Response payload for non-streaming task types.
#[derive(Debug, Clone)]
pub enum TaskResponse {
    Text(String),
    Embedding(Vec<f32>),
    Audio { samples: Vec<f32>, sample_rate: u32 },
}

/// Capability interface implemented by every inference backend.
#[async_trait]
pub trait BackendAdapter: Send + Sync {
    /// Backend tag this adapter implements.
    fn backend(&self) -> BackendKind;

    /// Adapter version, compared against `minBackendVersion`.
    fn version(&self) -> Version;

    /// Platforms this adapter runs on.
    fn platforms(&self) -> &[Platform];

    /// Probe hardware acceleration availability and stability.
    fn probe_accel(&self, provider: Provider) -> AccelSupport;

    /// Load model artifacts into a session.
    async fn load(&self, runtime: &SelectedRuntime, model_dir: &Path) -> Result<SessionHandle>;

    /// Release a session.
    async fn unload(&self, session: SessionHandle) -> Result<()>;

    /// Stream raw deltas for an LLM prompt. The adapter observes `cancel`
    /// cooperatively and ends the stream with a `Cancelled` terminal.
    async fn stream_generate(
        &self,
        session: &SessionHandle,
        prompt: String,
        params: GenerationParams,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<RawDelta>>;

    /// Run a request/response task (OCR, STT, TTS, embedding).
    async fn run(
        &self,
        session: &SessionHandle,
        request: TaskRequest,
        cancel: CancellationToken,
    ) -> Result<TaskResponse>;
}

/// A registry slot: either a live adapter or an explicit absence.
#[derive(Clone)]
pub enum AdapterSlot {
    Available(Arc<dyn BackendAdapter>),
    Absent,
}

impl AdapterSlot {
    pub fn as_available(&self) -> Option<&Arc<dyn BackendAdapter>> {
        match self {
            Self::Available(adapter) => Some(adapter),
            Self::Absent => None,
        }
    }
}

/// Maps backend tags to adapter slots.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    slots: BTreeMap<BackendKind, AdapterSlot>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn BackendAdapter>) {
        self.slots
            .insert(adapter.backend(), AdapterSlot::Available(adapter));
    }

    /// Slot for a backend; unknown backends are absent, not an error.
    pub fn slot(&self, backend: BackendKind) -> AdapterSlot {
        self.slots
            .get(&backend)
            .cloned()
            .unwrap_or(AdapterSlot::Absent)
    }

    pub fn available(&self, backend: BackendKind) -> Option<Arc<dyn BackendAdapter>> {
        self.slot(backend).as_available().cloned()
    }

    /// Installed backends with their advertised versions.
    pub fn installed_backends(&self) -> BTreeMap<BackendKind, Version> {
        self.slots
            .iter()
            .filter_map(|(kind, slot)| {
                slot.as_available().map(|a| (*kind, a.version()))
            })
            .collect()
    }

    /// Probe every (backend, provider) acceleration pair.
    pub fn probe_accel(&self) -> BTreeMap<(BackendKind, Provider), AccelSupport> {
        let providers = [Provider::Cpu, Provider::Gpu, Provider::CoreMl, Provider::Nnapi];
        let mut out = BTreeMap::new();
        for (kind, slot) in &self.slots {
            if let Some(adapter) = slot.as_available() {
                for provider in providers {
                    out.insert((*kind, provider), adapter.probe_accel(provider));
                }
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_slot_for_unknown_backend() {
        let registry = AdapterRegistry::new();
        assert!(registry.available(BackendKind::Vosk).is_none());
        assert!(matches!(
            registry.slot(BackendKind::LlamaCpp),
            AdapterSlot::Absent
        ));
    }
}
