//! Indlela Core - On-Device Model Lifecycle Runtime
//!
//! This crate turns a declarative model manifest into a reproducible plan
//! for downloading, verifying, installing, selecting, and executing local
//! ML models across heterogeneous hardware.
//!
//! # Architecture
//!
//! - Single-flight install pipeline with atomic verify-and-swap
//! - Deterministic backend/provider selection with a downgrade ladder
//! - Priority scheduling with per-queue concurrency caps
//! - Unified LLM event stream with cross-chunk stop matching
//!
//! # Example
//!
//! ```ignore
//! use indlela_core::{AdapterRegistry, GenerationRequest, ModelRuntime, RuntimeConfig};
//!
//! let manifest = indlela_core::manifest::parse(&manifest_json)?;
//! let runtime = ModelRuntime::new(RuntimeConfig::default(), manifest, adapters)?;
//!
//! let mut stream = runtime
//!     .generate(GenerationRequest::new("llama3.1-8b-q4km", "Hello!"))
//!     .await?;
//! while let Some(event) = stream.recv().await {
//!     // deltas, metrics, then exactly one terminal event
//! }
//! ```

pub mod adapter;
pub mod config;
pub mod error;
pub mod install;
pub mod manifest;
pub mod runtime;
pub mod scheduler;
pub mod selector;
pub mod stream;

pub use adapter::{
    AccelSupport, AdapterRegistry, AdapterSlot, BackendAdapter, RawDelta, RawFinish, RawTerminal,
    SessionHandle, TaskRequest, TaskResponse,
};
pub use config::{InstallConfig, RuntimeConfig, StreamConfig};
pub use error::{Error, ErrorCode, ErrorDetails, Result, WireError};
pub use install::{
    ArtifactFetcher, FetchResponse, InstallPhase, InstallProgress, InstallWatch, Installer,
    LocalModel,
};
pub use manifest::{
    Artifact, ArtifactRole, BackendKind, GenerationParams, Manifest, ModelItem, ModelType,
    Platform, Provider,
};
pub use runtime::{GenerationRequest, GenerationStream, ModelRuntime, ModelState, ModelSummary};
pub use scheduler::{
    Priority, ResourceType, SchedulerLimits, SchedulerStats, TaskEvent, TaskEventKind,
    TaskScheduler, TaskSpec, TaskStatus, TaskType,
};
pub use selector::{
    Decision, DowngradeDimension, DowngradeStep, HostCapabilities, SelectedRuntime, SelectionHints,
    SelectionReport, Selector,
};
pub use stream::{
    collect_stream, CompletedGeneration, EventPayload, FinishReason, GenerationStats, StopMatcher,
    StreamEvent,
};
