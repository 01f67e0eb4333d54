//! Configuration types for the indlela runtime.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Root directory for installed model versions.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,

    /// Base URL joined with artifact paths when downloading.
    #[serde(default = "default_artifact_base_url")]
    pub artifact_base_url: String,

    #[serde(default)]
    pub install: InstallConfig,

    #[serde(default)]
    pub scheduler: SchedulerLimitsConfig,

    #[serde(default)]
    pub stream: StreamConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            artifact_base_url: default_artifact_base_url(),
            install: InstallConfig::default(),
            scheduler: SchedulerLimitsConfig::default(),
            stream: StreamConfig::default(),
        }
    }
}

fn default_cache_dir() -> PathBuf {
    if let Ok(from_env) = std::env::var("INDLELA_CACHE_DIR") {
        let trimmed = from_env.trim();
        if !trimmed.is_empty() {
            return PathBuf::from(trimmed);
        }
    }

    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("indlela")
        .join("models")
}

fn default_artifact_base_url() -> String {
    "https://huggingface.co".to_string()
}

/// Install pipeline configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallConfig {
    /// Coalescing interval for download progress events, in milliseconds.
    /// A phase change always emits regardless of this interval.
    #[serde(default = "default_progress_interval_ms")]
    pub progress_interval_ms: u64,

    /// Evict least-recently-used ready versions once the cache grows past
    /// this many bytes. `None` disables eviction.
    #[serde(default)]
    pub cache_budget_bytes: Option<u64>,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for InstallConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: default_progress_interval_ms(),
            cache_budget_bytes: None,
            connect_timeout_secs: default_connect_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

fn default_progress_interval_ms() -> u64 {
    500
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_request_timeout_secs() -> u64 {
    3600
}

/// Scheduler concurrency limits as plain config; converted to
/// [`crate::scheduler::SchedulerLimits`] at construction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerLimitsConfig {
    #[serde(default = "default_max_total_concurrent")]
    pub max_total_concurrent: usize,

    #[serde(default = "default_llm_cap")]
    pub llm: usize,
    #[serde(default = "default_ocr_cap")]
    pub ocr: usize,
    #[serde(default = "default_stt_cap")]
    pub stt: usize,
    #[serde(default = "default_tts_cap")]
    pub tts: usize,
    #[serde(default = "default_embedding_cap")]
    pub embedding: usize,
    #[serde(default = "default_download_cap")]
    pub download: usize,
    #[serde(default = "default_verify_cap")]
    pub verify: usize,
}

impl Default for SchedulerLimitsConfig {
    fn default() -> Self {
        Self {
            max_total_concurrent: default_max_total_concurrent(),
            llm: default_llm_cap(),
            ocr: default_ocr_cap(),
            stt: default_stt_cap(),
            tts: default_tts_cap(),
            embedding: default_embedding_cap(),
            download: default_download_cap(),
            verify: default_verify_cap(),
        }
    }
}

fn default_max_total_concurrent() -> usize {
    8
}
fn default_llm_cap() -> usize {
    1
}
fn default_ocr_cap() -> usize {
    2
}
fn default_stt_cap() -> usize {
    2
}
fn default_tts_cap() -> usize {
    1
}
fn default_embedding_cap() -> usize {
    2
}
fn default_download_cap() -> usize {
    3
}
fn default_verify_cap() -> usize {
    2
}

/// Stream protocol configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamConfig {
    /// Emit the matched stop string as part of the final delta. Off by
    /// default; the wire contract forbids leaking the stop fragment unless
    /// a caller opts in.
    #[serde(default)]
    pub emit_stop_fragment: bool,

    /// Channel capacity for per-request event streams.
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,

    /// Emit an interim `metrics` event every N completion tokens.
    /// Disabled by default.
    #[serde(default)]
    pub metrics_every_n_tokens: Option<u32>,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            emit_stop_fragment: false,
            event_capacity: default_event_capacity(),
            metrics_every_n_tokens: None,
        }
    }
}

fn default_event_capacity() -> usize {
    64
}
