//! Manifest data model.
//!
//! The manifest is the declarative description of every model the runtime
//! can install and execute. It is parsed once, validated, and then shared
//! immutably. Unknown JSON fields are preserved in per-record `extra` maps
//! so a round-trip write is non-lossy.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Task family a model serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelType {
    Llm,
    Embedding,
    Ocr,
    Stt,
    Tts,
    Classification,
    Custom,
}

/// Inference backend implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum BackendKind {
    #[serde(rename = "llama.cpp")]
    LlamaCpp,
    #[serde(rename = "onnx")]
    Onnx,
    #[serde(rename = "tflite")]
    TfLite,
    #[serde(rename = "whisper")]
    Whisper,
    #[serde(rename = "vosk")]
    Vosk,
    #[serde(rename = "mediapipe")]
    MediaPipe,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LlamaCpp => "llama.cpp",
            Self::Onnx => "onnx",
            Self::TfLite => "tflite",
            Self::Whisper => "whisper",
            Self::Vosk => "vosk",
            Self::MediaPipe => "mediapipe",
        }
    }
}

impl std::fmt::Display for BackendKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Platform tag a model may be restricted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Ios,
    Android,
    Macos,
    Linux,
    Windows,
}

impl Platform {
    /// Mobile platforms default to the ONNX backend when no hint matches.
    pub fn is_mobile(&self) -> bool {
        matches!(self, Self::Ios | Self::Android)
    }
}

impl std::fmt::Display for Platform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Ios => "ios",
            Self::Android => "android",
            Self::Macos => "macos",
            Self::Linux => "linux",
            Self::Windows => "windows",
        };
        f.write_str(name)
    }
}

/// Hardware execution path within a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Provider {
    #[serde(rename = "cpu")]
    Cpu,
    #[serde(rename = "gpu")]
    Gpu,
    #[serde(rename = "coreml")]
    CoreMl,
    #[serde(rename = "nnapi")]
    Nnapi,
}

impl std::fmt::Display for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Cpu => "cpu",
            Self::Gpu => "gpu",
            Self::CoreMl => "coreml",
            Self::Nnapi => "nnapi",
        };
        f.write_str(name)
    }
}

/// Role of an artifact within a model package.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactRole {
    Model,
    Tokenizer,
    Config,
    Vocab,
    Adapter,
}

/// One file referenced by a manifest entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub name: String,
    pub role: ArtifactRole,
    pub format: String,
    /// Path relative to the artifact base URL and to the version directory.
    pub path: String,
    /// Decimal byte count.
    pub size: u64,
    /// Lowercase hex SHA-256 of the file contents.
    pub sha256: String,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Artifact {
    /// Whether this artifact is an archive that needs extraction.
    pub fn is_archive(&self) -> bool {
        matches!(self.format.as_str(), "zip" | "tar.gz" | "tgz")
    }
}

/// Sampling parameters attached to a manifest entry or a generation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationParams {
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_top_p")]
    pub top_p: f32,
    #[serde(default)]
    pub top_k: usize,
    #[serde(default = "default_repetition_penalty")]
    pub repetition_penalty: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    /// Generation stops before emitting any of these strings.
    #[serde(default)]
    pub stop_strings: Vec<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

fn default_temperature() -> f32 {
    0.7
}
fn default_top_p() -> f32 {
    0.9
}
fn default_repetition_penalty() -> f32 {
    1.1
}
fn default_max_tokens() -> usize {
    2048
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            temperature: default_temperature(),
            top_p: default_top_p(),
            top_k: 0,
            repetition_penalty: default_repetition_penalty(),
            max_tokens: default_max_tokens(),
            stop_strings: Vec::new(),
            extra: Map::new(),
        }
    }
}

impl GenerationParams {
    /// Clamp parameters into their valid ranges.
    pub fn clamped(mut self) -> Self {
        self.temperature = self.temperature.clamp(0.0, 2.0);
        self.top_p = self.top_p.clamp(0.0, 1.0);
        if self.max_tokens == 0 {
            self.max_tokens = default_max_tokens();
        }
        if self.repetition_penalty < 1.0 {
            self.repetition_penalty = 1.0;
        }
        self
    }
}

/// One model entry in the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelItem {
    /// Unique within the manifest.
    pub id: String,
    #[serde(rename = "type")]
    pub model_type: ModelType,
    pub version: Version,
    /// Preference-ordered backend hints; order is significant.
    #[serde(default)]
    pub backend_hints: Vec<BackendKind>,
    #[serde(default)]
    pub platforms: BTreeSet<Platform>,
    /// Minimum host OS build number per platform.
    #[serde(default)]
    pub min_sdk_version: BTreeMap<Platform, u32>,
    #[serde(default)]
    pub min_backend_version: BTreeMap<BackendKind, Version>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    /// Downgrade candidates, best first. Absent means the quantization
    /// dimension is skipped during downgrade.
    #[serde(default)]
    pub quantization_variants: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rope_scaling: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rope_theta: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_generation_config: Option<GenerationParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_template: Option<String>,
    #[serde(default)]
    pub special_tokens: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_gpu_layers: Option<u32>,
    /// Resident memory needed at the manifest quantization and full context.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub required_memory_bytes: Option<u64>,
    pub required_artifacts: Vec<Artifact>,
    #[serde(default)]
    pub optional_artifacts: Vec<Artifact>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl ModelItem {
    /// All artifacts, required first.
    pub fn artifacts(&self) -> impl Iterator<Item = &Artifact> {
        self.required_artifacts
            .iter()
            .chain(self.optional_artifacts.iter())
    }

    /// Total declared size of the required artifacts in bytes.
    pub fn required_size(&self) -> u64 {
        self.required_artifacts.iter().map(|a| a.size).sum()
    }

    /// Whether any artifact needs an extraction phase.
    pub fn has_archives(&self) -> bool {
        self.artifacts().any(|a| a.is_archive())
    }
}

/// Parsed manifest root.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub schema_version: u32,
    pub content_version: String,
    pub generated_at: DateTime<Utc>,
    pub models: Vec<ModelItem>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Manifest {
    /// Look up a model by id.
    pub fn get(&self, id: &str) -> Option<&ModelItem> {
        self.models.iter().find(|m| m.id == id)
    }

    /// All models of a given type, in manifest order.
    pub fn models_of_type(&self, ty: ModelType) -> impl Iterator<Item = &ModelItem> {
        self.models.iter().filter(move |m| m.model_type == ty)
    }
}
