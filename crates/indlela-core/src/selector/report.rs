//! Selection diagnostics.
//!
//! Every selection run, success or failure, produces a [`SelectionReport`]
//! recording each considered (backend, provider) pair and every downgrade
//! applied. Consumers display the report when selection fails.

use serde::{Deserialize, Serialize};

use crate::error::WireError;
use crate::manifest::{BackendKind, Provider};

/// One considered (backend, provider) pair with the reasons it was
/// accepted or rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    pub backend: BackendKind,
    pub provider: Provider,
    pub accepted: bool,
    pub reasons: Vec<String>,
}

/// Dimension along which a parameter was lowered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum DowngradeDimension {
    Quantization,
    ContextLength,
    Threads,
    GpuLayers,
}

/// One applied downgrade.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DowngradeStep {
    pub dimension: DowngradeDimension,
    pub from: String,
    pub to: String,
}

/// Load parameters for the chosen backend, handed to the adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectedRuntime {
    pub backend: BackendKind,
    pub provider: Provider,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantization: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_length: Option<u32>,
    pub threads: usize,
    pub gpu_layers: u32,
    /// Memory the fit check attributed to this configuration.
    pub model_memory_bytes: u64,
}

/// Outcome of a selection run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "camelCase")]
pub enum Decision {
    Selected { runtime: SelectedRuntime },
    Failed { error: WireError },
}

impl Decision {
    pub fn runtime(&self) -> Option<&SelectedRuntime> {
        match self {
            Self::Selected { runtime } => Some(runtime),
            Self::Failed { .. } => None,
        }
    }
}

/// Full audit trail of one selection run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelectionReport {
    pub request_id: String,
    pub candidates: Vec<Candidate>,
    pub downgrade_steps: Vec<DowngradeStep>,
    pub final_decision: Decision,
}

impl SelectionReport {
    pub fn is_selected(&self) -> bool {
        matches!(self.final_decision, Decision::Selected { .. })
    }
}

/// Optional caller preferences folded into selection.
#[derive(Debug, Clone, Default)]
pub struct SelectionHints {
    /// Tried before the manifest's own backend hints.
    pub preferred_backend: Option<BackendKind>,
    /// Forces CPU when set to [`Provider::Cpu`].
    pub preferred_provider: Option<Provider>,
    /// Upper bound on the thread count.
    pub max_threads: Option<usize>,
}
