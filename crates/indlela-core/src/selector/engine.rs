//! Backend selection and the downgrade ladder.
//!
//! Selection is deterministic: the same (manifest item, capability probe,
//! hints) triple always yields the same decision and the same downgrade
//! steps. The decision order is fixed and not platform-overridable.

use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, ErrorCode, ErrorDetails};
use crate::manifest::{BackendKind, ModelItem, ModelType, Platform, Provider, CONTEXT_LADDER};
use crate::selector::capability::HostCapabilities;
use crate::selector::report::{
    Candidate, Decision, DowngradeDimension, DowngradeStep, SelectedRuntime, SelectionHints,
    SelectionReport,
};

const MIB: u64 = 1024 * 1024;

/// Per-thread scratch memory attributed by the fit check.
const THREAD_SCRATCH_BYTES: u64 = 16 * MIB;

/// Deterministic backend/provider selection.
pub struct Selector;

impl Selector {
    /// Compute a selection report for one manifest item.
    pub fn select(
        item: &ModelItem,
        caps: &HostCapabilities,
        hints: &SelectionHints,
    ) -> SelectionReport {
        let request_id = Uuid::new_v4().to_string();
        let mut candidates: Vec<Candidate> = Vec::new();

        // Step 1: platform and SDK gates.
        if !item.platforms.is_empty() && !item.platforms.contains(&caps.platform) {
            return failed(
                request_id,
                candidates,
                Error::UnsupportedPlatform {
                    message: format!(
                        "model '{}' does not list platform {}",
                        item.id, caps.platform
                    ),
                },
            );
        }
        if let Some(&min) = item.min_sdk_version.get(&caps.platform) {
            if caps.os_version < min {
                return failed(
                    request_id,
                    candidates,
                    Error::UnsupportedPlatform {
                        message: format!(
                            "host OS build {} below required {} on {}",
                            caps.os_version, min, caps.platform
                        ),
                    },
                );
            }
        }

        // Step 2: walk backend hints left to right, then the per-type default.
        let mut walk: Vec<BackendKind> = Vec::new();
        if let Some(preferred) = hints.preferred_backend {
            walk.push(preferred);
        }
        for hint in &item.backend_hints {
            if !walk.contains(hint) {
                walk.push(*hint);
            }
        }
        let fallback = default_backend(item.model_type, caps.platform);
        if !walk.contains(&fallback) {
            walk.push(fallback);
        }

        let mut backend = None;
        for kind in walk {
            match caps.installed_backends.get(&kind) {
                None => candidates.push(Candidate {
                    backend: kind,
                    provider: Provider::Cpu,
                    accepted: false,
                    reasons: vec!["backend not installed".into()],
                }),
                Some(installed) => {
                    if let Some(min) = item.min_backend_version.get(&kind) {
                        if installed < min {
                            candidates.push(Candidate {
                                backend: kind,
                                provider: Provider::Cpu,
                                accepted: false,
                                reasons: vec![format!(
                                    "backend version {installed} below required {min}"
                                )],
                            });
                            continue;
                        }
                    }
                    backend = Some(kind);
                    break;
                }
            }
        }
        let Some(backend) = backend else {
            let mut details = ErrorDetails::default();
            details.extra.insert(
                "consideredBackends".into(),
                serde_json::Value::from(candidates.len()),
            );
            return failed(
                request_id,
                candidates,
                Error::RuntimeNotAvailable {
                    message: format!("no installed backend can serve model '{}'", item.id),
                    details: Box::new(details),
                },
            );
        };

        // Step 3: prefer the accelerated provider when stable.
        let accel_provider = caps.accel_provider();
        let accel = caps.accel_for(backend, accel_provider);
        let provider = if hints.preferred_provider == Some(Provider::Cpu) {
            candidates.push(Candidate {
                backend,
                provider: accel_provider,
                accepted: false,
                reasons: vec!["cpu preferred by caller".into()],
            });
            Provider::Cpu
        } else if accel.available && accel.stable {
            candidates.push(Candidate {
                backend,
                provider: Provider::Cpu,
                accepted: false,
                reasons: vec!["cpu fallback candidate".into()],
            });
            accel_provider
        } else {
            let reason = if accel.available {
                "hardware acceleration not marked stable"
            } else {
                "hardware acceleration unavailable"
            };
            candidates.push(Candidate {
                backend,
                provider: accel_provider,
                accepted: false,
                reasons: vec![reason.into()],
            });
            Provider::Cpu
        };

        // Step 4: resource fit, then the downgrade ladder.
        let mut default_threads = caps.cpu_cores.saturating_sub(1).max(1);
        if let Some(max) = hints.max_threads {
            default_threads = default_threads.min(max.max(1));
        }
        let mut fit = FitState {
            base_bytes: base_memory(item),
            quant: item.quantization.clone(),
            quant_rank: 0,
            context: item.context_length,
            model_context: item.context_length,
            threads: default_threads,
            gpu_layers: if provider == Provider::Cpu {
                0
            } else {
                item.max_gpu_layers.unwrap_or(0)
            },
        };
        let available = caps.available_memory_bytes;
        let mut steps: Vec<DowngradeStep> = Vec::new();

        if !fit.fits(available) {
            for dimension in [
                DowngradeDimension::Quantization,
                DowngradeDimension::ContextLength,
                DowngradeDimension::Threads,
                DowngradeDimension::GpuLayers,
            ] {
                if fit.fits(available) {
                    break;
                }
                if let Some(step) = fit.downgrade(dimension, item) {
                    debug!(
                        model = %item.id,
                        ?dimension,
                        from = %step.from,
                        to = %step.to,
                        "downgrade applied"
                    );
                    steps.push(step);
                }
            }
        }

        if !fit.fits(available) {
            candidates.push(Candidate {
                backend,
                provider,
                accepted: false,
                reasons: vec![ErrorCode::InsufficientMemory.as_str().into()],
            });
            let details = ErrorDetails {
                backend: Some(backend.to_string()),
                required_bytes: Some(fit.required_bytes()),
                available_bytes: Some(available),
                ..Default::default()
            };
            return SelectionReport {
                request_id,
                candidates,
                downgrade_steps: steps,
                final_decision: Decision::Failed {
                    error: Error::RuntimeNotAvailable {
                        message: format!(
                            "model '{}' does not fit host memory even after downgrade",
                            item.id
                        ),
                        details: Box::new(details),
                    }
                    .to_wire(),
                },
            };
        }

        let reasons = if steps.is_empty() {
            Vec::new()
        } else {
            vec!["fit after downgrade".into()]
        };
        candidates.push(Candidate {
            backend,
            provider,
            accepted: true,
            reasons,
        });

        let model_memory_bytes = fit.required_bytes();
        SelectionReport {
            request_id,
            candidates,
            downgrade_steps: steps,
            final_decision: Decision::Selected {
                runtime: SelectedRuntime {
                    backend,
                    provider,
                    quantization: fit.quant,
                    context_length: fit.context,
                    threads: fit.threads,
                    gpu_layers: fit.gpu_layers,
                    model_memory_bytes,
                },
            },
        }
    }
}

/// Default backend when no manifest hint matches the host.
fn default_backend(model_type: ModelType, platform: Platform) -> BackendKind {
    if platform.is_mobile() {
        BackendKind::Onnx
    } else if model_type == ModelType::Llm {
        BackendKind::LlamaCpp
    } else {
        BackendKind::Onnx
    }
}

/// Base memory need at the manifest quantization and full context. When the
/// manifest does not state a figure, the required artifact bytes plus 25%
/// working overhead stand in.
fn base_memory(item: &ModelItem) -> u64 {
    item.required_memory_bytes
        .unwrap_or_else(|| item.required_size() + item.required_size() / 4)
}

/// Mutable fit state walked by the downgrade ladder.
///
/// The fit model: quantization scales the base by 3/4 per variant step,
/// context scales the quantized base by `0.5 + 0.5 * ctx / model_ctx`,
/// each thread adds fixed scratch, and a nonzero GPU layer split adds
/// base/16 of transfer staging.
struct FitState {
    base_bytes: u64,
    quant: Option<String>,
    quant_rank: i32,
    context: Option<u32>,
    model_context: Option<u32>,
    threads: usize,
    gpu_layers: u32,
}

impl FitState {
    fn required_bytes(&self) -> u64 {
        let quant_mem = self.base_bytes as f64 * 0.75f64.powi(self.quant_rank);
        let ctx_factor = match (self.context, self.model_context) {
            (Some(ctx), Some(model_ctx)) if model_ctx > 0 => {
                0.5 + 0.5 * ctx as f64 / model_ctx as f64
            }
            _ => 1.0,
        };
        let scratch = self.threads as u64 * THREAD_SCRATCH_BYTES;
        let staging = if self.gpu_layers > 0 {
            self.base_bytes / 16
        } else {
            0
        };
        (quant_mem * ctx_factor) as u64 + scratch + staging
    }

    fn fits(&self, available: u64) -> bool {
        self.required_bytes() <= available
    }

    /// Apply at most one step along `dimension`. Returns the step taken,
    /// or `None` when the dimension has nothing left to offer.
    fn downgrade(&mut self, dimension: DowngradeDimension, item: &ModelItem) -> Option<DowngradeStep> {
        match dimension {
            DowngradeDimension::Quantization => {
                // Only variants the manifest lists explicitly; no runtime
                // string guessing.
                let variants = &item.quantization_variants;
                let current = self.quant.as_ref()?;
                let idx = variants.iter().position(|v| v == current)?;
                let next = variants.get(idx + 1)?.clone();
                let step = DowngradeStep {
                    dimension,
                    from: current.clone(),
                    to: next.clone(),
                };
                self.quant = Some(next);
                self.quant_rank += 1;
                Some(step)
            }
            DowngradeDimension::ContextLength => {
                let current = self.context?;
                let idx = CONTEXT_LADDER.iter().position(|&c| c == current)?;
                let next = *CONTEXT_LADDER.get(idx + 1)?;
                let step = DowngradeStep {
                    dimension,
                    from: current.to_string(),
                    to: next.to_string(),
                };
                self.context = Some(next);
                Some(step)
            }
            DowngradeDimension::Threads => {
                if self.threads <= 1 {
                    return None;
                }
                let next = (self.threads / 2).max(1);
                let step = DowngradeStep {
                    dimension,
                    from: self.threads.to_string(),
                    to: next.to_string(),
                };
                self.threads = next;
                Some(step)
            }
            DowngradeDimension::GpuLayers => {
                // Drops straight to zero; no intermediate layer counts.
                if self.gpu_layers == 0 {
                    return None;
                }
                let step = DowngradeStep {
                    dimension,
                    from: self.gpu_layers.to_string(),
                    to: "0".into(),
                };
                self.gpu_layers = 0;
                Some(step)
            }
        }
    }
}

fn failed(request_id: String, candidates: Vec<Candidate>, error: Error) -> SelectionReport {
    SelectionReport {
        request_id,
        candidates,
        downgrade_steps: Vec::new(),
        final_decision: Decision::Failed {
            error: error.to_wire(),
        },
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use semver::Version;

    use super::*;
    use crate::adapter::AccelSupport;
    use crate::manifest::{Artifact, ArtifactRole};

    const GIB: u64 = 1024 * 1024 * 1024;

    fn artifact(name: &str, size: u64) -> Artifact {
        Artifact {
            name: name.into(),
            role: ArtifactRole::Model,
            format: "gguf".into(),
            path: format!("m/{name}"),
            size,
            sha256: "ab".repeat(32),
            extra: Default::default(),
        }
    }

    fn llm_item() -> ModelItem {
        ModelItem {
            id: "llama3.1-8b-q4km".into(),
            model_type: ModelType::Llm,
            version: Version::new(1, 0, 0),
            backend_hints: vec![BackendKind::LlamaCpp],
            platforms: [Platform::Linux, Platform::Macos].into_iter().collect(),
            min_sdk_version: BTreeMap::new(),
            min_backend_version: BTreeMap::new(),
            quantization: Some("Q5_K_M".into()),
            quantization_variants: vec!["Q5_K_M".into(), "Q4_K_M".into(), "Q3_K_M".into()],
            context_length: Some(8192),
            rope_scaling: None,
            rope_theta: None,
            default_generation_config: None,
            chat_template: None,
            special_tokens: BTreeMap::new(),
            max_gpu_layers: Some(32),
            required_memory_bytes: Some(5 * GIB),
            required_artifacts: vec![artifact("model.gguf", 4 * GIB)],
            optional_artifacts: Vec::new(),
            extra: Default::default(),
        }
    }

    fn linux_host(available: u64) -> HostCapabilities {
        HostCapabilities {
            platform: Platform::Linux,
            os_version: 22,
            cpu_cores: 8,
            total_memory_bytes: 16 * GIB,
            available_memory_bytes: available,
            installed_backends: [(BackendKind::LlamaCpp, Version::new(0, 3, 0))]
                .into_iter()
                .collect(),
            accel: BTreeMap::new(),
        }
    }

    #[test]
    fn test_downgrade_ladder_scenario() {
        // 5 GiB needed at Q5, 3 GiB free: one quantization step, one
        // context step, CPU with cores-1 threads and no GPU layers.
        let report = Selector::select(&llm_item(), &linux_host(3 * GIB), &Default::default());
        assert_eq!(
            report.downgrade_steps,
            vec![
                DowngradeStep {
                    dimension: DowngradeDimension::Quantization,
                    from: "Q5_K_M".into(),
                    to: "Q4_K_M".into(),
                },
                DowngradeStep {
                    dimension: DowngradeDimension::ContextLength,
                    from: "8192".into(),
                    to: "4096".into(),
                },
            ]
        );
        let runtime = report.final_decision.runtime().expect("selected");
        assert_eq!(runtime.backend, BackendKind::LlamaCpp);
        assert_eq!(runtime.provider, Provider::Cpu);
        assert_eq!(runtime.threads, 7);
        assert_eq!(runtime.gpu_layers, 0);
    }

    #[test]
    fn test_no_downgrade_when_memory_suffices() {
        let report = Selector::select(&llm_item(), &linux_host(12 * GIB), &Default::default());
        assert!(report.downgrade_steps.is_empty());
        let runtime = report.final_decision.runtime().unwrap();
        assert_eq!(runtime.quantization.as_deref(), Some("Q5_K_M"));
        assert_eq!(runtime.context_length, Some(8192));
    }

    #[test]
    fn test_selection_fails_when_ladder_exhausted() {
        let report = Selector::select(&llm_item(), &linux_host(GIB / 2), &Default::default());
        match &report.final_decision {
            Decision::Failed { error } => {
                assert_eq!(error.code, ErrorCode::RuntimeNotAvailable);
                let details = error.details.as_ref().unwrap();
                assert!(details.required_bytes.unwrap() > details.available_bytes.unwrap());
            }
            other => panic!("expected failure, got {other:?}"),
        }
        // Every dimension left a step in the audit trail.
        assert_eq!(report.downgrade_steps.len(), 3);
        assert!(report
            .candidates
            .iter()
            .any(|c| c.reasons.iter().any(|r| r == "INSUFFICIENT_MEMORY")));
    }

    #[test]
    fn test_unsupported_platform() {
        let mut caps = linux_host(8 * GIB);
        caps.platform = Platform::Android;
        let report = Selector::select(&llm_item(), &caps, &Default::default());
        match &report.final_decision {
            Decision::Failed { error } => {
                assert_eq!(error.code, ErrorCode::UnsupportedPlatform)
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_min_sdk_gate() {
        let mut item = llm_item();
        item.min_sdk_version.insert(Platform::Linux, 30);
        let report = Selector::select(&item, &linux_host(8 * GIB), &Default::default());
        assert!(!report.is_selected());
    }

    #[test]
    fn test_hint_walk_skips_uninstalled() {
        let mut item = llm_item();
        item.backend_hints = vec![BackendKind::Onnx, BackendKind::LlamaCpp];
        let report = Selector::select(&item, &linux_host(12 * GIB), &Default::default());
        let runtime = report.final_decision.runtime().unwrap();
        assert_eq!(runtime.backend, BackendKind::LlamaCpp);
        assert!(report
            .candidates
            .iter()
            .any(|c| c.backend == BackendKind::Onnx && !c.accepted));
    }

    #[test]
    fn test_min_backend_version_gate() {
        let mut item = llm_item();
        item.min_backend_version
            .insert(BackendKind::LlamaCpp, Version::new(9, 0, 0));
        let report = Selector::select(&item, &linux_host(12 * GIB), &Default::default());
        match &report.final_decision {
            Decision::Failed { error } => {
                assert_eq!(error.code, ErrorCode::RuntimeNotAvailable)
            }
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[test]
    fn test_stable_accel_preferred_with_cpu_fallback_recorded() {
        let mut caps = linux_host(12 * GIB);
        caps.accel.insert(
            (BackendKind::LlamaCpp, Provider::Gpu),
            AccelSupport {
                available: true,
                stable: true,
            },
        );
        let report = Selector::select(&llm_item(), &caps, &Default::default());
        let runtime = report.final_decision.runtime().unwrap();
        assert_eq!(runtime.provider, Provider::Gpu);
        assert!(runtime.gpu_layers > 0);
        assert!(report
            .candidates
            .iter()
            .any(|c| c.provider == Provider::Cpu && !c.accepted));
    }

    #[test]
    fn test_unstable_accel_falls_back_to_cpu() {
        let mut caps = linux_host(12 * GIB);
        caps.accel.insert(
            (BackendKind::LlamaCpp, Provider::Gpu),
            AccelSupport {
                available: true,
                stable: false,
            },
        );
        let report = Selector::select(&llm_item(), &caps, &Default::default());
        assert_eq!(
            report.final_decision.runtime().unwrap().provider,
            Provider::Cpu
        );
    }

    #[test]
    fn test_deterministic_across_runs() {
        let item = llm_item();
        let caps = linux_host(3 * GIB);
        let hints = SelectionHints::default();
        let a = Selector::select(&item, &caps, &hints);
        let b = Selector::select(&item, &caps, &hints);
        assert_eq!(a.final_decision, b.final_decision);
        assert_eq!(a.downgrade_steps, b.downgrade_steps);
    }

    #[test]
    fn test_quantization_skipped_without_variants() {
        let mut item = llm_item();
        item.quantization_variants.clear();
        let report = Selector::select(&item, &linux_host(3 * GIB), &Default::default());
        assert!(report
            .downgrade_steps
            .iter()
            .all(|s| s.dimension != DowngradeDimension::Quantization));
    }
}
