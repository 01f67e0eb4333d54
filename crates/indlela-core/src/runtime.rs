//! Runtime root object.
//!
//! A [`ModelRuntime`] is constructed explicitly and owns the wiring of the
//! core subsystems: manifest lookups feed the selector, missing artifacts
//! go through the installer, adapter calls run under the scheduler's queue
//! caps, and LLM output flows through the stream normalizer. Tests build
//! independent runtimes; there is no process-wide instance.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::sync::{broadcast, mpsc, RwLock};
use tracing::{debug, info};

use crate::adapter::{AdapterRegistry, SessionHandle, TaskRequest, TaskResponse};
use crate::config::RuntimeConfig;
use crate::error::{Error, Result};
use crate::install::{InstallPhase, InstallProgress, InstallWatch, Installer};
use crate::manifest::{GenerationParams, Manifest, ModelItem, ModelType};
use crate::scheduler::{
    Priority, SchedulerLimits, SchedulerStats, TaskEvent, TaskScheduler, TaskSpec, TaskStatus,
    TaskType, TaskValue,
};
use crate::selector::{SelectedRuntime, SelectionHints, SelectionReport, Selector};
use crate::stream::{
    collect_stream, normalize_into, CompletedGeneration, FinishReason, NormalizerConfig,
    StreamEvent,
};
use crate::HostCapabilities;

/// A generation request with builder-style configuration.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub model_id: String,
    pub prompt: String,
    pub params: Option<GenerationParams>,
    pub hints: SelectionHints,
    pub timeout: Option<Duration>,
    pub priority: Priority,
}

impl GenerationRequest {
    pub fn new(model_id: impl Into<String>, prompt: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            prompt: prompt.into(),
            params: None,
            hints: SelectionHints::default(),
            timeout: None,
            priority: Priority::Normal,
        }
    }

    pub fn with_params(mut self, params: GenerationParams) -> Self {
        self.params = Some(params);
        self
    }

    pub fn with_hints(mut self, hints: SelectionHints) -> Self {
        self.hints = hints;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }
}

/// Live event stream of one generation.
pub struct GenerationStream {
    pub request_id: String,
    pub task_id: String,
    events: mpsc::Receiver<StreamEvent>,
}

impl std::fmt::Debug for GenerationStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenerationStream")
            .field("request_id", &self.request_id)
            .field("task_id", &self.task_id)
            .finish()
    }
}

impl GenerationStream {
    pub async fn recv(&mut self) -> Option<StreamEvent> {
        self.events.recv().await
    }

    /// Drain into the non-streaming result form.
    pub async fn collect(self) -> Result<CompletedGeneration> {
        collect_stream(self.events).await
    }

    /// Lazy stream view of the events.
    pub fn into_stream(self) -> impl futures::Stream<Item = StreamEvent> {
        tokio_stream::wrappers::ReceiverStream::new(self.events)
    }
}

/// Install state of one manifest model, as seen right now.
#[derive(Debug, Clone)]
pub enum ModelState {
    NotInstalled,
    Installing(InstallProgress),
    Ready { path: PathBuf },
}

/// One row of [`ModelRuntime::model_states`].
#[derive(Debug, Clone)]
pub struct ModelSummary {
    pub model_id: String,
    pub version: String,
    pub model_type: ModelType,
    pub state: ModelState,
}

struct SessionEntry {
    handle: SessionHandle,
    selected: SelectedRuntime,
    version: String,
}

/// The runtime core.
pub struct ModelRuntime {
    config: RuntimeConfig,
    manifest: Arc<Manifest>,
    capabilities: HostCapabilities,
    adapters: AdapterRegistry,
    installer: Installer,
    scheduler: TaskScheduler,
    sessions: RwLock<HashMap<String, SessionEntry>>,
}

impl ModelRuntime {
    /// Build a runtime against the live host: probe capabilities, restore
    /// the cache, and wire the default HTTP installer.
    pub fn new(config: RuntimeConfig, manifest: Manifest, adapters: AdapterRegistry) -> Result<Self> {
        let capabilities = HostCapabilities::probe(&adapters);
        let installer = Installer::new(&config)?;
        Self::with_parts(config, manifest, adapters, capabilities, installer)
    }

    /// Build from explicit parts. Tests construct synthetic capabilities
    /// and a mock-transport installer here.
    pub fn with_parts(
        config: RuntimeConfig,
        manifest: Manifest,
        adapters: AdapterRegistry,
        capabilities: HostCapabilities,
        installer: Installer,
    ) -> Result<Self> {
        installer.recover()?;
        let scheduler = TaskScheduler::new(SchedulerLimits::from(&config.scheduler));
        info!(
            models = manifest.models.len(),
            platform = %capabilities.platform,
            "runtime initialized"
        );
        Ok(Self {
            config,
            manifest: Arc::new(manifest),
            capabilities,
            adapters,
            installer,
            scheduler,
            sessions: RwLock::new(HashMap::new()),
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn capabilities(&self) -> &HostCapabilities {
        &self.capabilities
    }

    pub fn installer(&self) -> &Installer {
        &self.installer
    }

    pub fn scheduler(&self) -> &TaskScheduler {
        &self.scheduler
    }

    /// Scheduler lifecycle event stream.
    pub fn events(&self) -> broadcast::Receiver<TaskEvent> {
        self.scheduler.subscribe()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    fn item(&self, model_id: &str) -> Result<&ModelItem> {
        self.manifest
            .get(model_id)
            .ok_or_else(|| Error::ModelNotFound(model_id.to_string()))
    }

    /// Run selection for a model and return the full report.
    pub fn select(&self, model_id: &str, hints: &SelectionHints) -> Result<SelectionReport> {
        let item = self.item(model_id)?;
        Ok(Selector::select(item, &self.capabilities, hints))
    }

    /// Start (or join) the install of a model, bypassing the scheduler.
    pub fn install(&self, model_id: &str) -> Result<InstallWatch> {
        let item = self.item(model_id)?;
        Ok(self.installer.install(item))
    }

    /// Install state of every manifest model.
    pub fn model_states(&self) -> Vec<ModelSummary> {
        self.manifest
            .models
            .iter()
            .map(|item| {
                let version = item.version.to_string();
                let state = if let Some(progress) =
                    self.installer.install_state(&item.id, &version)
                {
                    ModelState::Installing(progress)
                } else if let Some(path) = self.installer.model_dir(&item.id, &version) {
                    ModelState::Ready { path }
                } else {
                    ModelState::NotInstalled
                };
                ModelSummary {
                    model_id: item.id.clone(),
                    version,
                    model_type: item.model_type,
                    state,
                }
            })
            .collect()
    }

    /// Re-verify an installed model's artifacts against the manifest
    /// digests, on the verify queue.
    pub async fn verify_installed(&self, model_id: &str) -> Result<()> {
        let item = self.item(model_id)?.clone();
        let version = item.version.to_string();
        let dir = self
            .installer
            .model_dir(&item.id, &version)
            .ok_or_else(|| Error::ModelNotFound(format!("{}@{version}", item.id)))?;

        let ticket = self.scheduler.submit(TaskSpec::new(TaskType::Verify), move |cancel| {
            async move {
                for artifact in &item.required_artifacts {
                    if cancel.is_cancelled() {
                        return Err(Error::TaskCancelled);
                    }
                    let digest = crate::install::hash_file(&dir.join(&artifact.name)).await?;
                    if digest != artifact.sha256 {
                        return Err(Error::VerifyFailed {
                            artifact: artifact.name.clone(),
                            expected_sha256: artifact.sha256.clone(),
                            actual_sha256: digest,
                        });
                    }
                }
                Ok(TaskValue::None)
            }
            .boxed()
        });

        let outcome = ticket
            .completion
            .await
            .map_err(|_| Error::download("verify task dropped"))?;
        match outcome.status {
            TaskStatus::Completed => Ok(()),
            _ => Err(outcome
                .error
                .map(Error::from)
                .unwrap_or(Error::TaskCancelled)),
        }
    }

    /// Ensure a model's artifacts are on disk, running the install as a
    /// download-queue task so IO never crowds out inference.
    pub async fn ensure_installed(&self, model_id: &str) -> Result<PathBuf> {
        let item = self.item(model_id)?.clone();
        let version = item.version.to_string();

        if let Some(dir) = self.installer.model_dir(&item.id, &version) {
            return Ok(dir);
        }

        let installer = self.installer.clone();
        let dir = self.installer.layout().version_dir(&item.id, &version);
        let ticket = self.scheduler.submit(
            TaskSpec::new(TaskType::Download),
            move |cancel| {
                async move {
                    let mut watch = installer.install(&item);
                    let mut cancel_forwarded = false;
                    loop {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled(), if !cancel_forwarded => {
                                watch.cancel();
                                cancel_forwarded = true;
                            }
                            event = watch.recv() => {
                                let Some(event) = event else {
                                    return Err(Error::download(
                                        "install stream closed before a terminal event",
                                    ));
                                };
                                match event.phase {
                                    InstallPhase::Ready => {
                                        return Ok(TaskValue::Path(dir));
                                    }
                                    InstallPhase::Cancelled => return Err(Error::TaskCancelled),
                                    InstallPhase::Failed => {
                                        let wire = event.error.unwrap_or_else(|| {
                                            Error::download("install failed").to_wire()
                                        });
                                        return Err(Error::from(wire));
                                    }
                                    _ => {}
                                }
                            }
                        }
                    }
                }
                .boxed()
            },
        );

        let outcome = ticket
            .completion
            .await
            .map_err(|_| Error::download("install task dropped"))?;
        match (outcome.status, outcome.value) {
            (TaskStatus::Completed, Some(TaskValue::Path(path))) => Ok(path),
            (_, _) => Err(outcome
                .error
                .map(Error::from)
                .unwrap_or(Error::TaskCancelled)),
        }
    }

    /// Load (or reuse) a session for the selected runtime.
    async fn session_for(
        &self,
        item: &ModelItem,
        selected: &SelectedRuntime,
        model_dir: &PathBuf,
    ) -> Result<SessionHandle> {
        let version = item.version.to_string();
        {
            let sessions = self.sessions.read().await;
            if let Some(entry) = sessions.get(&item.id) {
                if entry.version == version && entry.selected == *selected {
                    return Ok(entry.handle.clone());
                }
            }
        }

        let adapter = self
            .adapters
            .available(selected.backend)
            .ok_or_else(|| Error::RuntimeNotAvailable {
                message: format!("no adapter registered for backend {}", selected.backend),
                details: Box::default(),
            })?;

        debug!(model_id = %item.id, backend = %selected.backend, "loading session");
        let handle = adapter.load(selected, model_dir).await?;

        let mut sessions = self.sessions.write().await;
        // A concurrent loader may have won; keep the stored session.
        if let Some(entry) = sessions.get(&item.id) {
            if entry.version == version && entry.selected == *selected {
                let keep = entry.handle.clone();
                drop(sessions);
                let _ = adapter.unload(handle).await;
                return Ok(keep);
            }
        }
        sessions.insert(
            item.id.clone(),
            SessionEntry {
                handle: handle.clone(),
                selected: selected.clone(),
                version,
            },
        );
        Ok(handle)
    }

    /// Stream an LLM generation.
    ///
    /// Resolves the manifest item, selects a runtime, installs artifacts if
    /// missing, loads a session, and submits the generation to the LLM
    /// queue. Events arrive already normalized.
    pub async fn generate(&self, request: GenerationRequest) -> Result<GenerationStream> {
        let item = self.item(&request.model_id)?.clone();
        if item.model_type != ModelType::Llm {
            return Err(Error::ConfigError(format!(
                "model '{}' is {:?}, not an LLM",
                item.id, item.model_type
            )));
        }

        let report = Selector::select(&item, &self.capabilities, &request.hints);
        let selected = match &report.final_decision {
            crate::selector::Decision::Selected { runtime } => runtime.clone(),
            crate::selector::Decision::Failed { error } => {
                return Err(Error::from(error.clone()));
            }
        };

        let model_dir = self.ensure_installed(&item.id).await?;
        let session = self.session_for(&item, &selected, &model_dir).await?;
        let adapter = self
            .adapters
            .available(selected.backend)
            .ok_or_else(|| Error::RuntimeNotAvailable {
                message: format!("no adapter registered for backend {}", selected.backend),
                details: Box::default(),
            })?;

        let params = request
            .params
            .or_else(|| item.default_generation_config.clone())
            .unwrap_or_default()
            .clamped();
        let normalizer_config = NormalizerConfig {
            stop_strings: params.stop_strings.clone(),
            emit_stop_fragment: self.config.stream.emit_stop_fragment,
            metrics_every_n_tokens: self.config.stream.metrics_every_n_tokens,
        };
        let request_id = report.request_id.clone();
        let (tx, events) = mpsc::channel(self.config.stream.event_capacity);

        let mut spec = TaskSpec::new(TaskType::Llm).with_priority(request.priority);
        if let Some(timeout) = request.timeout {
            spec = spec.with_timeout(timeout);
        }

        let worker_request_id = request_id.clone();
        let prompt = request.prompt;
        let ticket = self.scheduler.submit(spec, move |cancel| {
            async move {
                let raw = adapter
                    .stream_generate(&session, prompt, params, cancel.clone())
                    .await?;
                let reason =
                    normalize_into(worker_request_id, normalizer_config, raw, tx, cancel).await;
                match reason {
                    FinishReason::Cancel => Err(Error::TaskCancelled),
                    FinishReason::Error => Err(Error::RuntimeNotAvailable {
                        message: "generation ended in error".into(),
                        details: Box::default(),
                    }),
                    _ => Ok(TaskValue::None),
                }
            }
            .boxed()
        });

        Ok(GenerationStream {
            request_id,
            task_id: ticket.task_id,
            events,
        })
    }

    /// Cancel a task by id. Same semantics as the scheduler's cancel.
    pub fn cancel(&self, task_id: &str) -> bool {
        self.scheduler.cancel(task_id)
    }

    /// Run a request/response task (OCR, STT, TTS, embedding).
    pub async fn run_task(
        &self,
        model_id: &str,
        request: TaskRequest,
        hints: &SelectionHints,
    ) -> Result<TaskResponse> {
        let item = self.item(model_id)?.clone();
        let task_type = match (&request, item.model_type) {
            (TaskRequest::Ocr { .. }, ModelType::Ocr) => TaskType::Ocr,
            (TaskRequest::Stt { .. }, ModelType::Stt) => TaskType::Stt,
            (TaskRequest::Tts { .. }, ModelType::Tts) => TaskType::Tts,
            (TaskRequest::Embedding { .. }, ModelType::Embedding) => TaskType::Embedding,
            (_, other) => {
                return Err(Error::ConfigError(format!(
                    "request does not match model '{}' of type {:?}",
                    item.id, other
                )));
            }
        };

        let report = Selector::select(&item, &self.capabilities, hints);
        let selected = match &report.final_decision {
            crate::selector::Decision::Selected { runtime } => runtime.clone(),
            crate::selector::Decision::Failed { error } => {
                return Err(Error::from(error.clone()));
            }
        };

        let model_dir = self.ensure_installed(&item.id).await?;
        let session = self.session_for(&item, &selected, &model_dir).await?;
        let adapter = self
            .adapters
            .available(selected.backend)
            .ok_or_else(|| Error::RuntimeNotAvailable {
                message: format!("no adapter registered for backend {}", selected.backend),
                details: Box::default(),
            })?;

        let ticket = self.scheduler.submit(TaskSpec::new(task_type), move |cancel| {
            async move {
                let response = adapter.run(&session, request, cancel).await?;
                Ok(match response {
                    TaskResponse::Text(text) => TaskValue::Text(text),
                    TaskResponse::Embedding(vector) => TaskValue::Embedding(vector),
                    TaskResponse::Audio {
                        samples,
                        sample_rate,
                    } => TaskValue::Audio {
                        samples,
                        sample_rate,
                    },
                })
            }
            .boxed()
        });

        let outcome = ticket
            .completion
            .await
            .map_err(|_| Error::download("task dropped"))?;
        match (outcome.status, outcome.value) {
            (TaskStatus::Completed, Some(TaskValue::Text(text))) => Ok(TaskResponse::Text(text)),
            (TaskStatus::Completed, Some(TaskValue::Embedding(vector))) => {
                Ok(TaskResponse::Embedding(vector))
            }
            (
                TaskStatus::Completed,
                Some(TaskValue::Audio {
                    samples,
                    sample_rate,
                }),
            ) => Ok(TaskResponse::Audio {
                samples,
                sample_rate,
            }),
            (_, _) => Err(outcome
                .error
                .map(Error::from)
                .unwrap_or(Error::TaskCancelled)),
        }
    }

    /// Unload a model's session, if one is loaded.
    pub async fn unload(&self, model_id: &str) -> Result<()> {
        let entry = self.sessions.write().await.remove(model_id);
        if let Some(entry) = entry {
            if let Some(adapter) = self.adapters.available(entry.handle.backend) {
                adapter.unload(entry.handle).await?;
            }
        }
        Ok(())
    }

    /// Cancel outstanding work and unload every session.
    pub async fn shutdown(&self) {
        self.scheduler.shutdown();
        let ids: Vec<String> = self.sessions.read().await.keys().cloned().collect();
        for id in ids {
            let _ = self.unload(&id).await;
        }
    }
}
