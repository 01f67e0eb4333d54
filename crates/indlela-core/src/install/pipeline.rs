//! Single-flight install pipeline.
//!
//! One worker owns each in-flight `(modelId, version)` install; concurrent
//! submitters share its progress stream and terminal outcome. Artifacts
//! download to `*.tmp.{suffix}` siblings with the SHA-256 computed while
//! streaming, verify against the manifest digest, and rename into place
//! within the same filesystem. The readiness sentinel is written last and
//! is the sole proof of completion.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use fs2::FileExt;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{InstallConfig, RuntimeConfig};
use crate::error::{Error, ErrorCode, Result};
use crate::install::fetcher::{artifact_url, ArtifactFetcher, HttpFetcher};
use crate::install::index::{LocalModel, LocalModelIndex};
use crate::install::layout::{self, CacheLayout, STAGE_DIR};
use crate::install::progress::{InstallPhase, InstallProgress, ProgressEmitter, ProgressMirror};
use crate::manifest::{Artifact, ModelItem};

/// Key identifying one install: `(modelId, version)`.
pub type InstallKey = (String, String);

/// Caller's view of an install: the shared request id, the progress
/// stream, and a cancellation handle.
pub struct InstallWatch {
    pub request_id: String,
    receiver: broadcast::Receiver<InstallProgress>,
    cancel: CancellationToken,
}

impl InstallWatch {
    /// Next progress event; `None` once the stream is closed. Lagged
    /// intervals are skipped, never surfaced as errors.
    pub async fn recv(&mut self) -> Option<InstallProgress> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => return Some(event),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    debug!(skipped, "install progress lagged");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Drain until the terminal event.
    pub async fn wait_terminal(mut self) -> Result<InstallProgress> {
        while let Some(event) = self.recv().await {
            if event.is_terminal() {
                return Ok(event);
            }
        }
        Err(Error::download("install stream closed before a terminal event"))
    }

    /// Request cooperative cancellation of the underlying install.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Lazy stream view of the progress events.
    pub fn into_stream(self) -> impl futures::Stream<Item = InstallProgress> {
        tokio_stream::wrappers::BroadcastStream::new(self.receiver)
            .filter_map(|event| async move { event.ok() })
    }
}

struct Inflight {
    request_id: String,
    tx: broadcast::Sender<InstallProgress>,
    cancel: CancellationToken,
    last: ProgressMirror,
}

/// The install pipeline.
#[derive(Clone)]
pub struct Installer {
    config: InstallConfig,
    base_url: String,
    layout: CacheLayout,
    fetcher: Arc<dyn ArtifactFetcher>,
    inflight: Arc<Mutex<HashMap<InstallKey, Inflight>>>,
    index: Arc<Mutex<LocalModelIndex>>,
}

impl Installer {
    /// Build the default HTTP-backed installer.
    pub fn new(config: &RuntimeConfig) -> Result<Self> {
        let fetcher = Arc::new(HttpFetcher::new(&config.install)?);
        Ok(Self::with_fetcher(
            config.cache_dir.clone(),
            config.artifact_base_url.clone(),
            config.install.clone(),
            fetcher,
        ))
    }

    /// Build with a custom transport.
    pub fn with_fetcher(
        cache_dir: PathBuf,
        base_url: String,
        config: InstallConfig,
        fetcher: Arc<dyn ArtifactFetcher>,
    ) -> Self {
        let layout = CacheLayout::new(cache_dir);
        let index = LocalModelIndex::load(&layout.index_path());
        Self {
            config,
            base_url,
            layout,
            fetcher,
            inflight: Arc::new(Mutex::new(HashMap::new())),
            index: Arc::new(Mutex::new(index)),
        }
    }

    pub fn layout(&self) -> &CacheLayout {
        &self.layout
    }

    /// Delete leftovers of interrupted installs. Call once at startup.
    pub fn recover(&self) -> Result<()> {
        self.layout.recover()?;
        // Drop index entries whose sentinel disappeared.
        let mut index = self.index.lock().unwrap();
        index
            .models
            .retain(|m| self.layout.is_ready(&m.model_id, &m.version));
        index.save(&self.layout.index_path())
    }

    /// Installed models as recorded in the index.
    pub fn installed_models(&self) -> Vec<LocalModel> {
        self.index.lock().unwrap().models.clone()
    }

    /// Whether a version is ready on disk.
    pub fn is_ready(&self, model_id: &str, version: &str) -> bool {
        self.layout.is_ready(model_id, version)
    }

    /// Path of a ready version directory.
    pub fn model_dir(&self, model_id: &str, version: &str) -> Option<PathBuf> {
        if self.is_ready(model_id, version) {
            Some(self.layout.version_dir(model_id, version))
        } else {
            None
        }
    }

    /// Start (or join) the install of a manifest item.
    ///
    /// Concurrent calls for the same `(modelId, version)` share one worker:
    /// the same request id, the same progress stream, one download.
    pub fn install(&self, item: &ModelItem) -> InstallWatch {
        let model_id = item.id.clone();
        let version = item.version.to_string();
        let key = (model_id.clone(), version.clone());
        let total_bytes = item.required_size();

        let mut inflight = self.inflight.lock().unwrap();

        if let Some(existing) = inflight.get(&key) {
            return InstallWatch {
                request_id: existing.request_id.clone(),
                receiver: existing.tx.subscribe(),
                cancel: existing.cancel.clone(),
            };
        }

        // Idempotent fast path: a ready version emits one `ready` event and
        // performs no network I/O.
        if self.layout.is_ready(&model_id, &version) {
            let request_id = Uuid::new_v4().to_string();
            let (tx, receiver) = broadcast::channel(8);
            let mut emitter = ProgressEmitter::new(
                tx,
                request_id.clone(),
                model_id.clone(),
                version.clone(),
                total_bytes,
                Duration::from_millis(self.config.progress_interval_ms),
            );
            {
                let mut index = self.index.lock().unwrap();
                index.touch(&model_id, &version);
                let _ = index.save(&self.layout.index_path());
            }
            emitter.ready();
            return InstallWatch {
                request_id,
                receiver,
                cancel: CancellationToken::new(),
            };
        }

        let request_id = Uuid::new_v4().to_string();
        let (tx, receiver) = broadcast::channel(256);
        let cancel = CancellationToken::new();
        let last: ProgressMirror = Default::default();
        inflight.insert(
            key.clone(),
            Inflight {
                request_id: request_id.clone(),
                tx: tx.clone(),
                cancel: cancel.clone(),
                last: last.clone(),
            },
        );
        drop(inflight);

        info!(model_id = %model_id, version = %version, request_id = %request_id, "install started");
        let installer = self.clone();
        let item = item.clone();
        let worker_request_id = request_id.clone();
        let worker_cancel = cancel.clone();
        tokio::spawn(async move {
            installer
                .run_worker(item, key, worker_request_id, tx, worker_cancel, last)
                .await;
        });

        InstallWatch {
            request_id,
            receiver,
            cancel,
        }
    }

    /// Subscribe to an in-flight install, if one exists for the key.
    pub fn watch(&self, model_id: &str, version: &str) -> Option<InstallWatch> {
        let inflight = self.inflight.lock().unwrap();
        inflight
            .get(&(model_id.to_string(), version.to_string()))
            .map(|f| InstallWatch {
                request_id: f.request_id.clone(),
                receiver: f.tx.subscribe(),
                cancel: f.cancel.clone(),
            })
    }

    /// Most recent progress record of an in-flight install.
    pub fn install_state(&self, model_id: &str, version: &str) -> Option<InstallProgress> {
        let inflight = self.inflight.lock().unwrap();
        inflight
            .get(&(model_id.to_string(), version.to_string()))
            .and_then(|f| f.last.lock().unwrap().clone())
    }

    /// Cancel an in-flight install. Returns false when none is running.
    pub fn cancel(&self, model_id: &str, version: &str) -> bool {
        let inflight = self.inflight.lock().unwrap();
        match inflight.get(&(model_id.to_string(), version.to_string())) {
            Some(f) => {
                f.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Mark a ready version as the active one for its model.
    pub fn activate(&self, model_id: &str, version: &str) -> Result<()> {
        if !self.layout.is_ready(model_id, version) {
            return Err(Error::ModelNotFound(format!("{model_id}@{version}")));
        }
        self.layout.set_active(model_id, version)?;
        let mut index = self.index.lock().unwrap();
        index.touch(model_id, version);
        index.save(&self.layout.index_path())
    }

    /// Remove an installed version. The active version is refused.
    pub fn remove(&self, model_id: &str, version: &str) -> Result<()> {
        if self.layout.active_version(model_id).as_deref() == Some(version) {
            return Err(Error::ConfigError(format!(
                "cannot remove active version {model_id}@{version}"
            )));
        }
        if self
            .inflight
            .lock()
            .unwrap()
            .contains_key(&(model_id.to_string(), version.to_string()))
        {
            return Err(Error::ConfigError(format!(
                "install of {model_id}@{version} is in flight"
            )));
        }
        let dir = self.layout.version_dir(model_id, version);
        if dir.exists() {
            std::fs::remove_dir_all(&dir)?;
        }
        let mut index = self.index.lock().unwrap();
        index.remove(model_id, version);
        index.save(&self.layout.index_path())
    }

    /// Evict least-recently-used ready versions until the cache fits the
    /// configured budget. The active version of a model is never evicted.
    /// Returns the number of versions removed.
    pub fn enforce_space(&self) -> Result<usize> {
        let Some(budget) = self.config.cache_budget_bytes else {
            return Ok(0);
        };
        let victims: Vec<LocalModel> = {
            let index = self.index.lock().unwrap();
            let mut total = index.total_size();
            let mut victims = Vec::new();
            for model in index.lru_order() {
                if total <= budget {
                    break;
                }
                if self.layout.active_version(&model.model_id).as_deref()
                    == Some(model.version.as_str())
                {
                    continue;
                }
                total = total.saturating_sub(model.size_bytes);
                victims.push(model.clone());
            }
            victims
        };

        for victim in &victims {
            info!(
                model_id = %victim.model_id,
                version = %victim.version,
                "evicting LRU version"
            );
            let dir = self.layout.version_dir(&victim.model_id, &victim.version);
            if dir.exists() {
                std::fs::remove_dir_all(&dir)?;
            }
            let mut index = self.index.lock().unwrap();
            index.remove(&victim.model_id, &victim.version);
            index.save(&self.layout.index_path())?;
        }
        Ok(victims.len())
    }

    async fn run_worker(
        &self,
        item: ModelItem,
        key: InstallKey,
        request_id: String,
        tx: broadcast::Sender<InstallProgress>,
        cancel: CancellationToken,
        last: ProgressMirror,
    ) {
        let mut emitter = ProgressEmitter::new(
            tx,
            request_id,
            key.0.clone(),
            key.1.clone(),
            item.required_size(),
            Duration::from_millis(self.config.progress_interval_ms),
        )
        .with_mirror(last);

        let result = self.run_install(&item, &key, &mut emitter, &cancel).await;

        // Deregister before the terminal event so a late joiner either sees
        // the broadcast or restarts against the on-disk state.
        self.inflight.lock().unwrap().remove(&key);

        let dir = self.layout.version_dir(&key.0, &key.1);
        match result {
            Ok(()) => {
                info!(model_id = %key.0, version = %key.1, "install ready");
                emitter.ready();
            }
            Err(err) if err.code() == ErrorCode::TaskCancelled => {
                info!(model_id = %key.0, version = %key.1, "install cancelled");
                let _ = cleanup_partial(&dir);
                emitter.cancelled();
            }
            Err(err) => {
                warn!(model_id = %key.0, version = %key.1, error = %err, "install failed");
                let _ = cleanup_partial(&dir);
                emitter.failed(err.to_wire());
            }
        }

        if let Err(err) = self.enforce_space() {
            warn!(error = %err, "cache eviction failed");
        }
    }

    async fn run_install(
        &self,
        item: &ModelItem,
        key: &InstallKey,
        emitter: &mut ProgressEmitter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let dir = self.layout.version_dir(&key.0, &key.1);
        tokio::fs::create_dir_all(&dir).await?;

        // Cross-process serialization on the version directory.
        let _lock = acquire_dir_lock(self.layout.lock_file(&key.0, &key.1)).await?;

        // Another process may have completed while we waited on the lock.
        if self.layout.is_ready(&key.0, &key.1) {
            return Ok(());
        }

        emitter.phase(InstallPhase::Downloading);
        let mut downloads: Vec<(&Artifact, PathBuf, String)> = Vec::new();
        for artifact in &item.required_artifacts {
            let (tmp, digest) = self
                .download_artifact(artifact, &dir, emitter, cancel)
                .await?;
            downloads.push((artifact, tmp, digest));
        }
        for artifact in &item.optional_artifacts {
            match self.download_artifact(artifact, &dir, emitter, cancel).await {
                Ok((tmp, digest)) => downloads.push((artifact, tmp, digest)),
                Err(err) if err.code() == ErrorCode::TaskCancelled => return Err(err),
                Err(err) => {
                    warn!(artifact = %artifact.name, error = %err, "optional artifact skipped");
                }
            }
        }

        emitter.phase(InstallPhase::Verifying);
        for (artifact, tmp, digest) in &downloads {
            if cancel.is_cancelled() {
                return Err(Error::TaskCancelled);
            }
            if digest != &artifact.sha256 {
                let _ = tokio::fs::remove_file(tmp).await;
                return Err(Error::VerifyFailed {
                    artifact: artifact.name.clone(),
                    expected_sha256: artifact.sha256.clone(),
                    actual_sha256: digest.clone(),
                });
            }
        }
        // Rename only once every artifact verified, so a failed install
        // never leaves a final-named file behind. Same-directory renames
        // keep each swap atomic.
        for (artifact, tmp, _) in &downloads {
            tokio::fs::rename(tmp, dir.join(&artifact.name)).await?;
        }

        if item.has_archives() {
            emitter.phase(InstallPhase::Extracting);
            self.extract_archives(item, &dir, cancel).await?;
        }

        let size_bytes = CacheLayout::dir_size(&dir)?;
        {
            let mut index = self.index.lock().unwrap();
            index.upsert(LocalModel {
                model_id: key.0.clone(),
                version: key.1.clone(),
                path: dir.clone(),
                size_bytes,
                installed_at: Utc::now(),
                last_used_at: Utc::now(),
            });
            index.save(&self.layout.index_path())?;
        }

        // Sentinel last: its presence is the only proof of completion, so
        // it must be durable before any `ready` event goes out.
        let sentinel = self.layout.sentinel(&key.0, &key.1);
        let file = tokio::fs::File::create(&sentinel).await?;
        file.sync_all().await?;

        Ok(())
    }

    async fn download_artifact(
        &self,
        artifact: &Artifact,
        dir: &Path,
        emitter: &mut ProgressEmitter,
        cancel: &CancellationToken,
    ) -> Result<(PathBuf, String)> {
        let url = artifact_url(&self.base_url, &artifact.path);
        let response = self.fetcher.fetch(&url).await?;

        let tmp = dir.join(format!("{}.tmp.{:08x}", artifact.name, rand::random::<u32>()));
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut hasher = Sha256::new();
        let mut stream = response.stream;

        while let Some(chunk) = stream.next().await {
            if cancel.is_cancelled() {
                drop(file);
                let _ = tokio::fs::remove_file(&tmp).await;
                return Err(Error::TaskCancelled);
            }
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await.map_err(Error::download_io)?;
            emitter.downloaded(chunk.len() as u64);
        }

        file.flush().await.map_err(Error::download_io)?;
        file.sync_all().await.map_err(Error::download_io)?;

        let digest = format!("{:x}", hasher.finalize());
        debug!(artifact = %artifact.name, digest = %digest, "artifact downloaded");
        Ok((tmp, digest))
    }

    /// Extract archive artifacts through `.stage/`, re-verifying any
    /// manifest artifact the archive contains before moving it into place.
    async fn extract_archives(
        &self,
        item: &ModelItem,
        dir: &Path,
        cancel: &CancellationToken,
    ) -> Result<()> {
        for artifact in item.artifacts().filter(|a| a.is_archive()) {
            if cancel.is_cancelled() {
                return Err(Error::TaskCancelled);
            }
            let stage = dir.join(STAGE_DIR);
            tokio::fs::create_dir_all(&stage).await?;

            let archive_path = dir.join(&artifact.name);
            if !archive_path.exists() {
                // An optional archive that failed to download was skipped.
                continue;
            }
            let format = artifact.format.clone();
            let stage_clone = stage.clone();
            tokio::task::spawn_blocking(move || extract_archive(&format, &archive_path, &stage_clone))
                .await
                .map_err(|e| Error::download(format!("extraction task failed: {e}")))??;

            for contained in item.artifacts().filter(|a| !a.is_archive()) {
                let staged = stage.join(&contained.name);
                if !staged.exists() {
                    continue;
                }
                let digest = hash_file(&staged).await?;
                if digest != contained.sha256 {
                    return Err(Error::VerifyFailed {
                        artifact: contained.name.clone(),
                        expected_sha256: contained.sha256.clone(),
                        actual_sha256: digest,
                    });
                }
            }

            // Stage verified; move its entries over the real directory.
            let mut entries = tokio::fs::read_dir(&stage).await?;
            while let Some(entry) = entries.next_entry().await? {
                let target = dir.join(entry.file_name());
                tokio::fs::rename(entry.path(), target).await?;
            }
            tokio::fs::remove_dir_all(&stage).await?;
        }
        Ok(())
    }
}

/// Take the advisory lock on `.lock`, blocking off-runtime.
async fn acquire_dir_lock(path: PathBuf) -> Result<std::fs::File> {
    tokio::task::spawn_blocking(move || -> Result<std::fs::File> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)?;
        file.lock_exclusive()?;
        Ok(file)
    })
    .await
    .map_err(|e| Error::download(format!("lock task failed: {e}")))?
}

fn cleanup_partial(dir: &Path) -> Result<()> {
    if dir.exists() {
        layout::clean_install_leftovers(dir)?;
    }
    Ok(())
}

fn extract_archive(format: &str, archive: &Path, dest: &Path) -> Result<()> {
    match format {
        "tar.gz" | "tgz" => {
            let file = std::fs::File::open(archive)?;
            let gz = flate2::read::GzDecoder::new(file);
            let mut tar = tar::Archive::new(gz);
            tar.unpack(dest)
                .map_err(|e| Error::download(format!("tar.gz extraction failed: {e}")))?;
            Ok(())
        }
        "zip" => {
            let file = std::fs::File::open(archive)?;
            let mut zip = zip::ZipArchive::new(file)
                .map_err(|e| Error::download(format!("zip archive unreadable: {e}")))?;
            zip.extract(dest)
                .map_err(|e| Error::download(format!("zip extraction failed: {e}")))?;
            Ok(())
        }
        other => Err(Error::InvalidModelFormat(format!(
            "unsupported archive format '{other}'"
        ))),
    }
}

/// Streaming SHA-256 of a file on disk.
pub async fn hash_file(path: &Path) -> Result<String> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 1024 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
