//! End-to-end install pipeline scenarios over a mock transport.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use semver::Version;
use sha2::{Digest, Sha256};

use indlela_core::install::artifact_url;
use indlela_core::{
    Artifact, ArtifactFetcher, ArtifactRole, Error, ErrorCode, FetchResponse, InstallConfig,
    InstallPhase, InstallProgress, Installer, ModelItem, ModelType,
};

const BASE_URL: &str = "https://models.example";

fn sha256_hex(data: &[u8]) -> String {
    format!("{:x}", Sha256::digest(data))
}

/// Serves canned bodies, counting fetches and optionally pacing chunks.
struct MockFetcher {
    files: HashMap<String, Vec<u8>>,
    chunk_size: usize,
    chunk_delay: Duration,
    fetches: Arc<AtomicUsize>,
}

impl MockFetcher {
    fn new() -> Self {
        Self {
            files: HashMap::new(),
            chunk_size: 16,
            chunk_delay: Duration::ZERO,
            fetches: Arc::new(AtomicUsize::new(0)),
        }
    }

    fn serve(mut self, path: &str, body: &[u8]) -> Self {
        self.files
            .insert(artifact_url(BASE_URL, path), body.to_vec());
        self
    }

    fn paced(mut self, chunk_size: usize, delay: Duration) -> Self {
        self.chunk_size = chunk_size;
        self.chunk_delay = delay;
        self
    }

    fn fetch_count(&self) -> Arc<AtomicUsize> {
        self.fetches.clone()
    }
}

#[async_trait]
impl ArtifactFetcher for MockFetcher {
    async fn fetch(&self, url: &str) -> indlela_core::Result<FetchResponse> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let body = self
            .files
            .get(url)
            .cloned()
            .ok_or_else(|| Error::download(format!("404 for {url}")))?;
        let total = body.len() as u64;
        let delay = self.chunk_delay;
        let chunks: Vec<indlela_core::Result<Bytes>> = body
            .chunks(self.chunk_size.max(1))
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        let stream = futures::stream::iter(chunks).then(move |chunk| async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            chunk
        });
        Ok(FetchResponse {
            total_bytes: Some(total),
            stream: Box::pin(stream),
        })
    }
}

fn item_with_artifacts(id: &str, artifacts: Vec<Artifact>) -> ModelItem {
    ModelItem {
        id: id.into(),
        model_type: ModelType::Llm,
        version: Version::new(1, 0, 0),
        backend_hints: Vec::new(),
        platforms: Default::default(),
        min_sdk_version: Default::default(),
        min_backend_version: Default::default(),
        quantization: None,
        quantization_variants: Vec::new(),
        context_length: None,
        rope_scaling: None,
        rope_theta: None,
        default_generation_config: None,
        chat_template: None,
        special_tokens: Default::default(),
        max_gpu_layers: None,
        required_memory_bytes: None,
        required_artifacts: artifacts,
        optional_artifacts: Vec::new(),
        extra: Default::default(),
    }
}

fn artifact(id: &str, name: &str, body: &[u8]) -> Artifact {
    Artifact {
        name: name.into(),
        role: ArtifactRole::Model,
        format: "gguf".into(),
        path: format!("{id}/{name}"),
        size: body.len() as u64,
        sha256: sha256_hex(body),
        extra: Default::default(),
    }
}

fn installer(cache: &Path, fetcher: MockFetcher) -> Installer {
    Installer::with_fetcher(
        cache.to_path_buf(),
        BASE_URL.into(),
        InstallConfig::default(),
        Arc::new(fetcher),
    )
}

async fn drain(mut watch: indlela_core::InstallWatch) -> Vec<InstallProgress> {
    let mut events = Vec::new();
    while let Some(event) = watch.recv().await {
        let terminal = event.is_terminal();
        events.push(event);
        if terminal {
            break;
        }
    }
    events
}

#[tokio::test]
async fn test_install_happy_path() {
    let cache = tempfile::tempdir().unwrap();
    let body = b"fake model weights, long enough for several chunks".as_slice();
    let item = item_with_artifacts("m1", vec![artifact("m1", "model.gguf", body)]);
    let fetcher = MockFetcher::new().serve("m1/model.gguf", body);
    let installer = installer(cache.path(), fetcher);

    let events = drain(installer.install(&item)).await;

    // Phases arrive in order and exactly one terminal closes the stream.
    let phases: Vec<InstallPhase> = events.iter().map(|e| e.phase).collect();
    assert_eq!(phases.first(), Some(&InstallPhase::Downloading));
    assert!(phases.contains(&InstallPhase::Verifying));
    assert_eq!(phases.last(), Some(&InstallPhase::Ready));
    assert_eq!(
        events.iter().filter(|e| e.is_terminal()).count(),
        1,
        "exactly one terminal event"
    );

    // On disk: artifact bytes verified, sentinel present.
    let dir = cache.path().join("m1").join("1.0.0");
    assert_eq!(std::fs::read(dir.join("model.gguf")).unwrap(), body);
    assert!(dir.join(".ready").exists());
    assert_eq!(installer.installed_models().len(), 1);
}

#[tokio::test]
async fn test_verify_fail_then_retry() {
    let cache = tempfile::tempdir().unwrap();
    let good = b"the real artifact bytes".as_slice();
    let item = item_with_artifacts("m1", vec![artifact("m1", "model.gguf", good)]);

    // First transport serves corrupted bytes.
    let bad_fetcher = MockFetcher::new().serve("m1/model.gguf", b"corrupted stream!");
    let bad_installer = installer(cache.path(), bad_fetcher);
    let events = drain(bad_installer.install(&item)).await;

    let terminal = events.last().unwrap();
    assert_eq!(terminal.phase, InstallPhase::Failed);
    let error = terminal.error.as_ref().unwrap();
    assert_eq!(error.code, ErrorCode::ModelVerifyFailed);
    assert!(error.retriable);
    let details = error.details.as_ref().unwrap();
    assert_eq!(details.expected_sha256.as_deref(), Some(&*sha256_hex(good)));
    assert_eq!(
        details.actual_sha256.as_deref(),
        Some(&*sha256_hex(b"corrupted stream!"))
    );
    let phases: Vec<InstallPhase> = events.iter().map(|e| e.phase).collect();
    assert!(phases.contains(&InstallPhase::Downloading));
    assert!(phases.contains(&InstallPhase::Verifying));

    // Neither the final name nor any temp file survived.
    let dir = cache.path().join("m1").join("1.0.0");
    assert!(!dir.join("model.gguf").exists());
    let leftovers: Vec<_> = std::fs::read_dir(&dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
        .collect();
    assert!(leftovers.is_empty(), "temp files must be deleted");

    // A corrected transport succeeds from scratch.
    let good_fetcher = MockFetcher::new().serve("m1/model.gguf", good);
    let good_installer = installer(cache.path(), good_fetcher);
    let events = drain(good_installer.install(&item)).await;
    assert_eq!(events.last().unwrap().phase, InstallPhase::Ready);
    assert_eq!(std::fs::read(dir.join("model.gguf")).unwrap(), good);
}

#[tokio::test]
async fn test_concurrent_installs_share_single_flight() {
    let cache = tempfile::tempdir().unwrap();
    let body = vec![7u8; 4096];
    let item = item_with_artifacts("llama3.1-8b-q4km", vec![artifact(
        "llama3.1-8b-q4km",
        "model.gguf",
        &body,
    )]);
    let fetcher = MockFetcher::new()
        .serve("llama3.1-8b-q4km/model.gguf", &body)
        .paced(256, Duration::from_millis(5));
    let fetches = fetcher.fetch_count();
    let installer = installer(cache.path(), fetcher);

    let first = installer.install(&item);
    tokio::time::sleep(Duration::from_millis(10)).await;
    let second = installer.install(&item);

    assert_eq!(first.request_id, second.request_id, "same in-flight install");

    let (a, b) = tokio::join!(drain(first), drain(second));
    assert_eq!(a.last().unwrap().phase, InstallPhase::Ready);
    assert_eq!(b.last().unwrap().phase, InstallPhase::Ready);
    assert_eq!(fetches.load(Ordering::SeqCst), 1, "one download at most");
}

#[tokio::test]
async fn test_install_is_idempotent_when_ready() {
    let cache = tempfile::tempdir().unwrap();
    let body = b"bytes".as_slice();
    let item = item_with_artifacts("m1", vec![artifact("m1", "model.gguf", body)]);
    let fetcher = MockFetcher::new().serve("m1/model.gguf", body);
    let fetches = fetcher.fetch_count();
    let installer = installer(cache.path(), fetcher);

    drain(installer.install(&item)).await;
    assert_eq!(fetches.load(Ordering::SeqCst), 1);

    let events = drain(installer.install(&item)).await;
    assert_eq!(events.len(), 1, "single ready event");
    assert_eq!(events[0].phase, InstallPhase::Ready);
    assert_eq!(fetches.load(Ordering::SeqCst), 1, "no further network I/O");
}

#[tokio::test]
async fn test_cancel_leaves_no_partial_files() {
    let cache = tempfile::tempdir().unwrap();
    let body = vec![3u8; 64 * 1024];
    let item = item_with_artifacts("m1", vec![artifact("m1", "model.gguf", &body)]);
    let fetcher = MockFetcher::new()
        .serve("m1/model.gguf", &body)
        .paced(1024, Duration::from_millis(5));
    let installer = installer(cache.path(), fetcher);

    let mut watch = installer.install(&item);
    // Let a few chunks land, then cancel.
    let first = watch.recv().await.unwrap();
    assert_eq!(first.phase, InstallPhase::Downloading);
    assert!(installer.cancel("m1", "1.0.0"));

    let mut terminal = None;
    while let Some(event) = watch.recv().await {
        if event.is_terminal() {
            terminal = Some(event);
            break;
        }
    }
    assert_eq!(terminal.unwrap().phase, InstallPhase::Cancelled);

    let dir = cache.path().join("m1").join("1.0.0");
    assert!(!dir.join("model.gguf").exists());
    assert!(!dir.join(".ready").exists());
    let tmp_files: Vec<_> = std::fs::read_dir(&dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().contains(".tmp."))
        .collect();
    assert!(tmp_files.is_empty());
}

#[tokio::test]
async fn test_network_error_is_retriable_failure() {
    let cache = tempfile::tempdir().unwrap();
    let body = b"data".as_slice();
    let item = item_with_artifacts("m1", vec![artifact("m1", "model.gguf", body)]);
    // Nothing served: every fetch 404s.
    let installer = installer(cache.path(), MockFetcher::new());

    let events = drain(installer.install(&item)).await;
    let terminal = events.last().unwrap();
    assert_eq!(terminal.phase, InstallPhase::Failed);
    let error = terminal.error.as_ref().unwrap();
    assert_eq!(error.code, ErrorCode::DownloadFailed);
    assert!(error.retriable);
}

#[tokio::test]
async fn test_recover_drops_unready_versions() {
    let cache = tempfile::tempdir().unwrap();

    // Simulate a crash: files and stage present, no sentinel.
    let partial = cache.path().join("m1").join("1.0.0");
    std::fs::create_dir_all(partial.join(".stage")).unwrap();
    std::fs::write(partial.join("model.gguf.tmp.9f"), b"half").unwrap();
    std::fs::write(partial.join("model.gguf"), b"half").unwrap();

    let installer = installer(cache.path(), MockFetcher::new());
    installer.recover().unwrap();

    assert!(!partial.exists(), "unready version is garbage-collected");
}

#[tokio::test]
async fn test_multi_artifact_install_verifies_each() {
    let cache = tempfile::tempdir().unwrap();
    let weights = b"weights-bytes".as_slice();
    let tokenizer = b"{\"vocab\": []}".as_slice();
    let mut tok = artifact("m1", "tokenizer.json", tokenizer);
    tok.role = ArtifactRole::Tokenizer;
    tok.format = "json".into();
    let item = item_with_artifacts(
        "m1",
        vec![artifact("m1", "model.gguf", weights), tok],
    );
    let fetcher = MockFetcher::new()
        .serve("m1/model.gguf", weights)
        .serve("m1/tokenizer.json", tokenizer);
    let installer = installer(cache.path(), fetcher);

    let events = drain(installer.install(&item)).await;
    assert_eq!(events.last().unwrap().phase, InstallPhase::Ready);

    let dir = cache.path().join("m1").join("1.0.0");
    assert_eq!(sha256_hex(&std::fs::read(dir.join("model.gguf")).unwrap()), sha256_hex(weights));
    assert_eq!(
        sha256_hex(&std::fs::read(dir.join("tokenizer.json")).unwrap()),
        sha256_hex(tokenizer)
    );
    // Total received equals the declared artifact sizes.
    let terminal = events.last().unwrap();
    assert_eq!(
        terminal.total_bytes,
        (weights.len() + tokenizer.len()) as u64
    );
}

#[tokio::test]
async fn test_activate_and_remove_guard() {
    let cache = tempfile::tempdir().unwrap();
    let body = b"v1 bytes".as_slice();
    let item = item_with_artifacts("m1", vec![artifact("m1", "model.gguf", body)]);
    let fetcher = MockFetcher::new().serve("m1/model.gguf", body);
    let installer = installer(cache.path(), fetcher);

    drain(installer.install(&item)).await;
    installer.activate("m1", "1.0.0").unwrap();
    assert_eq!(
        installer.layout().active_version("m1").as_deref(),
        Some("1.0.0")
    );

    // The active version refuses removal.
    let err = installer.remove("m1", "1.0.0").unwrap_err();
    assert_eq!(err.code(), ErrorCode::ConfigError);
    assert!(cache.path().join("m1").join("1.0.0").join(".ready").exists());
}

#[tokio::test]
async fn test_lru_eviction_spares_active_version() {
    let cache = tempfile::tempdir().unwrap();
    let body_a = vec![1u8; 2048];
    let body_b = vec![2u8; 2048];
    let item_a = item_with_artifacts("m-old", vec![artifact("m-old", "model.gguf", &body_a)]);
    let item_b = item_with_artifacts("m-new", vec![artifact("m-new", "model.gguf", &body_b)]);

    let fetcher = MockFetcher::new()
        .serve("m-old/model.gguf", &body_a)
        .serve("m-new/model.gguf", &body_b);
    let config = InstallConfig {
        cache_budget_bytes: Some(3000),
        ..Default::default()
    };
    let installer = Installer::with_fetcher(
        cache.path().to_path_buf(),
        BASE_URL.into(),
        config,
        Arc::new(fetcher),
    );

    drain(installer.install(&item_a)).await;
    tokio::time::sleep(Duration::from_millis(10)).await;
    // Installing the second model crosses the budget; the older entry goes.
    drain(installer.install(&item_b)).await;
    installer.enforce_space().unwrap();

    assert!(!installer.is_ready("m-old", "1.0.0"));
    assert!(installer.is_ready("m-new", "1.0.0"));
}
