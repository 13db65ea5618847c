//! End-to-end engine tests over an in-process upstream: sync, publish,
//! resolve, webhook-triggered resync, and read/publish isolation.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;

use remotedoc::config::{RepositoryConfig, SyncConfig};
use remotedoc::error::{FetchError, ReadError};
use remotedoc::fetcher::{RepoMetadata, Upstream};
use remotedoc::registry::{Registry, RepoKey};
use remotedoc::resolver::Resolver;
use remotedoc::store::MirrorStore;
use remotedoc::sync::{SyncOrchestrator, SyncOutcome, SyncReason, SyncTask};
use remotedoc::webhook::{WebhookEvent, WebhookVerifier};

/// Upstream serving versioned file trees from memory.
struct MemoryUpstream {
    state: Mutex<MemoryState>,
}

struct MemoryState {
    head: String,
    files: HashMap<String, String>,
    fail_next: Option<String>,
}

impl MemoryUpstream {
    fn new(head: &str, files: &[(&str, &str)]) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(MemoryState {
                head: head.to_string(),
                files: to_map(files),
                fail_next: None,
            }),
        })
    }

    fn push(&self, head: &str, files: &[(&str, &str)]) {
        let mut state = self.state.lock().unwrap();
        state.head = head.to_string();
        state.files = to_map(files);
    }

    fn fail_next(&self, message: &str) {
        self.state.lock().unwrap().fail_next = Some(message.to_string());
    }
}

fn to_map(files: &[(&str, &str)]) -> HashMap<String, String> {
    files
        .iter()
        .map(|(p, c)| (p.to_string(), c.to_string()))
        .collect()
}

#[async_trait]
impl Upstream for MemoryUpstream {
    async fn remote_head(&self, _config: &RepositoryConfig) -> Result<String, FetchError> {
        let mut state = self.state.lock().unwrap();
        if let Some(message) = state.fail_next.take() {
            return Err(FetchError::Network { message });
        }
        Ok(state.head.clone())
    }

    async fn fetch_into(
        &self,
        _config: &RepositoryConfig,
        staging: &Path,
    ) -> Result<String, FetchError> {
        let state = self.state.lock().unwrap();
        for (path, content) in &state.files {
            let full = staging.join(path);
            std::fs::create_dir_all(full.parent().unwrap()).unwrap();
            std::fs::write(full, content).unwrap();
        }
        Ok(state.head.clone())
    }

    async fn repo_metadata(&self, _config: &RepositoryConfig) -> Result<RepoMetadata, FetchError> {
        Ok(RepoMetadata::default())
    }
}

struct Harness {
    _tmp: tempfile::TempDir,
    upstream: Arc<MemoryUpstream>,
    registry: Arc<Registry>,
    store: Arc<MirrorStore>,
    orchestrator: Arc<SyncOrchestrator>,
    resolver: Resolver,
}

fn repo_config() -> RepositoryConfig {
    RepositoryConfig {
        owner: "octo".to_string(),
        repo: "widgets".to_string(),
        branch: "main".to_string(),
        root_spec_path: "spec.md".to_string(),
        access_token: None,
    }
}

fn key() -> RepoKey {
    repo_config().key()
}

fn harness(upstream: Arc<MemoryUpstream>) -> Harness {
    let tmp = tempfile::tempdir().unwrap();
    let registry = Arc::new(Registry::new([repo_config()]));
    let store = Arc::new(MirrorStore::open(tmp.path()).unwrap());
    let orchestrator = SyncOrchestrator::new(
        registry.clone(),
        store.clone(),
        upstream.clone(),
        SyncConfig::default(),
    );
    let resolver = Resolver::new(registry.clone(), store.clone());
    Harness {
        _tmp: tmp,
        upstream,
        registry,
        store,
        orchestrator,
        resolver,
    }
}

fn manual_task() -> SyncTask {
    SyncTask {
        key: key(),
        reason: SyncReason::Manual,
    }
}

#[tokio::test]
async fn test_sync_then_read_with_link_rewriting() {
    let h = harness(MemoryUpstream::new(
        "rev1",
        &[
            ("spec.md", "# Widgets\n\nSee the [guide](docs/guide.md)."),
            ("docs/guide.md", "Back to [spec](../spec.md)."),
        ],
    ));

    h.orchestrator.run_task(manual_task()).await;

    let spec = h.resolver.read("remotedoc://octo/widgets/main/spec.md").unwrap();
    assert!(spec.contains("[guide](remotedoc://octo/widgets/main/docs/guide.md)"));

    let guide = h
        .resolver
        .read("remotedoc://octo/widgets/main/docs/guide.md")
        .unwrap();
    assert!(guide.contains("[spec](remotedoc://octo/widgets/main/spec.md)"));
}

#[tokio::test]
async fn test_read_before_first_sync_is_not_synced() {
    let h = harness(MemoryUpstream::new("rev1", &[("spec.md", "x")]));
    assert!(matches!(
        h.resolver.read("remotedoc://octo/widgets/main/spec.md"),
        Err(ReadError::NotSynced { .. })
    ));
}

#[tokio::test]
async fn test_failed_resync_keeps_serving_previous_content() {
    let h = harness(MemoryUpstream::new("rev1", &[("spec.md", "version one")]));
    h.orchestrator.run_task(manual_task()).await;

    h.upstream.fail_next("upstream unreachable");
    let outcome = h.orchestrator.run_task(manual_task()).await;
    assert!(matches!(outcome, SyncOutcome::Failed { .. }));

    let content = h.resolver.read("remotedoc://octo/widgets/main/spec.md").unwrap();
    assert_eq!(content, "version one");
}

#[tokio::test]
async fn test_webhook_push_triggers_resync_of_named_repo() {
    let h = harness(MemoryUpstream::new("rev1", &[("spec.md", "v1")]));
    h.orchestrator.run_task(manual_task()).await;

    h.upstream.push("rev2", &[("spec.md", "v2")]);

    let secret = "hook-secret";
    let verifier = WebhookVerifier::new(h.registry.clone(), secret);
    let payload = serde_json::json!({
        "ref": "refs/heads/main",
        "repository": { "name": "widgets", "owner": { "login": "octo" } },
    })
    .to_string()
    .into_bytes();

    let mut mac = Hmac::<Sha256>::new_from_slice(secret.as_bytes()).unwrap();
    mac.update(&payload);
    let signature = format!("sha256={}", hex::encode(mac.finalize().into_bytes()));

    let task = verifier
        .handle(&WebhookEvent {
            event_type: "push".to_string(),
            signature: Some(signature),
            payload,
        })
        .unwrap();
    assert_eq!(task.key, key());

    h.orchestrator.run_task(task).await;
    let content = h.resolver.read("remotedoc://octo/widgets/main/spec.md").unwrap();
    assert_eq!(content, "v2");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_reads_never_observe_a_mixed_generation() {
    let h = harness(MemoryUpstream::new(
        "rev1",
        &[("a.md", "rev1"), ("b.md", "rev1")],
    ));
    h.orchestrator.run_task(manual_task()).await;

    let resolver = Arc::new(Resolver::new(h.registry.clone(), h.store.clone()));
    let mut readers = Vec::new();
    for _ in 0..4 {
        let resolver = resolver.clone();
        readers.push(tokio::spawn(async move {
            for _ in 0..100 {
                let a = resolver.read("remotedoc://octo/widgets/main/a.md").unwrap();
                let b = resolver.read("remotedoc://octo/widgets/main/b.md").unwrap();
                // Each individual read is against one pinned generation;
                // the pair check just widens the net.
                assert!(a.starts_with("rev") && b.starts_with("rev"));
            }
        }));
    }

    let writer = {
        let orchestrator = h.orchestrator.clone();
        let upstream = h.upstream.clone();
        tokio::spawn(async move {
            for i in 2..12 {
                let rev = format!("rev{i}");
                upstream.push(&rev, &[("a.md", rev.as_str()), ("b.md", rev.as_str())]);
                let outcome = orchestrator
                    .run_task(SyncTask {
                        key: key(),
                        reason: SyncReason::Manual,
                    })
                    .await;
                assert!(matches!(outcome, SyncOutcome::Published { .. }));
            }
        })
    };

    for reader in readers {
        reader.await.unwrap();
    }
    writer.await.unwrap();

    // Settled state serves the last push from a single generation.
    let a = resolver.read("remotedoc://octo/widgets/main/a.md").unwrap();
    let b = resolver.read("remotedoc://octo/widgets/main/b.md").unwrap();
    assert_eq!(a, "rev11");
    assert_eq!(a, b);
}

#[tokio::test]
async fn test_repository_removal_destroys_mirror_and_resolution() {
    let h = harness(MemoryUpstream::new("rev1", &[("spec.md", "v1")]));
    h.orchestrator.run_task(manual_task()).await;
    assert!(h.resolver.read("remotedoc://octo/widgets/main/spec.md").is_ok());

    assert!(h.orchestrator.remove_repository(&key()).await);

    assert!(matches!(
        h.resolver.read("remotedoc://octo/widgets/main/spec.md"),
        Err(ReadError::RepositoryNotConfigured { .. })
    ));
    assert!(h.store.get_published(&key()).is_none());
}
