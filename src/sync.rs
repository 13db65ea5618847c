//! Synchronization orchestration.
//!
//! Two producers (the polling scheduler and the webhook verifier) feed
//! the same per-repository execution path: probe the remote head, fetch a
//! snapshot into fresh staging when it moved, publish, record status. The
//! trigger source stays orthogonal to execution.
//!
//! Concurrency rules:
//! - at most one sync per repository at a time, enforced with a per-repo
//!   `try_lock`; a task that finds the lock held is coalesced, not queued
//! - unrelated repositories sync fully in parallel, bounded only by the
//!   global fetch semaphore
//! - a failed attempt never touches the published generation

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{RepositoryConfig, SyncConfig, SyncMode};
use crate::error::FetchError;
use crate::fetcher::Upstream;
use crate::registry::{Registry, RepoKey};
use crate::store::MirrorStore;

/// Why a sync task was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncReason {
    Scheduled,
    Webhook,
    Manual,
}

impl SyncReason {
    fn as_str(self) -> &'static str {
        match self {
            SyncReason::Scheduled => "scheduled",
            SyncReason::Webhook => "webhook",
            SyncReason::Manual => "manual",
        }
    }
}

/// Ephemeral unit of sync work. Queued, executed, discarded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncTask {
    pub key: RepoKey,
    pub reason: SyncReason,
}

/// Result of executing one sync task, for operator-facing reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A new generation was published.
    Published { generation: u64, revision: String },
    /// Upstream had not moved; nothing was fetched or published.
    Unchanged { revision: String },
    /// Another task already held this repository's sync lock.
    Coalesced,
    /// The attempt failed; the previous generation (if any) still serves.
    Failed { cause: String },
    /// The repository left the configuration before the task ran.
    Dropped,
}

/// Externally visible per-repository sync status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncStatus {
    /// The most recent attempt succeeded.
    Fresh {
        revision: String,
        synced_at: DateTime<Utc>,
    },
    /// A previous generation still serves, but the latest attempt failed.
    Stale {
        revision: String,
        synced_at: DateTime<Utc>,
        cause: String,
    },
    /// No sync has ever succeeded.
    Failed { cause: String },
}

#[derive(Debug, Default)]
struct RepoSyncState {
    status: Option<SyncStatus>,
    /// Earliest instant the next attempt should run, set from rate-limit
    /// responses.
    not_before: Option<Instant>,
}

/// Serializes and executes sync work across all configured repositories.
pub struct SyncOrchestrator {
    registry: Arc<Registry>,
    store: Arc<MirrorStore>,
    upstream: Arc<dyn Upstream>,
    sync_config: SyncConfig,
    fetch_slots: Arc<Semaphore>,
    locks: Mutex<HashMap<RepoKey, Arc<tokio::sync::Mutex<()>>>>,
    states: RwLock<HashMap<RepoKey, RepoSyncState>>,
}

impl SyncOrchestrator {
    pub fn new(
        registry: Arc<Registry>,
        store: Arc<MirrorStore>,
        upstream: Arc<dyn Upstream>,
        sync_config: SyncConfig,
    ) -> Arc<Self> {
        let fetch_slots = Arc::new(Semaphore::new(sync_config.max_concurrent_fetches));
        Arc::new(Self {
            registry,
            store,
            upstream,
            sync_config,
            fetch_slots,
            locks: Mutex::new(HashMap::new()),
            states: RwLock::new(HashMap::new()),
        })
    }

    /// Execute one sync task to completion.
    pub async fn run_task(&self, task: SyncTask) -> SyncOutcome {
        let Some(config) = self.registry.get(&task.key) else {
            debug!(repo = %task.key, "dropping task for unconfigured repository");
            return SyncOutcome::Dropped;
        };

        let lock = self.repo_lock(&task.key);
        let Ok(_guard) = lock.try_lock() else {
            debug!(repo = %task.key, reason = task.reason.as_str(), "sync already in progress, coalescing");
            return SyncOutcome::Coalesced;
        };

        let _permit = self
            .fetch_slots
            .acquire()
            .await
            .expect("fetch semaphore never closed");

        debug!(repo = %task.key, reason = task.reason.as_str(), "sync started");
        let outcome = self.fetch_and_publish(&config).await;
        match &outcome {
            SyncOutcome::Published { generation, revision } => {
                info!(repo = %task.key, generation, revision = %revision, reason = task.reason.as_str(), "sync published new generation");
            }
            SyncOutcome::Unchanged { revision } => {
                debug!(repo = %task.key, revision = %revision, "upstream unchanged, skipping publish");
            }
            SyncOutcome::Failed { cause } => {
                error!(repo = %task.key, cause = %cause, "sync failed, retaining last-good generation");
            }
            SyncOutcome::Coalesced | SyncOutcome::Dropped => {}
        }
        outcome
    }

    async fn fetch_and_publish(&self, config: &RepositoryConfig) -> SyncOutcome {
        let key = config.key();

        let head = match self.upstream.remote_head(config).await {
            Ok(head) => head,
            Err(e) => return self.record_failure(&key, e),
        };

        if self.store.last_revision(&key).as_deref() == Some(head.as_str()) {
            self.record_success(&key, &head);
            return SyncOutcome::Unchanged { revision: head };
        }

        let staging = match self.store.staging_dir(&key) {
            Ok(dir) => dir,
            Err(e) => {
                return self.record_failure(
                    &key,
                    FetchError::Network {
                        message: format!("failed to create staging directory: {e}"),
                    },
                )
            }
        };

        let revision = match self.upstream.fetch_into(config, &staging).await {
            Ok(revision) => revision,
            Err(e) => {
                let _ = std::fs::remove_dir_all(&staging);
                return self.record_failure(&key, e);
            }
        };

        match self.store.publish(&key, &staging, &revision) {
            Ok(generation) => {
                self.record_success(&key, &revision);
                SyncOutcome::Published {
                    generation: generation.number(),
                    revision,
                }
            }
            Err(e) => {
                let _ = std::fs::remove_dir_all(&staging);
                self.record_failure(
                    &key,
                    FetchError::Network {
                        message: format!("publish failed: {e}"),
                    },
                )
            }
        }
    }

    /// Sync every configured repository once, in parallel up to the fetch
    /// bound. Used at startup and by the manual CLI command.
    pub async fn sync_all(self: Arc<Self>, reason: SyncReason) -> Vec<(RepoKey, SyncOutcome)> {
        let mut handles = Vec::new();
        for config in self.registry.all() {
            let orchestrator = self.clone();
            let key = config.key();
            handles.push(tokio::spawn(async move {
                let outcome = orchestrator
                    .run_task(SyncTask {
                        key: key.clone(),
                        reason,
                    })
                    .await;
                (key, outcome)
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            if let Ok(result) = handle.await {
                results.push(result);
            }
        }
        results
    }

    /// Start the polling scheduler: one jittered timer loop per configured
    /// repository. Only valid in polling mode.
    pub fn start_polling(self: Arc<Self>) {
        assert_eq!(self.sync_config.mode, SyncMode::Poll);
        for config in self.registry.all() {
            self.clone().spawn_poller(config.key());
        }
    }

    /// Consume webhook-originated tasks until the channel closes. Only the
    /// verifier produces into this channel; no timer fires in webhook mode.
    pub async fn run_webhook_consumer(self: Arc<Self>, mut tasks: mpsc::Receiver<SyncTask>) {
        while let Some(task) = tasks.recv().await {
            let orchestrator = self.clone();
            tokio::spawn(async move {
                orchestrator.run_task(task).await;
            });
        }
    }

    fn spawn_poller(self: Arc<Self>, key: RepoKey) {
        let orchestrator = self;
        tokio::spawn(async move {
            let base = Duration::from_secs(orchestrator.sync_config.interval_secs);
            let jitter_max = orchestrator.sync_config.jitter_secs;
            loop {
                tokio::time::sleep(poll_delay(base, jitter_max)).await;

                if !orchestrator.registry.contains(&key) {
                    debug!(repo = %key, "repository removed, stopping poller");
                    return;
                }

                // Honor a provider-requested backoff without disturbing
                // other repositories' schedules.
                if let Some(not_before) = orchestrator.backoff_deadline(&key) {
                    let now = Instant::now();
                    if not_before > now {
                        warn!(repo = %key, wait = ?(not_before - now), "rate limited, deferring next poll");
                        tokio::time::sleep_until(not_before).await;
                    }
                }

                orchestrator
                    .run_task(SyncTask {
                        key: key.clone(),
                        reason: SyncReason::Scheduled,
                    })
                    .await;
            }
        });
    }

    /// Add (or replace) a repository at runtime: it is synced immediately
    /// and, in polling mode, gets its own scheduler loop.
    pub async fn add_repository(self: Arc<Self>, config: RepositoryConfig) {
        let key = config.key();
        let is_new = self.registry.add(config);
        self.run_task(SyncTask {
            key: key.clone(),
            reason: SyncReason::Manual,
        })
        .await;
        if is_new && self.sync_config.mode == SyncMode::Poll {
            self.spawn_poller(key);
        }
    }

    /// Remove a repository: stops its poller, forgets its status, and tears
    /// down its mirror.
    pub async fn remove_repository(&self, key: &RepoKey) -> bool {
        if self.registry.remove(key).is_none() {
            return false;
        }
        self.states.write().expect("state lock poisoned").remove(key);
        self.locks.lock().expect("lock map poisoned").remove(key);
        if let Err(e) = self.store.remove(key) {
            warn!(repo = %key, error = %e, "failed to tear down mirror");
        }
        true
    }

    /// Sync status for one repository, or `None` when it is not configured.
    pub fn status(&self, key: &RepoKey) -> Option<SyncStatus> {
        if !self.registry.contains(key) {
            return None;
        }
        let recorded = self
            .states
            .read()
            .expect("state lock poisoned")
            .get(key)
            .and_then(|s| s.status.clone());
        if let Some(status) = recorded {
            return Some(status);
        }
        // Nothing recorded this process lifetime; a generation re-adopted
        // from a previous run still counts as fresh.
        Some(match self.store.get_published(key) {
            Some(generation) => SyncStatus::Fresh {
                revision: generation.revision().to_string(),
                synced_at: generation_mtime(generation.root()),
            },
            None => SyncStatus::Failed {
                cause: "no sync attempted yet".to_string(),
            },
        })
    }

    /// Statuses for every configured repository, in stable order.
    pub fn statuses(&self) -> Vec<(RepoKey, SyncStatus)> {
        self.registry
            .all()
            .iter()
            .map(|c| {
                let key = c.key();
                let status = self.status(&key).expect("config just listed");
                (key, status)
            })
            .collect()
    }

    fn repo_lock(&self, key: &RepoKey) -> Arc<tokio::sync::Mutex<()>> {
        self.locks
            .lock()
            .expect("lock map poisoned")
            .entry(key.clone())
            .or_default()
            .clone()
    }

    fn backoff_deadline(&self, key: &RepoKey) -> Option<Instant> {
        self.states
            .read()
            .expect("state lock poisoned")
            .get(key)
            .and_then(|s| s.not_before)
    }

    fn record_success(&self, key: &RepoKey, revision: &str) {
        let mut states = self.states.write().expect("state lock poisoned");
        let state = states.entry(key.clone()).or_default();
        state.status = Some(SyncStatus::Fresh {
            revision: revision.to_string(),
            synced_at: Utc::now(),
        });
        state.not_before = None;
    }

    fn record_failure(&self, key: &RepoKey, error: FetchError) -> SyncOutcome {
        let cause = error.to_string();
        let mut states = self.states.write().expect("state lock poisoned");
        let state = states.entry(key.clone()).or_default();

        if let FetchError::RateLimited {
            retry_after: Some(wait),
        } = &error
        {
            state.not_before = Some(Instant::now() + *wait);
        }

        let next = match &state.status {
            Some(SyncStatus::Fresh {
                revision,
                synced_at,
            })
            | Some(SyncStatus::Stale {
                revision,
                synced_at,
                ..
            }) => SyncStatus::Stale {
                revision: revision.clone(),
                synced_at: *synced_at,
                cause: cause.clone(),
            },
            _ => SyncStatus::Failed {
                cause: cause.clone(),
            },
        };
        state.status = Some(next);

        SyncOutcome::Failed { cause }
    }
}

/// Publish time of a re-adopted generation, from its directory metadata.
fn generation_mtime(dir: &std::path::Path) -> DateTime<Utc> {
    std::fs::metadata(dir)
        .and_then(|m| m.modified())
        .map(DateTime::<Utc>::from)
        .unwrap_or_else(|_| Utc::now())
}

/// Wait before a repository's next scheduled sync: the base interval plus a
/// bounded random jitter, so a fleet of repositories never fires in one
/// synchronized burst against the provider's rate limiter.
fn poll_delay(base: Duration, jitter_max_secs: u64) -> Duration {
    if jitter_max_secs == 0 {
        return base;
    }
    let jitter = rand::thread_rng().gen_range(0..=jitter_max_secs * 1000);
    base + Duration::from_millis(jitter)
}
