//! Repository discovery for tool callers.
//!
//! `list` is the entry point an agent calls first: every configured
//! repository, its upstream description, and the address of its root spec
//! document. Descriptions come from the provider's metadata endpoint and
//! are cached per repository with a bounded TTL so a listing does not cost
//! one network call per invocation; a metadata failure degrades to an
//! empty description rather than failing the listing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::RwLock;
use tracing::warn;

use crate::address::SCHEME;
use crate::fetcher::Upstream;
use crate::registry::{Registry, RepoKey};

/// One discovery listing entry.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct DocListing {
    pub repo_name: String,
    pub repo_description: String,
    /// Address of the repository's root spec document.
    pub repo_spec_path: String,
}

#[derive(Debug, Clone)]
struct CachedDescription {
    description: String,
    fetched_at: Instant,
}

/// Lists configured repositories with TTL-cached upstream descriptions.
pub struct DiscoveryService {
    registry: Arc<Registry>,
    upstream: Arc<dyn Upstream>,
    ttl: Duration,
    descriptions: RwLock<HashMap<RepoKey, CachedDescription>>,
}

impl DiscoveryService {
    pub fn new(registry: Arc<Registry>, upstream: Arc<dyn Upstream>, ttl: Duration) -> Self {
        Self {
            registry,
            upstream,
            ttl,
            descriptions: RwLock::new(HashMap::new()),
        }
    }

    /// One entry per configured repository, in stable order.
    pub async fn list(&self) -> Vec<DocListing> {
        let mut listings = Vec::new();
        for config in self.registry.all() {
            let key = config.key();
            let description = self.description_for(&key, &config).await;
            listings.push(DocListing {
                repo_name: config.repo.clone(),
                repo_description: description,
                repo_spec_path: format!(
                    "{SCHEME}{}/{}/{}/{}",
                    config.owner, config.repo, config.branch, config.root_spec_path
                ),
            });
        }
        listings
    }

    async fn description_for(
        &self,
        key: &RepoKey,
        config: &crate::config::RepositoryConfig,
    ) -> String {
        if let Some(cached) = self.descriptions.read().await.get(key) {
            if cached.fetched_at.elapsed() < self.ttl {
                return cached.description.clone();
            }
        }

        let description = match self.upstream.repo_metadata(config).await {
            Ok(metadata) => metadata.description,
            Err(e) => {
                warn!(repo = %key, error = %e, "failed to fetch repository description");
                // Keep serving an expired description over an empty one.
                self.descriptions
                    .read()
                    .await
                    .get(key)
                    .map(|c| c.description.clone())
                    .unwrap_or_default()
            }
        };

        self.descriptions.write().await.insert(
            key.clone(),
            CachedDescription {
                description: description.clone(),
                fetched_at: Instant::now(),
            },
        );
        description
    }
}
