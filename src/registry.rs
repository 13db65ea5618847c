//! The configured repository set.
//!
//! Repositories are keyed by `(owner, repo, branch)`. The set is read on
//! every resolution and listing, and mutated only by reconfiguration calls
//! from the admin surface, so a read-mostly lock around a map is the right
//! shape. Updating a repository that does not exist falls back to adding it.

use std::collections::HashMap;
use std::fmt;
use std::sync::RwLock;

use crate::config::RepositoryConfig;

/// Unique identity of one mirrored repository branch.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoKey {
    pub owner: String,
    pub repo: String,
    pub branch: String,
}

impl fmt::Display for RepoKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.owner, self.repo, self.branch)
    }
}

/// Live view of the configured repositories.
#[derive(Debug, Default)]
pub struct Registry {
    repos: RwLock<HashMap<RepoKey, RepositoryConfig>>,
}

impl Registry {
    pub fn new(configs: impl IntoIterator<Item = RepositoryConfig>) -> Self {
        let repos = configs.into_iter().map(|c| (c.key(), c)).collect();
        Self {
            repos: RwLock::new(repos),
        }
    }

    pub fn get(&self, key: &RepoKey) -> Option<RepositoryConfig> {
        self.repos.read().expect("registry lock poisoned").get(key).cloned()
    }

    /// Snapshot of all configured repositories, ordered by key for stable
    /// listings.
    pub fn all(&self) -> Vec<RepositoryConfig> {
        let mut configs: Vec<_> = self
            .repos
            .read()
            .expect("registry lock poisoned")
            .values()
            .cloned()
            .collect();
        configs.sort_by(|a, b| {
            (&a.owner, &a.repo, &a.branch).cmp(&(&b.owner, &b.repo, &b.branch))
        });
        configs
    }

    pub fn contains(&self, key: &RepoKey) -> bool {
        self.repos.read().expect("registry lock poisoned").contains_key(key)
    }

    /// Add a repository. Returns `false` if the key was already present
    /// (the existing entry is replaced either way, which is how token
    /// rotation lands).
    pub fn add(&self, config: RepositoryConfig) -> bool {
        self.repos
            .write()
            .expect("registry lock poisoned")
            .insert(config.key(), config)
            .is_none()
    }

    /// Update attributes of an existing repository; falls back to adding
    /// the entry when the key is unknown.
    pub fn update(&self, config: RepositoryConfig) {
        self.add(config);
    }

    /// Remove a repository. Returns the removed config so the caller can
    /// tear down its mirror.
    pub fn remove(&self, key: &RepoKey) -> Option<RepositoryConfig> {
        self.repos.write().expect("registry lock poisoned").remove(key)
    }

    pub fn len(&self) -> usize {
        self.repos.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(owner: &str, repo: &str, branch: &str) -> RepositoryConfig {
        RepositoryConfig {
            owner: owner.to_string(),
            repo: repo.to_string(),
            branch: branch.to_string(),
            root_spec_path: "spec.md".to_string(),
            access_token: None,
        }
    }

    #[test]
    fn test_lookup_by_key() {
        let registry = Registry::new([config("octo", "widgets", "main")]);
        let key = RepoKey {
            owner: "octo".to_string(),
            repo: "widgets".to_string(),
            branch: "main".to_string(),
        };
        assert!(registry.get(&key).is_some());
        assert!(registry
            .get(&RepoKey {
                branch: "dev".to_string(),
                ..key
            })
            .is_none());
    }

    #[test]
    fn test_all_is_sorted() {
        let registry = Registry::new([
            config("zeta", "z", "main"),
            config("alpha", "a", "main"),
        ]);
        let all = registry.all();
        assert_eq!(all[0].owner, "alpha");
        assert_eq!(all[1].owner, "zeta");
    }

    #[test]
    fn test_add_update_remove() {
        let registry = Registry::new([]);
        assert!(registry.add(config("octo", "widgets", "main")));
        assert!(!registry.add(config("octo", "widgets", "main")));

        let mut updated = config("octo", "widgets", "main");
        updated.root_spec_path = "docs/index.md".to_string();
        registry.update(updated.clone());
        assert_eq!(
            registry.get(&updated.key()).unwrap().root_spec_path,
            "docs/index.md"
        );

        assert!(registry.remove(&updated.key()).is_some());
        assert!(registry.is_empty());
    }
}
