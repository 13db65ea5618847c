//! The read path: one address in, one document out.
//!
//! A read pins the published generation once at the start and resolves
//! everything against that root, so a publish landing mid-read can never
//! mix two generations into one response. Markdown documents get their
//! relative links rewritten against the requested address before they are
//! returned.

use std::sync::Arc;

use tracing::debug;

use crate::address::{resolve_within, Address};
use crate::error::ReadError;
use crate::registry::Registry;
use crate::rewrite::rewrite_links;
use crate::store::MirrorStore;

/// Resolves `remotedoc://` addresses to document content.
pub struct Resolver {
    registry: Arc<Registry>,
    store: Arc<MirrorStore>,
}

impl Resolver {
    pub fn new(registry: Arc<Registry>, store: Arc<MirrorStore>) -> Self {
        Self { registry, store }
    }

    /// Read the document a raw address names.
    ///
    /// Every failure branch returns its typed error; nothing substitutes
    /// default content. A repository that has never synced successfully
    /// yields `NotSynced` instead of waiting for a sync.
    pub fn read(&self, raw_address: &str) -> Result<String, ReadError> {
        let address = Address::parse(raw_address)?;
        let key = crate::registry::RepoKey {
            owner: address.owner.clone(),
            repo: address.repo.clone(),
            branch: address.branch.clone(),
        };

        if !self.registry.contains(&key) {
            return Err(ReadError::RepositoryNotConfigured {
                owner: address.owner,
                repo: address.repo,
                branch: address.branch,
            });
        }

        // Pin one generation for the whole read; never re-query mid-flight.
        let generation = self
            .store
            .get_published(&key)
            .ok_or_else(|| ReadError::NotSynced {
                owner: address.owner.clone(),
                repo: address.repo.clone(),
                branch: address.branch.clone(),
            })?;

        let full_path = resolve_within(generation.root(), &address.path)?;
        if full_path.is_dir() {
            return Err(ReadError::FileNotFound {
                path: address.path.clone(),
            });
        }

        let bytes = std::fs::read(&full_path).map_err(|source| match source.kind() {
            std::io::ErrorKind::NotFound => ReadError::FileNotFound {
                path: address.path.clone(),
            },
            _ => ReadError::Io {
                path: address.path.clone(),
                source,
            },
        })?;

        // Odd encodings degrade to replacement characters rather than an
        // error; the mirrors hold prose, not binaries.
        let content = String::from_utf8_lossy(&bytes).into_owned();

        debug!(
            address = %address,
            generation = generation.number(),
            bytes = content.len(),
            "resolved document"
        );

        if is_markdown(&address.path) {
            Ok(rewrite_links(&content, &address))
        } else {
            Ok(content)
        }
    }
}

fn is_markdown(path: &str) -> bool {
    let lowered = path.to_ascii_lowercase();
    lowered.ends_with(".md") || lowered.ends_with(".markdown")
}
