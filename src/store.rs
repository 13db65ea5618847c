//! On-disk mirror store with atomic generation publishing.
//!
//! Each mirrored repository branch lives under
//! `root/<owner>/<repo>/<branch>/` as a set of immutable generation
//! directories (`gen-<counter>-<shortrev>/`) plus a `CURRENT` pointer record
//! naming the published one. Publishing renames a fully-written staging
//! directory into place, rewrites the pointer, and swaps a reference-counted
//! in-memory handle; readers that started against the previous generation
//! keep a handle to it, and its directory is deleted only when the last
//! handle drops. Readers never block on sync and sync never blocks on
//! readers; the only shared step is the handle swap.
//!
//! Staging directories live under `root/.staging/` and are never inside a
//! published generation, so a crash mid-fetch leaves garbage that
//! [`MirrorStore::open`] sweeps on the next startup.

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::registry::RepoKey;

const STAGING_DIR: &str = ".staging";
const CURRENT_FILE: &str = "CURRENT";

/// One immutable, fully-written version of a mirror's contents.
///
/// Cloned handles are cheap; the backing directory outlives every handle
/// and is removed once the generation is retired and the last handle drops.
#[derive(Debug)]
pub struct Generation {
    number: u64,
    revision: String,
    dir: PathBuf,
    retired: AtomicBool,
}

impl Generation {
    /// Directory of this generation's working copy. Fixed for the lifetime
    /// of the handle; callers resolve every path of one read against it.
    pub fn root(&self) -> &Path {
        &self.dir
    }

    /// Upstream revision identifier this generation was fetched from.
    pub fn revision(&self) -> &str {
        &self.revision
    }

    /// Monotonically increasing per-repository counter.
    pub fn number(&self) -> u64 {
        self.number
    }

    fn retire(&self) {
        self.retired.store(true, Ordering::Release);
    }
}

impl Drop for Generation {
    fn drop(&mut self) {
        if !self.retired.load(Ordering::Acquire) {
            return;
        }
        if let Err(e) = fs::remove_dir_all(&self.dir) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!(dir = %self.dir.display(), error = %e, "failed to remove retired generation");
            }
        } else {
            debug!(dir = %self.dir.display(), "removed retired generation");
        }
    }
}

/// Pointer record persisted as `CURRENT` next to the generation directories.
#[derive(Debug, Serialize, Deserialize)]
struct CurrentRecord {
    dir: String,
    number: u64,
    revision: String,
}

/// Mirror store rooted at one directory, holding every configured
/// repository's published working copy.
#[derive(Debug)]
pub struct MirrorStore {
    root: PathBuf,
    published: RwLock<HashMap<RepoKey, Arc<Generation>>>,
    staging_seq: AtomicU64,
}

impl MirrorStore {
    /// Open (creating if needed) the store at `root`, re-adopting published
    /// generations from a previous run and sweeping orphaned staging
    /// directories and unpointed generations.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(STAGING_DIR))?;

        let store = Self {
            root,
            published: RwLock::new(HashMap::new()),
            staging_seq: AtomicU64::new(0),
        };
        store.recover()?;
        Ok(store)
    }

    /// Root directory of the store.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Published generation for `key`, or `None` when no sync has ever
    /// succeeded. Callers hold the returned handle for the whole read.
    pub fn get_published(&self, key: &RepoKey) -> Option<Arc<Generation>> {
        self.published
            .read()
            .expect("store lock poisoned")
            .get(key)
            .cloned()
    }

    /// Revision of the published generation, for redundant-sync detection.
    pub fn last_revision(&self, key: &RepoKey) -> Option<String> {
        self.get_published(key).map(|g| g.revision().to_string())
    }

    /// Allocate a fresh, empty staging directory for one fetch. Staging
    /// directories are always distinct from published generations.
    pub fn staging_dir(&self, key: &RepoKey) -> io::Result<PathBuf> {
        let seq = self.staging_seq.fetch_add(1, Ordering::Relaxed);
        let dir = self.root.join(STAGING_DIR).join(format!(
            "{}-{}-{}-{seq}",
            key.owner, key.repo, key.branch
        ));
        fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// Publish a fully-written staging directory as the next generation.
    ///
    /// The staging directory is renamed into the mirror, the `CURRENT`
    /// pointer is rewritten (temp file + rename), the in-memory handle is
    /// swapped, and the previous generation is retired for deletion after
    /// its last reader drops. Serialization of publishes for one key is the
    /// orchestrator's per-repository lock; this method assumes it.
    pub fn publish(
        &self,
        key: &RepoKey,
        staging: &Path,
        revision: &str,
    ) -> io::Result<Arc<Generation>> {
        let mirror_dir = self.mirror_dir(key);
        fs::create_dir_all(&mirror_dir)?;

        let number = self
            .get_published(key)
            .map(|g| g.number() + 1)
            .unwrap_or_else(|| self.next_number_on_disk(&mirror_dir));

        let dir_name = format!("gen-{number:06}-{}", short_rev(revision));
        let gen_dir = mirror_dir.join(&dir_name);
        fs::rename(staging, &gen_dir)?;

        let record = CurrentRecord {
            dir: dir_name,
            number,
            revision: revision.to_string(),
        };
        write_current(&mirror_dir, &record)?;

        let generation = Arc::new(Generation {
            number,
            revision: revision.to_string(),
            dir: gen_dir,
            retired: AtomicBool::new(false),
        });

        let previous = self
            .published
            .write()
            .expect("store lock poisoned")
            .insert(key.clone(), generation.clone());
        if let Some(old) = previous {
            old.retire();
        }

        info!(repo = %key, generation = number, revision = %short_rev(revision), "published mirror generation");
        Ok(generation)
    }

    /// Tear down a repository's mirror after it is removed from the
    /// configuration. The published generation directory disappears once
    /// in-flight readers finish.
    pub fn remove(&self, key: &RepoKey) -> io::Result<()> {
        let previous = self
            .published
            .write()
            .expect("store lock poisoned")
            .remove(key);
        if let Some(old) = previous {
            old.retire();
        }

        let mirror_dir = self.mirror_dir(key);
        if mirror_dir.exists() {
            let _ = fs::remove_file(mirror_dir.join(CURRENT_FILE));
            for entry in fs::read_dir(&mirror_dir)? {
                let path = entry?.path();
                // Leave generation dirs to their handles; anything else goes.
                if !path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with("gen-"))
                {
                    let _ = fs::remove_dir_all(&path);
                }
            }
            remove_empty_parents(&self.root, &mirror_dir);
        }
        info!(repo = %key, "removed mirror");
        Ok(())
    }

    fn mirror_dir(&self, key: &RepoKey) -> PathBuf {
        self.root
            .join(&key.owner)
            .join(&key.repo)
            .join(&key.branch)
    }

    /// Highest generation number already on disk, plus one. Keeps the
    /// counter monotonic across restarts even when `CURRENT` is missing.
    fn next_number_on_disk(&self, mirror_dir: &Path) -> u64 {
        let Ok(entries) = fs::read_dir(mirror_dir) else {
            return 1;
        };
        entries
            .flatten()
            .filter_map(|e| parse_gen_number(&e.file_name().to_string_lossy()))
            .max()
            .map(|n| n + 1)
            .unwrap_or(1)
    }

    /// Re-adopt `CURRENT` generations from disk and delete everything else:
    /// abandoned staging directories and generations no pointer names.
    fn recover(&self) -> io::Result<()> {
        let staging_root = self.root.join(STAGING_DIR);
        for entry in fs::read_dir(&staging_root)? {
            let path = entry?.path();
            warn!(dir = %path.display(), "removing abandoned staging directory");
            let _ = fs::remove_dir_all(&path);
        }

        let mut published = self.published.write().expect("store lock poisoned");
        for entry in WalkDir::new(&self.root)
            .min_depth(3)
            .max_depth(3)
            .into_iter()
            .filter_entry(|e| e.file_name() != STAGING_DIR)
            .flatten()
        {
            if !entry.file_type().is_dir() {
                continue;
            }
            let mirror_dir = entry.path();
            let Some(record) = read_current(mirror_dir) else {
                continue;
            };

            let rel = mirror_dir
                .strip_prefix(&self.root)
                .expect("walkdir stays under root");
            let mut components = rel.components().map(|c| c.as_os_str().to_string_lossy());
            let key = RepoKey {
                owner: components.next().unwrap_or_default().to_string(),
                repo: components.next().unwrap_or_default().to_string(),
                branch: components.next().unwrap_or_default().to_string(),
            };

            let gen_dir = mirror_dir.join(&record.dir);
            if !gen_dir.is_dir() {
                warn!(repo = %key, dir = %gen_dir.display(), "CURRENT points at a missing generation");
                continue;
            }

            // Unpointed generations are leftovers from an unclean shutdown.
            for sibling in fs::read_dir(mirror_dir)?.flatten() {
                let name = sibling.file_name().to_string_lossy().to_string();
                if name.starts_with("gen-") && name != record.dir {
                    warn!(dir = %sibling.path().display(), "removing unpointed generation");
                    let _ = fs::remove_dir_all(sibling.path());
                }
            }

            info!(repo = %key, generation = record.number, "re-adopted published generation");
            published.insert(
                key,
                Arc::new(Generation {
                    number: record.number,
                    revision: record.revision,
                    dir: gen_dir,
                    retired: AtomicBool::new(false),
                }),
            );
        }
        Ok(())
    }
}

fn write_current(mirror_dir: &Path, record: &CurrentRecord) -> io::Result<()> {
    let tmp = mirror_dir.join(format!("{CURRENT_FILE}.tmp"));
    fs::write(&tmp, serde_json::to_vec(record)?)?;
    fs::rename(&tmp, mirror_dir.join(CURRENT_FILE))
}

fn read_current(mirror_dir: &Path) -> Option<CurrentRecord> {
    let bytes = fs::read(mirror_dir.join(CURRENT_FILE)).ok()?;
    serde_json::from_slice(&bytes).ok()
}

fn parse_gen_number(name: &str) -> Option<u64> {
    name.strip_prefix("gen-")?
        .split('-')
        .next()?
        .parse()
        .ok()
}

fn short_rev(revision: &str) -> &str {
    revision.get(..12).unwrap_or(revision)
}

/// Remove now-empty `<owner>/<repo>` directories after a mirror teardown.
fn remove_empty_parents(root: &Path, mirror_dir: &Path) {
    let _ = fs::remove_dir(mirror_dir);
    let mut parent = mirror_dir.parent();
    while let Some(dir) = parent {
        if dir == root || fs::remove_dir(dir).is_err() {
            break;
        }
        parent = dir.parent();
    }
}
