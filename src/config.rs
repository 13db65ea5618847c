use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub store: StoreConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub github: GithubConfig,
    pub server: ServerConfig,
    #[serde(default)]
    pub discovery: DiscoveryConfig,
    #[serde(default)]
    pub repositories: Vec<RepositoryConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct StoreConfig {
    /// Root directory for mirror generations and staging space.
    pub root: PathBuf,
}

/// Which trigger drives synchronization. The two modes are mutually
/// exclusive for the lifetime of the process.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Poll,
    Webhook,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_sync_mode")]
    pub mode: SyncMode,
    /// Base polling interval. Each repository's actual wait is this plus a
    /// random jitter in `[0, jitter_secs]`.
    #[serde(default = "default_interval_secs")]
    pub interval_secs: u64,
    #[serde(default = "default_jitter_secs")]
    pub jitter_secs: u64,
    /// Upper bound on concurrent upstream fetches across all repositories.
    #[serde(default = "default_max_concurrent_fetches")]
    pub max_concurrent_fetches: usize,
    /// Timeout applied to every upstream network operation.
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            mode: default_sync_mode(),
            interval_secs: default_interval_secs(),
            jitter_secs: default_jitter_secs(),
            max_concurrent_fetches: default_max_concurrent_fetches(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
        }
    }
}

fn default_sync_mode() -> SyncMode {
    SyncMode::Poll
}
fn default_interval_secs() -> u64 {
    600
}
fn default_jitter_secs() -> u64 {
    60
}
fn default_max_concurrent_fetches() -> usize {
    5
}
fn default_fetch_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GithubConfig {
    /// REST API base. Point at a GitHub Enterprise host to use one.
    #[serde(default = "default_api_base")]
    pub api_base: String,
    /// Base for building clone URLs; `file://` bases work for local remotes.
    #[serde(default = "default_clone_base")]
    pub clone_base: String,
}

impl Default for GithubConfig {
    fn default() -> Self {
        Self {
            api_base: default_api_base(),
            clone_base: default_clone_base(),
        }
    }
}

fn default_api_base() -> String {
    "https://api.github.com".to_string()
}
fn default_clone_base() -> String {
    "https://github.com".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub bind: String,
    /// Shared secret for webhook signature verification. Required in
    /// webhook mode.
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// How long fetched repository descriptions stay cached.
    #[serde(default = "default_description_ttl_secs")]
    pub description_ttl_secs: u64,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            description_ttl_secs: default_description_ttl_secs(),
        }
    }
}

fn default_description_ttl_secs() -> u64 {
    300
}

/// One mirrored repository branch. `(owner, repo, branch)` is the unique
/// identity; everything else is an attribute.
#[derive(Debug, Deserialize, Clone, PartialEq, Eq)]
pub struct RepositoryConfig {
    pub owner: String,
    pub repo: String,
    #[serde(default = "default_branch")]
    pub branch: String,
    /// Entry-point document advertised by discovery.
    #[serde(default = "default_root_spec_path")]
    pub root_spec_path: String,
    /// Token for private repositories. A `${VAR}` value is expanded from
    /// the environment at load time.
    #[serde(default)]
    pub access_token: Option<String>,
}

fn default_branch() -> String {
    "main".to_string()
}
fn default_root_spec_path() -> String {
    "spec.md".to_string()
}

impl RepositoryConfig {
    pub fn key(&self) -> crate::registry::RepoKey {
        crate::registry::RepoKey {
            owner: self.owner.clone(),
            repo: self.repo.clone(),
            branch: self.branch.clone(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    // Validate sync settings
    if config.sync.interval_secs == 0 {
        anyhow::bail!("sync.interval_secs must be > 0");
    }
    if config.sync.max_concurrent_fetches == 0 {
        anyhow::bail!("sync.max_concurrent_fetches must be > 0");
    }
    if config.sync.fetch_timeout_secs == 0 {
        anyhow::bail!("sync.fetch_timeout_secs must be > 0");
    }

    if config.sync.mode == SyncMode::Webhook {
        let missing = config
            .server
            .webhook_secret
            .as_deref()
            .map_or(true, str::is_empty);
        if missing {
            anyhow::bail!("server.webhook_secret is required when sync.mode is 'webhook'");
        }
    }

    // Validate repositories
    let mut seen = std::collections::HashSet::new();
    for repo in &config.repositories {
        if repo.owner.is_empty() || repo.repo.is_empty() || repo.branch.is_empty() {
            anyhow::bail!("repositories entries require non-empty owner, repo, and branch");
        }
        if repo.root_spec_path.is_empty() {
            anyhow::bail!(
                "repositories entry {}/{} has an empty root_spec_path",
                repo.owner,
                repo.repo
            );
        }
        if !seen.insert((repo.owner.clone(), repo.repo.clone(), repo.branch.clone())) {
            anyhow::bail!(
                "duplicate repository entry: {}/{}/{}",
                repo.owner,
                repo.repo,
                repo.branch
            );
        }
    }

    // Expand ${VAR} token references from the environment
    for repo in &mut config.repositories {
        if let Some(token) = &repo.access_token {
            if let Some(var) = token.strip_prefix("${").and_then(|t| t.strip_suffix('}')) {
                repo.access_token = std::env::var(var).ok().filter(|v| !v.is_empty());
            }
        }
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(content: &str) -> (tempfile::TempDir, PathBuf) {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("rdoc.toml");
        std::fs::write(&path, content).unwrap();
        (tmp, path)
    }

    const MINIMAL: &str = r#"
[store]
root = "/tmp/mirrors"

[server]
bind = "127.0.0.1:8080"

[[repositories]]
owner = "octo"
repo = "widgets"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let (_tmp, path) = write_config(MINIMAL);
        let config = load_config(&path).unwrap();
        assert_eq!(config.sync.mode, SyncMode::Poll);
        assert_eq!(config.sync.interval_secs, 600);
        assert_eq!(config.repositories[0].branch, "main");
        assert_eq!(config.repositories[0].root_spec_path, "spec.md");
        assert_eq!(config.github.api_base, "https://api.github.com");
    }

    #[test]
    fn test_webhook_mode_requires_secret() {
        let (_tmp, path) = write_config(
            r#"
[store]
root = "/tmp/mirrors"

[sync]
mode = "webhook"

[server]
bind = "127.0.0.1:8080"
"#,
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_duplicate_repositories_rejected() {
        let (_tmp, path) = write_config(
            r#"
[store]
root = "/tmp/mirrors"

[server]
bind = "127.0.0.1:8080"

[[repositories]]
owner = "octo"
repo = "widgets"

[[repositories]]
owner = "octo"
repo = "widgets"
"#,
        );
        assert!(load_config(&path).is_err());
    }

    #[test]
    fn test_token_env_expansion() {
        let (_tmp, path) = write_config(
            r#"
[store]
root = "/tmp/mirrors"

[server]
bind = "127.0.0.1:8080"

[[repositories]]
owner = "octo"
repo = "widgets"
access_token = "${RDOC_TEST_TOKEN_VAR}"
"#,
        );
        std::env::set_var("RDOC_TEST_TOKEN_VAR", "sekrit");
        let config = load_config(&path).unwrap();
        assert_eq!(
            config.repositories[0].access_token.as_deref(),
            Some("sekrit")
        );
        std::env::remove_var("RDOC_TEST_TOKEN_VAR");
    }
}
