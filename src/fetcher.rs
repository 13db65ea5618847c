//! Upstream repository access.
//!
//! The [`Upstream`] trait is the seam between the sync machinery and the
//! network: probing the remote head, fetching a branch snapshot into a
//! staging directory, and reading repository metadata. [`GitHubUpstream`]
//! is the production implementation: `git` over HTTPS for content and the
//! GitHub REST API for metadata. Tests substitute an in-process fake.
//!
//! Invariant: the fetcher only ever writes into the staging directory the
//! caller supplies. It never touches a published generation.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::{GithubConfig, RepositoryConfig};
use crate::error::FetchError;

/// Repository metadata from the provider.
#[derive(Debug, Clone, Default)]
pub struct RepoMetadata {
    pub description: String,
}

/// Network-facing operations against the remote provider.
#[async_trait]
pub trait Upstream: Send + Sync {
    /// Revision currently at the tip of the configured branch.
    async fn remote_head(&self, config: &RepositoryConfig) -> Result<String, FetchError>;

    /// Fetch a snapshot of the configured branch into `staging`, returning
    /// the fetched revision.
    async fn fetch_into(
        &self,
        config: &RepositoryConfig,
        staging: &Path,
    ) -> Result<String, FetchError>;

    /// Repository metadata (description) for discovery listings.
    async fn repo_metadata(&self, config: &RepositoryConfig) -> Result<RepoMetadata, FetchError>;
}

/// Production upstream: shallow git clones plus the GitHub REST API.
pub struct GitHubUpstream {
    http: reqwest::Client,
    api_base: String,
    clone_base: String,
    timeout: Duration,
}

impl GitHubUpstream {
    pub fn new(github: &GithubConfig, timeout: Duration) -> Self {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("remotedoc/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("reqwest client construction is infallible with these options");
        Self {
            http,
            api_base: github.api_base.trim_end_matches('/').to_string(),
            clone_base: github.clone_base.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    /// Clone URL for git operations, with the access token embedded when
    /// configured. Never log this value.
    fn clone_url(&self, config: &RepositoryConfig) -> String {
        match (&config.access_token, self.clone_base.strip_prefix("https://")) {
            (Some(token), Some(host)) => {
                format!("https://{token}@{host}/{}/{}.git", config.owner, config.repo)
            }
            _ => format!("{}/{}/{}.git", self.clone_base, config.owner, config.repo),
        }
    }

    async fn run_git(&self, args: &[&str], cwd: Option<&Path>) -> Result<String, FetchError> {
        let mut cmd = Command::new("git");
        cmd.args(args);
        if let Some(dir) = cwd {
            cmd.current_dir(dir);
        }
        cmd.kill_on_drop(true);

        // Clones move a full branch snapshot, not one round trip.
        let budget = if args.first() == Some(&"clone") {
            self.timeout * 2
        } else {
            self.timeout
        };

        let output = tokio::time::timeout(budget, cmd.output())
            .await
            .map_err(|_| FetchError::Network {
                message: format!("git {} timed out after {budget:?}", args[0]),
            })?
            .map_err(|e| FetchError::Network {
                message: format!("failed to execute git: {e}"),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(classify_git_failure(stderr.trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl Upstream for GitHubUpstream {
    async fn remote_head(&self, config: &RepositoryConfig) -> Result<String, FetchError> {
        let url = self.clone_url(config);
        let refspec = format!("refs/heads/{}", config.branch);
        let stdout = self
            .run_git(&["ls-remote", "--heads", &url, &refspec], None)
            .await?;

        // `ls-remote` output: "<sha>\trefs/heads/<branch>" or nothing when
        // the branch does not exist.
        match stdout.split_whitespace().next() {
            Some(sha) if !sha.is_empty() => Ok(sha.to_string()),
            _ => Err(FetchError::BranchNotFound {
                branch: config.branch.clone(),
            }),
        }
    }

    async fn fetch_into(
        &self,
        config: &RepositoryConfig,
        staging: &Path,
    ) -> Result<String, FetchError> {
        let url = self.clone_url(config);
        let staging_str = staging.to_string_lossy();
        debug!(
            repo = %format!("{}/{}/{}", config.owner, config.repo, config.branch),
            "cloning branch snapshot"
        );
        self.run_git(
            &[
                "clone",
                "--branch",
                &config.branch,
                "--single-branch",
                "--depth",
                "1",
                &url,
                &staging_str,
            ],
            None,
        )
        .await?;

        let revision = self
            .run_git(&["rev-parse", "HEAD"], Some(staging))
            .await?
            .trim()
            .to_string();

        // The published working copy serves file content only; the object
        // database would just be dead weight behind the resolver.
        if let Err(e) = std::fs::remove_dir_all(staging.join(".git")) {
            warn!(error = %e, "failed to strip .git from staged snapshot");
        }

        Ok(revision)
    }

    async fn repo_metadata(&self, config: &RepositoryConfig) -> Result<RepoMetadata, FetchError> {
        #[derive(Deserialize)]
        struct RepoInfo {
            description: Option<String>,
        }

        let url = format!("{}/repos/{}/{}", self.api_base, config.owner, config.repo);
        let mut request = self
            .http
            .get(&url)
            .header("Accept", "application/vnd.github+json");
        if let Some(token) = &config.access_token {
            request = request.header("Authorization", format!("Bearer {token}"));
        }

        let response = request.send().await.map_err(|e| FetchError::Network {
            message: format!("metadata request failed: {e}"),
        })?;

        let status = response.status();
        match status.as_u16() {
            200 => {
                let info: RepoInfo = response.json().await.map_err(|e| FetchError::Network {
                    message: format!("malformed metadata response: {e}"),
                })?;
                Ok(RepoMetadata {
                    description: info.description.unwrap_or_default(),
                })
            }
            401 => Err(FetchError::AuthFailure {
                message: format!("metadata request unauthorized for {url}"),
            }),
            403 | 429 => {
                if rate_limit_exhausted(&response) {
                    Err(FetchError::RateLimited {
                        retry_after: retry_after(&response),
                    })
                } else {
                    Err(FetchError::AuthFailure {
                        message: format!("metadata request forbidden for {url}"),
                    })
                }
            }
            404 => Err(FetchError::NotFound {
                message: format!("{}/{} not found upstream", config.owner, config.repo),
            }),
            _ => Err(FetchError::Network {
                message: format!("metadata request returned HTTP {status}"),
            }),
        }
    }
}

/// Map a git subprocess failure onto the typed fetch taxonomy.
fn classify_git_failure(stderr: &str) -> FetchError {
    let lowered = stderr.to_lowercase();
    if lowered.contains("authentication failed")
        || lowered.contains("could not read username")
        || lowered.contains("invalid credentials")
    {
        FetchError::AuthFailure {
            message: stderr.to_string(),
        }
    } else if lowered.contains("remote branch") && lowered.contains("not found") {
        let branch = stderr
            .split('\'')
            .nth(1)
            .unwrap_or("unknown")
            .to_string();
        FetchError::BranchNotFound { branch }
    } else if lowered.contains("repository not found")
        || lowered.contains("not appear to be a git repository")
        || lowered.contains("does not exist")
    {
        FetchError::NotFound {
            message: stderr.to_string(),
        }
    } else if lowered.contains("rate limit") {
        FetchError::RateLimited { retry_after: None }
    } else {
        FetchError::Network {
            message: stderr.to_string(),
        }
    }
}

/// GitHub signals a primary-rate-limit 403 with `x-ratelimit-remaining: 0`;
/// secondary limits send `retry-after` directly.
fn rate_limit_exhausted(response: &reqwest::Response) -> bool {
    response.headers().contains_key("retry-after")
        || response
            .headers()
            .get("x-ratelimit-remaining")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "0")
}

fn retry_after(response: &reqwest::Response) -> Option<Duration> {
    response
        .headers()
        .get("retry-after")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_secs)
}
