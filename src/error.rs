//! Error types for the mirror and resolution engine.
//!
//! Three families cover the externally visible failure surface: [`ReadError`]
//! for the resolution path, [`FetchError`] for upstream operations, and
//! [`Rejected`] for inbound webhook validation. Parse and path errors are
//! returned to the immediate caller and never retried; fetch failures are
//! recorded against the mirror's sync status without discarding the last
//! published generation.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by the document resolution path.
#[derive(Debug, Error)]
pub enum ReadError {
    /// The address string does not conform to the
    /// `remotedoc://owner/repo/branch/path` scheme.
    #[error("invalid address: {reason}")]
    InvalidAddress {
        /// Why the address was rejected.
        reason: String,
    },

    /// The address resolved to a filesystem path outside the mirror root.
    #[error("path escapes mirror root: {path}")]
    PathEscape {
        /// The offending repository-relative path.
        path: String,
    },

    /// The addressed file does not exist in the published generation, or
    /// names a directory.
    #[error("file not found: {path}")]
    FileNotFound {
        /// The repository-relative path that was requested.
        path: String,
    },

    /// No configured repository matches the address's owner/repo/branch.
    #[error("repository not configured: {owner}/{repo}/{branch}")]
    RepositoryNotConfigured {
        owner: String,
        repo: String,
        branch: String,
    },

    /// The repository is configured but no sync has ever succeeded, so there
    /// is no published generation to read from.
    #[error("repository not synced yet: {owner}/{repo}/{branch}")]
    NotSynced {
        owner: String,
        repo: String,
        branch: String,
    },

    /// The file exists but could not be read.
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

/// Errors from upstream network operations (clone/update, metadata).
#[derive(Debug, Error)]
pub enum FetchError {
    /// The provider rejected the configured credentials.
    #[error("upstream authentication failed: {message}")]
    AuthFailure { message: String },

    /// The repository does not exist or is not visible with the
    /// configured credentials.
    #[error("repository not found upstream: {message}")]
    NotFound { message: String },

    /// The configured branch does not exist in the remote repository.
    #[error("branch not found upstream: {branch}")]
    BranchNotFound { branch: String },

    /// The provider's rate limiter refused the request.
    #[error("rate limited by upstream{}", retry_hint(.retry_after))]
    RateLimited {
        /// Provider-suggested wait before the next attempt, when known.
        retry_after: Option<Duration>,
    },

    /// Transport-level failure: timeout, DNS, connection reset, or a git
    /// subprocess failure that maps to none of the above.
    #[error("network error: {message}")]
    Network { message: String },
}

fn retry_hint(retry_after: &Option<Duration>) -> String {
    match retry_after {
        Some(d) => format!(" (retry after {}s)", d.as_secs()),
        None => String::new(),
    }
}

/// Outcomes of webhook validation that do not produce a sync task.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum Rejected {
    /// The payload signature did not verify against the shared secret.
    #[error("bad webhook signature")]
    BadSignature,

    /// The event type is not a push and carries no sync-relevant change.
    #[error("ignored webhook event: {event}")]
    IgnoredEvent { event: String },

    /// The payload names a repository/branch this process is not configured
    /// to mirror.
    #[error("webhook for unknown repository: {reference}")]
    UnknownRepository { reference: String },

    /// The payload could not be parsed after the signature verified.
    #[error("malformed webhook payload: {reason}")]
    MalformedPayload { reason: String },
}
