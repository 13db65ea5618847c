//! Validation of inbound push notifications.
//!
//! Webhook deliveries arrive unauthenticated; the only trust anchor is the
//! HMAC-SHA256 signature GitHub computes over the raw payload with the
//! shared secret. Verification runs before any parsing, uses a
//! constant-time comparison, and a mismatch ends processing immediately.
//! Verified push events are mapped to exactly one configured repository,
//! never a bulk resync, and handed to the orchestrator as a SyncTask.
//!
//! Validation is pure and fast: it only ever enqueues work, the fetch
//! itself happens on the orchestrator's side of the channel.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::error::Rejected;
use crate::registry::{Registry, RepoKey};
use crate::sync::{SyncReason, SyncTask};

type HmacSha256 = Hmac<Sha256>;

/// Signature header prefix used by GitHub (`X-Hub-Signature-256`).
const SIGNATURE_PREFIX: &str = "sha256=";

/// One inbound delivery, exactly as the transport received it.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    /// `X-GitHub-Event` header value.
    pub event_type: String,
    /// `X-Hub-Signature-256` header value, when present.
    pub signature: Option<String>,
    /// Raw request body. The signature covers these exact bytes.
    pub payload: Vec<u8>,
}

/// Relevant slice of a push payload.
#[derive(Debug, Deserialize)]
struct PushPayload {
    #[serde(rename = "ref")]
    git_ref: String,
    repository: PayloadRepository,
}

#[derive(Debug, Deserialize)]
struct PayloadRepository {
    name: String,
    owner: PayloadOwner,
}

/// GitHub sends `login` for user payloads and `name` for org payloads;
/// accept either.
#[derive(Debug, Deserialize)]
struct PayloadOwner {
    login: Option<String>,
    name: Option<String>,
}

/// Validates webhook deliveries and converts them into sync tasks.
pub struct WebhookVerifier {
    registry: Arc<Registry>,
    secret: String,
}

impl WebhookVerifier {
    pub fn new(registry: Arc<Registry>, secret: impl Into<String>) -> Self {
        Self {
            registry,
            secret: secret.into(),
        }
    }

    /// Validate one delivery. Returns a `webhook`-reasoned SyncTask for the
    /// single repository the payload names, or the typed rejection.
    pub fn handle(&self, event: &WebhookEvent) -> Result<SyncTask, Rejected> {
        self.verify_signature(event)?;

        if event.event_type != "push" {
            debug!(event = %event.event_type, "ignoring non-push webhook event");
            return Err(Rejected::IgnoredEvent {
                event: event.event_type.clone(),
            });
        }

        let payload: PushPayload =
            serde_json::from_slice(&event.payload).map_err(|e| Rejected::MalformedPayload {
                reason: e.to_string(),
            })?;

        let branch = payload
            .git_ref
            .strip_prefix("refs/heads/")
            .ok_or_else(|| Rejected::IgnoredEvent {
                event: format!("push to non-branch ref {}", payload.git_ref),
            })?;

        let owner = payload
            .repository
            .owner
            .login
            .or(payload.repository.owner.name)
            .ok_or_else(|| Rejected::MalformedPayload {
                reason: "payload repository has no owner".to_string(),
            })?;

        let key = RepoKey {
            owner,
            repo: payload.repository.name,
            branch: branch.to_string(),
        };

        if !self.registry.contains(&key) {
            warn!(repo = %key, "verified webhook for unconfigured repository");
            return Err(Rejected::UnknownRepository {
                reference: key.to_string(),
            });
        }

        debug!(repo = %key, "webhook verified, enqueueing sync");
        Ok(SyncTask {
            key,
            reason: SyncReason::Webhook,
        })
    }

    /// Constant-time HMAC check over the raw payload bytes. Runs before
    /// any payload parsing.
    fn verify_signature(&self, event: &WebhookEvent) -> Result<(), Rejected> {
        let header = event.signature.as_deref().ok_or(Rejected::BadSignature)?;
        let hex_digest = header
            .strip_prefix(SIGNATURE_PREFIX)
            .ok_or(Rejected::BadSignature)?;
        let expected = hex::decode(hex_digest).map_err(|_| Rejected::BadSignature)?;

        let mut mac = HmacSha256::new_from_slice(self.secret.as_bytes())
            .expect("HMAC accepts keys of any size");
        mac.update(&event.payload);
        mac.verify_slice(&expected).map_err(|_| Rejected::BadSignature)
    }
}
