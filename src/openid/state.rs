//! Pending logins keyed by `state`, each carrying its nonce and PKCE verifier.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use dashmap::DashMap;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

const MIN_SWEEP_PERIOD: Duration = Duration::from_secs(1);

/// Generates a cryptographically random code verifier for PKCE.
///
/// Returns a 64-character URL-safe string (RFC 7636 allows 43-128).
pub fn generate_code_verifier() -> String {
    let mut random_bytes = [0u8; 48];
    rand::thread_rng().fill_bytes(&mut random_bytes);
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// `challenge = BASE64URL(SHA256(verifier))`
pub fn generate_code_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

/// 32 random bytes, base64url. Used for both `state` and `nonce`.
pub fn generate_token() -> String {
    let mut random_bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut random_bytes);
    URL_SAFE_NO_PAD.encode(random_bytes)
}

/// One login attempt between the redirect to the provider and the callback.
#[derive(Clone)]
pub struct AuthorizationRequest {
    pub state: String,
    pub nonce: String,
    pub code_verifier: String,
    pub code_challenge: String,
    pub redirect_uri: String,
    pub requested_scopes: Vec<String>,
    /// Local path the user asked for before being sent to log in.
    pub return_to: String,
    pub created_at: Instant,
    pub expiry: Instant,
}

impl AuthorizationRequest {
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expiry
    }
}

impl std::fmt::Debug for AuthorizationRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationRequest")
            .field("state", &self.state)
            .field("redirect_uri", &self.redirect_uri)
            .field("requested_scopes", &self.requested_scopes)
            .field("return_to", &self.return_to)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum ConsumeError {
    #[error("login attempt expired")]
    Expired,
    #[error("unknown or already used state")]
    NotFound,
}

pub struct StateStore {
    pending: DashMap<String, AuthorizationRequest>,
    ttl: Duration,
    max_pending: usize,
    redirect_uri: String,
    scopes: Vec<String>,
}

impl StateStore {
    pub fn new(ttl: Duration, max_pending: usize, redirect_uri: &str, scopes: &[String]) -> Self {
        Self {
            pending: DashMap::new(),
            ttl,
            max_pending: max_pending.max(1),
            redirect_uri: redirect_uri.to_string(),
            scopes: scopes.to_vec(),
        }
    }

    /// Starts a login attempt: fresh state, nonce and PKCE pair, remembered
    /// until consumed or expired.
    pub fn issue(&self, return_to: &str) -> AuthorizationRequest {
        if self.pending.len() >= self.max_pending {
            self.make_room();
        }

        let code_verifier = generate_code_verifier();
        let created_at = Instant::now();
        let request = AuthorizationRequest {
            state: generate_token(),
            nonce: generate_token(),
            code_challenge: generate_code_challenge(&code_verifier),
            code_verifier,
            redirect_uri: self.redirect_uri.clone(),
            requested_scopes: self.scopes.clone(),
            return_to: return_to.to_string(),
            created_at,
            expiry: created_at + self.ttl,
        };
        self.pending.insert(request.state.clone(), request.clone());
        request
    }

    /// Removes and returns the pending login for `state`. The removal is
    /// atomic, so concurrent replays of one callback see exactly one success.
    pub fn consume(&self, state: &str) -> Result<AuthorizationRequest, ConsumeError> {
        let (_, request) = self.pending.remove(state).ok_or(ConsumeError::NotFound)?;
        if request.is_expired() {
            return Err(ConsumeError::Expired);
        }
        Ok(request)
    }

    /// Drops every expired entry, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let before = self.pending.len();
        self.pending.retain(|_, request| !request.is_expired());
        before.saturating_sub(self.pending.len())
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Purges expired entries every `every`, at least once per second.
    pub fn spawn_sweeper(self: Arc<Self>, every: Duration) -> tokio::task::JoinHandle<()> {
        let every = every.max(MIN_SWEEP_PERIOD);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(every);
            loop {
                interval.tick().await;
                let purged = self.purge_expired();
                if purged > 0 {
                    tracing::debug!(purged, "expired login attempts removed");
                }
            }
        })
    }

    fn make_room(&self) {
        if self.purge_expired() > 0 && self.pending.len() < self.max_pending {
            return;
        }
        let oldest = self
            .pending
            .iter()
            .min_by_key(|entry| entry.created_at)
            .map(|entry| entry.key().clone());
        if let Some(state) = oldest {
            tracing::warn!(
                max_pending = self.max_pending,
                "too many pending logins, dropping the oldest"
            );
            self.pending.remove(&state);
        }
    }
}
