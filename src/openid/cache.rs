//! Token & key cache: provider metadata and JWKS with a TTL, forced refresh
//! on unknown key ids, and stale fallback while the provider is down.

use std::{
    cmp,
    sync::Arc,
    time::{Duration, Instant},
};
use tokio::sync::{Mutex, RwLock};

use super::jwks::SigningKey;
use super::metadata::{fetch_metadata, ProviderMetadata};
use crate::error::AuthError;

const MAX_BACKOFF: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("no signing key for kid {kid:?}")]
    NotFound { kid: Option<String> },
    #[error("{0}")]
    Unreachable(String),
}

impl From<KeyError> for AuthError {
    fn from(e: KeyError) -> Self {
        match e {
            KeyError::NotFound { kid } => {
                AuthError::InvalidToken(format!("unknown signing key {kid:?}"))
            }
            KeyError::Unreachable(detail) => AuthError::ProviderUnreachable(detail),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheOptions {
    pub ttl: Duration,
    pub min_refresh_interval: Duration,
}

struct Entry {
    metadata: Arc<ProviderMetadata>,
    fetched_at: Instant,
    /// Bumped on every successful fetch.
    generation: u64,
    last_attempt: Instant,
    failures: u32,
    retry_at: Option<Instant>,
}

impl Entry {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }

    fn in_backoff(&self) -> bool {
        self.retry_at.map_or(false, |at| Instant::now() < at)
    }
}

#[derive(Clone, Copy)]
enum Refresh {
    /// TTL ran out or nothing is cached yet.
    Expired,
    /// A token named a key id the cached set does not hold.
    UnknownKey { seen_generation: u64 },
    /// Periodic refresh from the background task.
    Scheduled,
}

pub struct KeyCache {
    client: reqwest::Client,
    discovery_url: String,
    issuer: String,
    options: CacheOptions,
    current: RwLock<Option<Entry>>,
    refreshing: Mutex<()>,
}

impl KeyCache {
    pub fn new(
        client: reqwest::Client,
        discovery_url: impl Into<String>,
        issuer: impl Into<String>,
        options: CacheOptions,
    ) -> Self {
        Self {
            client,
            discovery_url: discovery_url.into(),
            issuer: issuer.into(),
            options,
            current: RwLock::new(None),
            refreshing: Mutex::new(()),
        }
    }

    /// Fetches metadata and keys up front so the first login does not pay for it.
    pub async fn init(&self) -> Result<(), KeyError> {
        self.refresh(Refresh::Expired).await.map(|_| ())
    }

    pub async fn get_metadata(&self) -> Result<Arc<ProviderMetadata>, KeyError> {
        if let Some(entry) = self.current.read().await.as_ref() {
            if entry.is_fresh(self.options.ttl) || entry.in_backoff() {
                return Ok(entry.metadata.clone());
            }
        }
        self.refresh(Refresh::Expired).await
    }

    /// Resolves the key a token was signed with, refreshing once when the
    /// key id is unknown so that provider key rotation is picked up.
    pub async fn get_signing_key(&self, kid: Option<&str>) -> Result<Arc<SigningKey>, KeyError> {
        let metadata = self.get_metadata().await?;
        if let Some(key) = metadata.signing_keys.find(kid) {
            return Ok(key);
        }

        let seen_generation = self.generation().await;
        tracing::debug!(?kid, "unknown key id, refreshing jwks");
        let metadata = self.refresh(Refresh::UnknownKey { seen_generation }).await?;
        metadata.signing_keys.find(kid).ok_or_else(|| KeyError::NotFound {
            kid: kid.map(str::to_string),
        })
    }

    /// Refreshes every `interval` until the returned task is aborted.
    pub fn spawn_refresh(self: Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match self.refresh(Refresh::Scheduled).await {
                    Ok(_) => tracing::debug!("jwks updated"),
                    Err(e) => tracing::error!("Jwks not updated: {:?}", e),
                };
            }
        })
    }

    async fn generation(&self) -> u64 {
        self.current
            .read()
            .await
            .as_ref()
            .map_or(0, |entry| entry.generation)
    }

    async fn refresh(&self, reason: Refresh) -> Result<Arc<ProviderMetadata>, KeyError> {
        // One fetch at a time; latecomers reuse what the winner fetched.
        let _guard = self.refreshing.lock().await;

        if let Some(entry) = self.current.read().await.as_ref() {
            let reuse = match reason {
                Refresh::Expired => entry.is_fresh(self.options.ttl) || entry.in_backoff(),
                Refresh::UnknownKey { seen_generation } => {
                    entry.generation != seen_generation
                        || entry.last_attempt.elapsed() < self.options.min_refresh_interval
                        || entry.in_backoff()
                }
                Refresh::Scheduled => false,
            };
            if reuse {
                return Ok(entry.metadata.clone());
            }
        }

        let fetched = fetch_metadata(&self.client, &self.discovery_url, &self.issuer).await;

        let mut current = self.current.write().await;
        match fetched {
            Ok(metadata) => {
                let metadata = Arc::new(metadata);
                let generation = current.as_ref().map_or(0, |entry| entry.generation) + 1;
                let now = Instant::now();
                tracing::debug!(
                    issuer = %metadata.issuer,
                    keys = metadata.signing_keys.len(),
                    generation,
                    "provider metadata refreshed"
                );
                *current = Some(Entry {
                    metadata: metadata.clone(),
                    fetched_at: now,
                    generation,
                    last_attempt: now,
                    failures: 0,
                    retry_at: None,
                });
                Ok(metadata)
            }
            Err(e) => match current.as_mut() {
                Some(entry) => {
                    entry.failures = entry.failures.saturating_add(1);
                    let backoff = cmp::min(
                        Duration::from_secs(1u64 << cmp::min(entry.failures - 1, 6)),
                        MAX_BACKOFF,
                    );
                    entry.last_attempt = Instant::now();
                    entry.retry_at = Some(entry.last_attempt + backoff);
                    tracing::warn!(
                        error = %e,
                        failures = entry.failures,
                        retry_in = ?backoff,
                        "provider metadata refresh failed, serving cached copy"
                    );
                    Ok(entry.metadata.clone())
                }
                None => {
                    tracing::error!(error = %e, "provider metadata unavailable");
                    Err(e)
                }
            },
        }
    }
}
