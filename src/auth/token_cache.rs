use crate::providers::ProviderError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::future::{BoxFuture, FutureExt, Shared};
use secrecy::SecretString;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Exchanges a refresh token for a fresh access token
#[async_trait]
pub trait TokenRefresher: Send + Sync {
    async fn refresh(&self, refresh_token: &str) -> Result<SecretString, ProviderError>;
}

/// Cached access token for one refresh token
#[derive(Debug, Clone)]
pub struct AccessTokenEntry {
    pub access_token: SecretString,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl AccessTokenEntry {
    /// Check if token is expired
    pub fn is_expired(&self) -> bool {
        Utc::now() > self.expires_at
    }
}

type RefreshOutcome = Result<AccessTokenEntry, Arc<ProviderError>>;
type PendingRefresh = Shared<BoxFuture<'static, RefreshOutcome>>;

struct Inner {
    entries: DashMap<String, AccessTokenEntry>,
    /// In-flight refreshes, one per refresh token
    pending: Mutex<HashMap<String, PendingRefresh>>,
    refresher: Arc<dyn TokenRefresher>,
    ttl: Duration,
}

/// Process-wide access token cache.
///
/// Refreshes are single-flight per refresh token: the first caller starts a
/// shared future and concurrent callers await the same outcome, success or
/// failure. Distinct refresh tokens never wait on each other.
#[derive(Clone)]
pub struct TokenCache {
    inner: Arc<Inner>,
}

impl TokenCache {
    pub fn new(refresher: Arc<dyn TokenRefresher>, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: DashMap::new(),
                pending: Mutex::new(HashMap::new()),
                refresher,
                ttl,
            }),
        }
    }

    /// Get a valid access token, refreshing when absent or expired
    pub async fn acquire(&self, refresh_token: &str) -> Result<SecretString, ProviderError> {
        if let Some(token) = self.cached(refresh_token) {
            return Ok(token);
        }

        match self.pending_refresh(refresh_token).await {
            Ok(entry) => Ok(entry.access_token),
            Err(e) => Err(match e.as_ref() {
                ProviderError::UpstreamAuth(message) => ProviderError::UpstreamAuth(message.clone()),
                other => ProviderError::UpstreamAuth(other.to_string()),
            }),
        }
    }

    /// Evict the cached token so the next acquisition refreshes
    pub fn invalidate(&self, refresh_token: &str) {
        if self.inner.entries.remove(refresh_token).is_some() {
            tracing::info!("🔑 Evicted access token after upstream auth failure");
        }
    }

    /// Check whether a refresh token can still obtain an access token.
    /// Always performs a refresh call, bypassing the cache.
    pub async fn is_live(&self, refresh_token: &str) -> bool {
        match self.inner.refresher.refresh(refresh_token).await {
            Ok(_) => true,
            Err(e) => {
                tracing::debug!("Token liveness check failed: {}", e);
                false
            }
        }
    }

    fn cached(&self, refresh_token: &str) -> Option<SecretString> {
        self.inner
            .entries
            .get(refresh_token)
            .filter(|entry| !entry.is_expired())
            .map(|entry| entry.access_token.clone())
    }

    fn pending_refresh(&self, refresh_token: &str) -> PendingRefresh {
        let mut pending = self
            .inner
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(refresh) = pending.get(refresh_token) {
            return refresh.clone();
        }

        let inner = Arc::clone(&self.inner);
        let key = refresh_token.to_string();
        let refresh = async move {
            let result = inner.refresher.refresh(&key).await;
            let outcome = match result {
                Ok(access_token) => {
                    let ttl = chrono::Duration::from_std(inner.ttl)
                        .unwrap_or_else(|_| chrono::Duration::seconds(3600));
                    let entry = AccessTokenEntry {
                        access_token,
                        refresh_token: key.clone(),
                        expires_at: Utc::now() + ttl,
                    };
                    inner.entries.insert(key.clone(), entry.clone());
                    tracing::info!("🔑 Refreshed access token");
                    Ok(entry)
                }
                Err(e) => {
                    tracing::error!("❌ Access token refresh failed: {}", e);
                    Err(Arc::new(e))
                }
            };
            inner
                .pending
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&key);
            outcome
        }
        .boxed()
        .shared();

        pending.insert(refresh_token.to_string(), refresh.clone());
        refresh
    }
}
