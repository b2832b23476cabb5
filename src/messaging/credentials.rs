//! Expiring broker credentials with single-flight refresh

use crate::messaging::error::{MessagingError, MessagingResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use moka::Expiry;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// A secret with an expiry instant
#[derive(Clone)]
pub struct Credential {
    pub secret: String,
    pub expires_at: DateTime<Utc>,
}

impl std::fmt::Debug for Credential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credential")
            .field("secret", &"<redacted>")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Source of fresh credentials, e.g. a token endpoint or secret store
#[async_trait]
pub trait CredentialSource: Send + Sync {
    async fn fetch(&self) -> MessagingResult<Credential>;
}

struct CredentialExpiry {
    refresh_margin: Duration,
}

impl Expiry<(), Credential> for CredentialExpiry {
    fn expire_after_create(&self, _key: &(), value: &Credential, _created_at: Instant) -> Option<Duration> {
        let remaining = (value.expires_at - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        Some(remaining.saturating_sub(self.refresh_margin))
    }
}

/// Cached credential shared by all callers.
///
/// Concurrent callers that find the cache empty or expired wait on a single
/// refresh instead of each hitting the source.
#[derive(Clone)]
pub struct CredentialCache {
    source: Arc<dyn CredentialSource>,
    cache: Cache<(), Credential>,
}

impl CredentialCache {
    /// Refresh `refresh_margin` before the credential actually expires
    pub fn new(source: Arc<dyn CredentialSource>, refresh_margin: Duration) -> Self {
        let cache = Cache::builder()
            .max_capacity(1)
            .expire_after(CredentialExpiry { refresh_margin })
            .build();

        Self { source, cache }
    }

    /// Current credential, refreshed if missing or expired
    pub async fn get(&self) -> MessagingResult<Credential> {
        let source = self.source.clone();
        self.cache
            .try_get_with((), async move {
                debug!("Refreshing broker credential");
                source.fetch().await
            })
            .await
            .map_err(|e: Arc<MessagingError>| (*e).clone())
    }

    /// Drop the cached credential, e.g. after the broker rejected it
    pub async fn invalidate(&self) {
        self.cache.invalidate(&()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingSource {
        calls: AtomicUsize,
        lifetime: chrono::Duration,
    }

    #[async_trait]
    impl CredentialSource for CountingSource {
        async fn fetch(&self) -> MessagingResult<Credential> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            Ok(Credential {
                secret: format!("secret-{}", n),
                expires_at: Utc::now() + self.lifetime,
            })
        }
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            lifetime: chrono::Duration::hours(1),
        });
        let cache = CredentialCache::new(source.clone(), Duration::from_secs(60));

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get().await.unwrap().secret })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.await.unwrap(), "secret-0");
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let source = Arc::new(CountingSource {
            calls: AtomicUsize::new(0),
            lifetime: chrono::Duration::hours(1),
        });
        let cache = CredentialCache::new(source.clone(), Duration::from_secs(60));

        assert_eq!(cache.get().await.unwrap().secret, "secret-0");
        cache.invalidate().await;
        assert_eq!(cache.get().await.unwrap().secret, "secret-1");
    }

    #[test]
    fn test_debug_redacts_secret() {
        let credential = Credential {
            secret: "hunter2".to_string(),
            expires_at: Utc::now(),
        };
        assert!(!format!("{:?}", credential).contains("hunter2"));
    }
}
