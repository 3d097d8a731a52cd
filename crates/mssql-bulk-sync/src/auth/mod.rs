//! Access tokens for managed identity data sources.
//!
//! [`TokenCache`] is an explicit object owned by whoever dispatches jobs and
//! handed to each invocation; there is no process-wide token state.

pub mod managed_identity;

pub use managed_identity::ManagedIdentityTokenProvider;

use crate::config::{DataSourceConfig, SyncSettings};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::stream::{self, StreamExt};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// A bearer token and when it stops being valid.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken {
    pub token: String,
    pub expires_on: DateTime<Utc>,
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AccessToken")
            .field("token", &"<redacted>")
            .field("expires_on", &self.expires_on)
            .finish()
    }
}

/// Source of fresh tokens for a tenant.
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn acquire(&self, tenant_id: &str) -> Result<AccessToken>;
}

type Slot = Arc<Mutex<Option<AccessToken>>>;

/// Per-tenant memoized tokens.
///
/// Tenants are acquired concurrently, at most `concurrency` at a time. Within
/// a tenant, callers serialize on that tenant's slot so only one acquisition
/// is in flight, and a cached token is reused until it is within
/// `refresh_margin` of expiring.
pub struct TokenCache<P> {
    provider: P,
    slots: Mutex<HashMap<String, Slot>>,
    refresh_margin: Duration,
    concurrency: usize,
}

impl<P: AccessTokenProvider> TokenCache<P> {
    pub fn new(provider: P, refresh_margin: Duration, concurrency: usize) -> Self {
        Self {
            provider,
            slots: Mutex::new(HashMap::new()),
            refresh_margin,
            concurrency: concurrency.max(1),
        }
    }

    /// Cache tuned by the engine settings.
    pub fn from_settings(provider: P, settings: &SyncSettings) -> Self {
        Self::new(
            provider,
            Duration::seconds(settings.token_refresh_margin_secs),
            settings.token_concurrency,
        )
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    async fn slot(&self, tenant: &str) -> Slot {
        let mut slots = self.slots.lock().await;
        slots
            .entry(tenant.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(None)))
            .clone()
    }

    /// A valid token for `tenant` (compared case-insensitively).
    pub async fn get_token(&self, tenant: &str) -> Result<String> {
        let tenant = tenant.trim().to_lowercase();
        let slot = self.slot(&tenant).await;
        let mut cached = slot.lock().await;

        if let Some(token) = cached.as_ref() {
            if token.expires_on - self.refresh_margin > Utc::now() {
                debug!("Reusing cached token for tenant {}", tenant);
                return Ok(token.token.clone());
            }
        }

        let token = self.provider.acquire(&tenant).await?;
        info!(
            "Acquired access token for tenant {} (expires {})",
            tenant,
            token.expires_on.to_rfc3339()
        );
        let value = token.token.clone();
        *cached = Some(token);
        Ok(value)
    }

    /// Tokens for every managed identity source, keyed by lowercased tenant.
    /// Sources using connection string auth contribute nothing.
    pub async fn get_token_cache<'a, I>(&self, sources: I) -> Result<HashMap<String, String>>
    where
        I: IntoIterator<Item = &'a DataSourceConfig>,
    {
        let tenants: BTreeSet<String> = sources.into_iter().filter_map(|s| s.token_key()).collect();
        if tenants.is_empty() {
            return Ok(HashMap::new());
        }

        let results: Vec<Result<(String, String)>> = stream::iter(tenants)
            .map(|tenant| async move {
                let token = self.get_token(&tenant).await?;
                Ok::<_, SyncError>((tenant, token))
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        results.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        lifetime: Duration,
        latency: std::time::Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
    }

    impl CountingProvider {
        fn new(lifetime: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                lifetime,
                latency: std::time::Duration::ZERO,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
            }
        }

        fn slow(mut self, latency: std::time::Duration) -> Self {
            self.latency = latency;
            self
        }
    }

    #[async_trait]
    impl AccessTokenProvider for CountingProvider {
        async fn acquire(&self, tenant_id: &str) -> Result<AccessToken> {
            if tenant_id == "broken" {
                return Err(SyncError::Token {
                    tenant: tenant_id.into(),
                    message: "no identity".into(),
                });
            }
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let running = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(self.latency).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(AccessToken {
                token: format!("{}-{}", tenant_id, n),
                expires_on: Utc::now() + self.lifetime,
            })
        }
    }

    fn source(managed: bool, tenant: Option<&str>) -> DataSourceConfig {
        DataSourceConfig {
            connection_string: "Server=db;Database=Shop".into(),
            managed_identity: managed,
            tenant_id: tenant.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn test_shared_tenant_yields_single_entry() {
        let cache = TokenCache::new(CountingProvider::new(Duration::hours(1)), Duration::minutes(5), 4);
        let sources = [
            source(true, Some("Tenant-A")),
            source(true, Some("tenant-a")),
            source(false, None),
        ];

        let first = cache.get_token_cache(&sources).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first["tenant-a"], "tenant-a-1");

        let second = cache.get_token_cache(&sources).await.unwrap();
        assert_eq!(second, first);
        assert_eq!(cache.provider.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refreshes_inside_margin() {
        let cache = TokenCache::new(CountingProvider::new(Duration::minutes(4)), Duration::minutes(5), 4);
        assert_eq!(cache.get_token("t").await.unwrap(), "t-1");
        assert_eq!(cache.get_token("t").await.unwrap(), "t-2");
    }

    #[tokio::test]
    async fn test_no_managed_identity_sources() {
        let cache = TokenCache::new(CountingProvider::new(Duration::hours(1)), Duration::minutes(5), 4);
        let tokens = cache.get_token_cache(&[source(false, None)]).await.unwrap();
        assert!(tokens.is_empty());
        assert_eq!(cache.provider.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_distinct_tenants_acquired_concurrently() {
        let provider = CountingProvider::new(Duration::hours(1)).slow(std::time::Duration::from_millis(20));
        let cache = TokenCache::new(provider, Duration::minutes(5), 4);
        let sources: Vec<_> = (0..10)
            .map(|i| source(true, Some(&format!("tenant-{}", i))))
            .collect();

        let tokens = cache.get_token_cache(&sources).await.unwrap();

        assert_eq!(tokens.len(), 10);
        assert_eq!(cache.provider.calls.load(Ordering::SeqCst), 10);
        let peak = cache.provider.peak.load(Ordering::SeqCst);
        assert!(peak > 1, "acquisitions ran one at a time");
        assert!(peak <= 4, "{} acquisitions overlapped, limit is 4", peak);
    }

    #[tokio::test]
    async fn test_acquisition_failure_propagates() {
        let cache = TokenCache::new(CountingProvider::new(Duration::hours(1)), Duration::minutes(5), 4);
        let err = cache
            .get_token_cache(&[source(true, Some("broken"))])
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Token { .. }));
    }

    #[test]
    fn test_debug_redacts_token() {
        let token = AccessToken {
            token: "eyJ0eXAi".into(),
            expires_on: Utc::now(),
        };
        assert!(!format!("{:?}", token).contains("eyJ0eXAi"));
    }
}
