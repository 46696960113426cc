//! Backend Directory Cache
//!
//! Memoizes the provider's backend list for a fixed TTL. A stale snapshot
//! is refreshed on the next lookup. When that refresh fails the stale list
//! is re-stamped and served for another TTL before the provider is asked
//! again.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::discovery::DiscoveryProvider;
use crate::error::DiscoveryError;
use crate::types::BackendSet;

/// One discovery cycle's result
#[derive(Debug)]
struct DirectorySnapshot {
    backends: BackendSet,
    fetched_at: Instant,
}

impl DirectorySnapshot {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

pub struct BackendDirectory {
    provider: Arc<dyn DiscoveryProvider>,
    ttl: Duration,
    snapshot: RwLock<Option<Arc<DirectorySnapshot>>>,
}

impl BackendDirectory {
    pub fn new(provider: Arc<dyn DiscoveryProvider>, ttl: Duration) -> Self {
        Self {
            provider,
            ttl,
            snapshot: RwLock::new(None),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Current backend set, refreshing first when the snapshot is stale.
    pub async fn get_backends(&self) -> Result<BackendSet, DiscoveryError> {
        let current = self.snapshot.read().await.clone();

        match current {
            Some(snapshot) if snapshot.is_fresh(self.ttl) => Ok(snapshot.backends.clone()),
            Some(stale) => match self.refresh().await {
                Ok(backends) => Ok(backends),
                Err(e) => {
                    warn!(
                        error = %e,
                        age_secs = stale.fetched_at.elapsed().as_secs(),
                        retry_in_secs = self.ttl.as_secs(),
                        "Backend refresh failed, serving stale list"
                    );
                    self.install(stale.backends.clone()).await;
                    Ok(stale.backends.clone())
                }
            },
            None => self.refresh().await.map_err(|e| {
                warn!(error = %e, "Backend refresh failed and no previous list exists");
                e
            }),
        }
    }

    /// Ask the provider for the current fleet and swap in a new snapshot.
    ///
    /// The lock is only taken to install the result, never across the
    /// provider call; concurrent refreshes both run and the last one wins.
    pub async fn refresh(&self) -> Result<BackendSet, DiscoveryError> {
        let started = Instant::now();

        let addresses = self
            .provider
            .list_backend_addresses()
            .await
            .map_err(|source| DiscoveryError::Lookup {
                provider: self.provider.name(),
                source,
            })?;

        let backends = BackendSet::from_discovered(addresses);
        info!(
            provider = self.provider.name(),
            count = backends.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Backend list refreshed"
        );

        self.install(backends.clone()).await;
        Ok(backends)
    }

    async fn install(&self, backends: BackendSet) {
        let snapshot = Arc::new(DirectorySnapshot {
            backends,
            fetched_at: Instant::now(),
        });
        *self.snapshot.write().await = Some(snapshot);
    }

    /// Populate the directory before serving traffic; failure is not fatal.
    pub async fn warm_up(&self) {
        if let Err(e) = self.refresh().await {
            warn!(error = %e, "Initial backend lookup failed, will retry on first purge");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Address;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingProvider {
        calls: AtomicUsize,
        failing: AtomicBool,
        addresses: Vec<Address>,
    }

    impl CountingProvider {
        fn new(hosts: &[&str]) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failing: AtomicBool::new(false),
                addresses: hosts.iter().map(|h| Address::new(*h, None)).collect(),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn set_failing(&self, failing: bool) {
            self.failing.store(failing, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl DiscoveryProvider for CountingProvider {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn authenticate(&self) -> Result<()> {
            Ok(())
        }

        async fn list_backend_addresses(&self) -> Result<Vec<Address>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("inventory API unavailable");
            }
            Ok(self.addresses.clone())
        }
    }

    #[tokio::test]
    async fn test_fresh_snapshot_is_reused() {
        let provider = CountingProvider::new(&["10.0.0.1", "10.0.0.2"]);
        let directory = BackendDirectory::new(provider.clone(), Duration::from_secs(60));

        let first = directory.get_backends().await.unwrap();
        let second = directory.get_backends().await.unwrap();

        assert_eq!(provider.calls(), 1);
        assert!(first.ptr_eq(&second));
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn test_stale_snapshot_triggers_one_lookup() {
        let provider = CountingProvider::new(&["10.0.0.1"]);
        let directory = BackendDirectory::new(provider.clone(), Duration::from_millis(20));

        directory.get_backends().await.unwrap();
        tokio::time::sleep(Duration::from_millis(40)).await;
        directory.get_backends().await.unwrap();

        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_stale_served_when_refresh_fails() {
        let provider = CountingProvider::new(&["10.0.0.1", "10.0.0.2"]);
        let directory = BackendDirectory::new(provider.clone(), Duration::from_millis(200));

        let original = directory.get_backends().await.unwrap();
        provider.set_failing(true);
        tokio::time::sleep(Duration::from_millis(250)).await;

        let served = directory.get_backends().await.unwrap();
        assert!(served.ptr_eq(&original));
        assert_eq!(provider.calls(), 2);

        // Failed refresh re-stamps the snapshot: no lookups until another TTL passes
        for _ in 0..5 {
            let served = directory.get_backends().await.unwrap();
            assert!(served.ptr_eq(&original));
        }
        assert_eq!(provider.calls(), 2);

        provider.set_failing(false);
        tokio::time::sleep(Duration::from_millis(250)).await;
        directory.get_backends().await.unwrap();
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_outage_does_not_block_every_lookup() {
        let provider = CountingProvider::new(&["10.0.0.1"]);
        let directory = BackendDirectory::new(provider.clone(), Duration::from_secs(1));

        directory.get_backends().await.unwrap();
        provider.set_failing(true);
        tokio::time::sleep(Duration::from_millis(1100)).await;

        for _ in 0..5 {
            assert_eq!(directory.get_backends().await.unwrap().len(), 1);
        }
        assert_eq!(provider.calls(), 2);
    }

    #[tokio::test]
    async fn test_failure_without_snapshot_propagates() {
        let provider = CountingProvider::new(&["10.0.0.1"]);
        provider.set_failing(true);
        let directory = BackendDirectory::new(provider.clone(), Duration::from_secs(60));

        let err = directory.get_backends().await.unwrap_err();
        assert!(err.to_string().contains("inventory API unavailable"));

        // A failed warm-up leaves nothing cached
        directory.warm_up().await;
        assert!(directory.get_backends().await.is_err());
        assert_eq!(provider.calls(), 3);
    }

    #[tokio::test]
    async fn test_warm_up_populates_snapshot() {
        let provider = CountingProvider::new(&["10.0.0.1", "10.0.0.1", "10.0.0.3"]);
        let directory = BackendDirectory::new(provider.clone(), Duration::from_secs(60));

        directory.warm_up().await;
        let backends = directory.get_backends().await.unwrap();

        assert_eq!(provider.calls(), 1);
        assert_eq!(backends.to_string(), "[10.0.0.1, 10.0.0.3]");
    }
}
