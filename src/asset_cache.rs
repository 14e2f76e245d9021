//! TTL-bounded directory of the chains and tokens a provider supports.
//!
//! Providers publish which `(chain, token)` pairs they can route. Asking them
//! on every quote is slow and rate limited, so each provider owns one
//! [`AssetSupportCache`] that is filled once at startup and refreshed by a
//! background task at 90% of the TTL.
//!
//! Lookups never fail. When the cache has nothing to answer with, either
//! because it was never populated or because every refresh since the TTL
//! elapsed has failed, the configured [`FallbackBehavior`] decides:
//!
//! - [`FallbackBehavior::AllowAll`] treats everything as supported and lets
//!   the provider reject the route itself.
//! - [`FallbackBehavior::DenyUnknown`] only admits pairs present in the last
//!   successful listing, however old.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;

use alloy::primitives::Address;
use async_trait::async_trait;
use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::token::ChainId;

#[derive(Debug, thiserror::Error)]
pub(crate) enum AssetCacheError {
    #[error("asset listing request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("asset listing returned HTTP {status}")]
    Status { status: u16 },
    #[cfg(test)]
    #[error("scripted listing failure")]
    Scripted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FallbackBehavior {
    AllowAll,
    DenyUnknown,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AssetCacheConfig {
    pub enabled: bool,
    pub ttl_secs: u64,
    /// Defaults to 90% of the TTL.
    pub refresh_interval_secs: Option<u64>,
    pub max_retries: usize,
    pub retry_delay_ms: u64,
    pub fallback: FallbackBehavior,
}

impl Default for AssetCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ttl_secs: 3600,
            refresh_interval_secs: None,
            max_retries: 3,
            retry_delay_ms: 1000,
            fallback: FallbackBehavior::AllowAll,
        }
    }
}

impl AssetCacheConfig {
    fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    fn refresh_interval(&self) -> Duration {
        self.refresh_interval_secs.map_or_else(
            || Duration::from_millis(self.ttl_secs.saturating_mul(900)),
            Duration::from_secs,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ChainInfo {
    pub(crate) chain_id: ChainId,
    pub(crate) name: String,
}

/// One complete listing from a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct AssetDirectory {
    pub(crate) chains: HashMap<ChainId, ChainInfo>,
    pub(crate) tokens_by_chain: HashMap<ChainId, HashSet<Address>>,
}

impl AssetDirectory {
    fn token_count(&self) -> usize {
        self.tokens_by_chain.values().map(HashSet::len).sum()
    }
}

/// Source of a provider's supported assets.
#[async_trait]
pub(crate) trait AssetListing: Send + Sync + 'static {
    fn provider(&self) -> &'static str;

    async fn fetch(&self) -> Result<AssetDirectory, AssetCacheError>;
}

struct Snapshot {
    directory: AssetDirectory,
    fetched_at: Instant,
    last_updated: DateTime<Utc>,
}

/// Point-in-time view of the cache for operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CacheStatus {
    pub(crate) initialized: bool,
    pub(crate) valid: bool,
    pub(crate) last_updated: Option<DateTime<Utc>>,
    pub(crate) next_refresh: Option<DateTime<Utc>>,
    pub(crate) total_chains: usize,
    pub(crate) total_tokens: usize,
    pub(crate) age: Option<Duration>,
}

pub(crate) struct AssetSupportCache {
    listing: Arc<dyn AssetListing>,
    config: AssetCacheConfig,
    snapshot: RwLock<Option<Snapshot>>,
    refresh_guard: Mutex<()>,
    refresh_task: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl AssetSupportCache {
    pub(crate) fn new(listing: Arc<dyn AssetListing>, config: AssetCacheConfig) -> Self {
        Self {
            listing,
            config,
            snapshot: RwLock::new(None),
            refresh_guard: Mutex::new(()),
            refresh_task: std::sync::Mutex::new(None),
        }
    }

    /// Populates the cache if it has never been populated.
    ///
    /// Concurrent callers share a single fetch. A failed initialization is
    /// logged and leaves lookups on the fallback policy.
    pub(crate) async fn initialize(&self) {
        if !self.config.enabled || self.snapshot.read().await.is_some() {
            return;
        }

        if let Err(error) = self.refresh().await {
            warn!(
                provider = self.listing.provider(),
                %error,
                fallback = ?self.config.fallback,
                "Asset cache initialization failed, serving fallback policy"
            );
        }
    }

    /// Replaces the cached listing with a fresh one.
    ///
    /// If a refresh is already running, waits for it instead of fetching
    /// again. On failure the previous listing is kept untouched.
    pub(crate) async fn refresh(&self) -> Result<(), AssetCacheError> {
        let Ok(_guard) = self.refresh_guard.try_lock() else {
            debug!(provider = self.listing.provider(), "Joining in-flight refresh");
            let _joined = self.refresh_guard.lock().await;
            return Ok(());
        };

        let backoff = ExponentialBuilder::default()
            .with_min_delay(Duration::from_millis(self.config.retry_delay_ms))
            .with_max_times(self.config.max_retries);

        let directory = (|| async { self.listing.fetch().await })
            .retry(backoff)
            .notify(|error, delay| {
                warn!(
                    provider = self.listing.provider(),
                    %error,
                    ?delay,
                    "Asset listing fetch failed, retrying"
                );
            })
            .await?;

        info!(
            provider = self.listing.provider(),
            chains = directory.chains.len(),
            tokens = directory.token_count(),
            "Asset cache refreshed"
        );

        *self.snapshot.write().await = Some(Snapshot {
            directory,
            fetched_at: Instant::now(),
            last_updated: Utc::now(),
        });

        Ok(())
    }

    /// Starts the background refresh timer. Calling it again replaces the
    /// previous timer.
    pub(crate) fn spawn_refresh(self: &Arc<Self>) {
        if !self.config.enabled {
            return;
        }

        let cache: Weak<Self> = Arc::downgrade(self);
        let interval = self.config.refresh_interval();

        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;

                let Some(cache) = cache.upgrade() else {
                    break;
                };

                if let Err(error) = cache.refresh().await {
                    warn!(
                        provider = cache.listing.provider(),
                        %error,
                        "Scheduled asset cache refresh failed, keeping stale listing"
                    );
                }
            }
        });

        let mut slot = match self.refresh_task.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };

        if let Some(previous) = slot.replace(handle) {
            previous.abort();
        }
    }

    /// Cancels the background refresh timer.
    pub(crate) fn stop(&self) {
        let mut slot = match self.refresh_task.lock() {
            Ok(guard) => guard,
            Err(poison) => poison.into_inner(),
        };

        if let Some(handle) = slot.take() {
            handle.abort();
            debug!(provider = self.listing.provider(), "Asset cache refresh stopped");
        }
    }

    pub(crate) async fn is_chain_supported(&self, chain_id: ChainId) -> bool {
        self.lookup(|directory| directory.chains.contains_key(&chain_id))
            .await
    }

    pub(crate) async fn is_token_supported(&self, chain_id: ChainId, address: Address) -> bool {
        self.lookup(|directory| {
            directory
                .tokens_by_chain
                .get(&chain_id)
                .is_some_and(|tokens| tokens.contains(&address))
        })
        .await
    }

    async fn lookup(&self, known: impl Fn(&AssetDirectory) -> bool) -> bool {
        if !self.config.enabled {
            return self.config.fallback == FallbackBehavior::AllowAll;
        }

        let snapshot = self.snapshot.read().await;

        match (snapshot.as_ref(), self.config.fallback) {
            (Some(snapshot), _) if snapshot.fetched_at.elapsed() <= self.config.ttl() => {
                known(&snapshot.directory)
            }
            (_, FallbackBehavior::AllowAll) => true,
            (Some(snapshot), FallbackBehavior::DenyUnknown) => known(&snapshot.directory),
            (None, FallbackBehavior::DenyUnknown) => false,
        }
    }

    pub(crate) async fn status(&self) -> CacheStatus {
        let snapshot = self.snapshot.read().await;

        let Some(snapshot) = snapshot.as_ref() else {
            return CacheStatus {
                initialized: false,
                valid: false,
                last_updated: None,
                next_refresh: None,
                total_chains: 0,
                total_tokens: 0,
                age: None,
            };
        };

        let age = snapshot.fetched_at.elapsed();
        let next_refresh = chrono::Duration::from_std(self.config.refresh_interval())
            .ok()
            .and_then(|interval| snapshot.last_updated.checked_add_signed(interval));

        CacheStatus {
            initialized: true,
            valid: age <= self.config.ttl(),
            last_updated: Some(snapshot.last_updated),
            next_refresh,
            total_chains: snapshot.directory.chains.len(),
            total_tokens: snapshot.directory.token_count(),
            age: Some(age),
        }
    }
}

impl Drop for AssetSupportCache {
    fn drop(&mut self) {
        self.stop();
    }
}
