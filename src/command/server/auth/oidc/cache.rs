use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use crate::command::server::auth::oidc::Jwk;
use crate::command::server::error::Error;

pub const DEFAULT_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Clone, Debug)]
pub struct CachedKeys {
    pub keys: Arc<Vec<Jwk>>,
    pub fetched_at: Instant,
}

type Slot = Arc<tokio::sync::Mutex<Option<CachedKeys>>>;

/// Verification keys per issuer.
///
/// Every issuer has its own async mutex held across the fetch, so concurrent
/// verifications of one issuer share a single upstream round-trip.
pub struct JwksCache {
    refresh_interval: Duration,
    entries: Mutex<HashMap<String, Slot>>,
}

impl Default for JwksCache {
    fn default() -> Self {
        Self::new(DEFAULT_REFRESH_INTERVAL)
    }
}

impl JwksCache {
    pub fn new(refresh_interval: Duration) -> Self {
        Self {
            refresh_interval,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn slot(&self, issuer: &str) -> Slot {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(entries.entry(issuer.to_string()).or_default())
    }

    /// Cached keys of `issuer`, fetched when missing or older than the
    /// refresh interval.
    pub async fn get<F, Fut>(&self, issuer: &str, fetch: F) -> Result<CachedKeys, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Jwk>, Error>>,
    {
        let slot = self.slot(issuer);
        let mut cached = slot.lock().await;

        if let Some(keys) = cached.as_ref() {
            if keys.fetched_at.elapsed() < self.refresh_interval {
                return Ok(keys.clone());
            }
            debug!("JWKS of {issuer} expired");
        }

        let keys = Self::store(&mut cached, fetch().await?);
        Ok(keys)
    }

    /// Forces a refetch after a key lookup miss on the set fetched at
    /// `seen_at`. When another task already replaced that set, its result is
    /// returned without a new round-trip.
    pub async fn refresh<F, Fut>(
        &self,
        issuer: &str,
        seen_at: Instant,
        fetch: F,
    ) -> Result<CachedKeys, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<Jwk>, Error>>,
    {
        let slot = self.slot(issuer);
        let mut cached = slot.lock().await;

        if let Some(keys) = cached.as_ref() {
            if keys.fetched_at != seen_at {
                debug!("JWKS of {issuer} already refreshed");
                return Ok(keys.clone());
            }
        }

        let keys = Self::store(&mut cached, fetch().await?);
        Ok(keys)
    }

    fn store(cached: &mut Option<CachedKeys>, keys: Vec<Jwk>) -> CachedKeys {
        let keys = CachedKeys {
            keys: Arc::new(keys),
            fetched_at: Instant::now(),
        };
        *cached = Some(keys.clone());
        keys
    }
}
