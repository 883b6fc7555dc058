use std::future::Future;
use std::time::{Duration, Instant};

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::debug;

use crate::command::server::error::Error;

/// Tokens are renewed this long before they actually expire.
const EXPIRY_MARGIN: Duration = Duration::from_secs(60);

/// OAuth2 token endpoint answer.
#[derive(Clone, Debug, Deserialize)]
pub struct BearerToken {
    access_token: Option<String>,
    #[serde(default = "BearerToken::default_expires_in")]
    expires_in: u64,
}

impl BearerToken {
    fn default_expires_in() -> u64 {
        3600
    }

    pub fn token(&self) -> Result<String, Error> {
        self.access_token.clone().ok_or_else(|| {
            Error::UpstreamTransport("Missing access_token in token endpoint response".to_string())
        })
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.expires_in)
    }
}

struct CachedToken {
    token: String,
    refresh_at: Instant,
}

/// Service credential shared by every request of one provider.
#[derive(Default)]
pub struct AccessTokenCache {
    cached: Mutex<Option<CachedToken>>,
}

impl AccessTokenCache {
    /// Returns the cached token, or calls `login` when there is none or it is
    /// about to expire. Concurrent callers wait for a single login.
    pub async fn get<F, Fut>(&self, login: F) -> Result<String, Error>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<BearerToken, Error>>,
    {
        let mut cached = self.cached.lock().await;

        if let Some(token) = cached.as_ref() {
            if Instant::now() < token.refresh_at {
                return Ok(token.token.clone());
            }
            debug!("Access token expired, logging in again");
        }

        let bearer = login().await?;
        let token = bearer.token()?;
        let refresh_at = Instant::now() + bearer.ttl().saturating_sub(EXPIRY_MARGIN);

        *cached = Some(CachedToken {
            token: token.clone(),
            refresh_at,
        });

        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    fn bearer(token: &str, expires_in: u64) -> BearerToken {
        BearerToken {
            access_token: Some(token.to_string()),
            expires_in,
        }
    }

    #[test]
    fn test_token_missing() {
        let bearer = BearerToken {
            access_token: None,
            expires_in: 3600,
        };

        assert!(matches!(bearer.token(), Err(Error::UpstreamTransport(_))));
    }

    #[test]
    fn test_expires_in_defaults_to_one_hour() {
        let bearer: BearerToken = serde_json::from_str(r#"{"access_token": "abc"}"#).unwrap();
        assert_eq!(bearer.ttl(), Duration::from_secs(3600));
    }

    #[tokio::test]
    async fn test_token_is_reused_until_expiry() {
        let cache = AccessTokenCache::default();
        let logins = AtomicUsize::new(0);
        let login = || async {
            logins.fetch_add(1, Ordering::SeqCst);
            Ok(bearer("abc", 3600))
        };

        assert_eq!(cache.get(login).await.unwrap(), "abc");
        assert_eq!(cache.get(login).await.unwrap(), "abc");
        assert_eq!(logins.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_short_lived_token_is_renewed() {
        let cache = AccessTokenCache::default();
        let logins = AtomicUsize::new(0);
        let login = || async {
            let n = logins.fetch_add(1, Ordering::SeqCst);
            Ok(bearer(&format!("token{n}"), 30))
        };

        assert_eq!(cache.get(login).await.unwrap(), "token0");
        assert_eq!(cache.get(login).await.unwrap(), "token1");
    }

    #[tokio::test]
    async fn test_failed_login_is_not_cached() {
        let cache = AccessTokenCache::default();

        let result = cache
            .get(|| async { Err(Error::TokenInvalid("bad secret".to_string())) })
            .await;
        assert!(result.is_err());

        assert_eq!(
            cache.get(|| async { Ok(bearer("abc", 3600)) }).await.unwrap(),
            "abc"
        );
    }
}
