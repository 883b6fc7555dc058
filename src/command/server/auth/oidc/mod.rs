pub mod cache;
pub mod jwk;

use std::sync::Arc;

use jsonwebtoken::{decode, decode_header, Algorithm, Validation};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use tracing::{debug, info, instrument, warn};

use crate::command::server::auth::upstream;
use crate::command::server::error::Error;
pub use cache::JwksCache;
pub use jwk::Jwk;
use jwk::{find_key, JwkSet};

const CLOCK_SKEW_TOLERANCE: u64 = 60;

#[derive(Debug, Deserialize)]
struct ProviderMetadata {
    issuer: String,
    jwks_uri: String,
}

/// Verifies ID tokens of one issuer.
pub struct OidcVerifier {
    issuer: String,
    audience: Option<String>,
    client: Client,
    cache: Arc<JwksCache>,
}

/// Claims of a token whose signature and standard claims were checked.
#[derive(Clone, Debug)]
pub struct VerifiedToken {
    claims: Map<String, Value>,
}

impl VerifiedToken {
    #[cfg(test)]
    pub fn from_claims(claims: Value) -> Self {
        match claims {
            Value::Object(claims) => Self { claims },
            _ => Self { claims: Map::new() },
        }
    }

    pub fn claims<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_value(Value::Object(self.claims.clone()))
            .map_err(|e| Error::TokenInvalid(format!("failed to get claim from token: {e}")))
    }

    pub fn claim(&self, name: &str) -> Option<&Value> {
        self.claims.get(name)
    }

    pub fn claim_str(&self, name: &str) -> Option<&str> {
        self.claims.get(name).and_then(Value::as_str)
    }
}

impl OidcVerifier {
    /// `audience: None` skips the `aud` check.
    pub fn new(
        issuer: impl Into<String>,
        audience: Option<String>,
        client: Client,
        cache: Arc<JwksCache>,
    ) -> Self {
        Self {
            issuer: issuer.into(),
            audience,
            client,
            cache,
        }
    }

    pub fn issuer(&self) -> &str {
        &self.issuer
    }

    #[instrument(skip(self, token), fields(issuer = %self.issuer))]
    pub async fn verify(&self, token: &str) -> Result<VerifiedToken, Error> {
        let header = decode_header(token)
            .map_err(|e| Error::TokenInvalid(format!("failed to decode token header: {e}")))?;

        debug!("JWT header: alg={:?}, kid={:?}", header.alg, header.kid);
        check_algorithm(header.alg)?;

        let kid = header.kid.as_deref();
        let cached = self.cache.get(&self.issuer, || self.fetch_keys()).await?;

        let jwk = if let Some(jwk) = find_key(&cached.keys, kid) {
            jwk.clone()
        } else {
            debug!("No key for kid {kid:?}, refreshing key set");
            let refreshed = self
                .cache
                .refresh(&self.issuer, cached.fetched_at, || self.fetch_keys())
                .await?;

            find_key(&refreshed.keys, kid).cloned().ok_or_else(|| {
                Error::TokenInvalid(format!("failed to verify token: no key found for kid {kid:?}"))
            })?
        };

        let decoding_key = jwk.to_decoding_key()?;

        let mut validation = Validation::new(header.alg);
        validation.set_issuer(&[&self.issuer]);
        if let Some(audience) = &self.audience {
            validation.set_audience(&[audience]);
        } else {
            validation.validate_aud = false;
        }
        validation.leeway = CLOCK_SKEW_TOLERANCE;
        validation.validate_exp = true;
        validation.validate_nbf = true;

        let token_data = decode::<Map<String, Value>>(token, &decoding_key, &validation)
            .map_err(|e| {
                warn!("JWT validation failed: {e}");
                Error::TokenInvalid(format!("failed to verify token: {e}"))
            })?;

        Ok(VerifiedToken {
            claims: token_data.claims,
        })
    }

    async fn fetch_keys(&self) -> Result<Vec<Jwk>, Error> {
        let discovery_url = format!(
            "{}/.well-known/openid-configuration",
            self.issuer.trim_end_matches('/')
        );

        let metadata: ProviderMetadata = upstream::fetch_json(
            self.client.get(&discovery_url),
            "failed to query provider configuration",
        )
        .await?;

        if metadata.issuer != self.issuer {
            let msg = format!(
                "oidc: issuer did not match the issuer returned by provider, expected {:?} got {:?}",
                self.issuer, metadata.issuer
            );
            return Err(Error::ProviderConfig(msg));
        }

        let key_set: JwkSet =
            upstream::fetch_json(self.client.get(&metadata.jwks_uri), "failed to fetch JWKS")
                .await?;
        let keys = key_set.into_keys();

        info!("Fetched {} signing keys from {}", keys.len(), metadata.jwks_uri);
        Ok(keys)
    }
}

fn check_algorithm(alg: Algorithm) -> Result<(), Error> {
    match alg {
        Algorithm::RS256
        | Algorithm::RS384
        | Algorithm::RS512
        | Algorithm::PS256
        | Algorithm::PS384
        | Algorithm::PS512
        | Algorithm::ES256
        | Algorithm::ES384 => Ok(()),
        other => Err(Error::TokenInvalid(format!(
            "failed to verify token: unsupported signing algorithm {other:?}"
        ))),
    }
}
