use jsonwebtoken::DecodingKey;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::command::server::error::Error;

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kty")]
pub enum Jwk {
    #[serde(rename = "RSA")]
    Rsa {
        #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
        key_use: Option<String>,
        kid: Option<String>,
        alg: Option<String>,
        n: String,
        e: String,
    },
    #[serde(rename = "EC")]
    Ec {
        #[serde(rename = "use", skip_serializing_if = "Option::is_none")]
        key_use: Option<String>,
        kid: Option<String>,
        alg: Option<String>,
        x: String,
        y: String,
    },
}

impl Jwk {
    pub fn kid(&self) -> Option<&str> {
        match self {
            Jwk::Rsa { kid, .. } | Jwk::Ec { kid, .. } => kid.as_deref(),
        }
    }

    pub fn to_decoding_key(&self) -> Result<DecodingKey, Error> {
        match self {
            Jwk::Rsa { n, e, alg, kid, .. } => {
                debug!("Creating RSA DecodingKey from JWK with alg={alg:?}, kid={kid:?}");
                DecodingKey::from_rsa_components(n, e).map_err(|e| {
                    Error::UpstreamTransport(format!("invalid RSA key published by provider: {e}"))
                })
            }
            Jwk::Ec { x, y, alg, kid, .. } => {
                debug!("Creating EC DecodingKey from JWK with alg={alg:?}, kid={kid:?}");
                DecodingKey::from_ec_components(x, y).map_err(|e| {
                    Error::UpstreamTransport(format!("invalid EC key published by provider: {e}"))
                })
            }
        }
    }
}

/// Key set document; keys of unsupported types are dropped instead of
/// failing the whole set.
#[derive(Debug, Deserialize)]
pub struct JwkSet {
    keys: Vec<Value>,
}

impl JwkSet {
    pub fn into_keys(self) -> Vec<Jwk> {
        self.keys
            .into_iter()
            .filter_map(|key| match serde_json::from_value::<Jwk>(key) {
                Ok(jwk) => Some(jwk),
                Err(error) => {
                    warn!("Ignoring unsupported JWK: {error}");
                    None
                }
            })
            .collect()
    }
}

/// Selects the key named by `kid`; a token without `kid` may only use a
/// single-key set.
pub fn find_key<'a>(keys: &'a [Jwk], kid: Option<&str>) -> Option<&'a Jwk> {
    match kid {
        Some(kid) => keys.iter().find(|key| key.kid() == Some(kid)),
        None if keys.len() == 1 => keys.first(),
        None => None,
    }
}
