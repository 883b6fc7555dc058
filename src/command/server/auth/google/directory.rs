use std::path::Path;

use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::command::server::auth::access_token::{AccessTokenCache, BearerToken};
use crate::command::server::auth::{paginate, upstream};
use crate::command::server::error::Error;
use crate::secret::Secret;

pub const DIRECTORY_GROUP_READONLY_SCOPE: &str =
    "https://www.googleapis.com/auth/admin.directory.group.readonly";
const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const ASSERTION_LIFETIME_SECS: i64 = 3600;

/// The fields of a service account key file used for the JWT bearer grant.
#[derive(Clone, Debug, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: Secret<String>,
    #[serde(default = "ServiceAccountKey::default_token_uri")]
    pub token_uri: String,
}

impl ServiceAccountKey {
    fn default_token_uri() -> String {
        "https://oauth2.googleapis.com/token".to_string()
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Initialization(format!(
                "failed to load service account json file {}: {e}",
                path.display()
            ))
        })?;

        serde_json::from_str(&content).map_err(|e| {
            Error::Initialization(format!(
                "failed to create JWT config from service account json file {}: {e}",
                path.display()
            ))
        })
    }
}

#[derive(Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    sub: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GroupsPage {
    #[serde(default)]
    groups: Vec<Group>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Group {
    email: String,
}

/// Admin Directory client acting as `admin_email` through domain-wide delegation.
pub struct DirectoryClient {
    client: Client,
    base_url: String,
    key: ServiceAccountKey,
    encoding_key: EncodingKey,
    admin_email: String,
    tokens: AccessTokenCache,
}

impl DirectoryClient {
    pub fn new(
        client: Client,
        base_url: String,
        key: ServiceAccountKey,
        admin_email: String,
    ) -> Result<Self, Error> {
        let encoding_key = EncodingKey::from_rsa_pem(key.private_key.expose().as_bytes())
            .map_err(|e| {
                Error::Initialization(format!(
                    "invalid private key for service account {}: {e}",
                    key.client_email
                ))
            })?;

        Ok(Self {
            client,
            base_url,
            key,
            encoding_key,
            admin_email,
            tokens: AccessTokenCache::default(),
        })
    }

    fn assertion(&self) -> Result<String, Error> {
        let iat = chrono::Utc::now().timestamp();
        let claims = AssertionClaims {
            iss: &self.key.client_email,
            sub: &self.admin_email,
            scope: DIRECTORY_GROUP_READONLY_SCOPE,
            aud: &self.key.token_uri,
            iat,
            exp: iat + ASSERTION_LIFETIME_SECS,
        };

        encode(&Header::new(Algorithm::RS256), &claims, &self.encoding_key)
            .map_err(|e| Error::Internal(format!("failed to sign service account assertion: {e}")))
    }

    async fn access_token(&self) -> Result<String, Error> {
        self.tokens
            .get(|| async {
                debug!("Requesting directory access token for {}", self.key.client_email);
                let assertion = self.assertion()?;
                let request = self.client.post(&self.key.token_uri).form(&[
                    ("grant_type", JWT_BEARER_GRANT),
                    ("assertion", assertion.as_str()),
                ]);

                upstream::fetch_json::<BearerToken>(
                    request,
                    "failed to obtain service account token",
                )
                .await
            })
            .await
    }

    /// Email addresses of the groups `user_key` belongs to in `domain`.
    #[instrument(skip(self))]
    pub async fn list_groups(&self, user_key: &str, domain: &str) -> Result<Vec<String>, Error> {
        let context = format!("failed to load user's groups for domain {domain}");
        let access_token = self
            .access_token()
            .await
            .map_err(|e| Error::UpstreamTransport(format!("{context}: {e}")))?;
        let url = format!("{}groups", self.base_url);

        let groups = paginate::collect_token_pages(|page_token| {
            let mut request = self
                .client
                .get(&url)
                .bearer_auth(&access_token)
                .query(&[("userKey", user_key), ("domain", domain)]);
            if let Some(page_token) = &page_token {
                request = request.query(&[("pageToken", page_token)]);
            }
            let context = &context;

            async move {
                let page: GroupsPage = upstream::fetch_json(request, context).await?;
                let emails = page.groups.into_iter().map(|group| group.email).collect();
                Ok((emails, page.next_page_token))
            }
        })
        .await
        .map_err(|e| match e {
            // a rejection here concerns the service account, not the reviewed token
            Error::TokenInvalid(msg) => Error::UpstreamTransport(msg),
            other => other,
        })?;

        Ok(groups)
    }
}
