pub mod directory;

use std::path::PathBuf;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, instrument};

use crate::command::server::auth::oidc::{JwksCache, OidcVerifier};
use crate::command::server::auth::{upstream, UserIdentity};
use crate::command::server::error::Error;
use directory::{DirectoryClient, ServiceAccountKey};

pub const ISSUER: &str = "https://accounts.google.com";
pub const OAUTH2_CLIENT_ID: &str =
    "37154062056-220683ek37naab43v23vc5qg01k1j14g.apps.googleusercontent.com";
const DIRECTORY_BASE_URL: &str = "https://admin.googleapis.com/admin/directory/v1/";

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    /// Service account key with domain-wide delegation; groups are only
    /// resolved when it is set.
    #[serde(default)]
    pub service_account_json_file: Option<PathBuf>,
    /// G Suite administrator impersonated by the service account.
    #[serde(default)]
    pub admin_email: Option<String>,
}

impl Config {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let has_service_account = self
            .service_account_json_file
            .as_ref()
            .is_some_and(|path| !path.as_os_str().is_empty());
        let has_admin = self.admin_email.as_ref().is_some_and(|email| !email.is_empty());

        if has_service_account && !has_admin {
            errors.push("google.admin-email must be non-empty".to_string());
        }

        errors
    }
}

pub struct Endpoints {
    pub issuer: String,
    pub directory_url: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            issuer: ISSUER.to_string(),
            directory_url: DIRECTORY_BASE_URL.to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct GoogleClaims {
    #[serde(default)]
    email: String,
    #[serde(default)]
    hd: String,
    #[serde(default)]
    user_id: Option<String>,
    #[serde(default)]
    sub: String,
}

pub struct Authenticator {
    verifier: OidcVerifier,
    directory: Option<DirectoryClient>,
}

impl Authenticator {
    pub fn new(config: &Config, jwks: Arc<JwksCache>) -> Result<Self, Error> {
        Self::with_endpoints(config, Endpoints::default(), jwks)
    }

    pub fn with_endpoints(
        config: &Config,
        endpoints: Endpoints,
        jwks: Arc<JwksCache>,
    ) -> Result<Self, Error> {
        let client = upstream::build_client()?;

        let directory = match &config.service_account_json_file {
            Some(path) if !path.as_os_str().is_empty() => {
                let key = ServiceAccountKey::from_file(path)?;
                let directory = DirectoryClient::new(
                    client.clone(),
                    upstream::normalize_base_url(Some(&endpoints.directory_url), DIRECTORY_BASE_URL),
                    key,
                    config.admin_email.clone().unwrap_or_default(),
                )?;
                Some(directory)
            }
            _ => None,
        };

        let verifier = OidcVerifier::new(
            endpoints.issuer,
            Some(OAUTH2_CLIENT_ID.to_string()),
            client,
            jwks,
        );

        Ok(Self { verifier, directory })
    }

    /// `domain` is the hosted domain taken from the client certificate CN.
    #[instrument(skip(self, token))]
    pub async fn check(&self, domain: &str, token: &str) -> Result<UserIdentity, Error> {
        let verified = self.verifier.verify(token).await.map_err(|e| match e {
            Error::TokenInvalid(msg) => {
                Error::TokenInvalid(format!("failed to verify token for google: {msg}"))
            }
            other => other,
        })?;
        let claims: GoogleClaims = verified.claims()?;

        if claims.hd != domain {
            return Err(Error::TokenInconsistent(format!(
                "user is not a member of domain {domain}"
            )));
        }

        let uid = claims.user_id.filter(|id| !id.is_empty()).unwrap_or(claims.sub);

        let groups = match &self.directory {
            Some(directory) => directory.list_groups(&claims.email, domain).await?,
            None => {
                debug!("No service account configured, skipping group lookup");
                Vec::new()
            }
        };

        Ok(UserIdentity {
            username: claims.email,
            uid,
            groups,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use serde_json::{json, Value};
    use tempfile::NamedTempFile;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::command::server::auth::oidc::tests::{
        create_rsa_keypair, mount_provider, rsa_public_key_to_jwk, sign_token, standard_claims,
    };

    struct Fixture {
        mock_server: MockServer,
        private_key: String,
        _service_account: Option<NamedTempFile>,
        authenticator: Authenticator,
    }

    async fn fixture(with_directory: bool) -> Fixture {
        let mock_server = MockServer::start().await;
        let (private_key, public_key) = create_rsa_keypair();
        mount_provider(&mock_server, None, vec![rsa_public_key_to_jwk(&public_key, "g1")]).await;

        let service_account = with_directory.then(|| {
            let mut file = NamedTempFile::new().unwrap();
            let key = json!({
                "type": "service_account",
                "client_email": "guard@appscode.iam.gserviceaccount.com",
                "private_key": private_key,
                "token_uri": format!("{}/token", mock_server.uri()),
            });
            file.write_all(key.to_string().as_bytes()).unwrap();
            file
        });

        let config = Config {
            service_account_json_file: service_account.as_ref().map(|f| f.path().to_path_buf()),
            admin_email: Some("admin@appscode.com".to_string()),
        };
        let endpoints = Endpoints {
            issuer: mock_server.uri(),
            directory_url: format!("{}/admin/directory/v1", mock_server.uri()),
        };
        let authenticator =
            Authenticator::with_endpoints(&config, endpoints, Arc::new(JwksCache::default()))
                .unwrap();

        Fixture {
            mock_server,
            private_key,
            _service_account: service_account,
            authenticator,
        }
    }

    fn id_token(fixture: &Fixture, hd: &str) -> String {
        let mut claims = standard_claims(&fixture.mock_server.uri(), OAUTH2_CLIENT_ID);
        claims.insert("email".to_string(), json!("nahid@appscode.com"));
        claims.insert("hd".to_string(), json!(hd));
        sign_token(&fixture.private_key, "g1", &claims)
    }

    fn groups(range: std::ops::Range<usize>) -> Vec<Value> {
        range
            .map(|i| json!({"kind": "admin#directory#group", "email": format!("group{i}@appscode.com")}))
            .collect()
    }

    #[test]
    fn test_validate_requires_admin_email_with_service_account() {
        let config = Config {
            service_account_json_file: Some(PathBuf::from("/etc/guard/sa.json")),
            admin_email: None,
        };
        assert_eq!(config.validate(), vec!["google.admin-email must be non-empty"]);

        assert!(Config::default().validate().is_empty());
    }

    #[tokio::test]
    async fn test_check_without_directory() {
        let fixture = fixture(false).await;
        let token = id_token(&fixture, "appscode.com");

        let identity = fixture
            .authenticator
            .check("appscode.com", &token)
            .await
            .unwrap();

        assert_eq!(identity.username, "nahid@appscode.com");
        assert_eq!(identity.uid, "110169484474386276334");
        assert!(identity.groups.is_empty());
    }

    #[tokio::test]
    async fn test_check_rejects_other_domain() {
        let fixture = fixture(false).await;
        let token = id_token(&fixture, "example.com");

        let result = fixture.authenticator.check("appscode.com", &token).await;

        assert_eq!(
            result,
            Err(Error::TokenInconsistent(
                "user is not a member of domain appscode.com".to_string()
            ))
        );
    }

    #[tokio::test]
    async fn test_check_wrong_audience() {
        let fixture = fixture(false).await;
        let mut claims = standard_claims(&fixture.mock_server.uri(), "another-client");
        claims.insert("hd".to_string(), json!("appscode.com"));
        let token = sign_token(&fixture.private_key, "g1", &claims);

        let result = fixture.authenticator.check("appscode.com", &token).await;

        assert!(matches!(
            result,
            Err(Error::TokenInvalid(msg)) if msg.starts_with("failed to verify token for google")
        ));
    }

    #[tokio::test]
    async fn test_check_follows_group_page_tokens() {
        let fixture = fixture(true).await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .and(body_string_contains("grant_type=urn%3Aietf%3Aparams%3Aoauth%3Agrant-type%3Ajwt-bearer"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "directory-token",
                "expires_in": 3600,
                "token_type": "Bearer"
            })))
            .expect(1)
            .mount(&fixture.mock_server)
            .await;

        let pages = [
            (None, groups(0..5), Some("2")),
            (Some("2"), groups(5..10), Some("3")),
            (Some("3"), groups(10..13), Some("")),
        ];
        for (page_token, page_groups, next) in pages {
            let mut body = json!({"kind": "admin#directory#groups", "groups": page_groups});
            if let Some(next) = next {
                body["nextPageToken"] = json!(next);
            }

            let mock = Mock::given(method("GET"))
                .and(path("/admin/directory/v1/groups"))
                .and(query_param("userKey", "nahid@appscode.com"))
                .and(query_param("domain", "appscode.com"))
                .and(header("authorization", "Bearer directory-token"));
            let mock = match page_token {
                Some(page_token) => mock.and(query_param("pageToken", page_token)),
                None => mock.and(wiremock::matchers::query_param_is_missing("pageToken")),
            };
            mock.respond_with(ResponseTemplate::new(200).set_body_json(body))
                .expect(1)
                .mount(&fixture.mock_server)
                .await;
        }

        let token = id_token(&fixture, "appscode.com");
        let identity = fixture
            .authenticator
            .check("appscode.com", &token)
            .await
            .unwrap();

        assert_eq!(identity.groups.len(), 13);
        assert_eq!(identity.groups[0], "group0@appscode.com");
        assert_eq!(identity.groups[12], "group12@appscode.com");
    }

    #[tokio::test]
    async fn test_check_group_listing_failure() {
        let fixture = fixture(true).await;

        Mock::given(method("POST"))
            .and(path("/token"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"access_token": "directory-token"})),
            )
            .mount(&fixture.mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/admin/directory/v1/groups"))
            .respond_with(ResponseTemplate::new(403).set_body_json(json!({
                "error": {"code": 403, "message": "Not Authorized to access this resource/api"}
            })))
            .mount(&fixture.mock_server)
            .await;

        let token = id_token(&fixture, "appscode.com");
        let result = fixture.authenticator.check("appscode.com", &token).await;

        assert!(matches!(
            result,
            Err(Error::UpstreamTransport(msg))
                if msg.starts_with("failed to load user's groups for domain appscode.com")
        ));
    }
}
