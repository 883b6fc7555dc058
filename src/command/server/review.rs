use hyper::StatusCode;
use tracing::{debug, instrument, warn};

use crate::command::server::auth::{ClientCertificate, PeerCertificate, ProviderKind, UserIdentity};
use crate::command::server::error::Error;
use crate::command::server::token_review::{TokenReview, TokenReviewRequest};
use crate::command::server::ServerContext;

/// Answers one TokenReview. Never fails: every error is folded into an
/// unauthenticated review carrying the error text.
#[instrument(skip(context, peer_certificate, body))]
pub async fn review(
    context: &ServerContext,
    peer_certificate: Option<&PeerCertificate>,
    body: &[u8],
) -> (StatusCode, TokenReview) {
    match authenticate(context, peer_certificate, body).await {
        Ok(identity) => {
            debug!("Authenticated {}", identity.username);
            (StatusCode::OK, TokenReview::authenticated(identity))
        }
        Err(error) => {
            let status = error.status_code();
            if status.is_server_error() {
                warn!("Token review failed: {error}");
            } else {
                debug!("Token review rejected: {error}");
            }
            (status, TokenReview::failed(&error))
        }
    }
}

async fn authenticate(
    context: &ServerContext,
    peer_certificate: Option<&PeerCertificate>,
    body: &[u8],
) -> Result<UserIdentity, Error> {
    let Some(PeerCertificate(der)) = peer_certificate else {
        return Err(Error::MalformedRequest("Missing client certificate".to_string()));
    };

    let certificate = ClientCertificate::from_der(der)?;
    let Some(organization) = certificate.organization() else {
        return Err(Error::MalformedRequest(
            "Client certificate is missing organization".to_string(),
        ));
    };

    let request: TokenReviewRequest = serde_json::from_slice(body)
        .map_err(|e| Error::MalformedRequest(format!("Failed to parse request: {e}")))?;

    let Some(kind) = ProviderKind::from_org(organization) else {
        return Err(Error::UnknownProvider(format!(
            "Client is using unknown organization {organization}"
        )));
    };

    let Some(authenticator) = context.authenticator(kind) else {
        return Err(Error::UnknownProvider(format!(
            "guard does not provide service for {kind}"
        )));
    };

    let token = request.spec.token;

    // Static tokens are honoured whatever the organization.
    if kind != ProviderKind::Token {
        if let Some(static_tokens) = context.static_tokens() {
            if let Ok(identity) = static_tokens.check(&token) {
                debug!("Token matched the static token table");
                return ensure_complete(identity);
            }
        }
    }

    let identity = authenticator.check(certificate.common_name(), &token).await?;
    ensure_complete(identity)
}

fn ensure_complete(identity: UserIdentity) -> Result<UserIdentity, Error> {
    if identity.username.is_empty() || identity.uid.is_empty() {
        return Err(Error::TokenInconsistent(
            "identity provider returned a user without username or uid".to_string(),
        ));
    }
    Ok(identity)
}

#[cfg(test)]
mod tests {
    use std::io::Write;
    use std::sync::Arc;
    use std::time::Duration;

    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::command::server::auth::mtls::tests::generate_test_certificate;
    use crate::command::server::auth::token::{self, TokenAuthenticator};
    use crate::command::server::auth::{github, Authenticator};

    const TOKEN_FILE: &str = "token1,user1,1,\"group1,group2\"\n";

    fn static_tokens(file: &tempfile::NamedTempFile) -> Authenticator {
        let tokens = TokenAuthenticator::new(&token::Config {
            auth_file: file.path().to_path_buf(),
            watch: None,
        });
        tokens.configure().unwrap();
        Authenticator::Token(Arc::new(tokens))
    }

    fn token_file() -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(TOKEN_FILE.as_bytes()).unwrap();
        file
    }

    fn github(base_url: &str) -> Authenticator {
        Authenticator::GitHub(
            github::Authenticator::new(&github::Config {
                base_url: Some(base_url.to_string()),
            })
            .unwrap(),
        )
    }

    fn context(authenticators: Vec<Authenticator>) -> ServerContext {
        ServerContext::from_authenticators(authenticators, Duration::from_secs(5))
    }

    fn peer(subject: &str) -> PeerCertificate {
        PeerCertificate(Arc::new(generate_test_certificate(subject)))
    }

    fn body(token: &str) -> Vec<u8> {
        json!({
            "apiVersion": "authentication.k8s.io/v1",
            "kind": "TokenReview",
            "spec": {"token": token}
        })
        .to_string()
        .into_bytes()
    }

    fn assert_rejected(review: &TokenReview, error: &str) {
        assert_eq!(review.api_version, "authentication.k8s.io/v1");
        assert_eq!(review.kind, "TokenReview");
        assert!(!review.status.authenticated);
        assert!(review.status.user.is_none());
        assert_eq!(review.status.error, error);
    }

    #[tokio::test]
    async fn test_static_token_user() {
        let file = token_file();
        let context = context(vec![static_tokens(&file)]);

        let (status, review) = review(&context, Some(&peer("/CN=token/O=Token")), &body("token1")).await;

        assert_eq!(status, StatusCode::OK);
        assert!(review.status.authenticated);
        assert_eq!(
            review.status.user,
            Some(UserIdentity {
                username: "user1".to_string(),
                uid: "1".to_string(),
                groups: vec!["group1".to_string(), "group2".to_string()],
            })
        );
    }

    #[tokio::test]
    async fn test_unknown_static_token() {
        let file = token_file();
        let context = context(vec![static_tokens(&file)]);

        let (status, review) =
            review(&context, Some(&peer("/CN=token/O=Token")), &body("token2")).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_rejected(&review, "Invalid token");
    }

    #[tokio::test]
    async fn test_missing_client_certificate() {
        let file = token_file();
        let context = context(vec![static_tokens(&file)]);

        let (status, review) = review(&context, None, &body("token1")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_rejected(&review, "Missing client certificate");
    }

    #[tokio::test]
    async fn test_certificate_without_organization() {
        let file = token_file();
        let context = context(vec![static_tokens(&file)]);

        let (status, review) = review(&context, Some(&peer("/CN=nahid")), &body("token1")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_rejected(&review, "Client certificate is missing organization");
    }

    #[tokio::test]
    async fn test_undecodable_body() {
        let file = token_file();
        let context = context(vec![static_tokens(&file)]);

        let (status, review) = review(&context, Some(&peer("/CN=token/O=Token")), b"{not json").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(!review.status.authenticated);
        assert!(review.status.error.starts_with("Failed to parse request: "));
    }

    #[tokio::test]
    async fn test_unknown_organization() {
        let file = token_file();
        let context = context(vec![static_tokens(&file)]);

        let (status, review) =
            review(&context, Some(&peer("/CN=nahid/O=AppsCode")), &body("token1")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_rejected(&review, "Client is using unknown organization AppsCode");
    }

    #[tokio::test]
    async fn test_provider_not_enabled() {
        let file = token_file();
        let context = context(vec![static_tokens(&file)]);

        let (status, review) =
            review(&context, Some(&peer("/CN=appscode/O=Github")), &body("token1")).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_rejected(&review, "guard does not provide service for github");
    }

    #[tokio::test]
    async fn test_static_token_is_consulted_before_the_organization_provider() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .expect(0)
            .mount(&mock_server)
            .await;

        let file = token_file();
        let context = context(vec![static_tokens(&file), github(&mock_server.uri())]);

        let (status, review) =
            review(&context, Some(&peer("/CN=appscode/O=Github")), &body("token1")).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(review.status.user.unwrap().username, "user1");
    }

    #[tokio::test]
    async fn test_static_token_miss_falls_through() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/memberships/orgs/appscode"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(json!({"message": "Authorization: invalid token"})),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let file = token_file();
        let context = context(vec![static_tokens(&file), github(&mock_server.uri())]);

        let (status, review) =
            review(&context, Some(&peer("/CN=appscode/O=Github")), &body("badtoken")).await;

        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(!review.status.authenticated);
        assert!(review.status.error.contains("invalid token"));
    }

    #[tokio::test]
    async fn test_upstream_failure_is_a_bad_gateway() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user/memberships/orgs/appscode"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let context = context(vec![github(&mock_server.uri())]);

        let (status, review) =
            review(&context, Some(&peer("/CN=appscode/O=Github")), &body("secret")).await;

        assert_eq!(status, StatusCode::BAD_GATEWAY);
        assert!(!review.status.authenticated);
        assert!(!review.status.error.is_empty());
    }

    #[test]
    fn test_identity_without_uid_is_not_authenticated() {
        let result = ensure_complete(UserIdentity {
            username: "nahid".to_string(),
            uid: String::new(),
            groups: Vec::new(),
        });

        assert!(matches!(result, Err(Error::TokenInconsistent(_))));
    }
}
