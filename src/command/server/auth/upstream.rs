use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, warn};

use crate::command::server::error::Error;

const USER_AGENT: &str = concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION"));

pub fn build_client() -> Result<Client, Error> {
    Client::builder()
        .timeout(Duration::from_secs(30))
        .user_agent(USER_AGENT)
        .build()
        .map_err(|err| Error::Initialization(format!("Failed to build HTTP client: {err}")))
}

/// Ensures a configured API base URL ends with a slash so paths can be appended.
pub fn normalize_base_url(base_url: Option<&str>, default: &str) -> String {
    let base_url = base_url.filter(|url| !url.is_empty()).unwrap_or(default);
    if base_url.ends_with('/') {
        base_url.to_string()
    } else {
        format!("{base_url}/")
    }
}

/// Sends `request` and decodes a successful JSON answer.
///
/// `context` prefixes every error message. 401 and 403 mean the upstream
/// refused the credential, any other failure is a transport problem.
pub async fn fetch_json<T: DeserializeOwned>(
    request: RequestBuilder,
    context: &str,
) -> Result<T, Error> {
    let response = request.send().await.map_err(|error| {
        warn!("{context}: {error}");
        Error::UpstreamTransport(format!("{context}: {error}"))
    })?;

    read_json(response, context).await
}

pub async fn read_json<T: DeserializeOwned>(response: Response, context: &str) -> Result<T, Error> {
    let status = response.status();
    if status.is_success() {
        return response.json::<T>().await.map_err(|error| {
            Error::UpstreamTransport(format!("{context}: invalid response body: {error}"))
        });
    }

    let body = response.text().await.unwrap_or_default();
    debug!("{context}: upstream answered {status}");

    let msg = match upstream_message(&body) {
        Some(message) => format!("{context}: {status}: {message}"),
        None => format!("{context}: {status}"),
    };

    Err(match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Error::TokenInvalid(msg),
        _ => Error::UpstreamTransport(msg),
    })
}

/// Extracts a human readable message from the error payloads used by the
/// GitHub, GitLab, Google and Microsoft APIs.
fn upstream_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;

    let candidates = [
        value.get("message"),
        value.get("error_description"),
        value.get("error").and_then(|error| error.get("message")),
        value.get("error"),
    ];

    let message = candidates
        .into_iter()
        .flatten()
        .find_map(|candidate| candidate.as_str().map(String::from));
    message
}

#[cfg(test)]
mod tests {
    use serde::Deserialize;
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    #[derive(Debug, Deserialize)]
    struct User {
        login: String,
    }

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            normalize_base_url(None, "https://api.github.com/"),
            "https://api.github.com/"
        );
        assert_eq!(
            normalize_base_url(Some(""), "https://api.github.com/"),
            "https://api.github.com/"
        );
        assert_eq!(
            normalize_base_url(Some("https://ghe.example.com/api/v3"), "unused"),
            "https://ghe.example.com/api/v3/"
        );
    }

    #[test]
    fn test_upstream_message_shapes() {
        assert_eq!(
            upstream_message(r#"{"message":"Bad credentials"}"#).as_deref(),
            Some("Bad credentials")
        );
        assert_eq!(
            upstream_message(r#"{"error":{"code":401,"message":"Invalid Credentials"}}"#)
                .as_deref(),
            Some("Invalid Credentials")
        );
        assert_eq!(
            upstream_message(r#"{"error":"invalid_client","error_description":"AADSTS7000215"}"#)
                .as_deref(),
            Some("AADSTS7000215")
        );
        assert_eq!(upstream_message("<html>oops</html>"), None);
    }

    #[tokio::test]
    async fn test_fetch_json_success() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"login": "nahid"})))
            .mount(&mock_server)
            .await;

        let client = build_client().unwrap();
        let user: User = fetch_json(client.get(format!("{}/user", mock_server.uri())), "ctx")
            .await
            .unwrap();

        assert_eq!(user.login, "nahid");
    }

    #[tokio::test]
    async fn test_fetch_json_unauthorized_is_token_invalid() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(json!({"message": "Authorization: invalid token"})),
            )
            .mount(&mock_server)
            .await;

        let client = build_client().unwrap();
        let result: Result<User, Error> =
            fetch_json(client.get(format!("{}/user", mock_server.uri())), "failed").await;

        let Err(Error::TokenInvalid(msg)) = result else {
            panic!("Expected TokenInvalid error");
        };
        assert!(msg.starts_with("failed: 401"));
        assert!(msg.ends_with("Authorization: invalid token"));
    }

    #[tokio::test]
    async fn test_fetch_json_server_error_is_transport() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/user"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let client = build_client().unwrap();
        let result: Result<User, Error> =
            fetch_json(client.get(format!("{}/user", mock_server.uri())), "failed").await;

        assert!(matches!(result, Err(Error::UpstreamTransport(msg)) if msg.contains("500")));
    }
}
