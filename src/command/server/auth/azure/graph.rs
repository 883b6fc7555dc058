use reqwest::{Client, Url};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, instrument};

use crate::command::server::auth::access_token::{AccessTokenCache, BearerToken};
use crate::command::server::auth::upstream;
use crate::command::server::error::Error;
use crate::secret::Secret;

const GRAPH_SCOPE: &str = "https://graph.microsoft.com/.default";
/// `directoryObjects/getByIds` accepts at most this many ids per call.
const GROUPS_PER_CALL: usize = 1000;

#[derive(Debug, Deserialize)]
struct MemberGroups {
    #[serde(default)]
    value: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct DirectoryObjects {
    #[serde(default)]
    value: Vec<DirectoryObject>,
}

#[derive(Debug, Deserialize)]
struct DirectoryObject {
    #[serde(rename = "displayName")]
    display_name: String,
}

/// Microsoft Graph client authenticated as the application itself
/// (client credentials grant).
pub struct GraphClient {
    client: Client,
    login_url: String,
    graph_url: String,
    client_id: String,
    client_secret: Secret<String>,
    use_group_uid: bool,
    tokens: AccessTokenCache,
}

impl GraphClient {
    pub fn new(
        client: Client,
        login_url: String,
        graph_url: String,
        client_id: String,
        client_secret: Secret<String>,
        use_group_uid: bool,
    ) -> Self {
        Self {
            client,
            login_url,
            graph_url: graph_url.trim_end_matches('/').to_string(),
            client_id,
            client_secret,
            use_group_uid,
            tokens: AccessTokenCache::default(),
        }
    }

    async fn access_token(&self) -> Result<String, Error> {
        self.tokens
            .get(|| async {
                let request = self.client.post(&self.login_url).form(&[
                    ("client_id", self.client_id.as_str()),
                    ("client_secret", self.client_secret.expose().as_str()),
                    ("scope", GRAPH_SCOPE),
                    ("grant_type", "client_credentials"),
                ]);

                let token = upstream::fetch_json::<BearerToken>(
                    request,
                    "failed to refresh token",
                )
                .await
                .map_err(|e| Error::UpstreamTransport(e.to_string()))?;

                info!("Graph access token refreshed");
                Ok(token)
            })
            .await
    }

    /// `graph_url` followed by `segments`, each percent-encoded so guest
    /// principals such as `john_example.com#EXT#@tenant.onmicrosoft.com`
    /// stay in the path.
    fn endpoint(&self, segments: &[&str]) -> Result<Url, Error> {
        let mut url = Url::parse(&self.graph_url)
            .map_err(|e| Error::ProviderConfig(format!("invalid Graph URL {}: {e}", self.graph_url)))?;
        url.path_segments_mut()
            .map_err(|()| Error::ProviderConfig(format!("invalid Graph URL {}", self.graph_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    /// Groups of `user_principal`: display names, or object ids when
    /// `use_group_uid` is set.
    #[instrument(skip(self))]
    pub async fn get_groups(&self, user_principal: &str) -> Result<Vec<String>, Error> {
        let access_token = self.access_token().await?;

        let request = self
            .client
            .post(self.endpoint(&["users", user_principal, "getMemberGroups"])?)
            .bearer_auth(&access_token)
            .json(&json!({"securityEnabledOnly": false}));
        let group_ids = upstream::fetch_json::<MemberGroups>(request, "failed to get group ids")
            .await
            .map_err(service_error)?
            .value;

        debug!("User {user_principal} is a member of {} groups", group_ids.len());
        if self.use_group_uid {
            return Ok(group_ids);
        }

        let get_by_ids = self.endpoint(&["directoryObjects", "getByIds"])?;
        let mut names = Vec::with_capacity(group_ids.len());
        for ids in group_ids.chunks(GROUPS_PER_CALL) {
            let request = self
                .client
                .post(get_by_ids.clone())
                .bearer_auth(&access_token)
                .json(&json!({"ids": ids, "types": ["group"]}));
            let objects =
                upstream::fetch_json::<DirectoryObjects>(request, "failed to expand group ids")
                    .await
                    .map_err(service_error)?;

            names.extend(objects.value.into_iter().map(|object| object.display_name));
        }

        Ok(names)
    }
}

// Graph rejects the application credential, never the reviewed token.
fn service_error(error: Error) -> Error {
    match error {
        Error::TokenInvalid(msg) => Error::UpstreamTransport(msg),
        other => other,
    }
}
