use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::command::server::auth::{paginate, upstream, UserIdentity};
use crate::command::server::error::Error;

const DEFAULT_BASE_URL: &str = "https://gitlab.com/api/v4/";
const GROUPS_PAGE_SIZE: usize = 20;
const PRIVATE_TOKEN: &str = "PRIVATE-TOKEN";

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    /// Self-hosted API endpoint, e.g. `https://gitlab.example.com/api/v4/`
    #[serde(default)]
    pub base_url: Option<String>,
    /// Emit numeric group ids instead of group full paths.
    #[serde(default)]
    pub use_group_id: bool,
}

#[derive(Debug, Deserialize)]
struct User {
    username: String,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct Group {
    id: u64,
    full_path: String,
}

pub struct Authenticator {
    client: Client,
    base_url: String,
    use_group_id: bool,
}

impl Authenticator {
    pub fn new(config: &Config) -> Result<Self, Error> {
        Ok(Self {
            client: upstream::build_client()?,
            base_url: upstream::normalize_base_url(config.base_url.as_deref(), DEFAULT_BASE_URL),
            use_group_id: config.use_group_id,
        })
    }

    #[instrument(skip(self, token))]
    pub async fn check(&self, token: &str) -> Result<UserIdentity, Error> {
        let request = self
            .client
            .get(format!("{}user", self.base_url))
            .header(PRIVATE_TOKEN, token);
        let user: User = upstream::fetch_json(request, "failed to get current user").await?;
        debug!("Resolved GitLab user {}", user.username);

        let groups_url = format!("{}groups", self.base_url);
        let groups = paginate::collect_numbered_pages(GROUPS_PAGE_SIZE, |page, per_page| {
            let request = self
                .client
                .get(&groups_url)
                .query(&[("page", page), ("per_page", per_page)])
                .header(PRIVATE_TOKEN, token);
            async move { upstream::fetch_json::<Vec<Group>>(request, "failed to load groups").await }
        })
        .await?;

        let groups = groups
            .into_iter()
            .map(|group| {
                if self.use_group_id {
                    group.id.to_string()
                } else {
                    group.full_path
                }
            })
            .collect();

        Ok(UserIdentity {
            username: user.username,
            uid: user.id.to_string(),
            groups,
        })
    }
}
