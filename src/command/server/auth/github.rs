use reqwest::header::ACCEPT;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};

use crate::command::server::auth::{paginate, upstream, UserIdentity};
use crate::command::server::error::Error;

const DEFAULT_BASE_URL: &str = "https://api.github.com/";
const TEAMS_PAGE_SIZE: usize = 25;

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    /// GitHub Enterprise API endpoint, e.g. `https://ghe.example.com/api/v3/`
    #[serde(default)]
    pub base_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Membership {
    user: Account,
}

#[derive(Debug, Deserialize)]
struct Account {
    login: String,
    id: u64,
}

#[derive(Debug, Deserialize)]
struct Team {
    name: String,
    organization: Organization,
}

#[derive(Debug, Deserialize)]
struct Organization {
    login: String,
}

pub struct Authenticator {
    client: Client,
    base_url: String,
}

impl Authenticator {
    pub fn new(config: &Config) -> Result<Self, Error> {
        Ok(Self {
            client: upstream::build_client()?,
            base_url: upstream::normalize_base_url(config.base_url.as_deref(), DEFAULT_BASE_URL),
        })
    }

    /// `org` comes from the client certificate Common Name.
    #[instrument(skip(self, token))]
    pub async fn check(&self, org: &str, token: &str) -> Result<UserIdentity, Error> {
        let membership_url = format!("{}user/memberships/orgs/{org}", self.base_url);
        let request = self
            .client
            .get(membership_url)
            .bearer_auth(token)
            .header(ACCEPT, "application/vnd.github+json");

        let context = format!("failed to check user's membership in Org {org}");
        let membership: Membership = upstream::fetch_json(request, &context).await?;
        debug!("User {} is a member of {org}", membership.user.login);

        let teams_url = format!("{}user/teams", self.base_url);
        let context = format!("failed to load user's teams for Org {org}");

        let teams = paginate::collect_numbered_pages(TEAMS_PAGE_SIZE, |page, per_page| {
            let request = self
                .client
                .get(&teams_url)
                .query(&[("page", page), ("per_page", per_page)])
                .bearer_auth(token)
                .header(ACCEPT, "application/vnd.github+json");
            let context = &context;
            async move { upstream::fetch_json::<Vec<Team>>(request, context).await }
        })
        .await?;

        let groups = teams
            .into_iter()
            .filter(|team| team.organization.login == org)
            .map(|team| team.name)
            .collect();

        Ok(UserIdentity {
            username: membership.user.login,
            uid: membership.user.id.to_string(),
            groups,
        })
    }
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn authenticator(mock_server: &MockServer) -> Authenticator {
        Authenticator::new(&Config {
            base_url: Some(mock_server.uri()),
        })
        .unwrap()
    }

    fn team(name: &str, org: &str) -> Value {
        json!({"name": name, "slug": name, "organization": {"login": org}})
    }

    async fn mount_membership(mock_server: &MockServer) {
        Mock::given(method("GET"))
            .and(path("/user/memberships/orgs/appscode"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "state": "active",
                "role": "member",
                "user": {"login": "nahid", "id": 1204}
            })))
            .mount(mock_server)
            .await;
    }

    #[tokio::test]
    async fn test_check_member_with_one_team() {
        let mock_server = MockServer::start().await;
        mount_membership(&mock_server).await;

        Mock::given(method("GET"))
            .and(path("/user/teams"))
            .and(query_param("page", "1"))
            .and(query_param("per_page", "25"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!([team("team1", "appscode")])))
            .expect(1)
            .mount(&mock_server)
            .await;

        let identity = authenticator(&mock_server)
            .check("appscode", "secret")
            .await
            .unwrap();

        assert_eq!(identity.username, "nahid");
        assert_eq!(identity.uid, "1204");
        assert_eq!(identity.groups, vec!["team1"]);
    }

    #[tokio::test]
    async fn test_check_bad_token() {
        let mock_server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/user/memberships/orgs/appscode"))
            .respond_with(
                ResponseTemplate::new(401)
                    .set_body_json(json!({"message": "Authorization: invalid token"})),
            )
            .mount(&mock_server)
            .await;

        let result = authenticator(&mock_server)
            .check("appscode", "badtoken")
            .await;

        let Err(Error::TokenInvalid(msg)) = result else {
            panic!("Expected TokenInvalid error");
        };
        assert!(msg.starts_with("failed to check user's membership in Org appscode"));
        assert!(msg.contains("invalid token"));
    }

    #[tokio::test]
    async fn test_check_filters_teams_of_other_orgs_across_pages() {
        let mock_server = MockServer::start().await;
        mount_membership(&mock_server).await;

        let first_page: Vec<Value> = (0..25)
            .map(|i| {
                let org = if i % 5 == 0 { "other" } else { "appscode" };
                team(&format!("team{i}"), org)
            })
            .collect();

        Mock::given(method("GET"))
            .and(path("/user/teams"))
            .and(query_param("page", "1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(first_page))
            .expect(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/user/teams"))
            .and(query_param("page", "2"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!([team("team25", "appscode")])),
            )
            .expect(1)
            .mount(&mock_server)
            .await;

        let identity = authenticator(&mock_server)
            .check("appscode", "secret")
            .await
            .unwrap();

        assert_eq!(identity.groups.len(), 21);
        assert_eq!(identity.groups.first().map(String::as_str), Some("team1"));
        assert_eq!(identity.groups.last().map(String::as_str), Some("team25"));
    }

    #[tokio::test]
    async fn test_check_team_listing_failure() {
        let mock_server = MockServer::start().await;
        mount_membership(&mock_server).await;

        Mock::given(method("GET"))
            .and(path("/user/teams"))
            .respond_with(ResponseTemplate::new(502))
            .mount(&mock_server)
            .await;

        let result = authenticator(&mock_server)
            .check("appscode", "secret")
            .await;

        assert!(matches!(
            result,
            Err(Error::UpstreamTransport(msg)) if msg.starts_with("failed to load user's teams for Org appscode")
        ));
    }
}
