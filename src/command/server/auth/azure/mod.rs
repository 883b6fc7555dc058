pub mod graph;

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;
use tracing::{debug, instrument};

use crate::command::server::auth::oidc::{JwksCache, OidcVerifier, VerifiedToken};
use crate::command::server::auth::{upstream, UserIdentity};
use crate::command::server::error::Error;
use crate::secret::Secret;
use graph::GraphClient;

const USERNAME_CLAIM: &str = "upn";
const OBJECT_ID_CLAIM: &str = "oid";

#[derive(Clone, Debug, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub client_secret: Secret<String>,
    #[serde(default)]
    pub tenant_id: String,
    /// Emit group object ids instead of display names.
    #[serde(default)]
    pub use_group_uid: bool,
    /// Require `aud` to equal `client_id`.
    #[serde(default = "Config::default_verify_client_id")]
    pub verify_client_id: bool,
    /// Trust the `groups` claim and only call Graph on a group overage.
    #[serde(default)]
    pub resolve_group_membership_only_on_overage_claim: bool,
    #[serde(default)]
    pub skip_group_membership_resolution: bool,
}

impl Config {
    fn default_verify_client_id() -> bool {
        true
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.tenant_id.is_empty() {
            errors.push("azure.tenant-id must be non-empty".to_string());
        }
        if self.verify_client_id && self.client_id.is_empty() {
            errors.push(
                "azure.client-id must be non-empty when azure.verify-client-id is set".to_string(),
            );
        }
        if !self.skip_group_membership_resolution {
            if self.client_id.is_empty() {
                errors.push("azure.client-id must be non-empty".to_string());
            }
            if self.client_secret.is_empty() {
                errors.push("azure.client-secret must be non-empty".to_string());
            }
        }

        errors
    }
}

pub struct Endpoints {
    pub issuer: String,
    pub login_url: String,
    pub graph_url: String,
}

impl Endpoints {
    pub fn for_tenant(tenant_id: &str) -> Self {
        Self {
            issuer: format!("https://sts.windows.net/{tenant_id}/"),
            login_url: format!("https://login.microsoftonline.com/{tenant_id}/oauth2/v2.0/token"),
            graph_url: "https://graph.microsoft.com/v1.0".to_string(),
        }
    }
}

pub struct Authenticator {
    verifier: OidcVerifier,
    graph: Option<GraphClient>,
    overage_only: bool,
}

impl Authenticator {
    pub fn new(config: &Config, jwks: Arc<JwksCache>) -> Result<Self, Error> {
        Self::with_endpoints(config, Endpoints::for_tenant(&config.tenant_id), jwks)
    }

    pub fn with_endpoints(
        config: &Config,
        endpoints: Endpoints,
        jwks: Arc<JwksCache>,
    ) -> Result<Self, Error> {
        let client = upstream::build_client()?;

        let graph = (!config.skip_group_membership_resolution).then(|| {
            GraphClient::new(
                client.clone(),
                endpoints.login_url,
                endpoints.graph_url,
                config.client_id.clone(),
                config.client_secret.clone(),
                config.use_group_uid,
            )
        });

        let audience = config
            .verify_client_id
            .then(|| config.client_id.clone());

        Ok(Self {
            verifier: OidcVerifier::new(endpoints.issuer, audience, client, jwks),
            graph,
            overage_only: config.resolve_group_membership_only_on_overage_claim,
        })
    }

    #[instrument(skip(self, token))]
    pub async fn check(&self, token: &str) -> Result<UserIdentity, Error> {
        let verified = self.verifier.verify(token).await.map_err(|e| match e {
            Error::TokenInvalid(msg) => {
                Error::TokenInvalid(format!("failed to verify token for azure: {msg}"))
            }
            other => other,
        })?;

        let username = verified
            .claim_str(USERNAME_CLAIM)
            .ok_or_else(|| {
                Error::TokenInvalid(format!("username claim {USERNAME_CLAIM} not found"))
            })?
            .to_string();
        let uid = verified
            .claim_str(OBJECT_ID_CLAIM)
            .unwrap_or(&username)
            .to_string();

        let mut identity = UserIdentity {
            username,
            uid,
            groups: Vec::new(),
        };

        if self.overage_only {
            match groups_from_claims(&verified)? {
                GroupClaims::Complete(groups) => {
                    identity.groups = groups;
                    return Ok(identity);
                }
                GroupClaims::Overage => debug!("Group overage claim found, resolving through Graph"),
            }
        }

        if let Some(graph) = &self.graph {
            identity.groups = graph
                .get_groups(&identity.username)
                .await
                .map_err(|e| Error::UpstreamTransport(format!("failed to get groups: {e}")))?;
        }

        Ok(identity)
    }
}

#[derive(Debug, PartialEq)]
enum GroupClaims {
    /// The token lists every group, or asserts none.
    Complete(Vec<String>),
    /// Too many groups to fit the token; `_claim_sources` points at Graph.
    Overage,
}

#[derive(Deserialize)]
struct ClaimSource {
    #[serde(default)]
    endpoint: String,
}

fn groups_from_claims(token: &VerifiedToken) -> Result<GroupClaims, Error> {
    let invalid = |e: String| Error::TokenInvalid(format!("invalid group claims: {e}"));

    if let Some(groups) = token.claim("groups") {
        let groups: Vec<String> =
            serde_json::from_value(groups.clone()).map_err(|e| invalid(e.to_string()))?;
        return Ok(GroupClaims::Complete(groups));
    }

    let Some(claim_names) = token.claim("_claim_names") else {
        return Ok(GroupClaims::Complete(Vec::new()));
    };
    let claim_names: HashMap<String, String> =
        serde_json::from_value(claim_names.clone()).map_err(|e| invalid(e.to_string()))?;

    let sources: HashMap<String, ClaimSource> = match token.claim("_claim_sources") {
        Some(sources) => {
            serde_json::from_value(sources.clone()).map_err(|e| invalid(e.to_string()))?
        }
        None => return Err(invalid("no _claim_sources is found".to_string())),
    };

    let Some(source) = claim_names.get("groups") else {
        return Ok(GroupClaims::Complete(Vec::new()));
    };

    match sources.get(source) {
        Some(ClaimSource { endpoint }) if endpoint.is_empty() => {
            Ok(GroupClaims::Complete(Vec::new()))
        }
        Some(_) => Ok(GroupClaims::Overage),
        None => Err(invalid(format!("{source} is missing in _claim_sources"))),
    }
}
