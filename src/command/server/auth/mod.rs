pub mod access_token;
pub mod azure;
pub mod github;
pub mod gitlab;
pub mod google;
pub mod ldap;
pub mod mtls;
pub mod oidc;
pub mod paginate;
pub mod token;
pub mod upstream;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::instrument;

use crate::command::server::error::Error;
use crate::metrics_provider::AUTH_ATTEMPTS;
pub use mtls::{ClientCertificate, PeerCertificate};

/// Identity provider selected by the Organization of the client certificate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Deserialize)]
#[serde(try_from = "String")]
pub enum ProviderKind {
    GitHub,
    GitLab,
    Google,
    Azure,
    Ldap,
    Token,
}

impl ProviderKind {
    pub const ALL: [ProviderKind; 6] = [
        ProviderKind::GitHub,
        ProviderKind::GitLab,
        ProviderKind::Google,
        ProviderKind::Azure,
        ProviderKind::Ldap,
        ProviderKind::Token,
    ];

    /// Case-insensitive lookup; `token-auth` is kept as a legacy alias of `token`.
    pub fn from_org(org: &str) -> Option<Self> {
        match org.to_lowercase().as_str() {
            "github" => Some(ProviderKind::GitHub),
            "gitlab" => Some(ProviderKind::GitLab),
            "google" => Some(ProviderKind::Google),
            "azure" => Some(ProviderKind::Azure),
            "ldap" => Some(ProviderKind::Ldap),
            "token" | "token-auth" => Some(ProviderKind::Token),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ProviderKind::GitHub => "github",
            ProviderKind::GitLab => "gitlab",
            ProviderKind::Google => "google",
            ProviderKind::Azure => "azure",
            ProviderKind::Ldap => "ldap",
            ProviderKind::Token => "token",
        }
    }

    /// Value written into the Organization field of issued client certificates.
    pub fn organization(self) -> &'static str {
        match self {
            ProviderKind::GitHub => "Github",
            ProviderKind::GitLab => "Gitlab",
            ProviderKind::Google => "Google",
            ProviderKind::Azure => "Azure",
            ProviderKind::Ldap => "Ldap",
            ProviderKind::Token => "Token",
        }
    }

    /// Providers whose client certificate does not carry a principal in its CN.
    pub fn requires_principal(self) -> bool {
        matches!(self, ProviderKind::GitHub | ProviderKind::Google)
    }
}

impl TryFrom<String> for ProviderKind {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        ProviderKind::from_org(&value).ok_or_else(|| format!("unknown provider {value}"))
    }
}

impl fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Canonical identity handed back to the API server.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserIdentity {
    pub username: String,
    pub uid: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub groups: Vec<String>,
}

pub enum Authenticator {
    GitHub(github::Authenticator),
    GitLab(gitlab::Authenticator),
    Google(google::Authenticator),
    Azure(azure::Authenticator),
    Ldap(ldap::Authenticator),
    Token(Arc<token::TokenAuthenticator>),
}

impl Authenticator {
    pub fn kind(&self) -> ProviderKind {
        match self {
            Authenticator::GitHub(_) => ProviderKind::GitHub,
            Authenticator::GitLab(_) => ProviderKind::GitLab,
            Authenticator::Google(_) => ProviderKind::Google,
            Authenticator::Azure(_) => ProviderKind::Azure,
            Authenticator::Ldap(_) => ProviderKind::Ldap,
            Authenticator::Token(_) => ProviderKind::Token,
        }
    }

    /// `principal` is the Common Name of the client certificate: the GitHub
    /// organization or the Google hosted domain. Other providers ignore it.
    #[instrument(skip(self, token), fields(provider = %self.kind()))]
    pub async fn check(&self, principal: &str, token: &str) -> Result<UserIdentity, Error> {
        let result = match self {
            Authenticator::GitHub(github) => github.check(principal, token).await,
            Authenticator::GitLab(gitlab) => gitlab.check(token).await,
            Authenticator::Google(google) => google.check(principal, token).await,
            Authenticator::Azure(azure) => azure.check(token).await,
            Authenticator::Ldap(ldap) => ldap.check(token).await,
            Authenticator::Token(static_tokens) => static_tokens.check(token),
        };

        record_attempt(self.kind(), result.is_ok());
        result
    }
}

pub fn record_attempt(kind: ProviderKind, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    AUTH_ATTEMPTS
        .with_label_values(&[kind.as_str(), outcome])
        .inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_org_is_case_insensitive() {
        assert_eq!(ProviderKind::from_org("Github"), Some(ProviderKind::GitHub));
        assert_eq!(ProviderKind::from_org("GITLAB"), Some(ProviderKind::GitLab));
        assert_eq!(ProviderKind::from_org("google"), Some(ProviderKind::Google));
        assert_eq!(ProviderKind::from_org("Azure"), Some(ProviderKind::Azure));
        assert_eq!(ProviderKind::from_org("Ldap"), Some(ProviderKind::Ldap));
        assert_eq!(ProviderKind::from_org("token"), Some(ProviderKind::Token));
        assert_eq!(ProviderKind::from_org("token-auth"), Some(ProviderKind::Token));
        assert_eq!(ProviderKind::from_org("appscode"), None);
    }

    #[test]
    fn test_provider_kind_names_round_trip() {
        for kind in ProviderKind::ALL {
            assert_eq!(ProviderKind::from_org(kind.as_str()), Some(kind));
            assert_eq!(ProviderKind::from_org(kind.organization()), Some(kind));
        }
    }

    #[test]
    fn test_user_identity_omits_empty_groups() {
        let identity = UserIdentity {
            username: "nahid".to_string(),
            uid: "1204".to_string(),
            groups: Vec::new(),
        };

        let json = serde_json::to_value(&identity).unwrap();
        assert_eq!(json, serde_json::json!({"username": "nahid", "uid": "1204"}));
    }
}
