use serde::{Deserialize, Serialize};

use crate::command::server::auth::UserIdentity;
use crate::command::server::error::Error;

pub const API_VERSION: &str = "authentication.k8s.io/v1";
pub const KIND: &str = "TokenReview";

/// Body posted by the API server.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenReviewRequest {
    #[serde(default)]
    pub api_version: Option<String>,
    #[serde(default)]
    pub kind: Option<String>,
    pub spec: TokenReviewSpec,
}

#[derive(Debug, Default, Deserialize)]
pub struct TokenReviewSpec {
    #[serde(default)]
    pub token: String,
    #[serde(default)]
    pub audiences: Vec<String>,
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenReview {
    pub api_version: String,
    pub kind: String,
    pub status: TokenReviewStatus,
}

#[derive(Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct TokenReviewStatus {
    pub authenticated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserIdentity>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl TokenReview {
    pub fn authenticated(user: UserIdentity) -> Self {
        Self::with_status(TokenReviewStatus {
            authenticated: true,
            user: Some(user),
            error: String::new(),
        })
    }

    pub fn failed(error: &Error) -> Self {
        Self::with_status(TokenReviewStatus {
            authenticated: false,
            user: None,
            error: error.to_string(),
        })
    }

    fn with_status(status: TokenReviewStatus) -> Self {
        Self {
            api_version: API_VERSION.to_string(),
            kind: KIND.to_string(),
            status,
        }
    }
}
