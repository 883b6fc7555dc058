use std::fmt;

use hyper::StatusCode;
use tracing::debug;

#[derive(Debug, PartialEq)]
pub enum Error {
    Initialization(String),
    // mappable to TokenReview failures
    MalformedRequest(String),
    UnknownProvider(String),
    ProviderConfig(String),
    TokenInvalid(String),
    TokenInconsistent(String),
    UpstreamTransport(String),
    Internal(String),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::MalformedRequest(_) | Error::UnknownProvider(_) => StatusCode::BAD_REQUEST,
            Error::ProviderConfig(_) | Error::TokenInvalid(_) | Error::TokenInconsistent(_) => {
                StatusCode::UNAUTHORIZED
            }
            Error::UpstreamTransport(_) => StatusCode::BAD_GATEWAY,
            Error::Initialization(_) | Error::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Initialization(msg)
            | Error::MalformedRequest(msg)
            | Error::UnknownProvider(msg)
            | Error::ProviderConfig(msg)
            | Error::TokenInvalid(msg)
            | Error::TokenInconsistent(msg)
            | Error::UpstreamTransport(msg)
            | Error::Internal(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<reqwest::Error> for Error {
    fn from(error: reqwest::Error) -> Self {
        debug!("HTTP client error: {error:?}");
        Error::UpstreamTransport(error.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Error::Internal(format!("JSON serialization error: {error}"))
    }
}

impl From<ldap3::LdapError> for Error {
    fn from(error: ldap3::LdapError) -> Self {
        debug!("LDAP error: {error:?}");
        Error::UpstreamTransport(error.to_string())
    }
}
