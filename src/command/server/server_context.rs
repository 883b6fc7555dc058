use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use crate::command::server::auth::oidc::JwksCache;
use crate::command::server::auth::token::TokenAuthenticator;
use crate::command::server::auth::{
    azure, github, gitlab, google, ldap, Authenticator, ProviderKind,
};
use crate::command::server::error::Error;
use crate::configuration::AuthConfig;

/// Everything a request handler needs, built once before serving starts.
pub struct ServerContext {
    providers: HashMap<ProviderKind, Authenticator>,
    static_tokens: Option<Arc<TokenAuthenticator>>,
    pub read_timeout: Duration,
}

impl ServerContext {
    pub fn new(auth: &AuthConfig, read_timeout: Duration) -> Result<Self, Error> {
        let jwks = Arc::new(JwksCache::default());
        let mut providers = HashMap::new();
        let mut static_tokens = None;

        for kind in &auth.providers {
            if providers.contains_key(kind) {
                continue;
            }

            let authenticator = match kind {
                ProviderKind::GitHub => Authenticator::GitHub(github::Authenticator::new(&auth.github)?),
                ProviderKind::GitLab => Authenticator::GitLab(gitlab::Authenticator::new(&auth.gitlab)?),
                ProviderKind::Google => Authenticator::Google(google::Authenticator::new(
                    &auth.google,
                    Arc::clone(&jwks),
                )?),
                ProviderKind::Azure => {
                    let config = section(auth.azure.as_ref(), *kind)?;
                    Authenticator::Azure(azure::Authenticator::new(config, Arc::clone(&jwks))?)
                }
                ProviderKind::Ldap => {
                    let config = section(auth.ldap.as_ref(), *kind)?;
                    Authenticator::Ldap(ldap::Authenticator::new(config)?)
                }
                ProviderKind::Token => {
                    let config = section(auth.token.as_ref(), *kind)?;
                    let tokens = Arc::new(TokenAuthenticator::new(config));
                    tokens.configure()?;
                    static_tokens = Some(Arc::clone(&tokens));
                    Authenticator::Token(tokens)
                }
            };

            info!("Enabled {kind} authenticator");
            providers.insert(*kind, authenticator);
        }

        Ok(Self {
            providers,
            static_tokens,
            read_timeout,
        })
    }

    pub fn from_authenticators(authenticators: Vec<Authenticator>, read_timeout: Duration) -> Self {
        let mut static_tokens = None;
        let mut providers = HashMap::new();

        for authenticator in authenticators {
            if let Authenticator::Token(tokens) = &authenticator {
                static_tokens = Some(Arc::clone(tokens));
            }
            providers.insert(authenticator.kind(), authenticator);
        }

        Self {
            providers,
            static_tokens,
            read_timeout,
        }
    }

    pub fn authenticator(&self, kind: ProviderKind) -> Option<&Authenticator> {
        self.providers.get(&kind)
    }

    /// Shared with the token file watcher.
    pub fn static_tokens(&self) -> Option<&Arc<TokenAuthenticator>> {
        self.static_tokens.as_ref()
    }
}

fn section<T>(config: Option<&T>, kind: ProviderKind) -> Result<&T, Error> {
    config.ok_or_else(|| {
        Error::Initialization(format!("auth.{kind} section is required when {kind} is enabled"))
    })
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;
    use crate::command::server::auth::token;
    use crate::configuration::AuthConfig;

    fn token_config(content: &str) -> (tempfile::NamedTempFile, token::Config) {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();

        let config = token::Config {
            auth_file: file.path().to_path_buf(),
            watch: None,
        };
        (file, config)
    }

    #[test]
    fn test_builds_enabled_providers_only() {
        let (_file, token) = token_config("token1,user1,1\n");
        let auth = AuthConfig {
            providers: vec![ProviderKind::GitHub, ProviderKind::Token, ProviderKind::GitHub],
            token: Some(token),
            ..AuthConfig::default()
        };

        let context = ServerContext::new(&auth, Duration::from_secs(5)).unwrap();

        assert!(context.authenticator(ProviderKind::GitHub).is_some());
        assert!(context.authenticator(ProviderKind::Token).is_some());
        assert!(context.authenticator(ProviderKind::GitLab).is_none());
        assert!(context.static_tokens().is_some());
    }

    #[test]
    fn test_token_file_errors_abort_startup() {
        let (_file, token) = token_config("token1,user1\n");
        let auth = AuthConfig {
            providers: vec![ProviderKind::Token],
            token: Some(token),
            ..AuthConfig::default()
        };

        let result = ServerContext::new(&auth, Duration::from_secs(5));
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_section_is_an_initialization_error() {
        let auth = AuthConfig {
            providers: vec![ProviderKind::Ldap],
            ..AuthConfig::default()
        };

        let Err(error) = ServerContext::new(&auth, Duration::from_secs(5)) else {
            panic!("Expected initialization error");
        };
        assert_eq!(
            error,
            Error::Initialization("auth.ldap section is required when ldap is enabled".to_string())
        );
    }
}
