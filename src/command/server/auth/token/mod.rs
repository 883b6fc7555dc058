mod file;

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};

use serde::Deserialize;
use tracing::{debug, error, info, instrument};

use crate::command::server::auth::UserIdentity;
use crate::command::server::error::Error;
use crate::watcher::ChangeNotifier;
use file::load_token_file;

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    pub auth_file: PathBuf,
    /// Reload on file change; defaults to on when running inside a cluster.
    #[serde(default)]
    pub watch: Option<bool>,
}

impl Config {
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.auth_file.as_os_str().is_empty() {
            errors.push("token.auth-file must be non-empty".to_string());
        }
        errors
    }

    pub fn watch_enabled(&self, in_cluster: bool) -> bool {
        self.watch.unwrap_or(in_cluster)
    }
}

/// Static token table, reloadable while requests are being served.
pub struct TokenAuthenticator {
    path: PathBuf,
    table: RwLock<HashMap<String, UserIdentity>>,
}

impl TokenAuthenticator {
    pub fn new(config: &Config) -> Self {
        Self {
            path: config.auth_file.clone(),
            table: RwLock::new(HashMap::new()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Re-reads the token file. On failure the table in use is left untouched.
    #[instrument(skip(self), fields(path = %self.path.display()))]
    pub fn configure(&self) -> Result<(), Error> {
        let table = load_token_file(&self.path)?;
        let count = table.len();

        let mut guard = self.table.write().unwrap_or_else(PoisonError::into_inner);
        *guard = table;
        drop(guard);

        info!("Static token table loaded ({count} tokens)");
        Ok(())
    }

    pub fn check(&self, token: &str) -> Result<UserIdentity, Error> {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);

        match table.get(token) {
            Some(identity) => Ok(identity.clone()),
            None => {
                debug!("Token not found in static token table");
                Err(Error::TokenInvalid("Invalid token".to_string()))
            }
        }
    }
}

impl ChangeNotifier for TokenAuthenticator {
    fn notify_change(&self) {
        if let Err(error) = self.configure() {
            error!("Failed to reload token file, keeping previous tokens: {error}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::TempDir;

    use super::*;

    fn authenticator_for(dir: &TempDir, content: &str) -> TokenAuthenticator {
        let path = dir.path().join("token.csv");
        fs::write(&path, content).unwrap();

        let config = Config {
            auth_file: path,
            watch: None,
        };
        TokenAuthenticator::new(&config)
    }

    #[test]
    fn test_check_known_token() {
        let dir = TempDir::new().unwrap();
        let authenticator = authenticator_for(&dir, "token1,user1,1,\"group1,group2\"\n");
        authenticator.configure().unwrap();

        let identity = authenticator.check("token1").unwrap();

        assert_eq!(identity.username, "user1");
        assert_eq!(identity.uid, "1");
        assert_eq!(identity.groups, vec!["group1", "group2"]);
    }

    #[test]
    fn test_check_unknown_token() {
        let dir = TempDir::new().unwrap();
        let authenticator = authenticator_for(&dir, "token1,user1,1\n");
        authenticator.configure().unwrap();

        let result = authenticator.check("token2");

        assert_eq!(result, Err(Error::TokenInvalid("Invalid token".to_string())));
    }

    #[test]
    fn test_reload_replaces_table() {
        let dir = TempDir::new().unwrap();
        let authenticator = authenticator_for(&dir, "old-token,user1,1\n");
        authenticator.configure().unwrap();
        assert!(authenticator.check("old-token").is_ok());

        fs::write(authenticator.path(), "new-token,user2,2\n").unwrap();
        authenticator.configure().unwrap();

        assert!(authenticator.check("old-token").is_err());
        assert_eq!(authenticator.check("new-token").unwrap().username, "user2");
    }

    #[test]
    fn test_failed_reload_keeps_previous_table() {
        let dir = TempDir::new().unwrap();
        let authenticator = authenticator_for(&dir, "token1,user1,1\n");
        authenticator.configure().unwrap();

        fs::write(authenticator.path(), "token1,user1\n").unwrap();
        let result = authenticator.configure();

        assert!(result.is_err());
        assert_eq!(authenticator.check("token1").unwrap().username, "user1");
    }

    #[test]
    fn test_watch_defaults_to_cluster_detection() {
        let mut config = Config {
            auth_file: PathBuf::from("/etc/guard/auth/token.csv"),
            watch: None,
        };
        assert!(config.watch_enabled(true));
        assert!(!config.watch_enabled(false));

        config.watch = Some(false);
        assert!(!config.watch_enabled(true));
    }

    #[test]
    fn test_validate_empty_path() {
        let config = Config {
            auth_file: PathBuf::new(),
            watch: None,
        };
        assert_eq!(config.validate(), vec!["token.auth-file must be non-empty"]);
    }
}
