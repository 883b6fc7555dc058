pub mod config;
pub mod directory;
pub mod kerberos;
pub mod keytab;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::{debug, instrument, warn};

use crate::command::server::auth::UserIdentity;
use crate::command::server::error::Error;
pub use config::{AuthChoice, Config, TlsMode};
use directory::{DirectoryConnector, DirectorySession, LdapConnector, SearchRequest};
use kerberos::{ApReqValidator, TicketValidator};
use keytab::Keytab;

const USER_SEARCH_SIZE_LIMIT: i32 = 2;

pub struct Authenticator {
    config: Config,
    connector: Box<dyn DirectoryConnector>,
    tickets: Option<Box<dyn TicketValidator>>,
}

impl Authenticator {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let connector = LdapConnector::new(config)?;

        let tickets: Option<Box<dyn TicketValidator>> = match config.auth_choice {
            AuthChoice::Simple => None,
            AuthChoice::Kerberos => {
                let path = config.keytab_file.as_deref().ok_or_else(|| {
                    Error::Initialization("keytab not provided".to_string())
                })?;
                let keytab = Keytab::load(path)?;
                debug!("Loaded {} keytab entries", keytab.entries.len());
                Some(Box::new(ApReqValidator::new(
                    keytab,
                    config.service_account.as_deref(),
                )))
            }
        };

        Ok(Self::with_connector(config.clone(), Box::new(connector), tickets))
    }

    pub fn with_connector(
        config: Config,
        connector: Box<dyn DirectoryConnector>,
        tickets: Option<Box<dyn TicketValidator>>,
    ) -> Self {
        Self {
            config,
            connector,
            tickets,
        }
    }

    /// Each review uses its own connection, closed whatever the outcome.
    #[instrument(skip(self, token))]
    pub async fn check(&self, token: &str) -> Result<UserIdentity, Error> {
        let mut session = self.connector.connect().await?;

        let result = self.check_with(session.as_mut(), token).await;

        if let Err(error) = session.close().await {
            warn!("Failed to close LDAP connection: {error}");
        }
        result
    }

    async fn check_with(
        &self,
        session: &mut dyn DirectorySession,
        token: &str,
    ) -> Result<UserIdentity, Error> {
        self.bind_service_account(session).await?;

        let (username, user_dn) = match self.config.auth_choice {
            AuthChoice::Simple => {
                let (username, password) = parse_basic_token(token)?;
                let user_dn = self.find_user_dn(session, &username).await?;

                session.bind(&user_dn, &password).await?;
                debug!("Bound as {user_dn}");

                // group search runs with the service account again
                self.bind_service_account(session).await?;
                (username, user_dn)
            }
            AuthChoice::Kerberos => {
                let tickets = self.tickets.as_ref().ok_or_else(|| {
                    Error::ProviderConfig("keytab not provided".to_string())
                })?;
                let username = tickets.validate(token)?;
                let user_dn = self.find_user_dn(session, &username).await?;
                (username, user_dn)
            }
        };

        let groups = self.find_groups(session, &user_dn).await?;

        Ok(UserIdentity {
            uid: username.clone(),
            username,
            groups,
        })
    }

    async fn bind_service_account(&self, session: &mut dyn DirectorySession) -> Result<(), Error> {
        match self.config.service_credentials() {
            Some((dn, password)) => session.bind(dn, password).await.map_err(|e| match e {
                // a rejected service account is a server-side problem
                Error::TokenInvalid(msg) => Error::ProviderConfig(msg),
                other => other,
            }),
            None => Ok(()),
        }
    }

    async fn find_user_dn(
        &self,
        session: &mut dyn DirectorySession,
        username: &str,
    ) -> Result<String, Error> {
        let request = SearchRequest {
            base: self.config.user_search_dn.clone(),
            filter: self.config.user_search_filter_for(username),
            attributes: Vec::new(),
            size_limit: USER_SEARCH_SIZE_LIMIT,
        };

        let outcome = session.search(&request).await?;

        if outcome.size_limit_exceeded || outcome.entries.len() > 1 {
            return Err(Error::TokenInconsistent(format!(
                "Multiple entries found for the user search filter '{}'",
                request.filter
            )));
        }

        outcome
            .entries
            .into_iter()
            .next()
            .map(|entry| entry.dn)
            .ok_or_else(|| {
                Error::TokenInconsistent(format!(
                    "No result for the user search filter '{}'",
                    request.filter
                ))
            })
    }

    async fn find_groups(
        &self,
        session: &mut dyn DirectorySession,
        user_dn: &str,
    ) -> Result<Vec<String>, Error> {
        let name_attribute = &self.config.group_name_attribute;
        let request = SearchRequest {
            base: self.config.group_search_dn.clone(),
            filter: self.config.group_search_filter_for(user_dn),
            attributes: vec![name_attribute.clone()],
            size_limit: 0,
        };

        let outcome = session.search(&request).await?;

        outcome
            .entries
            .iter()
            .map(|entry| {
                entry
                    .attribute(name_attribute)
                    .and_then(|values| values.first())
                    .cloned()
                    .ok_or_else(|| {
                        Error::UpstreamTransport(format!(
                            "{name_attribute} not provided for {}",
                            entry.dn
                        ))
                    })
            })
            .collect()
    }
}

/// Splits `base64(username:password)`; the password may contain colons.
fn parse_basic_token(token: &str) -> Result<(String, String), Error> {
    let invalid = || Error::TokenInvalid("Invalid basic auth token".to_string());

    let decoded = STANDARD.decode(token.trim()).map_err(|_| invalid())?;
    let decoded = String::from_utf8(decoded).map_err(|_| invalid())?;
    let (username, password) = decoded.split_once(':').ok_or_else(invalid)?;

    // an empty password would turn the user bind into an unauthenticated bind
    if username.is_empty() || password.is_empty() {
        return Err(invalid());
    }

    Ok((username.to_string(), password.to_string()))
}
