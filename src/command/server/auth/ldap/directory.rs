use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use ldap3::{
    DerefAliases, Ldap, LdapConnAsync, LdapConnSettings, LdapError, Scope, SearchEntry,
    SearchOptions,
};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::CertificateDer;
use tracing::{debug, warn};

use crate::command::server::auth::ldap::{Config, TlsMode};
use crate::command::server::error::Error;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const SEARCH_TIME_LIMIT: i32 = 10;

const RC_SIZE_LIMIT_EXCEEDED: u32 = 4;
const RC_INVALID_CREDENTIALS: u32 = 49;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SearchRequest {
    pub base: String,
    pub filter: String,
    pub attributes: Vec<String>,
    /// 0 means no limit.
    pub size_limit: i32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Entry {
    pub dn: String,
    pub attributes: HashMap<String, Vec<String>>,
}

impl Entry {
    /// Attribute names are case-insensitive.
    pub fn attribute(&self, name: &str) -> Option<&[String]> {
        self.attributes
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, values)| values.as_slice())
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchOutcome {
    pub entries: Vec<Entry>,
    /// The server stopped at the requested size limit.
    pub size_limit_exceeded: bool,
}

/// One authenticated conversation with the directory server.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectorySession: Send {
    async fn bind(&mut self, dn: &str, password: &str) -> Result<(), Error>;

    async fn search(&mut self, request: &SearchRequest) -> Result<SearchOutcome, Error>;

    async fn close(&mut self) -> Result<(), Error>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirectoryConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn DirectorySession>, Error>;
}

pub struct LdapConnector {
    server_address: String,
    server_port: u16,
    tls_mode: TlsMode,
    skip_tls_verification: bool,
    ca_certificates: Vec<native_tls::Certificate>,
}

impl LdapConnector {
    pub fn new(config: &Config) -> Result<Self, Error> {
        let ca_certificates = match &config.ca_cert_file {
            Some(path) if !path.as_os_str().is_empty() => load_ca_certificates(path)?,
            _ => Vec::new(),
        };

        Ok(Self {
            server_address: config.server_address.clone(),
            server_port: config.server_port,
            tls_mode: config.tls_mode,
            skip_tls_verification: config.skip_tls_verification,
            ca_certificates,
        })
    }

    fn url(&self) -> String {
        let scheme = match self.tls_mode {
            TlsMode::Ldaps => "ldaps",
            TlsMode::Plain | TlsMode::StartTls => "ldap",
        };
        format!("{scheme}://{}:{}", self.server_address, self.server_port)
    }

    fn settings(&self) -> Result<LdapConnSettings, Error> {
        let mut settings = LdapConnSettings::new()
            .set_conn_timeout(CONNECT_TIMEOUT)
            .set_starttls(self.tls_mode == TlsMode::StartTls)
            .set_no_tls_verify(self.skip_tls_verification);

        if self.tls_mode != TlsMode::Plain {
            let mut builder = native_tls::TlsConnector::builder();
            for certificate in &self.ca_certificates {
                builder.add_root_certificate(certificate.clone());
            }
            builder.danger_accept_invalid_certs(self.skip_tls_verification);

            let connector = builder.build().map_err(|e| {
                Error::Initialization(format!("unable to setup TLS connection: {e}"))
            })?;
            settings = settings.set_connector(connector);
        }

        Ok(settings)
    }
}

fn load_ca_certificates(path: &std::path::Path) -> Result<Vec<native_tls::Certificate>, Error> {
    let pem = std::fs::read(path)
        .map_err(|e| Error::Initialization(format!("unable to read ca cert file: {e}")))?;

    let certificates = CertificateDer::pem_slice_iter(&pem)
        .map(|certificate| {
            let certificate = certificate.map_err(|e| {
                Error::Initialization(format!("Failed to add CA cert in CertPool for LDAP: {e}"))
            })?;
            native_tls::Certificate::from_der(&certificate).map_err(|e| {
                Error::Initialization(format!("Failed to add CA cert in CertPool for LDAP: {e}"))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if certificates.is_empty() {
        return Err(Error::Initialization(
            "Failed to add CA cert in CertPool for LDAP: no certificate found".to_string(),
        ));
    }
    Ok(certificates)
}

#[async_trait]
impl DirectoryConnector for LdapConnector {
    async fn connect(&self) -> Result<Box<dyn DirectorySession>, Error> {
        let url = self.url();
        debug!("Connecting to {url}");

        let (conn, ldap) = LdapConnAsync::with_settings(self.settings()?, &url)
            .await
            .map_err(|e| {
                Error::UpstreamTransport(format!(
                    "unable to create ldap connector for {}:{}: {e}",
                    self.server_address, self.server_port
                ))
            })?;

        tokio::spawn(async move {
            if let Err(error) = conn.drive().await {
                warn!("LDAP connection error: {error}");
            }
        });

        Ok(Box::new(Ldap3Session { ldap }))
    }
}

struct Ldap3Session {
    ldap: Ldap,
}

#[async_trait]
impl DirectorySession for Ldap3Session {
    async fn bind(&mut self, dn: &str, password: &str) -> Result<(), Error> {
        let result = self
            .ldap
            .simple_bind(dn, password)
            .await
            .and_then(|result| result.success());

        match result {
            Ok(_) => Ok(()),
            Err(LdapError::LdapResult { result }) if result.rc == RC_INVALID_CREDENTIALS => {
                Err(Error::TokenInvalid(format!(
                    "LDAP Result Code 49 \"Invalid Credentials\" for {dn}"
                )))
            }
            Err(e) => Err(Error::UpstreamTransport(format!("failed to bind as {dn}: {e}"))),
        }
    }

    async fn search(&mut self, request: &SearchRequest) -> Result<SearchOutcome, Error> {
        let options = SearchOptions::new()
            .deref(DerefAliases::Never)
            .sizelimit(request.size_limit)
            .timelimit(SEARCH_TIME_LIMIT);

        let ldap3::SearchResult(entries, result) = self
            .ldap
            .with_search_options(options)
            .search(
                &request.base,
                Scope::Subtree,
                &request.filter,
                request.attributes.clone(),
            )
            .await?;

        let size_limit_exceeded = result.rc == RC_SIZE_LIMIT_EXCEEDED;
        if !size_limit_exceeded {
            result.success()?;
        }

        let entries = entries
            .into_iter()
            .map(|entry| {
                let entry = SearchEntry::construct(entry);
                Entry {
                    dn: entry.dn,
                    attributes: entry.attrs,
                }
            })
            .collect();

        Ok(SearchOutcome {
            entries,
            size_limit_exceeded,
        })
    }

    async fn close(&mut self) -> Result<(), Error> {
        self.ldap.unbind().await?;
        Ok(())
    }
}
