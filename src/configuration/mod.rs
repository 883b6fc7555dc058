use serde::Deserialize;
use std::env;
use std::fs;
use std::net::IpAddr;
use std::path::Path;

mod error;

use crate::command::server::auth::{azure, github, gitlab, google, ldap, token, ProviderKind};
pub use error::Error;

#[derive(Clone, Debug, Deserialize)]
pub struct Configuration {
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub ntp: NtpConfig,
    #[serde(default)]
    pub observability: Option<ObservabilityConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct ServerConfig {
    pub bind_address: IpAddr,
    #[serde(default = "ServerConfig::default_port")]
    pub port: u16,
    #[serde(default = "ServerConfig::default_read_timeout")]
    pub read_timeout: u64,
    #[serde(default = "ServerConfig::default_write_timeout")]
    pub write_timeout: u64,
    #[serde(default = "ServerConfig::default_shutdown_grace_period")]
    pub shutdown_grace_period: u64,
    pub tls: ServerTlsConfig,
}

impl ServerConfig {
    fn default_port() -> u16 {
        8443
    }

    fn default_read_timeout() -> u64 {
        5
    }

    fn default_write_timeout() -> u64 {
        10
    }

    fn default_shutdown_grace_period() -> u64 {
        5
    }
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ServerTlsConfig {
    pub server_certificate_bundle: String,
    pub server_private_key: String,
    pub client_ca_bundle: String,
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub providers: Vec<ProviderKind>,
    #[serde(default)]
    pub github: github::Config,
    #[serde(default)]
    pub gitlab: gitlab::Config,
    #[serde(default)]
    pub google: google::Config,
    #[serde(default)]
    pub azure: Option<azure::Config>,
    #[serde(default)]
    pub ldap: Option<ldap::Config>,
    #[serde(default)]
    pub token: Option<token::Config>,
}

impl AuthConfig {
    pub fn is_enabled(&self, kind: ProviderKind) -> bool {
        self.providers.contains(&kind)
    }

    fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.providers.is_empty() {
            errors.push("auth.providers must list at least one provider".to_string());
        }

        if self.is_enabled(ProviderKind::Google) {
            errors.extend(self.google.validate());
        }

        if self.is_enabled(ProviderKind::Azure) {
            match &self.azure {
                Some(azure) => errors.extend(azure.validate()),
                None => errors.push(missing_section(ProviderKind::Azure)),
            }
        }

        if self.is_enabled(ProviderKind::Ldap) {
            match &self.ldap {
                Some(ldap) => errors.extend(ldap.validate()),
                None => errors.push(missing_section(ProviderKind::Ldap)),
            }
        }

        if self.is_enabled(ProviderKind::Token) {
            match &self.token {
                Some(token) => errors.extend(token.validate()),
                None => errors.push(missing_section(ProviderKind::Token)),
            }
        }

        errors
    }
}

fn missing_section(kind: ProviderKind) -> String {
    format!("auth.{kind} section is required when {kind} is enabled")
}

#[derive(Clone, Debug, Deserialize)]
pub struct NtpConfig {
    #[serde(default = "NtpConfig::default_server")]
    pub server: String,
    #[serde(default = "NtpConfig::default_max_clock_skew")]
    pub max_clock_skew: u64,
    #[serde(default = "NtpConfig::default_interval")]
    pub interval: u64,
}

impl Default for NtpConfig {
    fn default() -> Self {
        NtpConfig {
            server: NtpConfig::default_server(),
            max_clock_skew: NtpConfig::default_max_clock_skew(),
            interval: NtpConfig::default_interval(),
        }
    }
}

impl NtpConfig {
    fn default_server() -> String {
        "0.pool.ntp.org".to_string()
    }

    fn default_max_clock_skew() -> u64 {
        120
    }

    fn default_interval() -> u64 {
        600
    }

    pub fn enabled(&self) -> bool {
        self.interval > 0
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
pub struct ObservabilityConfig {
    #[serde(default)]
    pub tracing: Option<TracingConfig>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct TracingConfig {
    pub endpoint: String,
    pub sampling_rate: f64,
}

impl Configuration {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let config_str = fs::read_to_string(path)?;
        Self::load_from_str(&config_str)
    }

    pub fn load_from_str(slice: &str) -> Result<Self, Error> {
        Self::load_with_env(slice, |name| env::var(name).ok())
    }

    fn load_with_env<F>(slice: &str, lookup: F) -> Result<Self, Error>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config: Configuration = toml::from_str(slice)?;

        if let Some(ldap) = config.auth.ldap.as_mut() {
            ldap.apply_env_defaults(&lookup);
        }

        let errors = config.auth.validate();
        if !errors.is_empty() {
            return Err(Error::Validation(errors));
        }

        Ok(config)
    }
}
