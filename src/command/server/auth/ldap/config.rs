use std::path::PathBuf;

use serde::Deserialize;

use crate::secret::Secret;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TlsMode {
    #[default]
    Plain,
    StartTls,
    Ldaps,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthChoice {
    /// Token is `base64(username:password)`.
    #[default]
    Simple,
    /// Token is a base64 encoded Kerberos AP-REQ.
    Kerberos,
}

#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server_address: String,
    #[serde(default = "Config::default_server_port")]
    pub server_port: u16,
    /// Service account used for searches; anonymous when unset.
    #[serde(default)]
    pub bind_dn: Option<String>,
    #[serde(default)]
    pub bind_password: Option<Secret<String>>,
    #[serde(default)]
    pub user_search_dn: String,
    #[serde(default = "Config::default_user_search_filter")]
    pub user_search_filter: String,
    #[serde(default = "Config::default_user_attribute")]
    pub user_attribute: String,
    #[serde(default)]
    pub group_search_dn: String,
    #[serde(default = "Config::default_group_search_filter")]
    pub group_search_filter: String,
    #[serde(default = "Config::default_group_member_attribute")]
    pub group_member_attribute: String,
    #[serde(default = "Config::default_group_name_attribute")]
    pub group_name_attribute: String,
    #[serde(default)]
    pub tls_mode: TlsMode,
    #[serde(default)]
    pub skip_tls_verification: bool,
    /// CA bundle for a self-signed server certificate.
    #[serde(default)]
    pub ca_cert_file: Option<PathBuf>,
    #[serde(default)]
    pub auth_choice: AuthChoice,
    #[serde(default)]
    pub keytab_file: Option<PathBuf>,
    /// Service principal tickets must be issued for, e.g. `HTTP/guard.example.com`.
    #[serde(default)]
    pub service_account: Option<String>,
}

impl Config {
    fn default_server_port() -> u16 {
        389
    }

    fn default_user_search_filter() -> String {
        "(objectClass=person)".to_string()
    }

    fn default_user_attribute() -> String {
        "uid".to_string()
    }

    fn default_group_search_filter() -> String {
        "(objectClass=groupOfNames)".to_string()
    }

    fn default_group_member_attribute() -> String {
        "member".to_string()
    }

    fn default_group_name_attribute() -> String {
        "cn".to_string()
    }

    /// Fills the service account credentials from `LDAP_BIND_DN` and
    /// `LDAP_BIND_PASSWORD` when the configuration file leaves them unset.
    pub fn apply_env_defaults<F>(&mut self, lookup: &F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if self.bind_dn.is_none() {
            self.bind_dn = lookup("LDAP_BIND_DN");
        }
        if self.bind_password.is_none() {
            self.bind_password = lookup("LDAP_BIND_PASSWORD").map(Secret::new);
        }
    }

    /// Service account credentials, when both parts are non-empty.
    pub fn service_credentials(&self) -> Option<(&str, &str)> {
        let dn = self.bind_dn.as_deref().filter(|dn| !dn.is_empty())?;
        let password = self
            .bind_password
            .as_ref()
            .map(|password| password.expose().as_str())
            .filter(|password| !password.is_empty())?;
        Some((dn, password))
    }

    pub fn user_search_filter_for(&self, username: &str) -> String {
        format!(
            "(&{}({}={}))",
            self.user_search_filter,
            self.user_attribute,
            ldap3::ldap_escape(username)
        )
    }

    pub fn group_search_filter_for(&self, user_dn: &str) -> String {
        format!(
            "(&{}({}={}))",
            self.group_search_filter,
            self.group_member_attribute,
            ldap3::ldap_escape(user_dn)
        )
    }

    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        let required = [
            ("ldap.server-address", &self.server_address),
            ("ldap.user-search-dn", &self.user_search_dn),
            ("ldap.user-attribute", &self.user_attribute),
            ("ldap.group-search-dn", &self.group_search_dn),
            ("ldap.group-member-attribute", &self.group_member_attribute),
            ("ldap.group-name-attribute", &self.group_name_attribute),
        ];
        for (name, value) in required {
            if value.is_empty() {
                errors.push(format!("{name} must be non-empty"));
            }
        }

        if self.server_port == 0 {
            errors.push("ldap.server-port must be non-empty".to_string());
        }

        let has_keytab = self
            .keytab_file
            .as_ref()
            .is_some_and(|path| !path.as_os_str().is_empty());
        if self.auth_choice == AuthChoice::Kerberos && !has_keytab {
            errors.push("for kerberos ldap.keytab-file must be non-empty".to_string());
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        toml::from_str(
            r#"
            server_address = "ldap.example.com"
            user_search_dn = "ou=users,o=Company"
            group_search_dn = "ou=groups,o=Company"
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_search_filters() {
        let config = config();

        assert_eq!(
            config.user_search_filter_for("nahid"),
            "(&(objectClass=person)(uid=nahid))"
        );
        assert_eq!(
            config.group_search_filter_for("uid=nahid,ou=users,o=Company"),
            "(&(objectClass=groupOfNames)(member=uid=nahid,ou=users,o=Company))"
        );
    }

    #[test]
    fn test_search_filter_escapes_user_input() {
        let config = config();

        assert_eq!(
            config.user_search_filter_for("*)(uid=*"),
            r"(&(objectClass=person)(uid=\2a\29\28uid=\2a))"
        );
    }

    #[test]
    fn test_tls_mode_names() {
        let config: Config = toml::from_str(
            r#"
            server_address = "ldap.example.com"
            tls_mode = "starttls"
            "#,
        )
        .unwrap();
        assert_eq!(config.tls_mode, TlsMode::StartTls);

        let config: Config = toml::from_str(r#"tls_mode = "ldaps""#).unwrap();
        assert_eq!(config.tls_mode, TlsMode::Ldaps);

        assert!(toml::from_str::<Config>(r#"tls_mode = "both""#).is_err());
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let config: Config = toml::from_str(r#"auth_choice = "kerberos""#).unwrap();

        assert_eq!(
            config.validate(),
            vec![
                "ldap.server-address must be non-empty",
                "ldap.user-search-dn must be non-empty",
                "ldap.group-search-dn must be non-empty",
                "for kerberos ldap.keytab-file must be non-empty",
            ]
        );
        assert!(self::config().validate().is_empty());
    }

    #[test]
    fn test_service_credentials_need_both_parts() {
        let mut config = config();
        assert!(config.service_credentials().is_none());

        config.bind_dn = Some("uid=admin,ou=system".to_string());
        assert!(config.service_credentials().is_none());

        config.bind_password = Some(Secret::new("secret".to_string()));
        assert_eq!(
            config.service_credentials(),
            Some(("uid=admin,ou=system", "secret"))
        );
    }
}
