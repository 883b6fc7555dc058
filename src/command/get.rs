use std::collections::BTreeMap;
use std::fs;
use std::net::SocketAddr;

use argh::FromArgs;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::command::eks::{self, AwsCredentials};
use crate::command::init::default_pki_dir;
use crate::command::pki::{self, CertStore, CA, SERVER};
use crate::command::server::auth::ProviderKind;
use crate::command::Error;

const DEFAULT_ADDR: &str = "10.96.10.96:443";
const CLUSTER_NAME: &str = "guard-server";
const CONTEXT_NAME: &str = "webhook";
const SERVING_PORT: u16 = 8443;
const PKI_MOUNT_PATH: &str = "/etc/guard/pki";
const CONFIG_MOUNT_PATH: &str = "/etc/guard/config";

#[derive(FromArgs, PartialEq, Debug)]
#[argh(
    subcommand,
    name = "get",
    description = "Print webhook configuration, tokens and installer manifests"
)]
pub struct Options {
    #[argh(subcommand)]
    target: Target,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
enum Target {
    WebhookConfig(WebhookConfigOptions),
    Token(TokenOptions),
    Installer(InstallerOptions),
    ClusterToken(ClusterTokenOptions),
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(
    subcommand,
    name = "webhook-config",
    description = "Print the authentication token webhook config file"
)]
struct WebhookConfigOptions {
    #[argh(positional)]
    /// client name used when the client certificate was generated
    name: Option<String>,

    #[argh(option, short = 'o')]
    /// name of the organization (github, gitlab, google, azure, ldap, token)
    organization: Option<String>,

    #[argh(option, default = "String::from(DEFAULT_ADDR)")]
    /// address (host:port) of the server
    addr: String,

    #[argh(option, default = "default_pki_dir()")]
    /// directory where pki files are stored
    pki_dir: String,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "token", description = "Get a token for an organization")]
struct TokenOptions {
    #[argh(option, short = 'o')]
    /// name of the organization (github, gitlab, ldap)
    organization: Option<String>,

    #[argh(option)]
    /// LDAP username
    username: Option<String>,

    #[argh(option)]
    /// LDAP password, prompted for when omitted
    password: Option<String>,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(
    subcommand,
    name = "installer",
    description = "Print the Kubernetes manifests running the server in-cluster"
)]
struct InstallerOptions {
    #[argh(option, default = "default_pki_dir()")]
    /// directory where pki files are stored
    pki_dir: String,

    #[argh(option, short = 'n', default = "String::from(\"kube-system\")")]
    /// namespace used to run the server
    namespace: String,

    #[argh(option, default = "String::from(DEFAULT_ADDR)")]
    /// address (host:port) of the server, its host becomes the service cluster IP
    addr: String,

    #[argh(option, default = "default_image()")]
    /// container image of the server
    image: String,

    #[argh(option)]
    /// configuration file shipped to the server, generated when omitted
    config: Option<String>,

    #[argh(option, default = "String::from(\"github\")")]
    /// providers enabled in the generated configuration, comma separated
    providers: String,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(
    subcommand,
    name = "cluster-token",
    description = "Print an exec credential for a managed cluster"
)]
struct ClusterTokenOptions {
    #[argh(option, short = 'p')]
    /// name of the cloud provider (eks)
    provider: Option<String>,

    #[argh(option, short = 'k', default = "String::new()")]
    /// name of the cluster
    cluster: String,
}

fn default_image() -> String {
    format!("{}:{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"))
}

pub struct Command;

impl Command {
    pub fn run(options: Options) -> Result<(), Error> {
        let output = match options.target {
            Target::WebhookConfig(options) => webhook_config(&options)?,
            Target::Token(options) => token(options)?,
            Target::Installer(options) => installer(&options)?,
            Target::ClusterToken(options) => cluster_token(&options)?,
        };
        println!("{output}");
        Ok(())
    }
}

/// Subset of the kubeconfig format read by the API server's
/// `--authentication-token-webhook-config-file`.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct KubeConfig {
    #[serde(rename = "apiVersion")]
    pub api_version: String,
    pub kind: String,
    pub clusters: Vec<NamedCluster>,
    pub users: Vec<NamedUser>,
    pub contexts: Vec<NamedContext>,
    pub current_context: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NamedCluster {
    pub name: String,
    pub cluster: Cluster,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Cluster {
    pub server: String,
    pub certificate_authority_data: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NamedUser {
    pub name: String,
    pub user: User,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct User {
    pub client_certificate_data: String,
    pub client_key_data: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct NamedContext {
    pub name: String,
    pub context: Context,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct Context {
    pub cluster: String,
    pub user: String,
}

fn webhook_config(options: &WebhookConfigOptions) -> Result<String, Error> {
    let kind = pki::parse_organization(options.organization.as_deref())?;
    let name = pki::client_name(options.name.clone(), kind)?;
    let client = pki::client_pair_name(&name, kind);

    let store = CertStore::new(&options.pki_dir)?;
    if !store.pair_exists(CA) {
        return Err(Error::Pki(format!(
            "CA certificates not found in {}. Run `kube-guard init ca`",
            store.location().display()
        )));
    }
    if !store.pair_exists(&client) {
        return Err(Error::Pki(format!(
            "Client certificate not found in {}. Run `kube-guard init client {name} -o {kind}`",
            store.location().display()
        )));
    }

    let ca = store.read_pair(CA)?;
    let client_pair = store.read_pair(&client)?;

    let config = KubeConfig {
        api_version: "v1".to_string(),
        kind: "Config".to_string(),
        clusters: vec![NamedCluster {
            name: CLUSTER_NAME.to_string(),
            cluster: Cluster {
                server: format!("https://{}/tokenreviews", options.addr),
                certificate_authority_data: STANDARD.encode(ca.certificate),
            },
        }],
        users: vec![NamedUser {
            name: client.clone(),
            user: User {
                client_certificate_data: STANDARD.encode(client_pair.certificate),
                client_key_data: STANDARD.encode(client_pair.key),
            },
        }],
        contexts: vec![NamedContext {
            name: CONTEXT_NAME.to_string(),
            context: Context {
                cluster: CLUSTER_NAME.to_string(),
                user: client,
            },
        }],
        current_context: CONTEXT_NAME.to_string(),
    };

    Ok(serde_yaml::to_string(&config)?)
}

fn token(options: TokenOptions) -> Result<String, Error> {
    match pki::parse_organization(options.organization.as_deref())? {
        ProviderKind::GitHub => Ok(
            "Create a personal access token with the read:org scope at https://github.com/settings/tokens/new"
                .to_string(),
        ),
        ProviderKind::GitLab => Ok(
            "Create a personal access token with the read_user and read_api scopes at https://gitlab.com/-/user_settings/personal_access_tokens"
                .to_string(),
        ),
        ProviderKind::Ldap => {
            let username = options
                .username
                .filter(|username| !username.is_empty())
                .ok_or_else(|| Error::InvalidArgument("username must be non-empty".to_string()))?;
            let password = match options.password {
                Some(password) => password,
                None => rpassword::prompt_password("Password: ")?,
            };
            ldap_token(&username, &password)
        }
        kind => Err(Error::InvalidArgument(format!(
            "Token issuance is not supported for {kind}"
        ))),
    }
}

/// Token accepted by the LDAP provider in simple bind mode.
fn ldap_token(username: &str, password: &str) -> Result<String, Error> {
    if password.is_empty() {
        return Err(Error::InvalidArgument("password must be non-empty".to_string()));
    }
    Ok(STANDARD.encode(format!("{username}:{password}")))
}

fn cluster_token(options: &ClusterTokenOptions) -> Result<String, Error> {
    match options.provider.as_deref().map(str::to_lowercase).as_deref() {
        None | Some("") => Err(Error::InvalidArgument(
            "Missing cloud provider name. Set flag -p eks.".to_string(),
        )),
        Some(eks::PROVIDER) => {
            let now = chrono::Utc::now();
            let token = eks::cluster_token(&options.cluster, &AwsCredentials::from_env()?, now)?;
            eks::exec_credential(&token, now)
        }
        Some(provider) => Err(Error::InvalidArgument(format!(
            "Unknown cloud provider {provider}."
        ))),
    }
}

fn installer(options: &InstallerOptions) -> Result<String, Error> {
    let addr: SocketAddr = options
        .addr
        .parse()
        .map_err(|e| Error::InvalidArgument(format!("Invalid address {}: {e}", options.addr)))?;

    let store = CertStore::new(&options.pki_dir)?;
    for pair in [CA, SERVER] {
        if !store.pair_exists(pair) {
            return Err(Error::Pki(format!(
                "{pair} certificates not found in {}. Run `kube-guard init {pair}`",
                store.location().display()
            )));
        }
    }
    let ca = store.read_pair(CA)?;
    let server = store.read_pair(SERVER)?;

    let config = match &options.config {
        Some(path) => fs::read_to_string(path)?,
        None => generated_config(&options.providers)?,
    };

    let labels = json!({ "app": "guard" });

    let mut pki_data = BTreeMap::new();
    pki_data.insert("ca.crt", STANDARD.encode(ca.certificate));
    pki_data.insert("tls.crt", STANDARD.encode(server.certificate));
    pki_data.insert("tls.key", STANDARD.encode(server.key));

    let pki_secret = json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": { "name": "guard-pki", "namespace": options.namespace, "labels": labels },
        "type": "Opaque",
        "data": pki_data,
    });

    let config_secret = json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": { "name": "guard-config", "namespace": options.namespace, "labels": labels },
        "type": "Opaque",
        "data": { "config.toml": STANDARD.encode(config) },
    });

    let probe = json!({
        "httpGet": { "path": "/healthz", "port": SERVING_PORT, "scheme": "HTTPS" },
        "initialDelaySeconds": 30,
    });

    let deployment = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": "guard", "namespace": options.namespace, "labels": labels },
        "spec": {
            "replicas": 1,
            "selector": { "matchLabels": labels },
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "priorityClassName": "system-cluster-critical",
                    "containers": [{
                        "name": "guard",
                        "image": options.image,
                        "args": ["-c", format!("{CONFIG_MOUNT_PATH}/config.toml"), "run"],
                        "env": [{ "name": "RUST_LOG", "value": "info" }],
                        "ports": [{ "containerPort": SERVING_PORT, "name": "web" }],
                        "readinessProbe": probe,
                        "livenessProbe": probe,
                        "volumeMounts": [
                            { "name": "guard-pki", "mountPath": PKI_MOUNT_PATH },
                            { "name": "guard-config", "mountPath": CONFIG_MOUNT_PATH },
                        ],
                    }],
                    "volumes": [
                        { "name": "guard-pki", "secret": { "secretName": "guard-pki", "defaultMode": 0o444 } },
                        { "name": "guard-config", "secret": { "secretName": "guard-config", "defaultMode": 0o444 } },
                    ],
                },
            },
        },
    });

    let service = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": { "name": "guard", "namespace": options.namespace, "labels": labels },
        "spec": {
            "type": "ClusterIP",
            "clusterIP": addr.ip().to_string(),
            "ports": [{
                "name": "api",
                "port": addr.port(),
                "protocol": "TCP",
                "targetPort": SERVING_PORT,
            }],
            "selector": labels,
        },
    });

    let documents = [pki_secret, config_secret, deployment, service]
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(documents.join("---\n"))
}

fn generated_config(providers: &str) -> Result<String, Error> {
    let providers = providers
        .split(',')
        .map(str::trim)
        .filter(|provider| !provider.is_empty())
        .map(|provider| {
            ProviderKind::from_org(provider)
                .map(|kind| format!("\"{kind}\""))
                .ok_or_else(|| Error::InvalidArgument(format!("Unknown organization {provider}.")))
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(format!(
        r#"[server]
bind_address = "0.0.0.0"
port = {SERVING_PORT}

[server.tls]
server_certificate_bundle = "{PKI_MOUNT_PATH}/tls.crt"
server_private_key = "{PKI_MOUNT_PATH}/tls.key"
client_ca_bundle = "{PKI_MOUNT_PATH}/ca.crt"

[auth]
providers = [{}]
"#,
        providers.join(", ")
    ))
}
