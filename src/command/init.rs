use std::env;
use std::path::PathBuf;

use argh::FromArgs;

use crate::command::pki::{self, CertStore};
use crate::command::Error;

/// Default root of the PKI directory, `$HOME/.kube-guard`.
pub fn default_pki_dir() -> String {
    env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_default()
        .join(".kube-guard")
        .display()
        .to_string()
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(
    subcommand,
    name = "init",
    description = "Generate the CA, server and client certificates"
)]
pub struct Options {
    #[argh(subcommand)]
    target: Target,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
enum Target {
    Ca(CaOptions),
    Server(ServerOptions),
    Client(ClientOptions),
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "ca", description = "Generate a self-signed CA")]
struct CaOptions {
    #[argh(option, default = "default_pki_dir()")]
    /// directory where pki files are stored
    pki_dir: String,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "server", description = "Generate the server certificate pair")]
struct ServerOptions {
    #[argh(option, default = "default_pki_dir()")]
    /// directory where pki files are stored
    pki_dir: String,

    #[argh(option)]
    /// alternative domain names, comma separated
    domains: Option<String>,

    #[argh(option, default = "String::from(\"127.0.0.1\")")]
    /// alternative IP addresses, comma separated
    ips: String,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand, name = "client", description = "Generate a client certificate pair")]
struct ClientOptions {
    #[argh(positional)]
    /// client name, written to the certificate CN
    name: Option<String>,

    #[argh(option, short = 'o')]
    /// name of the organization (github, gitlab, google, azure, ldap, token)
    organization: Option<String>,

    #[argh(option, default = "default_pki_dir()")]
    /// directory where pki files are stored
    pki_dir: String,
}

pub struct Command;

impl Command {
    pub fn run(options: Options) -> Result<(), Error> {
        match options.target {
            Target::Ca(options) => {
                let store = CertStore::new(&options.pki_dir)?;
                store.init_ca()?;
                println!("Wrote ca certificates in {}", store.location().display());
            }
            Target::Server(options) => {
                let store = CertStore::new(&options.pki_dir)?;
                store.init_server(server_sans(options.domains.as_deref(), &options.ips)?)?;
                println!("Wrote server certificates in {}", store.location().display());
            }
            Target::Client(options) => {
                let kind = pki::parse_organization(options.organization.as_deref())?;
                let name = pki::client_name(options.name, kind)?;
                let store = CertStore::new(&options.pki_dir)?;
                store.init_client(&name, kind)?;
                println!("Wrote client certificates in {}", store.location().display());
            }
        }
        Ok(())
    }
}

fn split_list(list: &str) -> impl Iterator<Item = &str> {
    list.split(',').map(str::trim).filter(|item| !item.is_empty())
}

fn server_sans(domains: Option<&str>, ips: &str) -> Result<Vec<String>, Error> {
    let mut sans = domains
        .map(|domains| split_list(domains).map(String::from).collect::<Vec<_>>())
        .unwrap_or_default();

    for ip in split_list(ips) {
        if ip.parse::<std::net::IpAddr>().is_err() {
            return Err(Error::InvalidArgument(format!("Invalid IP address {ip}")));
        }
        sans.push(ip.to_string());
    }
    Ok(sans)
}
