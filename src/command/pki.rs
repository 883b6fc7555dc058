use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

use crate::command::server::auth::ProviderKind;
use crate::command::Error;

pub const CA: &str = "ca";
pub const SERVER: &str = "server";

const CA_VALIDITY_DAYS: i64 = 3650;
const LEAF_VALIDITY_DAYS: i64 = 365;

/// Certificate/key pairs stored as `<root>/pki/<name>.crt` and `<name>.key`.
pub struct CertStore {
    dir: PathBuf,
}

/// PEM encoded certificate and private key.
pub struct PemPair {
    pub certificate: String,
    pub key: String,
}

impl CertStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self, Error> {
        let dir = root.as_ref().join("pki");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn location(&self) -> &Path {
        &self.dir
    }

    fn paths(&self, name: &str) -> (PathBuf, PathBuf) {
        (
            self.dir.join(format!("{name}.crt")),
            self.dir.join(format!("{name}.key")),
        )
    }

    pub fn pair_exists(&self, name: &str) -> bool {
        let (crt, key) = self.paths(name);
        crt.exists() && key.exists()
    }

    pub fn read_pair(&self, name: &str) -> Result<PemPair, Error> {
        let (crt, key) = self.paths(name);
        Ok(PemPair {
            certificate: fs::read_to_string(crt)?,
            key: fs::read_to_string(key)?,
        })
    }

    fn write_pair(&self, name: &str, certificate: &Certificate, key: &KeyPair) -> Result<(), Error> {
        let (crt, key_path) = self.paths(name);
        if crt.exists() || key_path.exists() {
            return Err(Error::Pki(format!(
                "{name} certificates already exist in {}",
                self.dir.display()
            )));
        }

        fs::write(&crt, certificate.pem())?;
        write_private(&key_path, key.serialize_pem().as_bytes())?;
        debug!("Wrote {} and {}", crt.display(), key_path.display());
        Ok(())
    }

    pub fn init_ca(&self) -> Result<(), Error> {
        let key = KeyPair::generate()?;

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.distinguished_name = distinguished_name(CA, None);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        set_validity(&mut params, CA_VALIDITY_DAYS);

        let certificate = params.self_signed(&key)?;
        self.write_pair(CA, &certificate, &key)?;
        info!("Wrote CA certificates in {}", self.dir.display());
        Ok(())
    }

    /// Rebuilds the CA from disk so it can sign new pairs.
    fn load_ca(&self) -> Result<(Certificate, KeyPair), Error> {
        if !self.pair_exists(CA) {
            return Err(Error::Pki(format!(
                "CA certificates not found in {}. Run `kube-guard init ca`",
                self.dir.display()
            )));
        }

        let pair = self.read_pair(CA)?;
        let key = KeyPair::from_pem(&pair.key)?;
        let certificate = CertificateParams::from_ca_cert_pem(&pair.certificate)?.self_signed(&key)?;
        Ok((certificate, key))
    }

    /// `sans` mixes DNS names and IP addresses.
    pub fn init_server(&self, sans: Vec<String>) -> Result<(), Error> {
        let (ca, ca_key) = self.load_ca()?;
        let key = KeyPair::generate()?;

        let mut params = CertificateParams::new(sans)?;
        params.distinguished_name = distinguished_name(SERVER, None);
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        set_validity(&mut params, LEAF_VALIDITY_DAYS);

        let certificate = params.signed_by(&key, &ca, &ca_key)?;
        self.write_pair(SERVER, &certificate, &key)?;
        info!("Wrote server certificates in {}", self.dir.display());
        Ok(())
    }

    /// Client pair with CN=`name` and O=the provider's organization.
    pub fn init_client(&self, name: &str, kind: ProviderKind) -> Result<String, Error> {
        let (ca, ca_key) = self.load_ca()?;
        let key = KeyPair::generate()?;

        let mut params = CertificateParams::new(Vec::<String>::new())?;
        params.distinguished_name = distinguished_name(name, Some(kind.organization()));
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        set_validity(&mut params, LEAF_VALIDITY_DAYS);

        let certificate = params.signed_by(&key, &ca, &ca_key)?;
        let file_name = client_pair_name(name, kind);
        self.write_pair(&file_name, &certificate, &key)?;
        info!("Wrote client certificates in {}", self.dir.display());
        Ok(file_name)
    }
}

pub fn client_pair_name(name: &str, kind: ProviderKind) -> String {
    format!("{name}@{}", kind.as_str())
}

/// Resolves the client name: providers that do not read the CN default to
/// the organization name.
pub fn client_name(name: Option<String>, kind: ProviderKind) -> Result<String, Error> {
    match name {
        Some(name) if !name.is_empty() => Ok(name),
        _ if !kind.requires_principal() => Ok(kind.as_str().to_string()),
        _ => Err(Error::InvalidArgument("Missing client name.".to_string())),
    }
}

pub fn parse_organization(org: Option<&str>) -> Result<ProviderKind, Error> {
    let names = ProviderKind::ALL.map(ProviderKind::as_str).join("|");
    match org {
        None | Some("") => Err(Error::InvalidArgument(format!(
            "Missing organization name. Set flag -o {names}"
        ))),
        Some(org) => ProviderKind::from_org(org)
            .ok_or_else(|| Error::InvalidArgument(format!("Unknown organization {org}."))),
    }
}

fn distinguished_name(common_name: &str, organization: Option<&str>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, common_name);
    if let Some(organization) = organization {
        dn.push(DnType::OrganizationName, organization);
    }
    dn
}

fn set_validity(params: &mut CertificateParams, days: i64) {
    let now = OffsetDateTime::now_utc();
    params.not_before = now - Duration::minutes(5);
    params.not_after = now + Duration::days(days);
}

fn write_private(path: &Path, content: &[u8]) -> Result<(), Error> {
    let mut options = fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }

    let mut file = options.open(path)?;
    file.write_all(content)?;
    Ok(())
}
