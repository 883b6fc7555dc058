use std::path::Path;
use std::sync::Arc;

use rustls::crypto::aws_lc_rs::{self, cipher_suite};
use rustls::crypto::CryptoProvider;
use rustls::server::{NoServerSessionStorage, WebPkiClientVerifier};
use rustls::{RootCertStore, ServerConfig};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tracing::{debug, info};

use crate::configuration::{Error, ServerTlsConfig};

/// ECDHE key exchange with AEAD ciphers only.
fn crypto_provider() -> CryptoProvider {
    CryptoProvider {
        cipher_suites: vec![
            cipher_suite::TLS13_AES_128_GCM_SHA256,
            cipher_suite::TLS13_AES_256_GCM_SHA384,
            cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
        ],
        ..aws_lc_rs::default_provider()
    }
}

pub fn load_certificate_bundle<P: AsRef<Path>>(path: P) -> Result<Vec<CertificateDer<'static>>, Error> {
    let path = path.as_ref();
    info!("Loading certificate bundle from {}", path.display());

    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|err| Error::Tls(format!("Error opening certificate bundle {}: {err}", path.display())))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|err| Error::Tls(format!("Error reading certificate bundle {}: {err}", path.display())))?;

    if certs.is_empty() {
        return Err(Error::Tls(format!("No certificate found in {}", path.display())));
    }
    Ok(certs)
}

pub fn load_private_key<P: AsRef<Path>>(path: P) -> Result<PrivateKeyDer<'static>, Error> {
    let path = path.as_ref();
    info!("Loading private key from {}", path.display());

    PrivateKeyDer::from_pem_file(path)
        .map_err(|err| Error::Tls(format!("Error reading private key {}: {err}", path.display())))
}

pub fn build_root_store(certs: Vec<CertificateDer>) -> Result<RootCertStore, Error> {
    let mut root_store = RootCertStore::empty();
    for cert in certs {
        root_store.add(cert)?;
    }
    Ok(root_store)
}

/// Server side TLS: client certificates are verified against the client CA
/// but not required, so a missing certificate reaches the handler and is
/// answered with a TokenReview error instead of a handshake failure.
pub fn build_server_config(tls: &ServerTlsConfig) -> Result<ServerConfig, Error> {
    let provider = Arc::new(crypto_provider());

    let server_certs = load_certificate_bundle(&tls.server_certificate_bundle)?;
    let server_key = load_private_key(&tls.server_private_key)?;
    let client_roots = build_root_store(load_certificate_bundle(&tls.client_ca_bundle)?)?;

    let client_cert_verifier =
        WebPkiClientVerifier::builder_with_provider(Arc::new(client_roots), Arc::clone(&provider))
            .allow_unauthenticated()
            .build()?;

    let mut config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS12, &rustls::version::TLS13])?
        .with_client_cert_verifier(client_cert_verifier)
        .with_single_cert(server_certs, server_key)?;

    config.ignore_client_order = true;
    config.send_tls13_tickets = 0;
    config.session_storage = Arc::new(NoServerSessionStorage {});
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    debug!("TLS server configuration built");
    Ok(config)
}

#[cfg(test)]
pub mod tests {
    use std::path::PathBuf;
    use std::process::Command;

    use super::*;

    fn openssl(args: &[&str]) {
        let status = Command::new("openssl").args(args).status().unwrap();
        assert!(status.success(), "openssl {args:?} failed");
    }

    /// Writes `ca.crt`, `server.crt` and `server.key` into `dir`.
    pub fn write_server_pki(dir: &Path) -> ServerTlsConfig {
        let path = |name: &str| dir.join(name).to_string_lossy().into_owned();

        openssl(&[
            "req", "-x509", "-newkey", "rsa:2048", "-nodes", "-days", "1",
            "-subj", "/CN=ca",
            "-keyout", &path("ca.key"), "-out", &path("ca.crt"),
        ]);
        openssl(&[
            "req", "-newkey", "rsa:2048", "-nodes",
            "-subj", "/CN=server",
            "-keyout", &path("server.key"), "-out", &path("server.csr"),
        ]);
        openssl(&[
            "x509", "-req", "-days", "1",
            "-in", &path("server.csr"),
            "-CA", &path("ca.crt"), "-CAkey", &path("ca.key"), "-CAcreateserial",
            "-out", &path("server.crt"),
        ]);

        ServerTlsConfig {
            server_certificate_bundle: path("server.crt"),
            server_private_key: path("server.key"),
            client_ca_bundle: path("ca.crt"),
        }
    }

    #[test]
    fn test_build_server_config() {
        let dir = tempfile::tempdir().unwrap();
        let tls = write_server_pki(dir.path());

        let config = build_server_config(&tls).unwrap();

        assert!(config.ignore_client_order);
        assert_eq!(config.send_tls13_tickets, 0);
        assert_eq!(config.alpn_protocols, vec![b"h2".to_vec(), b"http/1.1".to_vec()]);
        assert_eq!(config.crypto_provider().cipher_suites.len(), 9);
    }

    #[test]
    fn test_missing_certificate_bundle() {
        let tls = ServerTlsConfig {
            server_certificate_bundle: "/nonexistent/server.crt".to_string(),
            server_private_key: "/nonexistent/server.key".to_string(),
            client_ca_bundle: "/nonexistent/ca.crt".to_string(),
        };

        let result = build_server_config(&tls);
        assert!(matches!(result, Err(Error::Tls(msg)) if msg.contains("/nonexistent/server.crt")));
    }

    #[test]
    fn test_empty_bundle_is_rejected() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let path = PathBuf::from(file.path());

        let result = load_certificate_bundle(&path);
        assert!(matches!(result, Err(Error::Tls(msg)) if msg.starts_with("No certificate found")));
    }
}
