use std::sync::Arc;

use tracing::{debug, instrument};
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::command::server::error::Error;

/// Extension type for passing peer certificate data from TLS layer
#[derive(Clone)]
pub struct PeerCertificate(pub Arc<Vec<u8>>);

/// Subject of an already-verified client certificate.
///
/// Chain validation happens in the TLS handshake; this type only reads the
/// Organization (provider selector) and Common Name (provider principal).
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClientCertificate {
    pub organizations: Vec<String>,
    pub common_names: Vec<String>,
}

impl ClientCertificate {
    #[instrument(skip(der))]
    pub fn from_der(der: &[u8]) -> Result<Self, Error> {
        let (_, cert) = X509Certificate::from_der(der).map_err(|e| {
            debug!("Failed to parse client certificate: {:?}", e);
            Error::MalformedRequest(format!("Malformed client certificate: {e}"))
        })?;

        Ok(Self::from_certificate(&cert))
    }

    fn from_certificate(cert: &X509Certificate) -> Self {
        let subject = cert.subject();

        let organizations = subject
            .iter_organization()
            .filter_map(|o| o.as_str().ok().map(String::from))
            .collect::<Vec<_>>();

        let common_names = subject
            .iter_common_name()
            .filter_map(|cn| cn.as_str().ok().map(String::from))
            .collect::<Vec<_>>();

        Self {
            organizations,
            common_names,
        }
    }

    pub fn organization(&self) -> Option<&str> {
        self.organizations.first().map(String::as_str)
    }

    pub fn common_name(&self) -> &str {
        self.common_names.first().map_or("", String::as_str)
    }
}
