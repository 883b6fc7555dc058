use opentelemetry_otlp::ExporterBuildError;
use rustls_pki_types::pem;
use std::{fmt, io};
use tracing::debug;

#[derive(Debug)]
pub enum Error {
    Io(io::Error),
    NotReadable(String),
    ConfigurationFileFormat(String),
    Validation(Vec<String>),
    Tls(String),
    Watcher(String),
    ExporterInit(ExporterBuildError),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "IO error: {err}"),
            Error::NotReadable(err) => write!(f, "Configuration not readable: {err}"),
            Error::ConfigurationFileFormat(error) => {
                write!(f, "Configuration file format error: ")?;
                write!(f, "{error}")
            }
            Error::Validation(errors) => {
                write!(f, "Invalid configuration: {}", errors.join("; "))
            }
            Error::Tls(error) => write!(f, "TLS error: {error}"),
            Error::Watcher(error) => write!(f, "Watcher error: {error}"),
            Error::ExporterInit(error) => {
                write!(f, "Exporter initialization error: {error}")
            }
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl From<toml::de::Error> for Error {
    fn from(error: toml::de::Error) -> Self {
        debug!("TOML error: {error}");
        Error::ConfigurationFileFormat(error.to_string())
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error::Tls(err.to_string())
    }
}

impl From<rustls::server::VerifierBuilderError> for Error {
    fn from(err: rustls::server::VerifierBuilderError) -> Self {
        Error::Tls(err.to_string())
    }
}

impl From<pem::Error> for Error {
    fn from(err: pem::Error) -> Self {
        Error::Tls(err.to_string())
    }
}

impl From<notify::Error> for Error {
    fn from(err: notify::Error) -> Self {
        Error::Watcher(err.to_string())
    }
}

impl From<ExporterBuildError> for Error {
    fn from(error: ExporterBuildError) -> Self {
        Error::ExporterInit(error)
    }
}
