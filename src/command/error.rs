use crate::command::server;
use crate::configuration;
use std::{fmt, io};

#[derive(Debug)]
pub enum Error {
    IO(io::Error),
    Configuration(configuration::Error),
    Server(server::Error),
    Pki(String),
    InvalidArgument(String),
    Serialization(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::IO(err) => write!(f, "IO error: {err}"),
            Error::Configuration(err) => write!(f, "Configuration error: {err}"),
            Error::Server(err) => write!(f, "Server error: {err}"),
            Error::Pki(err) => write!(f, "{err}"),
            Error::InvalidArgument(err) => write!(f, "{err}"),
            Error::Serialization(err) => write!(f, "Serialization error: {err}"),
        }
    }
}

impl std::error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::IO(err)
    }
}

impl From<configuration::Error> for Error {
    fn from(err: configuration::Error) -> Self {
        Error::Configuration(err)
    }
}

impl From<server::Error> for Error {
    fn from(err: server::Error) -> Self {
        Error::Server(err)
    }
}

impl From<rcgen::Error> for Error {
    fn from(err: rcgen::Error) -> Self {
        Error::Pki(format!("Certificate generation failed: {err}"))
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
