mod eks;
pub mod error;
pub mod get;
pub mod init;
pub mod pki;
pub mod server;

pub use error::Error;
