use std::env;
use std::sync::Arc;
use std::time::Duration;

use argh::FromArgs;
use tracing::info;

pub mod auth;
pub mod error;
mod http_server;
mod listeners;
mod review;
mod server_context;
pub mod token_review;

use crate::command;
use crate::command::server::listeners::tls::TlsListener;
use crate::configuration::Configuration;
use crate::metrics_provider::METRICS_PROVIDER;
use crate::ntp::ClockSkewMonitor;
use crate::watcher::{ChangeNotifier, FileWatcher};
pub use error::Error;
pub use http_server::serve_request;
pub use server_context::ServerContext;

/// Set by the kubelet in every pod.
const IN_CLUSTER_ENV: &str = "KUBERNETES_SERVICE_HOST";

#[derive(FromArgs, PartialEq, Debug)]
#[argh(
    subcommand,
    name = "run",
    description = "Run the TokenReview webhook server"
)]
pub struct Options {}

pub struct Command {
    listener: Arc<TlsListener>,
    _tls_watcher: FileWatcher,
    _token_watcher: Option<FileWatcher>,
    _clock_skew_monitor: Option<ClockSkewMonitor>,
}

impl Command {
    /// Builds every component up front; must run inside the tokio runtime.
    pub fn new(config: &Configuration) -> Result<Command, command::Error> {
        let read_timeout = Duration::from_secs(config.server.read_timeout);
        let context = ServerContext::new(&config.auth, read_timeout)?;
        let listener = Arc::new(TlsListener::new(&config.server, context)?);

        let tls_watcher = FileWatcher::new(
            "TLS certificate",
            &listener.tls_files(),
            Arc::clone(&listener) as Arc<dyn ChangeNotifier>,
        )?;

        let in_cluster = env::var_os(IN_CLUSTER_ENV).is_some();
        let token_watcher = match (&config.auth.token, listener.context().static_tokens()) {
            (Some(token_config), Some(tokens)) if token_config.watch_enabled(in_cluster) => {
                Some(FileWatcher::new(
                    "token file",
                    &[tokens.path()],
                    Arc::clone(tokens) as Arc<dyn ChangeNotifier>,
                )?)
            }
            _ => None,
        };

        let clock_skew_monitor = ClockSkewMonitor::spawn(&config.ntp);

        METRICS_PROVIDER.record_version(env!("CARGO_PKG_VERSION"));
        info!("kube-guard {} initialized", env!("CARGO_PKG_VERSION"));

        Ok(Command {
            listener,
            _tls_watcher: tls_watcher,
            _token_watcher: token_watcher,
            _clock_skew_monitor: clock_skew_monitor,
        })
    }

    pub async fn run(&self) -> Result<(), command::Error> {
        self.listener.serve().await?;
        Ok(())
    }
}
