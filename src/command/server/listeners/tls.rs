use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use hyper_util::rt::TokioIo;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};

use crate::command::server::error::Error;
use crate::command::server::listeners::{accept, build_listener};
use crate::command::server::{serve_request, ServerContext};
use crate::configuration::{self, ServerConfig, ServerTlsConfig};
use crate::tls::build_server_config;
use crate::watcher::ChangeNotifier;

pub struct TlsListener {
    binding_address: SocketAddr,
    tls_config: ServerTlsConfig,
    tls_acceptor: ArcSwap<TlsAcceptor>,
    context: Arc<ServerContext>,
    timeouts: Arc<[Duration; 2]>,
}

impl TlsListener {
    pub fn new(config: &ServerConfig, context: ServerContext) -> Result<Self, configuration::Error> {
        let binding_address = SocketAddr::new(config.bind_address, config.port);
        let tls_acceptor = ArcSwap::from_pointee(Self::build_tls_acceptor(&config.tls)?);

        // Connections are asked to close once a request had the time to be
        // read and answered, then dropped after the grace period.
        let timeouts = [
            Duration::from_secs(config.read_timeout + config.write_timeout),
            Duration::from_secs(config.shutdown_grace_period),
        ];

        Ok(Self {
            binding_address,
            tls_config: config.tls.clone(),
            tls_acceptor,
            context: Arc::new(context),
            timeouts: Arc::new(timeouts),
        })
    }

    pub fn context(&self) -> &Arc<ServerContext> {
        &self.context
    }

    /// Files whose rotation must rebuild the acceptor.
    pub fn tls_files(&self) -> [&str; 3] {
        [
            &self.tls_config.server_certificate_bundle,
            &self.tls_config.server_private_key,
            &self.tls_config.client_ca_bundle,
        ]
    }

    pub fn notify_tls_config_change(&self, config: &ServerTlsConfig) -> Result<(), configuration::Error> {
        let acceptor = Arc::new(Self::build_tls_acceptor(config)?);
        self.tls_acceptor.store(acceptor);
        info!("TLS certificates reloaded");

        Ok(())
    }

    fn build_tls_acceptor(tls_config: &ServerTlsConfig) -> Result<TlsAcceptor, configuration::Error> {
        let server_config = build_server_config(tls_config)?;
        Ok(TlsAcceptor::from(Arc::new(server_config)))
    }

    pub async fn serve(&self) -> Result<(), Error> {
        let listener = build_listener(self.binding_address).await?;
        info!("Listening on {} (mTLS)", self.binding_address);

        loop {
            let (tcp, remote_address) = accept(&listener).await;

            let tls_acceptor = Arc::clone(&self.tls_acceptor.load());
            let context = Arc::clone(&self.context);
            let timeouts = Arc::clone(&self.timeouts);

            tokio::spawn(async move {
                let tls = match tls_acceptor.accept(tcp).await {
                    Ok(tls) => tls,
                    Err(error) => {
                        warn!("TLS handshake with {remote_address} failed: {error}");
                        return;
                    }
                };

                let (_, session) = tls.get_ref();
                let peer_certificate = session
                    .peer_certificates()
                    .and_then(|certs| certs.first())
                    .map(|cert| cert.to_vec());

                debug!("Accepted TLS connection from {remote_address}");
                let stream = TokioIo::new(tls);
                serve_request(stream, context, peer_certificate, timeouts, remote_address).await;
            });
        }
    }
}

impl ChangeNotifier for TlsListener {
    fn notify_change(&self) {
        if let Err(error) = self.notify_tls_config_change(&self.tls_config) {
            error!("Failed to reload TLS certificates, keeping previous ones: {error}");
        }
    }
}

#[cfg(test)]
mod tests {

    use super::*;
    use crate::tls::tests::write_server_pki;

    fn server_config(tls: ServerTlsConfig) -> ServerConfig {
        ServerConfig {
            bind_address: "127.0.0.1".parse().unwrap(),
            port: 0,
            read_timeout: 5,
            write_timeout: 10,
            shutdown_grace_period: 5,
            tls,
        }
    }

    fn empty_context() -> ServerContext {
        ServerContext::from_authenticators(Vec::new(), Duration::from_secs(5))
    }

    #[test]
    fn test_new_computes_connection_timeouts() {
        let dir = tempfile::tempdir().unwrap();
        let tls = write_server_pki(dir.path());

        let listener = TlsListener::new(&server_config(tls), empty_context()).unwrap();

        assert_eq!(
            *listener.timeouts,
            [Duration::from_secs(15), Duration::from_secs(5)]
        );
    }

    #[test]
    fn test_reload_keeps_previous_acceptor_on_error() {
        let dir = tempfile::tempdir().unwrap();
        let tls = write_server_pki(dir.path());
        let listener = TlsListener::new(&server_config(tls.clone()), empty_context()).unwrap();
        let before = listener.tls_acceptor.load_full();

        let broken = ServerTlsConfig {
            server_private_key: "/nonexistent/server.key".to_string(),
            ..tls.clone()
        };
        assert!(listener.notify_tls_config_change(&broken).is_err());
        assert!(Arc::ptr_eq(&listener.tls_acceptor.load_full(), &before));

        listener.notify_tls_config_change(&tls).unwrap();
        assert!(!Arc::ptr_eq(&listener.tls_acceptor.load_full(), &before));
    }
}
