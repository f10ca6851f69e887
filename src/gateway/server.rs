//! Gateway server

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use hyper::Request;
use hyper::body::Incoming;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::service::TowerToHyperService;
use tokio::net::{TcpListener, TcpStream};
use tokio::runtime::Handle;
use tokio::signal;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower::ServiceExt;
use tracing::{debug, error, info, warn};

use super::conn_limit::ConnLimiter;
use super::forward::{ForwardState, ForwardTarget};
use super::router::create_router;
use crate::config::Config;
use crate::egress::{EgressClient, ProxyDialer, client_tls_config};
use crate::mtls::{PeerIdentity, build_server_config, load_ca_pool};
use crate::revocation::{CertValidationPolicy, RevocationStrategy};
use crate::{Error, Result};

/// mTLS gateway server
pub struct Gateway {
    /// Configuration
    config: Config,
    /// TLS acceptor running the client certificate policy
    acceptor: TlsAcceptor,
    /// Router for authenticated requests
    router: Router,
    /// Per-IP connection cap
    limiter: Arc<ConnLimiter>,
    /// Revocation policy shared with the TLS verifier
    policy: Arc<CertValidationPolicy>,
}

impl Gateway {
    /// Create a new gateway: load the CA pool, build the revocation policy
    /// and TLS config, and wire up forwarding.
    ///
    /// # Errors
    ///
    /// Any configuration, certificate or CA fetch failure. These are fatal.
    pub async fn new(config: Config) -> Result<Self> {
        let dialer = ProxyDialer::new(config.egress.proxy_enabled)?;
        Self::with_dialer(config, Arc::new(dialer)).await
    }

    /// Like [`Gateway::new`], with every outbound call going through
    /// `dialer`.
    ///
    /// # Errors
    ///
    /// As [`Gateway::new`].
    pub async fn with_dialer(config: Config, dialer: Arc<ProxyDialer>) -> Result<Self> {
        config.validate()?;

        let egress = EgressClient::new(
            dialer,
            client_tls_config(&[])?,
            Some(config.egress.dial_timeout),
        );

        let ca_certs = load_ca_pool(&config.tls, &egress).await?;

        let runtime = Handle::try_current()
            .map_err(|e| Error::Configuration(format!("gateway requires a tokio runtime: {e}")))?;
        let strategy = RevocationStrategy::from_config(&config.revocation, egress.clone())?;
        let policy = Arc::new(CertValidationPolicy::new(strategy, runtime));

        let tls = build_server_config(&config.tls, &ca_certs, Arc::clone(&policy))?;
        let acceptor = TlsAcceptor::from(Arc::new(tls));

        let target = ForwardTarget::from_config(&config.forward)?;
        let state = Arc::new(ForwardState::new(target, egress));
        let router = create_router(state, &config.forward.health_path, config.server.max_body_size);

        let limiter = ConnLimiter::new(config.server.max_conns_per_ip);

        Ok(Self {
            config,
            acceptor,
            router,
            limiter,
            policy,
        })
    }

    /// Run the gateway on the configured address until SIGINT/SIGTERM.
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address is invalid or cannot be bound.
    pub async fn run(self) -> Result<()> {
        let addr: SocketAddr = self.config.server.listen_addr.parse().map_err(|e| {
            Error::Configuration(format!(
                "Invalid listen address '{}': {e}",
                self.config.server.listen_addr
            ))
        })?;
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown_signal()).await
    }

    /// Serve connections from `listener` until `shutdown` completes, then
    /// give open connections up to `server.shutdown_timeout` to finish.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener's local address cannot be read.
    pub async fn serve(self, listener: TcpListener, shutdown: impl Future<Output = ()> + Send) -> Result<()> {
        let local_addr = listener.local_addr()?;
        self.log_banner(local_addr);

        let connections = TaskTracker::new();
        let stop = CancellationToken::new();
        let handshake_timeout = self.config.server.handshake_timeout;
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "Failed to accept connection");
                            continue;
                        }
                    };

                    let Some(guard) = self.limiter.try_acquire(peer.ip()) else {
                        warn!(
                            peer = %peer,
                            max_conns_per_ip = self.config.server.max_conns_per_ip,
                            "Rejected connection: per-IP limit reached"
                        );
                        continue;
                    };

                    let acceptor = self.acceptor.clone();
                    let router = self.router.clone();
                    let stop = stop.clone();
                    connections.spawn(async move {
                        serve_connection(stream, peer, acceptor, router, handshake_timeout, stop).await;
                        drop(guard);
                    });
                }
                () = &mut shutdown => {
                    info!("Shutdown signal received, stopping new connections");
                    break;
                }
            }
        }

        drop(listener);
        stop.cancel();
        connections.close();

        let shutdown_timeout = self.config.server.shutdown_timeout;
        if tokio::time::timeout(shutdown_timeout, connections.wait()).await.is_err() {
            warn!(
                remaining = connections.len(),
                timeout = ?shutdown_timeout,
                "Shutdown timeout elapsed with connections still open"
            );
        } else {
            info!("All connections closed");
        }

        Ok(())
    }

    /// The revocation policy installed in the TLS verifier
    pub fn policy(&self) -> &Arc<CertValidationPolicy> {
        &self.policy
    }

    fn log_banner(&self, local_addr: SocketAddr) {
        info!("============================================================");
        info!("CERTGATE v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(listen = %local_addr, "Listening (mTLS required)");
        info!(strategy = %self.policy.strategy().kind(), "Revocation checking");
        info!(proxy_enabled = self.config.egress.proxy_enabled, "Egress");
        info!(
            backend = %self.config.forward.base_url,
            health_path = %self.config.forward.health_path,
            "Forwarding"
        );
        if self.config.server.max_conns_per_ip > 0 {
            info!(max_conns_per_ip = self.config.server.max_conns_per_ip, "Per-IP connection cap");
        }
        info!("============================================================");
    }
}

/// Complete the TLS handshake and serve HTTP on one connection.
async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    router: Router,
    handshake_timeout: Duration,
    stop: CancellationToken,
) {
    let tls = match tokio::time::timeout(handshake_timeout, acceptor.accept(stream)).await {
        Ok(Ok(tls)) => tls,
        Ok(Err(e)) => {
            warn!(peer = %peer, error = %e, "TLS handshake failed");
            return;
        }
        Err(_) => {
            warn!(peer = %peer, timeout = ?handshake_timeout, "TLS handshake timed out");
            return;
        }
    };

    let identity = tls
        .get_ref()
        .1
        .peer_certificates()
        .and_then(PeerIdentity::from_peer_certificates);
    let Some(identity) = identity else {
        error!(peer = %peer, "Handshake completed without a usable client certificate");
        return;
    };
    debug!(peer = %peer, cn = identity.common_name(), "Client authenticated");

    let service = router.map_request(move |mut request: Request<Incoming>| {
        request.extensions_mut().insert(identity.clone());
        request
    });

    let builder = auto::Builder::new(TokioExecutor::new());
    let conn = builder.serve_connection_with_upgrades(TokioIo::new(tls), TowerToHyperService::new(service));
    tokio::pin!(conn);

    tokio::select! {
        result = &mut conn => {
            if let Err(e) = result {
                debug!(peer = %peer, error = %e, "Connection closed with error");
            }
        }
        () = stop.cancelled() => {
            conn.as_mut().graceful_shutdown();
            if let Err(e) = conn.await {
                debug!(peer = %peer, error = %e, "Connection closed with error during shutdown");
            }
        }
    }
}

/// Resolves on SIGINT or SIGTERM.
///
/// If a handler cannot be installed, that signal is ignored and a warning is
/// logged; the other signal still works.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received");
}
