//! RPC-style egress: a tonic channel over the cancellable dial.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use http::Uri;
use hyper_rustls::HttpsConnectorBuilder;
use rustls::ClientConfig;
use tokio_util::sync::CancellationToken;
use tonic::transport::{Channel, Endpoint};
use tower::Service;
use tracing::debug;

use super::dialer::ProxyDialer;
use super::stream::EgressStream;
use crate::error::{display_chain, find_in_chain};
use crate::{Error, Result};

/// `tower::Service<Uri>` adapter over [`ProxyDialer::dial_with_cancel`].
///
/// Every dial made through one connector observes the same token, so
/// cancelling it aborts both the first connect and later reconnects.
#[derive(Debug, Clone)]
pub struct CancellableConnector {
    dialer: Arc<ProxyDialer>,
    cancel: CancellationToken,
}

impl CancellableConnector {
    /// Wrap `dialer`, aborting dials once `cancel` fires.
    pub fn new(dialer: Arc<ProxyDialer>, cancel: CancellationToken) -> Self {
        Self { dialer, cancel }
    }
}

impl Service<Uri> for CancellableConnector {
    type Response = EgressStream;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<EgressStream>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let dialer = Arc::clone(&self.dialer);
        let cancel = self.cancel.clone();
        Box::pin(async move { dialer.dial_with_cancel(&dst, &cancel).await })
    }
}

/// Open an HTTP/2 channel to `endpoint` (`http://` or `https://`).
///
/// `tls` is used for `https://` endpoints; `h2` is negotiated via ALPN.
///
/// # Errors
///
/// - `Error::Configuration` for an unparsable endpoint
/// - `Error::ProxyTunnel` when the proxy refuses the tunnel
/// - `Error::Network` for any other connect failure, including cancellation
pub async fn connect_channel(
    dialer: Arc<ProxyDialer>,
    endpoint: &str,
    tls: ClientConfig,
    cancel: CancellationToken,
) -> Result<Channel> {
    let endpoint = Endpoint::from_shared(endpoint.to_owned())
        .map_err(|e| Error::Configuration(format!("invalid RPC endpoint '{endpoint}': {e}")))?;

    let connector = HttpsConnectorBuilder::new()
        .with_tls_config(tls)
        .https_or_http()
        .enable_http2()
        .wrap_connector(CancellableConnector::new(dialer, cancel));

    debug!(endpoint = %endpoint.uri(), "Opening RPC channel");
    endpoint
        .connect_with_connector(connector)
        .await
        .map_err(|e| match find_in_chain(&e) {
            Some(Error::ProxyTunnel(msg)) => Error::ProxyTunnel(msg.clone()),
            _ => Error::Network(display_chain(&e)),
        })
}
