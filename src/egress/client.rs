//! HTTP egress client.
//!
//! Every outbound HTTP call (CA fetch, CRL fetch, reputation lookup,
//! backend forward) goes through [`EgressClient`]: a hyper client whose only
//! connector is the [`ProxyDialer`], with `hyper-rustls` layered on top for
//! `https://` destinations.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderValue, PROXY_AUTHORIZATION};
use http::{Method, Request, Response, Uri};
use http_body_util::{BodyExt, Full, Limited};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rustls::ClientConfig;
use tower::Service;
use tracing::{debug, warn};

use super::dialer::ProxyDialer;
use super::stream::EgressStream;
use crate::error::{display_chain, find_in_chain};
use crate::{Error, Result};

/// Default cap on a buffered response body.
pub const DEFAULT_MAX_RESPONSE: usize = 16 * 1024 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Connector
// ─────────────────────────────────────────────────────────────────────────────

/// `tower::Service<Uri>` adapter over [`ProxyDialer::dial`].
#[derive(Debug, Clone)]
pub struct ProxyConnector {
    dialer: Arc<ProxyDialer>,
    timeout: Option<Duration>,
}

impl ProxyConnector {
    /// Wrap `dialer`, bounding each dial by `timeout`.
    pub fn new(dialer: Arc<ProxyDialer>, timeout: Option<Duration>) -> Self {
        Self { dialer, timeout }
    }
}

impl Service<Uri> for ProxyConnector {
    type Response = EgressStream;
    type Error = Error;
    type Future = Pin<Box<dyn Future<Output = Result<EgressStream>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, dst: Uri) -> Self::Future {
        let dialer = Arc::clone(&self.dialer);
        let timeout = self.timeout;
        Box::pin(async move { dialer.dial(&dst, timeout).await })
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────────────────────────

/// Proxy-aware HTTP/1.1 client with buffered responses.
#[derive(Clone)]
pub struct EgressClient {
    dialer: Arc<ProxyDialer>,
    inner: Client<HttpsConnector<ProxyConnector>, Full<Bytes>>,
}

impl std::fmt::Debug for EgressClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EgressClient")
            .field("dialer", &self.dialer)
            .finish_non_exhaustive()
    }
}

impl EgressClient {
    /// Build a client dialing through `dialer`, using `tls` for `https://`
    /// destinations and bounding every dial by `dial_timeout`.
    pub fn new(dialer: Arc<ProxyDialer>, tls: ClientConfig, dial_timeout: Option<Duration>) -> Self {
        let connector = HttpsConnectorBuilder::new()
            .with_tls_config(tls)
            .https_or_http()
            .enable_http1()
            .wrap_connector(ProxyConnector::new(Arc::clone(&dialer), dial_timeout));

        let inner = Client::builder(TokioExecutor::new())
            .pool_idle_timeout(Duration::from_secs(30))
            .build(connector);

        Self { dialer, inner }
    }

    /// The dialer behind this client.
    pub fn dialer(&self) -> &Arc<ProxyDialer> {
        &self.dialer
    }

    /// `GET url`, buffering at most `max_body` bytes of response.
    ///
    /// # Errors
    ///
    /// See [`EgressClient::execute`].
    pub async fn get(&self, url: &str, timeout: Duration, max_body: usize) -> Result<Response<Bytes>> {
        let uri: Uri = url
            .parse()
            .map_err(|e| Error::Configuration(format!("invalid URL '{url}': {e}")))?;
        let request = Request::builder()
            .method(Method::GET)
            .uri(uri)
            .body(Full::new(Bytes::new()))
            .map_err(|e| Error::Configuration(format!("invalid request for '{url}': {e}")))?;
        self.execute(request, timeout, Some(max_body)).await
    }

    /// Send `request` and buffer the whole response within `timeout`.
    ///
    /// For plain-HTTP destinations behind an authenticated proxy the
    /// `Proxy-Authorization` header is added here, since no CONNECT carries
    /// it.
    ///
    /// # Errors
    ///
    /// - `Error::ProxyTunnel` when the proxy refuses the tunnel
    /// - `Error::Network` for connect failures, timeouts and oversized bodies
    pub async fn execute(
        &self,
        mut request: Request<Full<Bytes>>,
        timeout: Duration,
        max_body: Option<usize>,
    ) -> Result<Response<Bytes>> {
        let ctx = self.dialer.context_for(request.uri())?;
        if ctx.forwards_plain() {
            if let Some(auth) = ctx.proxy_auth.as_deref() {
                let value = HeaderValue::from_str(auth)
                    .map_err(|e| Error::Configuration(format!("invalid proxy credentials: {e}")))?;
                request.headers_mut().insert(PROXY_AUTHORIZATION, value);
            }
        }

        let uri = request.uri().clone();
        let method = request.method().clone();
        let exchange = async {
            let response = self.inner.request(request).await.map_err(|e| classify(&e))?;
            let (parts, body) = response.into_parts();
            let body = match max_body {
                Some(limit) => Limited::new(body, limit)
                    .collect()
                    .await
                    .map_err(|e| Error::Network(format!("reading response from {uri}: {e}")))?
                    .to_bytes(),
                None => body
                    .collect()
                    .await
                    .map_err(|e| Error::Network(format!("reading response from {uri}: {e}")))?
                    .to_bytes(),
            };
            Ok::<_, Error>(Response::from_parts(parts, body))
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(Ok(response)) => {
                debug!(method = %method, uri = %uri, status = %response.status(), "Egress request completed");
                Ok(response)
            }
            Ok(Err(e)) => {
                warn!(method = %method, uri = %uri, error = %e, "Egress request failed");
                Err(e)
            }
            Err(_) => Err(Error::Network(format!(
                "{method} {uri} timed out after {timeout:?}"
            ))),
        }
    }
}

/// Map a hyper client error onto the crate taxonomy, keeping proxy tunnel
/// failures recognisable.
fn classify(err: &hyper_util::client::legacy::Error) -> Error {
    match find_in_chain(err) {
        Some(Error::ProxyTunnel(msg)) => Error::ProxyTunnel(msg.clone()),
        Some(Error::Configuration(msg)) => Error::Configuration(msg.clone()),
        _ => Error::Network(display_chain(err)),
    }
}
