//! Proxy-aware dialer shared by the HTTP and RPC egress clients.
//!
//! ```text
//! dial(uri) / dial_with_cancel(uri)
//!   → ProxyContext::resolve (per call, from the environment)
//!   → TCP to destination ............................ no proxy
//!   → TCP to proxy [→ TLS to proxy] [→ CONNECT] ...... proxy
//! ```
//!
//! Both entry points run the same `establish` routine; they differ only in
//! the guard wrapped around it (a timeout or a cancellation token).

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use http::Uri;
use rustls::ClientConfig;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::proxy::{ProxyContext, ProxySource, default_port, target_host_port};
use super::stream::{EgressStream, Route, Transport};
use crate::{Error, Result};

/// Largest CONNECT response head accepted from a proxy.
pub const MAX_CONNECT_RESPONSE: usize = 8192;

/// Builds connections to outbound destinations, tunnelling through the
/// environment-configured forward proxy when enabled.
#[derive(Clone)]
pub struct ProxyDialer {
    proxy_enabled: bool,
    source: ProxySource,
    proxy_tls: TlsConnector,
}

impl fmt::Debug for ProxyDialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyDialer")
            .field("proxy_enabled", &self.proxy_enabled)
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

/// How a dial is bounded.
enum Guard<'a> {
    Timeout(Option<Duration>),
    Cancel(&'a CancellationToken),
}

impl Guard<'_> {
    async fn run<T>(&self, target: &Uri, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match self {
            Self::Timeout(None) => fut.await,
            Self::Timeout(Some(limit)) => tokio::time::timeout(*limit, fut)
                .await
                .map_err(|_| Error::Network(format!("dial {target} timed out after {limit:?}")))?,
            Self::Cancel(token) => tokio::select! {
                biased;
                () = token.cancelled() => Err(Error::Network(format!("dial {target} cancelled"))),
                res = fut => res,
            },
        }
    }
}

impl ProxyDialer {
    /// Create a dialer. TLS to an `https://` proxy is verified against the
    /// bundled web PKI roots.
    ///
    /// # Errors
    ///
    /// Returns an error if the default TLS client config cannot be built.
    pub fn new(proxy_enabled: bool) -> Result<Self> {
        let tls = super::client_tls_config(&[])?;
        Ok(Self {
            proxy_enabled,
            source: ProxySource::Environment,
            proxy_tls: TlsConnector::from(Arc::new(tls)),
        })
    }

    /// Read proxy settings from `source` instead of the process environment.
    #[must_use]
    pub fn with_proxy_source(mut self, source: ProxySource) -> Self {
        self.source = source;
        self
    }

    /// Use `config` for the TLS session to an `https://` proxy.
    #[must_use]
    pub fn with_proxy_tls(mut self, config: Arc<ClientConfig>) -> Self {
        self.proxy_tls = TlsConnector::from(config);
        self
    }

    /// Whether outbound calls consult the proxy settings at all.
    pub fn proxy_enabled(&self) -> bool {
        self.proxy_enabled
    }

    /// Resolve the proxy decision for `target`.
    ///
    /// With proxying disabled, or no proxy variables set, this is always a
    /// direct context.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` for a malformed target or proxy URL.
    pub fn context_for(&self, target: &Uri) -> Result<ProxyContext> {
        let scheme = target.scheme_str().unwrap_or("http");
        if !self.proxy_enabled {
            return Ok(ProxyContext::direct(scheme));
        }
        let env = self.source.current();
        if env.is_empty() {
            return Ok(ProxyContext::direct(scheme));
        }
        ProxyContext::resolve(target, &env)
    }

    /// Dial `target`, bounding the whole connection setup by `timeout`.
    ///
    /// Used by the HTTP egress client. For plain `http` destinations behind a
    /// proxy the returned stream is [`Route::Forwarded`] and the caller must
    /// send absolute-form requests carrying `Proxy-Authorization`.
    ///
    /// # Errors
    ///
    /// `Error::Network` for connect failures and timeouts,
    /// `Error::ProxyTunnel` for proxy TLS or CONNECT failures.
    pub async fn dial(&self, target: &Uri, timeout: Option<Duration>) -> Result<EgressStream> {
        let ctx = self.context_for(target)?;
        Guard::Timeout(timeout)
            .run(target, self.establish(target, &ctx))
            .await
    }

    /// Dial `target`, abandoning the attempt as soon as `cancel` fires.
    ///
    /// Used by the RPC egress channel. Proxied connections always tunnel,
    /// since an RPC stream cannot be relayed in absolute-form.
    ///
    /// # Errors
    ///
    /// Same as [`ProxyDialer::dial`], plus `Error::Network` on cancellation.
    pub async fn dial_with_cancel(
        &self,
        target: &Uri,
        cancel: &CancellationToken,
    ) -> Result<EgressStream> {
        let ctx = self.context_for(target)?.with_tunnel();
        Guard::Cancel(cancel)
            .run(target, self.establish(target, &ctx))
            .await
    }

    async fn establish(&self, target: &Uri, ctx: &ProxyContext) -> Result<EgressStream> {
        let (host, port) = target_host_port(target)?;

        let Some(proxy) = ctx.proxy_url.as_ref() else {
            let tcp = connect_tcp(&host, port).await?;
            return Ok(EgressStream::new(Transport::Plain(tcp), Route::Direct));
        };

        let proxy_host = proxy
            .host_str()
            .ok_or_else(|| Error::Configuration(format!("proxy URL '{proxy}' has no host")))?
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_owned();
        let proxy_port = proxy
            .port()
            .unwrap_or_else(|| default_port(proxy.scheme()));

        debug!(
            destination = %target,
            proxy = %format_authority(&proxy_host, proxy_port),
            tunnel = ctx.tunnels(),
            "Dialing through proxy"
        );

        let tcp = connect_tcp(&proxy_host, proxy_port).await?;
        let mut transport = if proxy.scheme() == "https" {
            let name = ServerName::try_from(proxy_host.clone()).map_err(|e| {
                Error::Configuration(format!("invalid proxy server name '{proxy_host}': {e}"))
            })?;
            let tls = self.proxy_tls.connect(name, tcp).await.map_err(|e| {
                Error::ProxyTunnel(format!("TLS handshake with proxy {proxy_host} failed: {e}"))
            })?;
            Transport::Tls(Box::new(tls))
        } else {
            Transport::Plain(tcp)
        };

        if ctx.tunnels() {
            establish_tunnel(&mut transport, &host, port, ctx.proxy_auth.as_deref()).await?;
            Ok(EgressStream::new(transport, Route::Tunneled))
        } else {
            Ok(EgressStream::new(transport, Route::Forwarded))
        }
    }
}

async fn connect_tcp(host: &str, port: u16) -> Result<TcpStream> {
    let stream = TcpStream::connect((host, port))
        .await
        .map_err(|e| Error::Network(format!("connect {}: {e}", format_authority(host, port))))?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// `host:port`, bracketing IPv6 literals.
pub(crate) fn format_authority(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{host}]:{port}")
    } else {
        format!("{host}:{port}")
    }
}

/// Write a `CONNECT` request and wait for a `200` from the proxy.
pub(crate) async fn establish_tunnel<S>(
    stream: &mut S,
    host: &str,
    port: u16,
    proxy_auth: Option<&str>,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let authority = format_authority(host, port);
    let mut request = format!("CONNECT {authority} HTTP/1.1\r\nHost: {authority}\r\n");
    if let Some(auth) = proxy_auth {
        request.push_str("Proxy-Authorization: ");
        request.push_str(auth);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| Error::ProxyTunnel(format!("writing CONNECT {authority}: {e}")))?;
    stream
        .flush()
        .await
        .map_err(|e| Error::ProxyTunnel(format!("writing CONNECT {authority}: {e}")))?;

    let (head, trailing) = read_response_head(stream).await?;
    let status = parse_status(&head)?;
    if status != 200 {
        return Err(Error::ProxyTunnel(format!(
            "proxy refused CONNECT {authority}: status {status}"
        )));
    }
    if trailing > 0 {
        return Err(Error::ProxyTunnel(format!(
            "proxy sent {trailing} unexpected bytes after CONNECT {authority} response"
        )));
    }

    debug!(destination = %authority, "CONNECT tunnel established");
    Ok(())
}

/// Read until the blank line ending the response head. Returns the head and
/// the number of bytes received past it.
async fn read_response_head<S>(stream: &mut S) -> Result<(Vec<u8>, usize)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0u8; 512];
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|e| Error::ProxyTunnel(format!("reading CONNECT response: {e}")))?;
        if n == 0 {
            return Err(Error::ProxyTunnel(
                "proxy closed the connection before answering CONNECT".to_string(),
            ));
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            let head_len = end + 4;
            let trailing = buf.len() - head_len;
            buf.truncate(head_len);
            return Ok((buf, trailing));
        }
        if buf.len() > MAX_CONNECT_RESPONSE {
            return Err(Error::ProxyTunnel(format!(
                "CONNECT response head exceeds {MAX_CONNECT_RESPONSE} bytes"
            )));
        }
    }
}

fn parse_status(head: &[u8]) -> Result<u16> {
    let mut headers = [httparse::EMPTY_HEADER; 64];
    let mut response = httparse::Response::new(&mut headers);
    match response.parse(head) {
        Ok(httparse::Status::Complete(_)) => response
            .code
            .ok_or_else(|| Error::ProxyTunnel("CONNECT response without status".to_string())),
        Ok(httparse::Status::Partial) => Err(Error::ProxyTunnel(
            "incomplete CONNECT response".to_string(),
        )),
        Err(e) => Err(Error::ProxyTunnel(format!("malformed CONNECT response: {e}"))),
    }
}
