//! Identity-forwarding handler
//!
//! Every authenticated request that is not the health path is rebuilt
//! against the configured backend and relayed through the egress client.
//! The outbound copy always carries `X-ClientID` set from the verified
//! client certificate; whatever the client sent under that name is dropped.

use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::extract::{Request, State};
use axum::http::header::{CONNECTION, HOST};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use http_body_util::{Full, LengthLimitError};
use tracing::{debug, warn};

use crate::config::ForwardConfig;
use crate::egress::EgressClient;
use crate::mtls::PeerIdentity;
use crate::{Error, Result};

/// Header carrying the client certificate's Common Name to the backend
pub const CLIENT_ID_HEADER: HeaderName = HeaderName::from_static("x-clientid");

/// Headers scoped to a single connection, never relayed
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Backend every request is forwarded to
#[derive(Debug, Clone)]
pub struct ForwardTarget {
    /// Base URL without a trailing slash
    base: String,
    /// `Host` value for outbound requests
    authority: HeaderValue,
    /// Per-request timeout
    timeout: Duration,
}

impl ForwardTarget {
    /// Parse `base_url`, which must be an absolute `http` or `https` URL.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` for anything else.
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let uri: Uri = base_url
            .parse()
            .map_err(|e| Error::Configuration(format!("invalid forward.base_url '{base_url}': {e}")))?;
        match uri.scheme_str() {
            Some("http" | "https") => {}
            _ => {
                return Err(Error::Configuration(format!(
                    "forward.base_url '{base_url}' must use http or https"
                )));
            }
        }
        let authority = uri.authority().ok_or_else(|| {
            Error::Configuration(format!("forward.base_url '{base_url}' has no host"))
        })?;
        let authority = HeaderValue::from_str(authority.as_str())
            .map_err(|e| Error::Configuration(format!("invalid forward.base_url host: {e}")))?;

        Ok(Self {
            base: base_url.trim_end_matches('/').to_string(),
            authority,
            timeout,
        })
    }

    /// Build from the `forward:` config block.
    ///
    /// # Errors
    ///
    /// As [`ForwardTarget::new`].
    pub fn from_config(config: &ForwardConfig) -> Result<Self> {
        Self::new(&config.base_url, config.timeout)
    }

    /// Outbound URI: base URL, inbound path, and the inbound query verbatim.
    ///
    /// # Errors
    ///
    /// Returns `Error::Forward` if the combination is not a valid URI.
    pub fn uri_for(&self, inbound: &Uri) -> Result<Uri> {
        let mut target = format!("{}{}", self.base, inbound.path());
        if let Some(query) = inbound.query() {
            target.push('?');
            target.push_str(query);
        }
        target
            .parse()
            .map_err(|e| Error::Forward(format!("cannot build backend URI '{target}': {e}")))
    }

    /// Per-request timeout
    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}

/// State shared by the forwarding handler
#[derive(Debug, Clone)]
pub struct ForwardState {
    /// Where requests go
    pub target: ForwardTarget,
    /// How they get there
    pub client: EgressClient,
}

impl ForwardState {
    /// Create forwarding state
    pub fn new(target: ForwardTarget, client: EgressClient) -> Self {
        Self { target, client }
    }
}

/// Relay `request` to the backend on behalf of the authenticated peer.
pub async fn forward_request(State(state): State<Arc<ForwardState>>, request: Request) -> Response {
    let (parts, body) = request.into_parts();

    let Some(identity) = parts.extensions.get::<PeerIdentity>().cloned() else {
        warn!(path = %parts.uri.path(), "Request without verified client identity");
        return (StatusCode::UNAUTHORIZED, "client certificate required").into_response();
    };

    let body = match read_body(body).await {
        Ok(body) => body,
        Err(response) => return response,
    };

    let outbound = match build_outbound(&state.target, parts, &identity, body) {
        Ok(outbound) => outbound,
        Err(e) => return request_failed(&e),
    };

    debug!(
        cn = identity.common_name(),
        method = %outbound.method(),
        uri = %outbound.uri(),
        "Forwarding request"
    );

    match state
        .client
        .execute(outbound, state.target.timeout(), None)
        .await
    {
        Ok(response) => {
            let (parts, body) = response.into_parts();
            (parts.status, Body::from(body)).into_response()
        }
        Err(e) => {
            let e = match e {
                Error::Network(reason) => Error::Forward(reason),
                other => other,
            };
            request_failed(&e)
        }
    }
}

/// Buffer the inbound body; the body limit layer surfaces as 413.
async fn read_body(body: Body) -> std::result::Result<bytes::Bytes, Response> {
    to_bytes(body, usize::MAX).await.map_err(|e| {
        if is_length_limit(&e) {
            (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response()
        } else {
            request_failed(&Error::Forward(format!("reading request body: {e}")))
        }
    })
}

fn is_length_limit(err: &axum::Error) -> bool {
    let mut current: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(cause) = current {
        if cause.is::<LengthLimitError>() {
            return true;
        }
        current = cause.source();
    }
    false
}

fn build_outbound(
    target: &ForwardTarget,
    parts: axum::http::request::Parts,
    identity: &PeerIdentity,
    body: bytes::Bytes,
) -> Result<axum::http::Request<Full<bytes::Bytes>>> {
    let uri = target.uri_for(&parts.uri)?;
    let client_id = HeaderValue::from_bytes(identity.common_name().as_bytes())
        .map_err(|e| Error::Forward(format!("client Common Name is not a valid header value: {e}")))?;

    let mut headers = relayable_headers(parts.headers);
    headers.insert(HOST, target.authority.clone());
    headers.insert(CLIENT_ID_HEADER, client_id);

    let mut outbound = axum::http::Request::builder()
        .method(parts.method)
        .uri(uri)
        .body(Full::new(body))
        .map_err(|e| Error::Forward(format!("cannot build backend request: {e}")))?;
    *outbound.headers_mut() = headers;
    Ok(outbound)
}

/// Drop hop-by-hop headers, including any named by `Connection`.
fn relayable_headers(mut headers: HeaderMap) -> HeaderMap {
    let named: Vec<String> = headers
        .get_all(CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in HOP_BY_HOP.iter().copied().chain(named.iter().map(String::as_str)) {
        headers.remove(name);
    }
    headers
}

fn request_failed(err: &Error) -> Response {
    warn!(kind = err.kind(), error = %err, "Forward failed");
    (StatusCode::BAD_REQUEST, format!("request failed: {err}")).into_response()
}
