//! certgate Library
//!
//! An mTLS authenticating gateway: terminates TLS, requires a client
//! certificate issued by the configured CA, checks it for revocation, and
//! forwards the request to a backend with the certificate's Common Name in
//! `X-ClientID`.
//!
//! # Features
//!
//! - **Revocation strategies**: CRL distribution points (cached, signature
//!   and freshness checked) or an online reputation service
//! - **Fail-closed**: any revocation or lookup failure rejects the handshake
//! - **Proxy-aware egress**: CRL, CA bundle, reputation and backend traffic
//!   honour `HTTPS_PROXY` / `HTTP_PROXY` / `NO_PROXY`, with TLS to the proxy
//! - **Identity forwarding**: `X-ClientID` is always set by the gateway,
//!   never by the client
//! - **Operational**: per-IP connection caps, graceful shutdown, structured logs
//!
//! # Modules
//!
//! - [`mtls`]: certificate loading, client verification, CA tooling, mTLS client
//! - [`revocation`]: CRL cache, reputation lookups, validation policy
//! - [`egress`]: proxy resolution, CONNECT tunnelling, outbound HTTP and RPC
//! - [`gateway`]: listener, router, forwarding

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod egress;
pub mod error;
pub mod gateway;
pub mod mtls;
pub mod revocation;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
///
/// `RUST_LOG` wins over `level` when set.
///
/// # Errors
///
/// Returns `Error::Configuration` if a global subscriber is already installed.
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };

    installed.map_err(|e| Error::Configuration(format!("cannot install tracing subscriber: {e}")))
}
