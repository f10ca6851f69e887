//! Outbound connectivity.
//!
//! All traffic leaving the gateway uses one dialer, [`ProxyDialer`]. Two
//! client shapes sit on top of it:
//!
//! - [`EgressClient`]: HTTP/1.1 with a per-dial timeout. It carries CA
//!   fetches, CRL fetches, reputation lookups and backend forwards.
//! - [`rpc::connect_channel`]: HTTP/2 (tonic) with a cancellable dial.
//!
//! Proxy settings come from `HTTPS_PROXY` / `HTTP_PROXY` / `NO_PROXY` and
//! are re-read on every dial.

pub mod client;
pub mod dialer;
pub mod proxy;
pub mod rpc;
pub mod stream;

use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use rustls::{ClientConfig, RootCertStore};

pub use client::{EgressClient, ProxyConnector};
pub use dialer::ProxyDialer;
pub use proxy::{ProxyContext, ProxyEnv, ProxySource};
pub use rpc::{CancellableConnector, connect_channel};
pub use stream::{EgressStream, Route};

use crate::mtls::crypto_provider;
use crate::{Error, Result};

/// TLS client configuration for outbound destinations and `https://`
/// proxies: the bundled web PKI roots plus `extra_roots`, no client
/// certificate.
///
/// ALPN is left empty; the client wrappers add what they speak.
///
/// # Errors
///
/// Returns `Error::CertificateLoad` if an extra root is not a valid trust
/// anchor.
pub fn client_tls_config(extra_roots: &[CertificateDer<'static>]) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    for cert in extra_roots {
        roots
            .add(cert.clone())
            .map_err(|e| Error::CertificateLoad(format!("invalid trust anchor: {e}")))?;
    }

    let config = ClientConfig::builder_with_provider(Arc::new(crypto_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Configuration(format!("TLS protocol versions: {e}")))?
        .with_root_certificates(roots)
        .with_no_client_auth();
    Ok(config)
}
