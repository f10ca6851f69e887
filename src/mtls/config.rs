//! TLS configuration types.
//!
//! # Example YAML
//!
//! ```yaml
//! tls:
//!   server_cert: "/etc/certgate/tls/server.crt"
//!   server_key:  "/etc/certgate/tls/server.key"
//!   ca_cert:     "/etc/certgate/tls/ca.crt"
//!   # or, instead of ca_cert:
//!   # ca_cert_url: "https://pki.example/ca.pem"
//!   client_cert: "/etc/certgate/tls/client.crt"
//!   client_key:  "/etc/certgate/tls/client.key"
//! ```

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::{Error, Result};

/// Where the trusted client CA pool comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaSource<'a> {
    /// Local PEM file.
    File(&'a str),
    /// PEM document fetched over HTTP(S) through the egress client.
    Url(&'a str),
}

/// Certificates, keys and trust settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsConfig {
    /// PEM server certificate chain presented by the gateway.
    pub server_cert: String,

    /// PEM private key for `server_cert`.
    pub server_key: String,

    /// PEM file with the CA certificates client certificates must chain to.
    pub ca_cert: Option<String>,

    /// URL of a PEM document with the CA certificates.
    pub ca_cert_url: Option<String>,

    /// Timeout for fetching `ca_cert_url`.
    #[serde(with = "crate::config::humantime_serde")]
    pub ca_fetch_timeout: Duration,

    /// PEM certificate this process presents when acting as a client.
    pub client_cert: Option<String>,

    /// PEM private key for `client_cert`.
    pub client_key: Option<String>,

    /// Name server certificates are verified against when acting as a
    /// client, instead of the dialled host.
    pub server_name: Option<String>,
}

impl Default for TlsConfig {
    fn default() -> Self {
        Self {
            server_cert: String::new(),
            server_key: String::new(),
            ca_cert: None,
            ca_cert_url: None,
            ca_fetch_timeout: Duration::from_secs(30),
            client_cert: None,
            client_key: None,
            server_name: None,
        }
    }
}

impl TlsConfig {
    /// The configured CA source. When both are set the file wins and the
    /// URL is ignored.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` when neither source is set.
    pub fn ca_source(&self) -> Result<CaSource<'_>> {
        let file = self.ca_cert.as_deref().filter(|s| !s.is_empty());
        let url = self.ca_cert_url.as_deref().filter(|s| !s.is_empty());
        match (file, url) {
            (Some(path), None) => Ok(CaSource::File(path)),
            (None, Some(url)) => Ok(CaSource::Url(url)),
            (None, None) => Err(Error::Configuration(
                "no CA configured: set tls.ca_cert or tls.ca_cert_url".to_string(),
            )),
            (Some(path), Some(url)) => {
                warn!(ca_cert = %path, ca_cert_url = %url, "Both CA sources set; ignoring tls.ca_cert_url");
                Ok(CaSource::File(path))
            }
        }
    }
}
