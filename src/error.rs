//! Error types for certgate

use std::error::Error as StdError;
use std::io;

use thiserror::Error;

/// Result type alias for certgate
pub type Result<T> = std::result::Result<T, Error>;

/// certgate errors
///
/// Every per-connection variant is fail-closed: the caller rejects the
/// handshake or answers the request with an error, never with trust.
#[derive(Error, Debug)]
pub enum Error {
    /// Missing or ambiguous setting (fatal at startup, or per-certificate
    /// when a leaf carries an unusable CRL distribution point list)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Unreadable or malformed PEM/DER material
    #[error("Certificate load error: {0}")]
    CertificateLoad(String),

    /// Connect, fetch or timeout failure against an outbound endpoint
    #[error("Network error: {0}")]
    Network(String),

    /// Signature mismatch, stale revocation data, unknown reputation status
    #[error("Validation error: {0}")]
    Validation(String),

    /// Serial listed as revoked by the active revocation strategy
    #[error("certificate {serial} was revoked: {reason}")]
    Revoked {
        /// Decimal serial number of the revoked leaf
        serial: String,
        /// Revocation reason as reported by the source
        reason: String,
    },

    /// CONNECT refused or proxy TLS handshake failure
    #[error("Proxy tunnel error: {0}")]
    ProxyTunnel(String),

    /// Backend unreachable or timed out
    #[error("Forward error: {0}")]
    Forward(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether this error reports an actual revocation rather than a failed check
    #[must_use]
    pub fn is_revoked(&self) -> bool {
        matches!(self, Self::Revoked { .. })
    }

    /// Short classification used as a structured log field
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Configuration(_) => "configuration",
            Self::CertificateLoad(_) => "certificate_load",
            Self::Network(_) | Self::Io(_) => "network",
            Self::Validation(_) => "validation",
            Self::Revoked { .. } => "revoked",
            Self::ProxyTunnel(_) => "proxy_tunnel",
            Self::Forward(_) => "forward",
        }
    }
}

/// Render an error together with its `source()` chain.
///
/// hyper and rustls keep the useful part of a failure in the source chain
/// (`client error (Connect)` on its own says very little).
pub fn display_chain(err: &(dyn StdError + 'static)) -> String {
    let mut out = err.to_string();
    let mut current = err.source();
    while let Some(cause) = current {
        let text = cause.to_string();
        if !out.contains(&text) {
            out.push_str(": ");
            out.push_str(&text);
        }
        current = cause.source();
    }
    out
}

/// Find a certgate [`Error`] anywhere in a boxed error's source chain.
pub(crate) fn find_in_chain<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a Error> {
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(cause) = current {
        if let Some(found) = cause.downcast_ref::<Error>() {
            return Some(found);
        }
        current = cause.source();
    }
    None
}
