//! Mutual TLS: client certificate verification on the listener and
//! certificate-authenticated outbound clients.
//!
//! # Architecture
//!
//! ```text
//! TCP connection
//!   → TLS handshake  (webpki verifies the chain against the configured CA)
//!   → PolicyClientVerifier runs the revocation policy on the chain top
//!   → PeerIdentity extracted from the accepted leaf
//!   → Injected into request extensions
//!   → forward handler sets X-ClientID from the leaf's Common Name
//! ```
//!
//! # Modules
//!
//! - [`config`]: `tls:` configuration block (`TlsConfig`, `CaSource`)
//! - [`identity`]: X.509 field extraction (`ClientCertificate`, `PeerIdentity`)
//! - [`verifier`]: rustls `ClientCertVerifier` wired to the revocation policy
//! - [`cert_manager`]: rustls server config building and certificate generation
//! - [`client`]: mTLS client configuration and identity helpers
//!
//! # Quick start
//!
//! ```yaml
//! tls:
//!   server_cert: "/etc/certgate/tls/server.crt"
//!   server_key:  "/etc/certgate/tls/server.key"
//!   ca_cert:     "/etc/certgate/tls/ca.crt"
//! revocation:
//!   strategy: crl
//!   crl_refresh_interval: 10s
//! ```

pub mod cert_manager;
pub mod client;
pub mod config;
pub mod identity;
pub mod verifier;

pub use cert_manager::{
    CaParams, CertGenerator, CrlParams, GeneratedCert, LeafCertParams, RevokedEntry,
    build_server_config, load_ca_pool, load_certs, load_private_key, parse_pem_certs,
};
pub use client::{MtlsClient, build_client_config, client_common_name};
pub use config::{CaSource, TlsConfig};
pub use identity::{ClientCertificate, IssuerCertificate, PeerIdentity};
pub use verifier::PolicyClientVerifier;

/// The rustls crypto provider used for every TLS context in the process.
pub fn crypto_provider() -> rustls::crypto::CryptoProvider {
    rustls::crypto::aws_lc_rs::default_provider()
}
