//! Certificate-authenticated outbound client.
//!
//! [`build_client_config`] turns the `tls:` block into a rustls
//! `ClientConfig` that trusts only the configured CA pool, presents the
//! configured client certificate, and optionally verifies servers against a
//! fixed name. [`MtlsClient`] wraps an [`EgressClient`] with that config, so
//! it dials through the same proxy-aware path as every other egress call.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, Error as RustlsError, RootCertStore, SignatureScheme};
use tracing::debug;

use super::cert_manager::{load_certs, load_private_key};
use super::config::TlsConfig;
use super::crypto_provider;
use super::identity::ClientCertificate;
use crate::egress::client::DEFAULT_MAX_RESPONSE;
use crate::egress::{EgressClient, ProxyDialer};
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Server name pinning
// ─────────────────────────────────────────────────────────────────────────────

/// Verifies server certificates against a configured name instead of the
/// host being dialled.
#[derive(Debug)]
struct PinnedServerName {
    inner: Arc<WebPkiServerVerifier>,
    name: ServerName<'static>,
}

impl ServerCertVerifier for PinnedServerName {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, RustlsError> {
        self.inner
            .verify_server_cert(end_entity, intermediates, &self.name, ocsp_response, now)
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public API
// ─────────────────────────────────────────────────────────────────────────────

/// Build a client config trusting exactly `ca_certs`.
///
/// `client_cert` and `client_key` must be set together. When
/// `server_name` is set, every server certificate is checked against it.
/// ALPN is left empty for the HTTP connector to fill in.
///
/// # Errors
///
/// - `Error::Configuration` for a half-configured client identity, an
///   invalid server name, or an unusable trust pool
/// - `Error::CertificateLoad` for unreadable certificate or key files
pub fn build_client_config(config: &TlsConfig, ca_certs: &[CertificateDer<'static>]) -> Result<ClientConfig> {
    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots
            .add(cert.clone())
            .map_err(|e| Error::CertificateLoad(format!("Failed to add CA cert to trust store: {e}")))?;
    }

    let provider = Arc::new(crypto_provider());
    let verifier = server_verifier(config, roots, Arc::clone(&provider))?;

    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Configuration(format!("TLS protocol versions: {e}")))?
        .dangerous()
        .with_custom_certificate_verifier(verifier);

    let client_cert = non_empty(config.client_cert.as_deref());
    let client_key = non_empty(config.client_key.as_deref());
    match (client_cert, client_key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
            .map_err(|e| Error::CertificateLoad(format!("client cert/key mismatch: {e}"))),
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(Error::Configuration(
            "tls.client_cert and tls.client_key must be set together".to_string(),
        )),
    }
}

/// Common Name of the first certificate in the PEM file at `path`.
///
/// # Errors
///
/// Returns `Error::CertificateLoad` if the file cannot be parsed and
/// `Error::Validation` if the certificate has no Common Name.
pub fn client_common_name(path: &str) -> Result<String> {
    let certs = load_certs(path)?;
    let leaf = certs
        .first()
        .ok_or_else(|| Error::CertificateLoad(format!("No certificates found in '{path}'")))?;
    let parsed = ClientCertificate::from_der(leaf)?;
    parsed
        .common_name()
        .map(str::to_string)
        .ok_or_else(|| Error::Validation(format!("certificate in '{path}' has no Common Name")))
}

/// HTTP client presenting the configured client certificate.
#[derive(Clone)]
pub struct MtlsClient {
    inner: EgressClient,
}

impl fmt::Debug for MtlsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MtlsClient").field("inner", &self.inner).finish()
    }
}

impl MtlsClient {
    /// Build a client from the `tls:` block.
    ///
    /// # Errors
    ///
    /// As [`build_client_config`].
    pub fn new(
        config: &TlsConfig,
        ca_certs: &[CertificateDer<'static>],
        dialer: Arc<ProxyDialer>,
        dial_timeout: Option<Duration>,
    ) -> Result<Self> {
        let tls = build_client_config(config, ca_certs)?;
        Ok(Self {
            inner: EgressClient::new(dialer, tls, dial_timeout),
        })
    }

    /// The underlying egress client.
    pub fn egress(&self) -> &EgressClient {
        &self.inner
    }

    /// `GET url`, reading at most 16 MiB of body.
    ///
    /// # Errors
    ///
    /// See [`EgressClient::execute`].
    pub async fn get(&self, url: &str, timeout: Duration) -> Result<Response<Bytes>> {
        self.inner.get(url, timeout, DEFAULT_MAX_RESPONSE).await
    }

    /// Send an arbitrary request.
    ///
    /// # Errors
    ///
    /// See [`EgressClient::execute`].
    pub async fn execute(&self, request: Request<Full<Bytes>>, timeout: Duration) -> Result<Response<Bytes>> {
        self.inner
            .execute(request, timeout, Some(DEFAULT_MAX_RESPONSE))
            .await
    }
}

/// webpki server verification against `roots`, pinned to
/// `tls.server_name` when it is set.
fn server_verifier(
    config: &TlsConfig,
    roots: RootCertStore,
    provider: Arc<CryptoProvider>,
) -> Result<Arc<dyn ServerCertVerifier>> {
    let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), provider)
        .build()
        .map_err(|e| Error::Configuration(format!("Failed to build server verifier: {e}")))?;

    match non_empty(config.server_name.as_deref()) {
        Some(name) => {
            let name = ServerName::try_from(name.to_string())
                .map_err(|e| Error::Configuration(format!("invalid tls.server_name '{name}': {e}")))?;
            debug!(server_name = ?name, "Pinning server certificate name");
            Ok(Arc::new(PinnedServerName { inner: verifier, name }))
        }
        None => Ok(verifier),
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mtls::cert_manager::{CertGenerator, LeafCertParams, parse_pem_certs};
    use crate::testing::TestPki;
    use std::fs;

    fn server_cert(pki: &TestPki, dns: &str) -> CertificateDer<'static> {
        let params = LeafCertParams {
            cn: dns,
            san_dns: vec![dns.to_string()],
            san_ips: vec![],
            crl_urls: vec![],
            serial: None,
            client: false,
            validity_days: 30,
        };
        let cert = CertGenerator::issue_leaf(&params, &pki.ca.cert_pem, &pki.ca.key_pem).unwrap();
        parse_pem_certs(cert.cert_pem.as_bytes(), "server").unwrap().remove(0)
    }

    fn roots(pki: &TestPki) -> RootCertStore {
        let mut roots = RootCertStore::empty();
        roots.add_parsable_certificates(ca_pool(pki));
        roots
    }

    fn ca_pool(pki: &TestPki) -> Vec<CertificateDer<'static>> {
        parse_pem_certs(pki.ca.cert_pem.as_bytes(), "ca").unwrap()
    }

    #[test]
    fn half_configured_client_identity_is_rejected() {
        // GIVEN: a client certificate without its key
        let pki = TestPki::new("Root");
        let config = TlsConfig {
            client_cert: Some("/tmp/client.crt".to_string()),
            ..TlsConfig::default()
        };

        // WHEN: building
        let err = build_client_config(&config, &ca_pool(&pki)).unwrap_err();

        // THEN: configuration error
        assert!(matches!(err, Error::Configuration(_)), "{err}");
    }

    #[test]
    fn client_identity_is_loaded_from_files() {
        let pki = TestPki::new("Root");
        let dir = tempfile::tempdir().unwrap();
        CertGenerator::write_to_dir(&pki.leaf_pem("DV1", 1, &[]), dir.path(), "client").unwrap();

        let config = TlsConfig {
            client_cert: Some(dir.path().join("client.crt").to_string_lossy().into_owned()),
            client_key: Some(dir.path().join("client.key").to_string_lossy().into_owned()),
            ..TlsConfig::default()
        };

        let tls = build_client_config(&config, &ca_pool(&pki)).unwrap();
        assert!(tls.client_auth_cert_resolver.has_certs());
        assert!(tls.alpn_protocols.is_empty());
    }

    #[test]
    fn pinned_name_replaces_dialled_host() {
        // GIVEN: a server certificate valid only for gateway.internal
        let pki = TestPki::new("Root");
        let cert = server_cert(&pki, "gateway.internal");
        let dialled = ServerName::try_from("127.0.0.1").unwrap();

        let pinned_config = TlsConfig {
            server_name: Some("gateway.internal".to_string()),
            ..TlsConfig::default()
        };
        let plain = server_verifier(&TlsConfig::default(), roots(&pki), Arc::new(crypto_provider())).unwrap();
        let pinned = server_verifier(&pinned_config, roots(&pki), Arc::new(crypto_provider())).unwrap();

        // WHEN: verifying it for a connection to 127.0.0.1
        let plain_result = plain.verify_server_cert(&cert, &[], &dialled, &[], UnixTime::now());
        let pinned_result = pinned.verify_server_cert(&cert, &[], &dialled, &[], UnixTime::now());

        // THEN: only the pinned verifier accepts it
        assert!(plain_result.is_err());
        assert!(pinned_result.is_ok(), "{pinned_result:?}");
    }

    #[test]
    fn invalid_server_name_is_rejected() {
        let pki = TestPki::new("Root");
        let config = TlsConfig {
            server_name: Some("not a host name".to_string()),
            ..TlsConfig::default()
        };
        let err = build_client_config(&config, &ca_pool(&pki)).unwrap_err();
        assert!(err.to_string().contains("tls.server_name"));
    }

    #[test]
    fn client_common_name_reads_cn() {
        let pki = TestPki::new("Root");
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.crt");
        fs::write(&path, pki.leaf_pem("DV1", 7, &[]).cert_pem).unwrap();

        assert_eq!(client_common_name(path.to_str().unwrap()).unwrap(), "DV1");
    }
}
