//! Certificate management: loading, rustls server config building, and the
//! development PKI behind `certgate tls`.
//!
//! Provides:
//! - [`build_server_config`]: `rustls::ServerConfig` requiring client
//!   certificates checked by the revocation policy
//! - [`load_certs`] / [`load_private_key`] / [`load_ca_pool`]: PEM loading
//! - [`CertGenerator`]: `rcgen`-backed CA, leaf and CRL generation
//!
//! # File format
//!
//! Certificate and key files are PEM. CRLs produced by
//! [`CertGenerator::issue_crl`] are DER, the format distribution points
//! serve.

use std::fs;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use http::StatusCode;
use num_bigint::BigUint;
use rcgen::{
    BasicConstraints, CertificateParams, CertificateRevocationListParams, CrlDistributionPoint,
    DistinguishedName, DnType, ExtendedKeyUsagePurpose, Ia5String, IsCa, KeyIdMethod, KeyPair,
    KeyUsagePurpose, RevocationReason, RevokedCertParams, SanType, SerialNumber,
};
use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use time::OffsetDateTime;
use tracing::{debug, info};

use super::config::{CaSource, TlsConfig};
use super::crypto_provider;
use super::verifier::PolicyClientVerifier;
use crate::egress::EgressClient;
use crate::revocation::CertValidationPolicy;
use crate::{Error, Result};

/// Largest CA bundle accepted from `ca_cert_url`.
const MAX_CA_BUNDLE: usize = 1024 * 1024;

// ─────────────────────────────────────────────────────────────────────────────
// Public: build TLS server config
// ─────────────────────────────────────────────────────────────────────────────

/// Build the gateway's `rustls::ServerConfig`.
///
/// Every client must present a certificate chaining to `ca_certs`; the chain
/// is then handed to `policy`. ALPN offers HTTP/2 and HTTP/1.1.
///
/// # Errors
///
/// Returns an error if the server certificate or key cannot be loaded, a CA
/// certificate is unusable, or the key does not match the certificate.
pub fn build_server_config(
    config: &TlsConfig,
    ca_certs: &[CertificateDer<'static>],
    policy: Arc<CertValidationPolicy>,
) -> Result<ServerConfig> {
    let server_certs = load_certs(&config.server_cert)?;
    let server_key = load_private_key(&config.server_key)?;
    let verifier = PolicyClientVerifier::new(ca_certs, policy)?;

    let mut tls_cfg = ServerConfig::builder_with_provider(Arc::new(crypto_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| Error::Configuration(format!("TLS protocol versions: {e}")))?
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(server_certs, server_key)
        .map_err(|e| Error::CertificateLoad(format!("TLS config error (cert/key mismatch?): {e}")))?;

    tls_cfg.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];

    debug!(
        server_cert = %config.server_cert,
        trusted_cas = ca_certs.len(),
        "mTLS server config built"
    );

    Ok(tls_cfg)
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: PEM loading
// ─────────────────────────────────────────────────────────────────────────────

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no valid PEM
/// certificate blocks.
pub fn load_certs(path: &str) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data = read_file(path)?;
    parse_pem_certs(&pem_data, path)
}

/// Parse every certificate in a PEM document; `origin` names it in errors.
///
/// # Errors
///
/// Returns `Error::CertificateLoad` for malformed PEM or no certificates.
pub fn parse_pem_certs(pem: &[u8], origin: &str) -> Result<Vec<CertificateDer<'static>>> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &pem[..])
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::CertificateLoad(format!("Failed to parse certs from '{origin}': {e}")))?;

    if certs.is_empty() {
        return Err(Error::CertificateLoad(format!(
            "No certificates found in '{origin}'"
        )));
    }

    Ok(certs)
}

/// Load the first private key from a PEM file.
///
/// Supports RSA (`RSA PRIVATE KEY`), PKCS#8 (`PRIVATE KEY`), and EC keys.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no private key.
pub fn load_private_key(path: &str) -> Result<PrivateKeyDer<'static>> {
    let pem_data = read_file(path)?;
    let key = rustls_pemfile::private_key(&mut pem_data.as_slice())
        .map_err(|e| Error::CertificateLoad(format!("Failed to parse private key from '{path}': {e}")))?
        .ok_or_else(|| Error::CertificateLoad(format!("No private key found in '{path}'")))?;

    Ok(key)
}

/// Load the trusted client CA pool from the configured source.
///
/// A URL source is fetched through `client` (and so through the proxy when
/// enabled) and must answer 200 with PEM certificates.
///
/// # Errors
///
/// `Error::Configuration` for a missing or ambiguous source,
/// `Error::Network` for a failed fetch, `Error::CertificateLoad` for bad
/// PEM.
pub async fn load_ca_pool(config: &TlsConfig, client: &EgressClient) -> Result<Vec<CertificateDer<'static>>> {
    let certs = match config.ca_source()? {
        CaSource::File(path) => load_certs(path)?,
        CaSource::Url(url) => {
            let response = client.get(url, config.ca_fetch_timeout, MAX_CA_BUNDLE).await?;
            if response.status() != StatusCode::OK {
                return Err(Error::Network(format!(
                    "CA fetch from {url} returned {}",
                    response.status()
                )));
            }
            parse_pem_certs(response.body(), url)?
        }
    };
    info!(count = certs.len(), "Loaded trusted client CA pool");
    Ok(certs)
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: certificate generation (CLI helpers)
// ─────────────────────────────────────────────────────────────────────────────

/// Parameters for generating a CA certificate.
#[derive(Debug)]
pub struct CaParams<'a> {
    /// Common Name for the root CA (e.g. `"certgate Root CA"`).
    pub cn: &'a str,
    /// Validity period in days.
    pub validity_days: u32,
}

/// Parameters for generating a leaf certificate (server or client).
#[derive(Debug)]
pub struct LeafCertParams<'a> {
    /// Common Name.
    pub cn: &'a str,
    /// Subject Alternative Names: DNS entries.
    pub san_dns: Vec<String>,
    /// Subject Alternative Names: IP addresses.
    pub san_ips: Vec<IpAddr>,
    /// CRL distribution point URIs.
    pub crl_urls: Vec<String>,
    /// Explicit serial number; derived from the key when `None`.
    pub serial: Option<u64>,
    /// `true` for a client certificate, `false` for a server certificate.
    pub client: bool,
    /// Validity period in days.
    pub validity_days: u32,
}

/// One entry of a generated CRL.
#[derive(Debug, Clone)]
pub struct RevokedEntry {
    /// Serial number of the revoked certificate.
    pub serial: BigUint,
    /// Optional CRLReason.
    pub reason: Option<RevocationReason>,
}

/// Parameters for generating a CRL.
#[derive(Debug, Clone)]
pub struct CrlParams {
    /// Revoked certificates.
    pub revoked: Vec<RevokedEntry>,
    /// nextUpdate relative to now; negative values produce a stale list.
    pub next_update: chrono::Duration,
    /// CRL number.
    pub crl_number: u64,
}

/// Generated certificate and key pair in PEM format.
#[derive(Debug, Clone)]
pub struct GeneratedCert {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
}

/// Certificate generator backed by `rcgen`.
pub struct CertGenerator;

impl CertGenerator {
    /// Generate a self-signed CA certificate allowed to sign certificates
    /// and CRLs.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or certificate serialisation fails.
    pub fn init_ca(params: &CaParams<'_>) -> Result<GeneratedCert> {
        let key_pair = KeyPair::generate()
            .map_err(|e| Error::CertificateLoad(format!("Failed to generate CA key: {e}")))?;

        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name = common_name(params.cn);
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = ca_key_usages();
        ca_params.not_after = days_from_now(i64::from(params.validity_days))?;

        let ca_cert = ca_params
            .self_signed(&key_pair)
            .map_err(|e| Error::CertificateLoad(format!("CA cert generation failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: ca_cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    /// Issue a leaf certificate signed by `ca_cert_pem` / `ca_key_pem`.
    ///
    /// # Errors
    ///
    /// Returns an error if the CA cert/key cannot be parsed, a SAN or CRL URL
    /// is not IA5, or signing fails.
    pub fn issue_leaf(
        params: &LeafCertParams<'_>,
        ca_cert_pem: &str,
        ca_key_pem: &str,
    ) -> Result<GeneratedCert> {
        let (ca_cert, ca_key) = rebuild_ca(ca_cert_pem, ca_key_pem)?;

        let leaf_key = KeyPair::generate()
            .map_err(|e| Error::CertificateLoad(format!("Failed to generate leaf key: {e}")))?;

        let mut leaf_params = CertificateParams::default();
        leaf_params.distinguished_name = common_name(params.cn);
        leaf_params.not_after = days_from_now(i64::from(params.validity_days))?;
        leaf_params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        leaf_params.extended_key_usages = vec![if params.client {
            ExtendedKeyUsagePurpose::ClientAuth
        } else {
            ExtendedKeyUsagePurpose::ServerAuth
        }];
        if let Some(serial) = params.serial {
            leaf_params.serial_number = Some(serial_number(&BigUint::from(serial)));
        }

        let mut sans: Vec<SanType> = Vec::new();
        for dns in &params.san_dns {
            let ia5 = Ia5String::try_from(dns.as_str())
                .map_err(|e| Error::Configuration(format!("Invalid DNS SAN '{dns}': {e}")))?;
            sans.push(SanType::DnsName(ia5));
        }
        sans.extend(params.san_ips.iter().copied().map(SanType::IpAddress));
        leaf_params.subject_alt_names = sans;

        if !params.crl_urls.is_empty() {
            leaf_params.crl_distribution_points = vec![CrlDistributionPoint {
                uris: params.crl_urls.clone(),
            }];
        }

        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &ca_cert, &ca_key)
            .map_err(|e| Error::CertificateLoad(format!("Leaf cert signing failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: leaf_cert.pem(),
            key_pem: leaf_key.serialize_pem(),
        })
    }

    /// Issue a DER CRL signed by `ca_cert_pem` / `ca_key_pem`.
    ///
    /// # Errors
    ///
    /// Returns an error if the CA cannot be parsed or signing fails.
    pub fn issue_crl(params: &CrlParams, ca_cert_pem: &str, ca_key_pem: &str) -> Result<Vec<u8>> {
        let (ca_cert, ca_key) = rebuild_ca(ca_cert_pem, ca_key_pem)?;

        let now = OffsetDateTime::now_utc();
        let next_update = now + time::Duration::seconds(params.next_update.num_seconds());
        let this_update = now.min(next_update) - time::Duration::minutes(1);

        let revoked_certs = params
            .revoked
            .iter()
            .map(|entry| RevokedCertParams {
                serial_number: serial_number(&entry.serial),
                revocation_time: this_update,
                reason_code: entry.reason,
                invalidity_date: None,
            })
            .collect();

        let crl = CertificateRevocationListParams {
            this_update,
            next_update,
            crl_number: serial_number(&BigUint::from(params.crl_number)),
            issuing_distribution_point: None,
            revoked_certs,
            key_identifier_method: KeyIdMethod::Sha256,
        }
        .signed_by(&ca_cert, &ca_key)
        .map_err(|e| Error::CertificateLoad(format!("CRL signing failed: {e}")))?;

        Ok(crl.der().to_vec())
    }

    /// Write a [`GeneratedCert`] to disk as `<stem>.crt` and `<stem>.key`
    /// under `dir`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the files
    /// cannot be written.
    pub fn write_to_dir(cert: &GeneratedCert, dir: &Path, stem: &str) -> Result<()> {
        fs::create_dir_all(dir)?;
        fs::write(dir.join(format!("{stem}.crt")), &cert.cert_pem)?;
        fs::write(dir.join(format!("{stem}.key")), &cert.key_pem)?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Private helpers
// ─────────────────────────────────────────────────────────────────────────────

fn read_file(path: &str) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::CertificateLoad(format!("Cannot read '{path}': {e}")))
}

fn common_name(cn: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    dn
}

fn ca_key_usages() -> Vec<KeyUsagePurpose> {
    vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ]
}

/// Re-create a signing handle for an existing CA from its PEM cert and key.
fn rebuild_ca(ca_cert_pem: &str, ca_key_pem: &str) -> Result<(rcgen::Certificate, KeyPair)> {
    let ca_key = KeyPair::from_pem(ca_key_pem)
        .map_err(|e| Error::CertificateLoad(format!("Failed to parse CA key: {e}")))?;
    let mut ca_params = CertificateParams::from_ca_cert_pem(ca_cert_pem)
        .map_err(|e| Error::CertificateLoad(format!("Failed to parse CA cert: {e}")))?;
    ca_params.key_usages = ca_key_usages();
    let ca_cert = ca_params
        .self_signed(&ca_key)
        .map_err(|e| Error::CertificateLoad(format!("Failed to rebuild CA cert for signing: {e}")))?;
    Ok((ca_cert, ca_key))
}

/// Positive DER INTEGER bytes for `serial`.
fn serial_number(serial: &BigUint) -> SerialNumber {
    SerialNumber::from_slice(&serial.to_bytes_be())
}

fn days_from_now(days: i64) -> Result<OffsetDateTime> {
    OffsetDateTime::now_utc()
        .checked_add(time::Duration::days(days))
        .ok_or_else(|| Error::Configuration(format!("validity of {days} days is out of range")))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
