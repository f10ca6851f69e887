//! Certificate identity extraction.
//!
//! Parses the X.509 leaf a client presents and exposes the fields the trust
//! decision needs: serial number, Common Name and CRL distribution points.
//! Also resolves the top of the verified chain, the certificate a CRL must
//! be signed by.

use std::sync::Arc;

use num_bigint::BigUint;
use rustls::pki_types::CertificateDer;
use x509_parser::certificate::X509Certificate;
use x509_parser::extensions::{DistributionPointName, GeneralName, ParsedExtension};
use x509_parser::prelude::FromDer;

use crate::{Error, Result};

/// Upper bound on issuer links walked when resolving the chain top.
const MAX_CHAIN_DEPTH: usize = 8;

// ─────────────────────────────────────────────────────────────────────────────
// Client certificate
// ─────────────────────────────────────────────────────────────────────────────

/// A parsed client leaf certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientCertificate {
    der: CertificateDer<'static>,
    serial: BigUint,
    common_name: Option<String>,
    crl_distribution_points: Vec<String>,
    subject: Vec<u8>,
    issuer: Vec<u8>,
}

impl ClientCertificate {
    /// Parse a DER-encoded certificate.
    ///
    /// # Errors
    ///
    /// Returns `Error::CertificateLoad` if the bytes are not a certificate.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::CertificateLoad(format!("Failed to parse certificate: {e}")))?;

        Ok(Self {
            der: CertificateDer::from(der.to_vec()),
            serial: cert.tbs_certificate.serial.clone(),
            common_name: extract_cn(&cert),
            crl_distribution_points: extract_crl_urls(&cert),
            subject: cert.subject().as_raw().to_vec(),
            issuer: cert.issuer().as_raw().to_vec(),
        })
    }

    /// Serial number as an unsigned integer.
    pub fn serial(&self) -> &BigUint {
        &self.serial
    }

    /// Subject Common Name, if the subject carries one.
    pub fn common_name(&self) -> Option<&str> {
        self.common_name.as_deref()
    }

    /// All URIs listed in the CRL Distribution Points extension.
    pub fn crl_distribution_points(&self) -> &[String] {
        &self.crl_distribution_points
    }

    /// The one CRL URL this certificate names.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` when the certificate lists no CRL
    /// distribution point or more than one.
    pub fn single_crl_distribution_point(&self) -> Result<&str> {
        match self.crl_distribution_points.as_slice() {
            [url] => Ok(url),
            points => Err(Error::Configuration(format!(
                "certificate {} lists {} CRL distribution points, exactly one is required",
                self.serial,
                points.len()
            ))),
        }
    }

    /// Raw DER encoding.
    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    /// Raw DER subject name.
    pub fn subject_raw(&self) -> &[u8] {
        &self.subject
    }

    /// Raw DER issuer name.
    pub fn issuer_raw(&self) -> &[u8] {
        &self.issuer
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Issuer certificate
// ─────────────────────────────────────────────────────────────────────────────

/// The top of a verified chain: the trust anchor the leaf chains up to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuerCertificate {
    der: CertificateDer<'static>,
    subject: Vec<u8>,
}

impl IssuerCertificate {
    /// Parse a DER-encoded CA certificate.
    ///
    /// # Errors
    ///
    /// Returns `Error::CertificateLoad` if the bytes are not a certificate.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::CertificateLoad(format!("Failed to parse CA certificate: {e}")))?;
        Ok(Self {
            der: CertificateDer::from(der.to_vec()),
            subject: cert.subject().as_raw().to_vec(),
        })
    }

    /// Raw DER encoding.
    pub fn der(&self) -> &CertificateDer<'static> {
        &self.der
    }

    /// Raw DER subject name.
    pub fn subject_raw(&self) -> &[u8] {
        &self.subject
    }
}

/// Resolve the top of the chain `leaf` was verified through.
///
/// Walks issuer → subject links through `intermediates` until a certificate
/// from `anchors` is reached. Trust anchors are preferred over intermediates
/// carrying the same subject.
///
/// # Errors
///
/// Returns `Error::Validation` if no path to an anchor exists.
pub fn resolve_chain_top(
    leaf: &ClientCertificate,
    intermediates: &[CertificateDer<'_>],
    anchors: &[IssuerCertificate],
) -> Result<IssuerCertificate> {
    let parsed: Vec<(Vec<u8>, Vec<u8>)> = intermediates
        .iter()
        .filter_map(|der| {
            X509Certificate::from_der(der).ok().map(|(_, cert)| {
                (cert.subject().as_raw().to_vec(), cert.issuer().as_raw().to_vec())
            })
        })
        .collect();

    let mut wanted = leaf.issuer_raw().to_vec();
    for _ in 0..MAX_CHAIN_DEPTH {
        if let Some(anchor) = anchors.iter().find(|a| a.subject_raw() == wanted.as_slice()) {
            return Ok(anchor.clone());
        }
        match parsed.iter().find(|(subject, _)| *subject == wanted) {
            Some((subject, issuer)) if subject != issuer => wanted = issuer.clone(),
            _ => break,
        }
    }

    Err(Error::Validation(format!(
        "no trusted issuer found for certificate {}",
        leaf.serial()
    )))
}

// ─────────────────────────────────────────────────────────────────────────────
// Peer identity
// ─────────────────────────────────────────────────────────────────────────────

/// The verified client certificate of a connection, attached to each request
/// as an extension.
#[derive(Debug, Clone)]
pub struct PeerIdentity(Arc<ClientCertificate>);

impl PeerIdentity {
    /// Build from the peer chain rustls recorded; the leaf comes first.
    pub fn from_peer_certificates(certs: &[CertificateDer<'_>]) -> Option<Self> {
        let leaf = certs.first()?;
        ClientCertificate::from_der(leaf)
            .ok()
            .map(|cert| Self(Arc::new(cert)))
    }

    /// The leaf certificate.
    pub fn certificate(&self) -> &ClientCertificate {
        &self.0
    }

    /// Subject Common Name, or `""` when absent.
    pub fn common_name(&self) -> &str {
        self.0.common_name().unwrap_or_default()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Extraction helpers
// ─────────────────────────────────────────────────────────────────────────────

fn extract_cn(cert: &X509Certificate<'_>) -> Option<String> {
    cert.subject()
        .iter_common_name()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_owned)
}

/// Every URI in every full-name distribution point.
fn extract_crl_urls(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut urls = Vec::new();
    for ext in cert.extensions() {
        let ParsedExtension::CRLDistributionPoints(dps) = ext.parsed_extension() else {
            continue;
        };
        for point in &dps.points {
            if let Some(DistributionPointName::FullName(names)) = &point.distribution_point {
                for name in names {
                    if let GeneralName::URI(uri) = name {
                        urls.push((*uri).to_owned());
                    }
                }
            }
        }
    }
    urls
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use rcgen::{
        BasicConstraints, CertificateParams, CrlDistributionPoint, DistinguishedName, DnType,
        IsCa, KeyPair, SerialNumber,
    };

    struct Ca {
        cert: rcgen::Certificate,
        key: KeyPair,
    }

    fn make_ca(cn: &str) -> Ca {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.self_signed(&key).unwrap();
        Ca { cert, key }
    }

    fn make_intermediate(cn: &str, parent: &Ca) -> Ca {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        let cert = params.signed_by(&key, &parent.cert, &parent.key).unwrap();
        Ca { cert, key }
    }

    fn make_leaf(cn: Option<&str>, serial: &[u8], crl_urls: &[&str], ca: &Ca) -> Vec<u8> {
        let key = KeyPair::generate().unwrap();
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        if let Some(cn) = cn {
            dn.push(DnType::CommonName, cn);
        }
        params.distinguished_name = dn;
        params.serial_number = Some(SerialNumber::from_slice(serial));
        if !crl_urls.is_empty() {
            params.crl_distribution_points = vec![CrlDistributionPoint {
                uris: crl_urls.iter().map(|u| (*u).to_string()).collect(),
            }];
        }
        params
            .signed_by(&key, &ca.cert, &ca.key)
            .unwrap()
            .der()
            .to_vec()
    }

    fn anchor(ca: &Ca) -> IssuerCertificate {
        IssuerCertificate::from_der(ca.cert.der()).unwrap()
    }

    #[test]
    fn from_der_extracts_serial_cn_and_crl_url() {
        // GIVEN: a leaf with serial 0x1001 and one CRL URL
        let ca = make_ca("Root");
        let der = make_leaf(Some("DV1"), &[0x10, 0x01], &["http://crl.example/root.crl"], &ca);

        // WHEN: parsing
        let cert = ClientCertificate::from_der(&der).unwrap();

        // THEN: fields are extracted
        assert_eq!(cert.serial(), &BigUint::from(0x1001u32));
        assert_eq!(cert.common_name(), Some("DV1"));
        assert_eq!(
            cert.single_crl_distribution_point().unwrap(),
            "http://crl.example/root.crl"
        );
    }

    #[test]
    fn single_crl_distribution_point_rejects_zero_and_many() {
        let ca = make_ca("Root");
        let none = ClientCertificate::from_der(&make_leaf(Some("a"), &[1], &[], &ca)).unwrap();
        let two = ClientCertificate::from_der(&make_leaf(
            Some("b"),
            &[2],
            &["http://a.example/crl", "http://b.example/crl"],
            &ca,
        ))
        .unwrap();

        assert!(matches!(
            none.single_crl_distribution_point(),
            Err(Error::Configuration(_))
        ));
        let err = two.single_crl_distribution_point().unwrap_err();
        assert!(err.to_string().contains("lists 2"), "{err}");
    }

    #[test]
    fn from_der_rejects_garbage() {
        assert!(matches!(
            ClientCertificate::from_der(b"not a cert"),
            Err(Error::CertificateLoad(_))
        ));
    }

    #[test]
    fn resolve_chain_top_returns_direct_anchor() {
        let root = make_ca("Root");
        let leaf = ClientCertificate::from_der(&make_leaf(Some("DV1"), &[7], &[], &root)).unwrap();

        let top = resolve_chain_top(&leaf, &[], &[anchor(&root)]).unwrap();
        assert_eq!(top.der().as_ref(), root.cert.der().as_ref());
    }

    #[test]
    fn resolve_chain_top_walks_through_intermediates() {
        // GIVEN: root → intermediate → leaf
        let root = make_ca("Root");
        let other = make_ca("Other Root");
        let mid = make_intermediate("Issuing CA", &root);
        let leaf = ClientCertificate::from_der(&make_leaf(Some("DV1"), &[9], &[], &mid)).unwrap();

        // WHEN: resolving with the intermediate presented by the peer
        let top = resolve_chain_top(
            &leaf,
            &[mid.cert.der().clone()],
            &[anchor(&other), anchor(&root)],
        )
        .unwrap();

        // THEN: the root is the top, not the intermediate
        assert_eq!(top.der().as_ref(), root.cert.der().as_ref());
    }

    #[test]
    fn resolve_chain_top_fails_without_path() {
        let root = make_ca("Root");
        let stranger = make_ca("Stranger");
        let leaf = ClientCertificate::from_der(&make_leaf(Some("x"), &[3], &[], &stranger)).unwrap();

        let err = resolve_chain_top(&leaf, &[], &[anchor(&root)]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn peer_identity_defaults_to_empty_common_name() {
        let ca = make_ca("Root");
        let der = CertificateDer::from(make_leaf(None, &[4], &[], &ca));

        let peer = PeerIdentity::from_peer_certificates(&[der]).unwrap();
        assert_eq!(peer.common_name(), "");
        assert!(PeerIdentity::from_peer_certificates(&[]).is_none());
    }
}
