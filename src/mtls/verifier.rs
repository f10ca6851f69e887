//! rustls client certificate verifier running the revocation policy.
//!
//! Standard path validation (signatures, expiry, trust anchor) is delegated
//! to [`WebPkiClientVerifier`]. Only chains it accepts reach the
//! [`CertValidationPolicy`], together with the resolved chain top.

use std::sync::Arc;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    CertificateError, DigitallySignedStruct, DistinguishedName, Error as RustlsError,
    RootCertStore, SignatureScheme,
};
use tracing::warn;

use super::crypto_provider;
use super::identity::{ClientCertificate, IssuerCertificate, resolve_chain_top};
use crate::revocation::CertValidationPolicy;
use crate::{Error, Result};

/// Client verifier: webpki path validation, then the revocation policy.
#[derive(Debug)]
pub struct PolicyClientVerifier {
    webpki: Arc<dyn ClientCertVerifier>,
    anchors: Vec<IssuerCertificate>,
    policy: Arc<CertValidationPolicy>,
}

impl PolicyClientVerifier {
    /// Build a verifier trusting exactly `ca_certs`.
    ///
    /// # Errors
    ///
    /// Returns `Error::CertificateLoad` for an unusable CA certificate and
    /// `Error::Configuration` if the webpki verifier cannot be built.
    pub fn new(ca_certs: &[CertificateDer<'static>], policy: Arc<CertValidationPolicy>) -> Result<Self> {
        let mut roots = RootCertStore::empty();
        let mut anchors = Vec::with_capacity(ca_certs.len());
        for cert in ca_certs {
            roots
                .add(cert.clone())
                .map_err(|e| Error::CertificateLoad(format!("Failed to add CA cert to trust store: {e}")))?;
            anchors.push(IssuerCertificate::from_der(cert)?);
        }

        let webpki = WebPkiClientVerifier::builder_with_provider(
            Arc::new(roots),
            Arc::new(crypto_provider()),
        )
        .build()
        .map_err(|e| Error::Configuration(format!("Failed to build client verifier: {e}")))?;

        Ok(Self {
            webpki,
            anchors,
            policy,
        })
    }
}

impl ClientCertVerifier for PolicyClientVerifier {
    fn offer_client_auth(&self) -> bool {
        self.webpki.offer_client_auth()
    }

    fn client_auth_mandatory(&self) -> bool {
        self.webpki.client_auth_mandatory()
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        self.webpki.root_hint_subjects()
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, RustlsError> {
        self.webpki
            .verify_client_cert(end_entity, intermediates, now)?;

        let leaf = ClientCertificate::from_der(end_entity)
            .map_err(|_| RustlsError::InvalidCertificate(CertificateError::BadEncoding))?;
        let issuer = resolve_chain_top(&leaf, intermediates, &self.anchors).map_err(|e| {
            warn!(serial = %leaf.serial(), error = %e, "Cannot resolve chain top");
            RustlsError::InvalidCertificate(CertificateError::UnknownIssuer)
        })?;

        match self.policy.check_blocking(&leaf, &issuer) {
            Ok(()) => Ok(ClientCertVerified::assertion()),
            Err(e) if e.is_revoked() => Err(RustlsError::InvalidCertificate(CertificateError::Revoked)),
            Err(_) => Err(RustlsError::InvalidCertificate(
                CertificateError::ApplicationVerificationFailure,
            )),
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
        self.webpki.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, RustlsError> {
        self.webpki.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.webpki.supported_verify_schemes()
    }
}
