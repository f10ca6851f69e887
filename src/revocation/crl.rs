//! Signed revocation list snapshots.
//!
//! A [`RevocationSnapshot`] is parsed once when fetched and never mutated.
//! Its signature is not trusted at parse time: callers verify it against the
//! issuer of the handshake at hand on every use.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use num_bigint::BigUint;
use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;
use x509_parser::revocation_list::CertificateRevocationList;
use x509_parser::time::ASN1Time;

use crate::mtls::identity::IssuerCertificate;
use crate::{Error, Result};

const PEM_CRL_HEADER: &[u8] = b"-----BEGIN X509 CRL-----";

/// One fetched CRL.
#[derive(Debug, Clone)]
pub struct RevocationSnapshot {
    der: Vec<u8>,
    revoked: HashMap<BigUint, String>,
    this_update: DateTime<Utc>,
    next_update: Option<DateTime<Utc>>,
    fetched_at: Instant,
    source: String,
}

impl RevocationSnapshot {
    /// Parse a DER (or PEM-armoured) CRL fetched from `source`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` if the bytes are not a CRL.
    pub fn parse(bytes: Vec<u8>, source: impl Into<String>) -> Result<Self> {
        let source = source.into();
        let der = if bytes.starts_with(PEM_CRL_HEADER) {
            pem_to_der(&bytes, &source)?
        } else {
            bytes
        };

        let (_, crl) = CertificateRevocationList::from_der(&der)
            .map_err(|e| Error::Validation(format!("malformed CRL from {source}: {e}")))?;

        let this_update = to_chrono(crl.last_update())
            .ok_or_else(|| Error::Validation(format!("CRL from {source} has an invalid thisUpdate")))?;
        let next_update = crl.next_update().and_then(to_chrono);

        let revoked = crl
            .iter_revoked_certificates()
            .map(|entry| {
                let reason = entry
                    .reason_code()
                    .map_or("unspecified", |(_, code)| reason_name(code.0));
                (entry.serial().clone(), reason.to_owned())
            })
            .collect();

        Ok(Self {
            der,
            revoked,
            this_update,
            next_update,
            fetched_at: Instant::now(),
            source,
        })
    }

    /// Check the list was signed by `issuer`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` on signature mismatch.
    pub fn verify_signature(&self, issuer: &IssuerCertificate) -> Result<()> {
        let (_, ca) = X509Certificate::from_der(issuer.der())
            .map_err(|e| Error::CertificateLoad(format!("Failed to parse CA certificate: {e}")))?;
        let (_, crl) = CertificateRevocationList::from_der(&self.der)
            .map_err(|e| Error::Validation(format!("malformed CRL from {}: {e}", self.source)))?;

        crl.verify_signature(ca.public_key()).map_err(|e| {
            Error::Validation(format!(
                "CRL from {} is not signed by {}: {e}",
                self.source,
                ca.subject()
            ))
        })
    }

    /// Check `now` is before the list's nextUpdate. A list without
    /// nextUpdate is never considered fresh.
    ///
    /// # Errors
    ///
    /// Returns `Error::Validation` for stale revocation data.
    pub fn ensure_fresh(&self, now: DateTime<Utc>) -> Result<()> {
        match self.next_update {
            Some(next) if now < next => Ok(()),
            Some(next) => Err(Error::Validation(format!(
                "stale revocation data from {}: nextUpdate {} has passed",
                self.source,
                next.to_rfc3339()
            ))),
            None => Err(Error::Validation(format!(
                "stale revocation data from {}: CRL has no nextUpdate",
                self.source
            ))),
        }
    }

    /// The revocation reason when `serial` is listed.
    pub fn revocation_reason(&self, serial: &BigUint) -> Option<&str> {
        self.revoked.get(serial).map(String::as_str)
    }

    /// Whether `serial` is listed.
    pub fn is_revoked(&self, serial: &BigUint) -> bool {
        self.revoked.contains_key(serial)
    }

    /// Number of listed serials.
    pub fn len(&self) -> usize {
        self.revoked.len()
    }

    /// Whether no serial is listed.
    pub fn is_empty(&self) -> bool {
        self.revoked.is_empty()
    }

    /// thisUpdate of the list.
    pub fn this_update(&self) -> DateTime<Utc> {
        self.this_update
    }

    /// nextUpdate of the list, if present.
    pub fn next_update(&self) -> Option<DateTime<Utc>> {
        self.next_update
    }

    /// Time since the list was fetched.
    pub fn age(&self) -> Duration {
        self.fetched_at.elapsed()
    }

    /// URL the list was fetched from.
    pub fn source(&self) -> &str {
        &self.source
    }
}

fn pem_to_der(bytes: &[u8], source: &str) -> Result<Vec<u8>> {
    rustls_pemfile::crls(&mut &bytes[..])
        .next()
        .ok_or_else(|| Error::Validation(format!("no CRL in PEM from {source}")))?
        .map(|crl| crl.as_ref().to_vec())
        .map_err(|e| Error::Validation(format!("malformed CRL PEM from {source}: {e}")))
}

fn to_chrono(time: ASN1Time) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(time.timestamp(), 0)
}

/// RFC 5280 CRLReason names.
fn reason_name(code: u8) -> &'static str {
    match code {
        1 => "keyCompromise",
        2 => "cACompromise",
        3 => "affiliationChanged",
        4 => "superseded",
        5 => "cessationOfOperation",
        6 => "certificateHold",
        8 => "removeFromCRL",
        9 => "privilegeWithdrawn",
        10 => "aACompromise",
        _ => "unspecified",
    }
}
