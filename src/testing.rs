//! In-memory PKI shared by unit tests.

use num_bigint::BigUint;

use crate::mtls::cert_manager::{
    CaParams, CertGenerator, CrlParams, GeneratedCert, LeafCertParams, RevokedEntry,
    parse_pem_certs,
};
use crate::mtls::identity::{ClientCertificate, IssuerCertificate};

/// A throwaway CA able to issue leaves and CRLs.
pub(crate) struct TestPki {
    pub ca: GeneratedCert,
}

impl TestPki {
    pub fn new(cn: &str) -> Self {
        let ca = CertGenerator::init_ca(&CaParams {
            cn,
            validity_days: 30,
        })
        .unwrap();
        Self { ca }
    }

    pub fn issuer(&self) -> IssuerCertificate {
        let der = parse_pem_certs(self.ca.cert_pem.as_bytes(), "test CA")
            .unwrap()
            .remove(0);
        IssuerCertificate::from_der(&der).unwrap()
    }

    pub fn leaf_pem(&self, cn: &str, serial: u64, crl_urls: &[&str]) -> GeneratedCert {
        let params = LeafCertParams {
            cn,
            san_dns: vec![],
            san_ips: vec![],
            crl_urls: crl_urls.iter().map(|u| (*u).to_string()).collect(),
            serial: Some(serial),
            client: true,
            validity_days: 30,
        };
        CertGenerator::issue_leaf(&params, &self.ca.cert_pem, &self.ca.key_pem).unwrap()
    }

    pub fn leaf(&self, cn: &str, serial: u64, crl_urls: &[&str]) -> ClientCertificate {
        let pem = self.leaf_pem(cn, serial, crl_urls);
        let der = parse_pem_certs(pem.cert_pem.as_bytes(), "test leaf")
            .unwrap()
            .remove(0);
        ClientCertificate::from_der(&der).unwrap()
    }

    pub fn crl(&self, revoked: &[u64], next_update: chrono::Duration) -> Vec<u8> {
        let params = CrlParams {
            revoked: revoked
                .iter()
                .map(|s| RevokedEntry {
                    serial: BigUint::from(*s),
                    reason: Some(rcgen::RevocationReason::KeyCompromise),
                })
                .collect(),
            next_update,
            crl_number: 1,
        };
        CertGenerator::issue_crl(&params, &self.ca.cert_pem, &self.ca.key_pem).unwrap()
    }
}
