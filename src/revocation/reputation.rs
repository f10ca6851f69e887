//! Reputation-service revocation strategy.
//!
//! Each handshake asks `{base_url}/{serial}` for the leaf's current status.
//! The service answers with a JSON array whose first element carries
//! `status` and an optional `reason`. Nothing is cached.

use std::time::Duration;

use http::StatusCode;
use num_bigint::BigUint;
use serde::Deserialize;
use tracing::debug;

use crate::egress::EgressClient;
use crate::mtls::identity::ClientCertificate;
use crate::{Error, Result};

/// Largest reputation response accepted.
const MAX_RESPONSE: usize = 64 * 1024;

/// Trust status reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReputationStatus {
    /// Certificate is in good standing.
    Good,
    /// Certificate is revoked.
    Revoked,
    /// The service does not know the certificate, or sent an unrecognised
    /// status.
    Unknown,
}

impl ReputationStatus {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "good" => Self::Good,
            "revoked" => Self::Revoked,
            _ => Self::Unknown,
        }
    }
}

/// One lookup result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReputationRecord {
    /// Reported status.
    pub status: ReputationStatus,
    /// Reason given by the service; may be empty.
    pub reason: String,
}

#[derive(Debug, Deserialize)]
struct WireRecord {
    #[serde(default)]
    status: String,
    #[serde(default)]
    reason: String,
}

/// Client for the reputation service.
#[derive(Debug, Clone)]
pub struct ReputationClient {
    client: EgressClient,
    base_url: String,
    timeout: Duration,
}

impl ReputationClient {
    /// Create a client querying below `base_url`.
    pub fn new(client: EgressClient, base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            timeout,
        }
    }

    /// Lookup URL for `serial` (decimal).
    pub fn lookup_url(&self, serial: &BigUint) -> String {
        format!("{}/{serial}", self.base_url.trim_end_matches('/'))
    }

    /// Fetch the current record for `serial`.
    ///
    /// # Errors
    ///
    /// - `Error::Network` for transport failures and non-200 answers
    /// - `Error::Validation` for an empty body, malformed JSON, an empty
    ///   array or a missing status
    pub async fn lookup(&self, serial: &BigUint) -> Result<ReputationRecord> {
        let url = self.lookup_url(serial);
        let response = self.client.get(&url, self.timeout, MAX_RESPONSE).await?;
        if response.status() != StatusCode::OK {
            return Err(Error::Network(format!(
                "reputation lookup {url} returned {}",
                response.status()
            )));
        }

        let body = response.into_body();
        if body.is_empty() {
            return Err(Error::Validation(format!("reputation lookup {url} returned an empty body")));
        }

        // Only the first record counts; later ones are not decoded
        let records: Vec<serde_json::Value> = serde_json::from_slice(&body)
            .map_err(|e| Error::Validation(format!("malformed reputation response from {url}: {e}")))?;
        let first = records
            .into_iter()
            .next()
            .ok_or_else(|| Error::Validation(format!("reputation response from {url} is empty")))?;
        let first: WireRecord = serde_json::from_value(first)
            .map_err(|e| Error::Validation(format!("malformed reputation record from {url}: {e}")))?;
        if first.status.trim().is_empty() {
            return Err(Error::Validation(format!(
                "reputation response from {url} has no status"
            )));
        }

        debug!(serial = %serial, status = %first.status, "Reputation lookup completed");
        Ok(ReputationRecord {
            status: ReputationStatus::parse(&first.status),
            reason: first.reason,
        })
    }

    /// Accept `leaf` only when the service reports it good.
    ///
    /// # Errors
    ///
    /// `Error::Revoked` for revoked, `Error::Validation` for unknown, plus
    /// everything [`ReputationClient::lookup`] returns.
    pub async fn check(&self, leaf: &ClientCertificate) -> Result<()> {
        let record = self.lookup(leaf.serial()).await?;
        match record.status {
            ReputationStatus::Good => Ok(()),
            ReputationStatus::Revoked => Err(Error::Revoked {
                serial: leaf.serial().to_string(),
                reason: record.reason,
            }),
            ReputationStatus::Unknown => Err(Error::Validation(format!(
                "certificate {} has unknown reputation: {}",
                leaf.serial(),
                record.reason
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::egress::{ProxyDialer, client_tls_config};
    use crate::testing::TestPki;
    use axum::Router;
    use axum::extract::Path;
    use axum::routing::get;
    use std::sync::Arc;
    use tokio::net::TcpListener;

    /// Reputation service keyed by decimal serial.
    async fn service() -> String {
        let app = Router::new().route(
            "/status/{serial}",
            get(|Path(serial): Path<String>| async move {
                match serial.as_str() {
                    "1" => (StatusCode::OK, r#"[{"status":"good"}]"#.to_string()),
                    "2" => (
                        StatusCode::OK,
                        r#"[{"status":"Revoked","reason":"keyCompromise"}]"#.to_string(),
                    ),
                    "3" => (StatusCode::OK, r#"[{"status":"unknown","reason":"never seen"}]"#.to_string()),
                    "4" => (StatusCode::OK, r#"[{"reason":"no status"}]"#.to_string()),
                    "5" => (StatusCode::OK, "not json".to_string()),
                    "6" => (StatusCode::OK, String::new()),
                    "7" => (StatusCode::OK, "[]".to_string()),
                    "8" => (
                        StatusCode::OK,
                        r#"[{"status":"good"},{"status":42},"trailing"]"#.to_string(),
                    ),
                    "9" => (StatusCode::OK, r#"[{"status":["good"]}]"#.to_string()),
                    "4096" => (StatusCode::OK, r#"[{"status":"good"}]"#.to_string()),
                    _ => (StatusCode::NOT_FOUND, String::new()),
                }
            }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        format!("http://{addr}/status/")
    }

    fn client(base: String) -> ReputationClient {
        let dialer = Arc::new(ProxyDialer::new(false).unwrap());
        let egress = EgressClient::new(dialer, client_tls_config(&[]).unwrap(), None);
        ReputationClient::new(egress, base, Duration::from_secs(5))
    }

    #[test]
    fn status_parsing_is_case_insensitive_and_defaults_to_unknown() {
        assert_eq!(ReputationStatus::parse("GOOD"), ReputationStatus::Good);
        assert_eq!(ReputationStatus::parse("revoked"), ReputationStatus::Revoked);
        assert_eq!(ReputationStatus::parse("suspended"), ReputationStatus::Unknown);
    }

    #[tokio::test]
    async fn lookup_url_uses_decimal_serial() {
        let client = client("http://rep.example/v1/".to_string());
        assert_eq!(
            client.lookup_url(&BigUint::from(0x1000u32)),
            "http://rep.example/v1/4096"
        );
    }

    #[tokio::test]
    async fn check_maps_statuses() {
        // GIVEN: a reputation service and leaves with known serials
        let pki = TestPki::new("Root");
        let client = client(service().await);

        // THEN: good accepts, revoked carries the reason, unknown rejects
        client.check(&pki.leaf("ok", 1, &[])).await.unwrap();

        let revoked = client.check(&pki.leaf("bad", 2, &[])).await.unwrap_err();
        assert!(
            matches!(revoked, Error::Revoked { ref reason, .. } if reason == "keyCompromise"),
            "{revoked}"
        );

        let unknown = client.check(&pki.leaf("who", 3, &[])).await.unwrap_err();
        assert!(matches!(unknown, Error::Validation(_)), "{unknown}");
    }

    #[tokio::test]
    async fn only_the_first_record_is_decoded() {
        // GIVEN: a good first record followed by entries of another shape
        let pki = TestPki::new("Root");
        let client = client(service().await);

        // WHEN: looking up that serial
        let record = client.lookup(&BigUint::from(8u32)).await.unwrap();

        // THEN: the first record decides
        assert_eq!(record.status, ReputationStatus::Good);
        client.check(&pki.leaf("ok", 8, &[])).await.unwrap();
    }

    #[tokio::test]
    async fn malformed_answers_are_errors() {
        let pki = TestPki::new("Root");
        let client = client(service().await);

        for serial in [4, 5, 6, 7, 9] {
            let err = client.check(&pki.leaf("x", serial, &[])).await.unwrap_err();
            assert!(matches!(err, Error::Validation(_)), "serial {serial}: {err}");
        }

        let missing = client.check(&pki.leaf("x", 99, &[])).await.unwrap_err();
        assert!(matches!(missing, Error::Network(ref m) if m.contains("404")), "{missing}");
    }
}
