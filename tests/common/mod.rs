//! Shared fixtures for end-to-end gateway tests: an on-disk PKI, a CRL
//! server, a recording backend, and a running gateway.

#![allow(dead_code)]

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use num_bigint::BigUint;
use rustls::pki_types::CertificateDer;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use certgate::config::Config;
use certgate::egress::ProxyDialer;
use certgate::gateway::Gateway;
use certgate::mtls::{
    CaParams, CertGenerator, CrlParams, GeneratedCert, LeafCertParams, MtlsClient, RevokedEntry,
    TlsConfig, load_certs,
};
use certgate::revocation::{CertValidationPolicy, StrategyKind};

pub const TIMEOUT: Duration = Duration::from_secs(5);

// ─────────────────────────────────────────────────────────────────────────────
// PKI
// ─────────────────────────────────────────────────────────────────────────────

/// A CA with its files written to a temp directory.
pub struct Pki {
    pub dir: TempDir,
    pub ca: GeneratedCert,
}

impl Pki {
    pub fn new(cn: &str) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let ca = CertGenerator::init_ca(&CaParams {
            cn,
            validity_days: 30,
        })
        .unwrap();
        CertGenerator::write_to_dir(&ca, dir.path(), "ca").unwrap();
        Self { dir, ca }
    }

    pub fn path(&self, file: &str) -> String {
        self.dir.path().join(file).display().to_string()
    }

    pub fn ca_certs(&self) -> Vec<CertificateDer<'static>> {
        load_certs(&self.path("ca.crt")).unwrap()
    }

    /// Server certificate for `localhost` / 127.0.0.1, written as `<stem>.crt/.key`.
    pub fn server(&self, stem: &str) {
        let params = LeafCertParams {
            cn: "localhost",
            san_dns: vec!["localhost".to_string()],
            san_ips: vec![IpAddr::V4(Ipv4Addr::LOCALHOST)],
            crl_urls: vec![],
            serial: None,
            client: false,
            validity_days: 30,
        };
        let cert = CertGenerator::issue_leaf(&params, &self.ca.cert_pem, &self.ca.key_pem).unwrap();
        CertGenerator::write_to_dir(&cert, self.dir.path(), stem).unwrap();
    }

    /// Client certificate written as `<cn>.crt/.key`.
    pub fn client(&self, cn: &str, serial: u64, crl_urls: &[&str]) {
        let params = LeafCertParams {
            cn,
            san_dns: vec![],
            san_ips: vec![],
            crl_urls: crl_urls.iter().map(|u| (*u).to_string()).collect(),
            serial: Some(serial),
            client: true,
            validity_days: 30,
        };
        let cert = CertGenerator::issue_leaf(&params, &self.ca.cert_pem, &self.ca.key_pem).unwrap();
        CertGenerator::write_to_dir(&cert, self.dir.path(), cn).unwrap();
    }

    /// DER CRL listing `revoked`.
    pub fn crl(&self, revoked: &[u64]) -> Vec<u8> {
        let params = CrlParams {
            revoked: revoked
                .iter()
                .map(|s| RevokedEntry {
                    serial: BigUint::from(*s),
                    reason: Some(rcgen::RevocationReason::KeyCompromise),
                })
                .collect(),
            next_update: chrono::Duration::hours(1),
            crl_number: 1,
        };
        CertGenerator::issue_crl(&params, &self.ca.cert_pem, &self.ca.key_pem).unwrap()
    }

    /// Client for `cn`, trusting this CA for the gateway's server certificate.
    pub fn mtls_client(&self, cn: &str) -> MtlsClient {
        self.mtls_client_from(cn, self)
    }

    /// Client presenting `cn` issued by `issuer`, trusting this CA.
    pub fn mtls_client_from(&self, cn: &str, issuer: &Pki) -> MtlsClient {
        let tls = TlsConfig {
            client_cert: Some(issuer.path(&format!("{cn}.crt"))),
            client_key: Some(issuer.path(&format!("{cn}.key"))),
            ..TlsConfig::default()
        };
        MtlsClient::new(
            &tls,
            &self.ca_certs(),
            Arc::new(ProxyDialer::new(false).unwrap()),
            Some(TIMEOUT),
        )
        .unwrap()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// HTTP fixtures
// ─────────────────────────────────────────────────────────────────────────────

async fn spawn(app: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    addr
}

/// Serves a replaceable CRL at `/crl` and counts fetches.
pub struct CrlServer {
    pub addr: SocketAddr,
    pub body: Arc<RwLock<Vec<u8>>>,
    pub fetches: Arc<AtomicUsize>,
}

impl CrlServer {
    pub async fn start(initial: Vec<u8>) -> Self {
        let body = Arc::new(RwLock::new(initial));
        let fetches = Arc::new(AtomicUsize::new(0));
        let (serve_body, count) = (Arc::clone(&body), Arc::clone(&fetches));
        let app = Router::new().route(
            "/crl",
            axum::routing::get(move || {
                let body = Arc::clone(&serve_body);
                let count = Arc::clone(&count);
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    body.read().await.clone()
                }
            }),
        );
        Self {
            addr: spawn(app).await,
            body,
            fetches,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}/crl", self.addr)
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

/// What the backend saw for one request.
#[derive(Debug, Clone)]
pub struct Seen {
    pub method: String,
    pub uri: String,
    pub client_ids: Vec<String>,
    pub host: Option<String>,
    pub body: Vec<u8>,
}

/// Records every request and answers 200 "backend ok".
pub struct Backend {
    pub addr: SocketAddr,
    pub seen: Arc<Mutex<Vec<Seen>>>,
}

impl Backend {
    pub async fn start() -> Self {
        let seen: Arc<Mutex<Vec<Seen>>> = Arc::default();
        let record = Arc::clone(&seen);
        let app = Router::new().fallback(move |request: Request<Body>| {
            let record = Arc::clone(&record);
            async move {
                let (parts, body) = request.into_parts();
                let body = to_bytes(body, usize::MAX).await.unwrap().to_vec();
                record.lock().await.push(Seen {
                    method: parts.method.to_string(),
                    uri: parts.uri.to_string(),
                    client_ids: parts
                        .headers
                        .get_all("x-clientid")
                        .iter()
                        .map(|v| v.to_str().unwrap().to_string())
                        .collect(),
                    host: parts
                        .headers
                        .get("host")
                        .map(|v| v.to_str().unwrap().to_string()),
                    body,
                });
                (StatusCode::OK, "backend ok")
            }
        });
        Self {
            addr: spawn(app).await,
            seen,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub async fn requests(&self) -> Vec<Seen> {
        self.seen.lock().await.clone()
    }
}

/// Reputation service answering `/{serial}` from a fixed table; unknown
/// serials get 404.
pub async fn reputation_service(records: &[(u64, &str, &str)]) -> SocketAddr {
    let table: Vec<(String, String)> = records
        .iter()
        .map(|(serial, status, reason)| {
            (
                serial.to_string(),
                format!(r#"[{{"status":"{status}","reason":"{reason}"}}]"#),
            )
        })
        .collect();
    let table = Arc::new(table);
    let app = Router::new().route(
        "/{serial}",
        axum::routing::get(
            move |axum::extract::Path(serial): axum::extract::Path<String>| {
                let table = Arc::clone(&table);
                async move {
                    match table.iter().find(|(s, _)| *s == serial) {
                        Some((_, body)) => (StatusCode::OK, body.clone()),
                        None => (StatusCode::NOT_FOUND, String::new()),
                    }
                }
            },
        ),
    );
    spawn(app).await
}

// ─────────────────────────────────────────────────────────────────────────────
// Gateway
// ─────────────────────────────────────────────────────────────────────────────

/// A gateway serving on a loopback port until dropped.
pub struct RunningGateway {
    pub addr: SocketAddr,
    pub policy: Arc<CertValidationPolicy>,
    stop: CancellationToken,
}

impl RunningGateway {
    pub fn url(&self, path_and_query: &str) -> String {
        format!("https://127.0.0.1:{}{path_and_query}", self.addr.port())
    }

    /// CRL fetches performed by the gateway's revocation cache.
    pub fn crl_fetches(&self) -> u64 {
        match self.policy.strategy() {
            certgate::revocation::RevocationStrategy::Crl(cache) => cache.fetch_count(),
            certgate::revocation::RevocationStrategy::Reputation(_) => 0,
        }
    }
}

impl Drop for RunningGateway {
    fn drop(&mut self) {
        self.stop.cancel();
    }
}

/// Gateway config pointing at `pki`'s `server.crt` and `ca.crt`.
pub fn gateway_config(pki: &Pki, backend_url: &str) -> Config {
    let mut config = Config::default();
    config.server.listen_addr = "127.0.0.1:0".to_string();
    config.server.shutdown_timeout = Duration::from_secs(1);
    config.tls.server_cert = pki.path("server.crt");
    config.tls.server_key = pki.path("server.key");
    config.tls.ca_cert = Some(pki.path("ca.crt"));
    config.forward.base_url = backend_url.to_string();
    config.forward.timeout = TIMEOUT;
    config.revocation.strategy = StrategyKind::Crl;
    config.revocation.crl_refresh_interval = Duration::from_secs(60);
    config.revocation.crl_fetch_timeout = Duration::from_secs(2);
    config
}

pub async fn start_gateway(config: Config) -> RunningGateway {
    start_gateway_with(config, ProxyDialer::new(false).unwrap()).await
}

pub async fn start_gateway_with(config: Config, dialer: ProxyDialer) -> RunningGateway {
    let gateway = Gateway::with_dialer(config, Arc::new(dialer)).await.unwrap();
    let policy = Arc::clone(gateway.policy());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let stop = CancellationToken::new();
    let shutdown = stop.clone().cancelled_owned();
    tokio::spawn(async move { gateway.serve(listener, shutdown).await.unwrap() });
    RunningGateway { addr, policy, stop }
}

pub fn body_text(response: &axum::http::Response<bytes::Bytes>) -> String {
    String::from_utf8(response.body().to_vec()).unwrap()
}
