//! Configuration management

use std::{env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::mtls::TlsConfig;
use crate::revocation::{RevocationConfig, StrategyKind};
use crate::{Error, Result};

/// Environment variable prefix for configuration overrides
pub const ENV_PREFIX: &str = "CERTGATE_";

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before the environment is merged.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    /// Useful for `HTTPS_PROXY` / `NO_PROXY` kept next to the config.
    pub env_files: Vec<String>,
    /// Listener configuration
    pub server: ServerConfig,
    /// Certificates, keys and the trusted client CA
    pub tls: TlsConfig,
    /// Revocation checking
    pub revocation: RevocationConfig,
    /// Outbound connectivity
    pub egress: EgressConfig,
    /// Backend forwarding
    pub forward: ForwardConfig,
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// Precedence, lowest first: defaults, YAML file, `CERTGATE_*` variables
    /// (`__` separates sections, e.g. `CERTGATE_FORWARD__BASE_URL`).
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Configuration(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // env_files must be in the process environment before it is merged
        let env_files: Vec<String> = figment.extract_inner("env_files").unwrap_or_default();
        load_env_files(&env_files);

        figment = figment.merge(Env::prefixed(ENV_PREFIX).split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Configuration(e.to_string()))?;

        config.expand_env_vars();

        Ok(config)
    }

    /// Check settings that cannot be expressed in types.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` naming the first problem found.
    pub fn validate(&self) -> Result<()> {
        if self.tls.server_cert.is_empty() || self.tls.server_key.is_empty() {
            return Err(Error::Configuration(
                "tls.server_cert and tls.server_key are required".to_string(),
            ));
        }
        self.tls.ca_source()?;

        if self.forward.base_url.is_empty() {
            return Err(Error::Configuration("forward.base_url is required".to_string()));
        }
        if !(self.forward.base_url.starts_with("http://") || self.forward.base_url.starts_with("https://")) {
            return Err(Error::Configuration(format!(
                "forward.base_url '{}' must use http or https",
                self.forward.base_url
            )));
        }
        if !self.forward.health_path.starts_with('/') {
            return Err(Error::Configuration(format!(
                "forward.health_path '{}' must start with '/'",
                self.forward.health_path
            )));
        }

        if self.revocation.strategy == StrategyKind::Reputation
            && self.revocation.reputation_url.as_deref().is_none_or(str::is_empty)
        {
            return Err(Error::Configuration(
                "revocation.reputation_url is required for the reputation strategy".to_string(),
            ));
        }

        if self.server.max_body_size == 0 {
            return Err(Error::Configuration(
                "server.max_body_size must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in URL and path values
    fn expand_env_vars(&mut self) {
        // Pattern: ${VAR} or ${VAR:-default}
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for value in [
            &mut self.forward.base_url,
            &mut self.tls.server_cert,
            &mut self.tls.server_key,
        ] {
            *value = expand_string(&re, value);
        }

        for value in [
            &mut self.tls.ca_cert,
            &mut self.tls.ca_cert_url,
            &mut self.tls.client_cert,
            &mut self.tls.client_key,
            &mut self.revocation.reputation_url,
        ]
        .into_iter()
        .flatten()
        {
            *value = expand_string(&re, value);
        }
    }
}

/// Load environment files into the process environment.
/// Supports ~ expansion. Files that don't exist are silently skipped.
fn load_env_files(paths: &[String]) {
    for path_str in paths {
        let expanded = if path_str.starts_with('~') {
            if let Some(home) = dirs::home_dir() {
                path_str.replacen('~', &home.display().to_string(), 1)
            } else {
                path_str.clone()
            }
        } else {
            path_str.clone()
        };

        let path = Path::new(&expanded);
        if path.exists() {
            match dotenvy::from_path(path) {
                Ok(()) => {
                    tracing::info!("Loaded env file: {expanded}");
                }
                Err(e) => {
                    tracing::warn!("Failed to load env file {expanded}: {e}");
                }
            }
        } else {
            tracing::debug!("Env file not found (skipped): {expanded}");
        }
    }
}

/// Expand environment variables in a string
fn expand_string(re: &Regex, value: &str) -> String {
    re.replace_all(value, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map_or("", |m| m.as_str());
        env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .into_owned()
}

/// Listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Address to listen on
    pub listen_addr: String,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
    /// Maximum concurrent connections per client IP (0 = unlimited)
    pub max_conns_per_ip: usize,
    /// TLS handshake timeout, including revocation checks
    #[serde(with = "humantime_serde")]
    pub handshake_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:443".to_string(),
            max_body_size: 512 * 1024 * 1024, // 512MB
            max_conns_per_ip: 0,
            handshake_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// Outbound connectivity
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EgressConfig {
    /// Honour `HTTPS_PROXY` / `HTTP_PROXY` / `NO_PROXY`
    pub proxy_enabled: bool,
    /// Timeout for establishing an outbound connection, proxy tunnel included
    #[serde(with = "humantime_serde")]
    pub dial_timeout: Duration,
}

impl Default for EgressConfig {
    fn default() -> Self {
        Self {
            proxy_enabled: false,
            dial_timeout: Duration::from_secs(10),
        }
    }
}

/// Backend forwarding
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwardConfig {
    /// Base URL requests are forwarded to
    pub base_url: String,
    /// Per-request timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Path answered locally with a fixed body
    pub health_path: String,
}

impl Default for ForwardConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            timeout: Duration::from_secs(5),
            health_path: "/test".to_string(),
        }
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s", "250ms")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_nanos() == 0 {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        } else {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        }
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Secs(u64),
        Text(String),
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "100ms")
    /// or a bare number of seconds
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the value cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Raw::deserialize(deserializer)? {
            Raw::Secs(secs) => Ok(Duration::from_secs(secs)),
            Raw::Text(s) => parse(&s).map_err(serde::de::Error::custom),
        }
    }

    /// Parse "30s", "5m", "2h", "100ms", or a bare number of seconds
    ///
    /// # Errors
    ///
    /// Returns a description of the problem if `s` is not a duration.
    pub fn parse(s: &str) -> Result<Duration, String> {
        let s = s.trim();
        let invalid = |e: std::num::ParseIntError| format!("invalid duration '{s}': {e}");

        // "ms" before "s" and "m", both of which it ends with
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>().map(Duration::from_millis).map_err(invalid)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>().map(Duration::from_secs).map_err(invalid)
        } else if let Some(mins) = s.strip_suffix('m') {
            scaled(mins.parse::<u64>().map_err(invalid)?, 60, s)
        } else if let Some(hours) = s.strip_suffix('h') {
            scaled(hours.parse::<u64>().map_err(invalid)?, 3600, s)
        } else {
            // Assume seconds
            s.parse::<u64>().map(Duration::from_secs).map_err(invalid)
        }
    }

    fn scaled(value: u64, unit_secs: u64, raw: &str) -> Result<Duration, String> {
        value
            .checked_mul(unit_secs)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("invalid duration '{raw}': out of range"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    fn valid() -> Config {
        let mut config = Config::default();
        config.tls.server_cert = "/etc/certgate/server.crt".to_string();
        config.tls.server_key = "/etc/certgate/server.key".to_string();
        config.tls.ca_cert = Some("/etc/certgate/ca.crt".to_string());
        config.forward.base_url = "http://127.0.0.1:8080".to_string();
        config
    }

    #[test]
    fn defaults_follow_deployment_values() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr, "0.0.0.0:443");
        assert_eq!(config.server.max_body_size, 536_870_912);
        assert_eq!(config.server.handshake_timeout, Duration::from_secs(10));
        assert_eq!(config.revocation.crl_refresh_interval, Duration::from_secs(10));
        assert_eq!(config.tls.ca_fetch_timeout, Duration::from_secs(30));
        assert_eq!(config.forward.timeout, Duration::from_secs(5));
        assert_eq!(config.forward.health_path, "/test");
        assert!(!config.egress.proxy_enabled);
    }

    #[test]
    fn load_merges_yaml_file() {
        // GIVEN: a YAML config with durations in several notations
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("certgate.yaml");
        std::fs::write(
            &path,
            r#"
server:
  listen_addr: "127.0.0.1:8443"
  handshake_timeout: 250ms
tls:
  server_cert: /tls/server.crt
  server_key: /tls/server.key
  ca_cert_url: https://pki.example/ca.pem
revocation:
  strategy: reputation
  reputation_url: https://rep.example/status
  reputation_timeout: 2
forward:
  base_url: http://backend:8080
  timeout: 1m
"#,
        )
        .unwrap();

        // WHEN: loading
        let config = Config::load(Some(&path)).unwrap();

        // THEN: every section is populated
        assert_eq!(config.server.listen_addr, "127.0.0.1:8443");
        assert_eq!(config.server.handshake_timeout, Duration::from_millis(250));
        assert_eq!(config.tls.ca_cert_url.as_deref(), Some("https://pki.example/ca.pem"));
        assert_eq!(config.revocation.strategy, StrategyKind::Reputation);
        assert_eq!(config.revocation.reputation_timeout, Duration::from_secs(2));
        assert_eq!(config.forward.timeout, Duration::from_secs(60));
        config.validate().unwrap();
    }

    #[test]
    fn load_rejects_missing_file() {
        let err = Config::load(Some(Path::new("/nonexistent/certgate.yaml"))).unwrap_err();
        assert!(err.to_string().contains("Config file not found"));
    }

    #[test]
    fn validate_requires_a_ca_source() {
        let mut config = valid();
        config.validate().unwrap();

        // File and URL together: the file wins, still valid
        config.tls.ca_cert_url = Some("https://pki.example/ca.pem".to_string());
        config.validate().unwrap();

        config.tls.ca_cert = None;
        config.tls.ca_cert_url = None;
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_rejects_bad_forward_target() {
        let mut config = valid();
        config.forward.base_url = "ftp://backend".to_string();
        assert!(config.validate().is_err());

        config.forward.base_url = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn validate_requires_reputation_url() {
        let mut config = valid();
        config.revocation.strategy = StrategyKind::Reputation;
        assert!(config.validate().is_err());

        config.revocation.reputation_url = Some("https://rep.example".to_string());
        config.validate().unwrap();
    }

    #[test]
    fn validate_rejects_zero_body_limit() {
        let mut config = valid();
        config.server.max_body_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn expand_env_vars_substitutes_and_defaults() {
        let re = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}").unwrap();
        assert_eq!(
            expand_string(&re, "http://${CERTGATE_TEST_UNSET_HOST:-backend}:8080"),
            "http://backend:8080"
        );
        assert_eq!(expand_string(&re, "no variables"), "no variables");
    }

    #[test]
    fn load_env_files_sets_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "CERTGATE_TEST_KEY_A=hello_from_env_file").unwrap();
        drop(f);

        load_env_files(&[env_path.to_string_lossy().to_string()]);

        assert_eq!(env::var("CERTGATE_TEST_KEY_A").unwrap(), "hello_from_env_file");
        // env::remove_var is unsafe in edition 2024; test keys are unique instead.
    }

    #[test]
    fn load_env_files_skips_missing() {
        load_env_files(&["/nonexistent/path/.env".to_string()]);
    }

    #[test]
    fn humantime_parses_all_units() {
        #[derive(Deserialize)]
        struct Wrap {
            #[serde(with = "humantime_serde")]
            d: Duration,
        }
        let parse = |v: &str| serde_json::from_str::<Wrap>(&format!(r#"{{"d":{v}}}"#)).map(|w| w.d);

        assert_eq!(parse(r#""100ms""#).unwrap(), Duration::from_millis(100));
        assert_eq!(parse(r#""10s""#).unwrap(), Duration::from_secs(10));
        assert_eq!(parse(r#""5m""#).unwrap(), Duration::from_secs(300));
        assert_eq!(parse(r#""2h""#).unwrap(), Duration::from_secs(7200));
        assert_eq!(parse(r#""7""#).unwrap(), Duration::from_secs(7));
        assert_eq!(parse("7").unwrap(), Duration::from_secs(7));
        assert!(parse(r#""soon""#).is_err());
    }

    #[test]
    fn humantime_rejects_overflowing_units() {
        let huge_hours = format!("{}h", u64::MAX / 3600 + 1);
        let huge_minutes = format!("{}m", u64::MAX);

        for raw in [huge_hours.as_str(), huge_minutes.as_str()] {
            let err = humantime_serde::parse(raw).unwrap_err();
            assert!(err.contains("out of range"), "{raw}: {err}");
        }
        assert_eq!(
            humantime_serde::parse(&format!("{}h", u64::MAX / 3600)).unwrap(),
            Duration::from_secs(u64::MAX / 3600 * 3600)
        );
    }

    #[test]
    fn humantime_serializes_sub_second_as_millis() {
        #[derive(Serialize)]
        struct Wrap {
            #[serde(with = "humantime_serde")]
            d: Duration,
        }
        let json = serde_json::to_string(&Wrap { d: Duration::from_millis(1500) }).unwrap();
        assert_eq!(json, r#"{"d":"1500ms"}"#);
    }
}
