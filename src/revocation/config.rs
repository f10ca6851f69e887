//! Revocation strategy configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Which revocation check runs during the handshake.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    /// Signed CRL fetched from the leaf's distribution point and cached.
    #[default]
    Crl,
    /// Per-serial lookup against an external reputation service.
    Reputation,
}

impl std::fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Crl => f.write_str("crl"),
            Self::Reputation => f.write_str("reputation"),
        }
    }
}

/// Revocation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RevocationConfig {
    /// Active strategy; exactly one per deployment.
    pub strategy: StrategyKind,

    /// Minimum time between CRL fetches.
    #[serde(with = "crate::config::humantime_serde")]
    pub crl_refresh_interval: Duration,

    /// Timeout for one CRL fetch.
    #[serde(with = "crate::config::humantime_serde")]
    pub crl_fetch_timeout: Duration,

    /// Largest CRL body accepted, in bytes.
    pub max_crl_size: usize,

    /// Base URL of the reputation service; lookups go to `{url}/{serial}`.
    pub reputation_url: Option<String>,

    /// Timeout for one reputation lookup.
    #[serde(with = "crate::config::humantime_serde")]
    pub reputation_timeout: Duration,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::Crl,
            crl_refresh_interval: Duration::from_secs(10),
            crl_fetch_timeout: Duration::from_secs(10),
            max_crl_size: 16 * 1024 * 1024,
            reputation_url: None,
            reputation_timeout: Duration::from_secs(10),
        }
    }
}
