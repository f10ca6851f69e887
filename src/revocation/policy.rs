//! The handshake-time trust decision.
//!
//! rustls calls client certificate verifiers synchronously. The policy runs
//! its async strategy to completion on the current multi-threaded runtime
//! via `block_in_place`, which parks only the connection's worker. Outside a
//! runtime it drives the future on the handle captured at construction.

use std::sync::Arc;

use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, warn};

use super::cache::RevocationCache;
use super::config::{RevocationConfig, StrategyKind};
use super::fetch::HttpCrlSource;
use super::reputation::ReputationClient;
use crate::egress::EgressClient;
use crate::mtls::identity::{ClientCertificate, IssuerCertificate};
use crate::{Error, Result};

/// Exactly one revocation check, chosen at startup.
#[derive(Debug, Clone)]
pub enum RevocationStrategy {
    /// CRL from the leaf's distribution point, cached.
    Crl(Arc<RevocationCache>),
    /// Per-serial reputation lookup.
    Reputation(ReputationClient),
}

impl RevocationStrategy {
    /// Build the configured strategy on top of `client`.
    ///
    /// # Errors
    ///
    /// Returns `Error::Configuration` when the reputation strategy has no
    /// URL.
    pub fn from_config(config: &RevocationConfig, client: EgressClient) -> Result<Self> {
        match config.strategy {
            StrategyKind::Crl => {
                let source = HttpCrlSource::new(client, config.crl_fetch_timeout, config.max_crl_size);
                Ok(Self::Crl(Arc::new(RevocationCache::new(
                    Arc::new(source),
                    config.crl_refresh_interval,
                ))))
            }
            StrategyKind::Reputation => {
                let url = config
                    .reputation_url
                    .as_deref()
                    .filter(|u| !u.is_empty())
                    .ok_or_else(|| {
                        Error::Configuration(
                            "revocation.reputation_url is required for the reputation strategy"
                                .to_string(),
                        )
                    })?;
                Ok(Self::Reputation(ReputationClient::new(
                    client,
                    url,
                    config.reputation_timeout,
                )))
            }
        }
    }

    /// Which strategy this is.
    pub fn kind(&self) -> StrategyKind {
        match self {
            Self::Crl(_) => StrategyKind::Crl,
            Self::Reputation(_) => StrategyKind::Reputation,
        }
    }

    /// Run the check.
    ///
    /// # Errors
    ///
    /// Any failure means reject.
    pub async fn check(&self, leaf: &ClientCertificate, issuer: &IssuerCertificate) -> Result<()> {
        match self {
            Self::Crl(cache) => cache.check(leaf, issuer).await,
            Self::Reputation(client) => client.check(leaf).await,
        }
    }
}

/// Accept/reject decision for verified client chains.
#[derive(Debug, Clone)]
pub struct CertValidationPolicy {
    strategy: RevocationStrategy,
    runtime: Handle,
}

impl CertValidationPolicy {
    /// Wrap `strategy`; `runtime` drives checks invoked off-runtime.
    pub fn new(strategy: RevocationStrategy, runtime: Handle) -> Self {
        Self { strategy, runtime }
    }

    /// The active strategy.
    pub fn strategy(&self) -> &RevocationStrategy {
        &self.strategy
    }

    /// Decide on `leaf`, whose chain was verified up to `issuer`.
    ///
    /// # Errors
    ///
    /// Fail-closed: every error is a rejection.
    pub async fn check(&self, leaf: &ClientCertificate, issuer: &IssuerCertificate) -> Result<()> {
        match self.strategy.check(leaf, issuer).await {
            Ok(()) => {
                debug!(
                    serial = %leaf.serial(),
                    cn = leaf.common_name().unwrap_or_default(),
                    strategy = %self.strategy.kind(),
                    "Client certificate accepted"
                );
                Ok(())
            }
            Err(e) => {
                warn!(
                    serial = %leaf.serial(),
                    cn = leaf.common_name().unwrap_or_default(),
                    strategy = %self.strategy.kind(),
                    kind = e.kind(),
                    error = %e,
                    "Client certificate rejected"
                );
                Err(e)
            }
        }
    }

    /// Synchronous form of [`CertValidationPolicy::check`] for the TLS
    /// verifier callback.
    ///
    /// # Errors
    ///
    /// As [`CertValidationPolicy::check`]; additionally
    /// `Error::Configuration` when called on a current-thread runtime,
    /// where blocking would deadlock.
    pub fn check_blocking(&self, leaf: &ClientCertificate, issuer: &IssuerCertificate) -> Result<()> {
        let fut = self.check(leaf, issuer);
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| handle.block_on(fut))
            }
            Ok(_) => Err(Error::Configuration(
                "revocation checks require a multi-threaded tokio runtime".to_string(),
            )),
            Err(_) => self.runtime.block_on(fut),
        }
    }
}
