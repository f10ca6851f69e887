//! Time-bounded CRL cache.
//!
//! ```text
//! check(leaf, issuer)
//!   → snapshot missing or older than refresh_interval? → refresh (fetch, parse, swap)
//!   → verify snapshot signature against *this* issuer
//!   → now < nextUpdate?
//!   → leaf serial listed? → Revoked
//! ```
//!
//! The snapshot lives in an [`ArcSwapOption`]: readers never lock, and a
//! refresh installs a fully parsed value in one store. Concurrent refreshes
//! are not deduplicated; the last store wins.
//!
//! A refresh runs as its own task. When the handshake that triggered it is
//! dropped, the fetch still completes (or times out) and installs its result
//! for the next caller.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use chrono::Utc;
use tracing::{debug, info};

use super::crl::RevocationSnapshot;
use super::fetch::CrlSource;
use crate::mtls::identity::{ClientCertificate, IssuerCertificate};
use crate::{Error, Result};

/// Shared CRL cache consulted on every handshake.
#[derive(Debug)]
pub struct RevocationCache {
    snapshot: ArcSwapOption<RevocationSnapshot>,
    source: Arc<dyn CrlSource>,
    refresh_interval: Duration,
    fetches: AtomicU64,
}

impl RevocationCache {
    /// Create an empty cache refreshing from `source` at most every
    /// `refresh_interval`.
    pub fn new(source: Arc<dyn CrlSource>, refresh_interval: Duration) -> Self {
        Self {
            snapshot: ArcSwapOption::empty(),
            source,
            refresh_interval,
            fetches: AtomicU64::new(0),
        }
    }

    /// The currently installed snapshot.
    pub fn snapshot(&self) -> Option<Arc<RevocationSnapshot>> {
        self.snapshot.load_full()
    }

    /// Number of fetches started since creation.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::Relaxed)
    }

    /// Decide whether `leaf`, verified up to `issuer`, is revoked.
    ///
    /// # Errors
    ///
    /// - `Error::Configuration` when the leaf does not name exactly one CRL
    /// - `Error::Network` when a needed refresh fails
    /// - `Error::Validation` for a bad signature or stale list
    /// - `Error::Revoked` when the leaf's serial is listed
    pub async fn check(self: &Arc<Self>, leaf: &ClientCertificate, issuer: &IssuerCertificate) -> Result<()> {
        let url = leaf.single_crl_distribution_point()?;
        let snapshot = match self.usable_snapshot() {
            Some(snapshot) => snapshot,
            None => self.refresh(url).await?,
        };

        snapshot.verify_signature(issuer)?;
        snapshot.ensure_fresh(Utc::now())?;

        if let Some(reason) = snapshot.revocation_reason(leaf.serial()) {
            return Err(Error::Revoked {
                serial: leaf.serial().to_string(),
                reason: reason.to_owned(),
            });
        }
        Ok(())
    }

    /// The installed snapshot, unless it is due for a refresh.
    fn usable_snapshot(&self) -> Option<Arc<RevocationSnapshot>> {
        self.snapshot
            .load_full()
            .filter(|snap| snap.age() < self.refresh_interval)
    }

    /// Fetch, parse and install a new snapshot from `url`.
    async fn refresh(self: &Arc<Self>, url: &str) -> Result<Arc<RevocationSnapshot>> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        debug!(url = %url, "Refreshing CRL");

        let this = Arc::clone(self);
        let url = url.to_owned();
        let task = tokio::spawn(async move {
            let bytes = this.source.fetch(&url).await?;
            let snapshot = Arc::new(RevocationSnapshot::parse(bytes, url)?);
            this.snapshot.store(Some(Arc::clone(&snapshot)));
            info!(
                url = %snapshot.source(),
                revoked = snapshot.len(),
                next_update = ?snapshot.next_update(),
                "Installed CRL snapshot"
            );
            Ok::<_, Error>(snapshot)
        });

        task.await
            .map_err(|e| Error::Network(format!("CRL refresh task failed: {e}")))?
    }
}
