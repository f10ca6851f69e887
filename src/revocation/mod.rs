//! Certificate revocation checking.
//!
//! Two mutually exclusive strategies sit behind [`CertValidationPolicy`]:
//!
//! - [`RevocationCache`]: signed CRL from the leaf's single distribution
//!   point, cached for `crl_refresh_interval` and re-verified on every use
//! - [`ReputationClient`]: per-serial lookup against an external service,
//!   never cached
//!
//! Both fail closed: an unreachable source, a bad signature, stale data or
//! an unknown status all reject the handshake.

pub mod cache;
pub mod config;
pub mod crl;
pub mod fetch;
pub mod policy;
pub mod reputation;

pub use cache::RevocationCache;
pub use config::{RevocationConfig, StrategyKind};
pub use crl::RevocationSnapshot;
pub use fetch::{CrlSource, HttpCrlSource};
pub use policy::{CertValidationPolicy, RevocationStrategy};
pub use reputation::{ReputationClient, ReputationRecord, ReputationStatus};
