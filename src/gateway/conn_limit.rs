//! Per-client-IP concurrent connection cap

use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

/// Counts open connections per client IP
#[derive(Debug, Default)]
pub struct ConnLimiter {
    /// Maximum concurrent connections per IP (0 = unlimited)
    max_per_ip: usize,
    /// Open connections keyed by peer IP
    open: DashMap<IpAddr, usize>,
}

/// Releases its connection slot when dropped
#[derive(Debug)]
pub struct ConnGuard {
    limiter: Arc<ConnLimiter>,
    ip: Option<IpAddr>,
}

impl ConnLimiter {
    /// Create a limiter allowing `max_per_ip` concurrent connections per IP
    pub fn new(max_per_ip: usize) -> Arc<Self> {
        Arc::new(Self {
            max_per_ip,
            open: DashMap::new(),
        })
    }

    /// Reserve a slot for `ip`, or `None` when it is at the cap
    pub fn try_acquire(self: &Arc<Self>, ip: IpAddr) -> Option<ConnGuard> {
        if self.max_per_ip == 0 {
            return Some(ConnGuard {
                limiter: Arc::clone(self),
                ip: None,
            });
        }

        let mut count = self.open.entry(ip).or_insert(0);
        if *count >= self.max_per_ip {
            return None;
        }
        *count += 1;
        drop(count);

        Some(ConnGuard {
            limiter: Arc::clone(self),
            ip: Some(ip),
        })
    }

    /// Open connections currently counted for `ip`
    pub fn open_connections(&self, ip: IpAddr) -> usize {
        self.open.get(&ip).map_or(0, |count| *count)
    }
}

impl Drop for ConnGuard {
    fn drop(&mut self) {
        let Some(ip) = self.ip else { return };
        if let Entry::Occupied(mut entry) = self.limiter.open.entry(ip) {
            let count = entry.get_mut();
            *count = count.saturating_sub(1);
            if *count == 0 {
                entry.remove();
            }
        }
    }
}
