//! Source-address ban list.
//!
//! The dispatcher only ever asks "is this peer banned?" from the accept
//! loop, so reads must be cheap and never block. Writes (a relay banning a
//! peer that sent garbage) are rare.
//!
//! Uses ArcSwap: readers load an immutable snapshot, writers build a new
//! map and swap it in atomically.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use tracing::{debug, info};

/// Answers whether a source address is currently banned.
pub trait BanRegistry: Send + Sync {
    /// Pure lookup; must not block.
    fn is_banned(&self, ip: IpAddr) -> bool;
}

/// Ban entries keyed by IP. `None` means the ban never expires.
type BanSnapshot = HashMap<IpAddr, Option<Instant>>;

/// In-memory ban list with optional expiry.
pub struct BanList {
    /// Atomically swappable ban snapshot.
    snapshot: ArcSwap<BanSnapshot>,
    /// How long a ban lasts. `None` bans for the process lifetime.
    ttl: Option<Duration>,
}

impl BanList {
    /// Create an empty ban list.
    pub fn new(ttl: Option<Duration>) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(BanSnapshot::new()),
            ttl,
        }
    }

    /// Ban `ip`, refreshing the expiry if it is already banned.
    ///
    /// Expired entries are dropped from the new snapshot.
    pub fn ban(&self, ip: IpAddr) {
        let now = Instant::now();
        let expires_at = self.ttl.map(|ttl| now + ttl);

        self.snapshot.rcu(|current| {
            let mut next: BanSnapshot = current
                .iter()
                .filter(|(_, expiry)| expiry.map_or(true, |at| at > now))
                .map(|(ip, expiry)| (*ip, *expiry))
                .collect();
            next.insert(ip, expires_at);
            next
        });

        info!(ip = %ip, ttl_secs = ?self.ttl.map(|t| t.as_secs()), "Address banned");
    }

    /// Lift a ban. Returns whether `ip` was on the list.
    pub fn unban(&self, ip: IpAddr) -> bool {
        let mut removed = false;
        self.snapshot.rcu(|current| {
            let mut next = BanSnapshot::clone(current);
            removed = next.remove(&ip).is_some();
            next
        });

        if removed {
            debug!(ip = %ip, "Ban lifted");
        }
        removed
    }

    /// Number of bans still in force.
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.snapshot
            .load()
            .values()
            .filter(|expiry| expiry.map_or(true, |at| at > now))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for BanList {
    fn default() -> Self {
        Self::new(None)
    }
}

impl BanRegistry for BanList {
    fn is_banned(&self, ip: IpAddr) -> bool {
        match self.snapshot.load().get(&ip) {
            Some(None) => true,
            Some(Some(expires_at)) => Instant::now() < *expires_at,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_ban_and_unban() {
        let bans = BanList::default();
        assert!(!bans.is_banned(ip("192.0.2.7")));

        bans.ban(ip("192.0.2.7"));
        assert!(bans.is_banned(ip("192.0.2.7")));
        assert!(!bans.is_banned(ip("192.0.2.8")));
        assert_eq!(bans.len(), 1);

        assert!(bans.unban(ip("192.0.2.7")));
        assert!(!bans.unban(ip("192.0.2.7")));
        assert!(bans.is_empty());
    }

    #[test]
    fn test_ipv6_ban() {
        let bans = BanList::default();
        bans.ban(ip("2001:db8::9"));
        assert!(bans.is_banned(ip("2001:db8::9")));
        assert!(!bans.is_banned(ip("2001:db8::a")));
    }

    #[test]
    fn test_ban_expires() {
        let bans = BanList::new(Some(Duration::from_millis(20)));
        bans.ban(ip("198.51.100.1"));
        assert!(bans.is_banned(ip("198.51.100.1")));

        std::thread::sleep(Duration::from_millis(40));
        assert!(!bans.is_banned(ip("198.51.100.1")));
        assert_eq!(bans.len(), 0);
    }

    #[test]
    fn test_expired_entries_pruned_on_write() {
        let bans = BanList::new(Some(Duration::from_millis(10)));
        bans.ban(ip("198.51.100.1"));
        std::thread::sleep(Duration::from_millis(20));

        bans.ban(ip("198.51.100.2"));
        assert_eq!(bans.snapshot.load().len(), 1);
    }

    #[test]
    fn test_shared_registry() {
        let bans = Arc::new(BanList::default());
        bans.ban(ip("203.0.113.5"));

        let registry: Arc<dyn BanRegistry> = bans.clone();
        assert!(registry.is_banned(ip("203.0.113.5")));
    }
}
