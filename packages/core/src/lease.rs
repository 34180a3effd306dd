//! Liveness tracking for optimizer lock holders.
//!
//! A holder proves it is alive in one or both of two ways:
//!
//! - by keeping a [`LivenessToken`] alive (typically one per connection;
//!   dropping the last clone means the holder is gone), and
//! - by renewing the lease with heartbeats before the lock timeout elapses.

use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

/// Owned by a lock holder. Clones share the same liveness.
#[derive(Debug, Clone, Default)]
pub struct LivenessToken(Arc<()>);

impl LivenessToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A lease linked to this token.
    pub fn lease(&self, now: Instant) -> Lease {
        Lease {
            link: Some(Arc::downgrade(&self.0)),
            last_seen: now,
        }
    }
}

/// The store's view of a holder's liveness.
#[derive(Debug, Clone)]
pub struct Lease {
    link: Option<Weak<()>>,
    last_seen: Instant,
}

impl Lease {
    /// A lease kept alive by heartbeats alone.
    pub fn heartbeat(now: Instant) -> Self {
        Self {
            link: None,
            last_seen: now,
        }
    }

    pub fn renew(&mut self, now: Instant) {
        self.last_seen = now;
    }

    /// Whether the linked token (if any) still exists.
    pub fn is_connected(&self) -> bool {
        self.link
            .as_ref()
            .map_or(true, |link| link.strong_count() > 0)
    }

    /// Dead when the token is gone or `timeout` passed without a renewal.
    pub fn is_expired(&self, now: Instant, timeout: Option<Duration>) -> bool {
        if !self.is_connected() {
            return true;
        }
        timeout.is_some_and(|timeout| now.saturating_duration_since(self.last_seen) > timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dropping_token_expires_lease() {
        let now = Instant::now();
        let token = LivenessToken::new();
        let lease = token.lease(now);
        assert!(!lease.is_expired(now, None));

        let clone = token.clone();
        drop(token);
        assert!(lease.is_connected());
        drop(clone);
        assert!(!lease.is_connected());
        assert!(lease.is_expired(now, None));
    }

    #[test]
    fn heartbeat_lease_times_out() {
        let start = Instant::now();
        let mut lease = Lease::heartbeat(start);
        let timeout = Some(Duration::from_secs(10));

        assert!(!lease.is_expired(start + Duration::from_secs(10), timeout));
        assert!(lease.is_expired(start + Duration::from_secs(11), timeout));

        lease.renew(start + Duration::from_secs(9));
        assert!(!lease.is_expired(start + Duration::from_secs(11), timeout));
        assert!(!lease.is_expired(start + Duration::from_secs(3600), None));
    }
}
