//! Send throttling for `send_message` frames.
//!
//! Every identity gets an allowance of `burst` messages that refills at
//! `per_second`. It is keyed by identity rather than connection, so a
//! second device shares the first one's allowance. Joins, acks and pings
//! are never throttled.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;

use enclave_shared::types::IdentityId;

#[derive(Debug, Clone)]
struct Allowance {
    messages: f64,
    checked_at: Instant,
}

impl Allowance {
    fn full(burst: f64) -> Self {
        Self {
            messages: burst,
            checked_at: Instant::now(),
        }
    }

    /// Top up for the time since the last send attempt, then spend one
    /// message if there is one.
    fn spend(&mut self, per_second: f64, burst: f64) -> bool {
        let now = Instant::now();
        let idle = now.duration_since(self.checked_at).as_secs_f64();
        self.checked_at = now;
        self.messages = (self.messages + idle * per_second).min(burst);

        if self.messages < 1.0 {
            return false;
        }
        self.messages -= 1.0;
        true
    }
}

#[derive(Clone)]
pub struct SendThrottle {
    allowances: Arc<Mutex<HashMap<IdentityId, Allowance>>>,
    per_second: f64,
    burst: f64,
}

impl SendThrottle {
    pub fn new(per_second: f64, burst: f64) -> Self {
        Self {
            allowances: Arc::new(Mutex::new(HashMap::new())),
            per_second,
            burst: burst.max(1.0),
        }
    }

    /// `false` means the message must be refused with `rate_limited`.
    pub async fn check(&self, identity: &IdentityId) -> bool {
        let mut allowances = self.allowances.lock().await;
        allowances
            .entry(identity.clone())
            .or_insert_with(|| Allowance::full(self.burst))
            .spend(self.per_second, self.burst)
    }

    /// Forget identities that have not tried to send for `max_idle_secs`.
    /// A forgotten identity starts again with a full burst.
    pub async fn purge_stale(&self, max_idle_secs: f64) {
        let now = Instant::now();
        self.allowances.lock().await.retain(|_, allowance| {
            now.duration_since(allowance.checked_at).as_secs_f64() < max_idle_secs
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn id(raw: &str) -> IdentityId {
        IdentityId::new(raw).unwrap()
    }

    #[tokio::test]
    async fn test_burst_then_refuse() {
        let throttle = SendThrottle::new(0.001, 3.0);
        let alice = id("alice");

        for _ in 0..3 {
            assert!(throttle.check(&alice).await);
        }
        assert!(!throttle.check(&alice).await);
    }

    #[tokio::test]
    async fn test_identities_are_independent() {
        let throttle = SendThrottle::new(0.001, 1.0);
        assert!(throttle.check(&id("alice")).await);
        assert!(!throttle.check(&id("alice")).await);
        assert!(throttle.check(&id("bob")).await);
    }

    #[tokio::test]
    async fn test_allowance_refills_over_time() {
        let throttle = SendThrottle::new(20.0, 1.0);
        let alice = id("alice");
        assert!(throttle.check(&alice).await);
        assert!(!throttle.check(&alice).await);

        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(throttle.check(&alice).await);
        assert!(!throttle.check(&alice).await);
    }

    #[tokio::test]
    async fn test_purge_stale() {
        let throttle = SendThrottle::new(0.001, 1.0);
        let alice = id("alice");
        assert!(throttle.check(&alice).await);

        throttle.purge_stale(0.0).await;

        assert!(throttle.allowances.lock().await.is_empty());
        assert!(throttle.check(&alice).await);
    }
}
