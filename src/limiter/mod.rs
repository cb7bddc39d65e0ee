//! Per-tier token-bucket admission control for outbound calls.
//!
//! Each configured tier is an independent token bucket with continuous
//! refill; callers block (asynchronously) until a token is available rather
//! than failing. Budgets are not persisted — they respect external service
//! limits, they are not correctness-critical state, so a process restart
//! simply refills them.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorLimiter};

use crate::config::TierConfig;
use crate::errors::EngineError;

type TierBucket = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Token-bucket admission control across named tiers.
pub struct RateLimiter {
    tiers: HashMap<String, Arc<TierBucket>>,
}

impl RateLimiter {
    /// Build one bucket per configured tier. Capacity and refill rate come
    /// from configuration; a tier with zero capacity or a non-positive
    /// refill rate is a configuration error.
    pub fn new(tiers: &[TierConfig]) -> Result<Self> {
        let mut buckets = HashMap::new();
        for tier in tiers {
            if !(tier.refill_per_sec > 0.0) || !tier.refill_per_sec.is_finite() {
                bail!(
                    "tier '{}' has invalid refill rate {}",
                    tier.name,
                    tier.refill_per_sec
                );
            }
            let capacity = NonZeroU32::new(tier.capacity)
                .with_context(|| format!("tier '{}' has zero capacity", tier.name))?;
            let period = Duration::from_secs_f64(1.0 / tier.refill_per_sec);
            let quota = Quota::with_period(period)
                .with_context(|| format!("tier '{}' refill period out of range", tier.name))?
                .allow_burst(capacity);
            buckets.insert(tier.name.clone(), Arc::new(GovernorLimiter::direct(quota)));
        }
        Ok(Self { tiers: buckets })
    }

    pub fn has_tier(&self, name: &str) -> bool {
        self.tiers.contains_key(name)
    }

    /// Block until a token is available on `tier`, then consume it.
    pub async fn acquire(&self, tier: &str) -> Result<(), EngineError> {
        let bucket = self
            .tiers
            .get(tier)
            .ok_or_else(|| EngineError::UnknownTier(tier.to_string()))?;
        bucket.until_ready().await;
        Ok(())
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter")
            .field("tiers", &self.tiers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn zero_capacity_rejected() {
        assert!(RateLimiter::new(&[TierConfig::new("decision", 0, 1.0)]).is_err());
    }

    #[test]
    fn non_positive_refill_rejected() {
        assert!(RateLimiter::new(&[TierConfig::new("decision", 5, 0.0)]).is_err());
        assert!(RateLimiter::new(&[TierConfig::new("decision", 5, -1.0)]).is_err());
    }

    #[tokio::test]
    async fn unknown_tier_is_an_error() {
        let limiter = RateLimiter::new(&[TierConfig::new("decision", 5, 1.0)]).unwrap();
        assert!(limiter.has_tier("decision"));
        assert!(!limiter.has_tier("search"));
        match limiter.acquire("search").await {
            Err(EngineError::UnknownTier(tier)) => assert_eq!(tier, "search"),
            other => panic!("Expected UnknownTier, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn burst_admits_up_to_capacity_instantly() {
        let limiter = RateLimiter::new(&[TierConfig::new("decision", 3, 1.0)]).unwrap();
        for _ in 0..3 {
            tokio::time::timeout(Duration::from_millis(50), limiter.acquire("decision"))
                .await
                .expect("within capacity, acquire must not block")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn concurrent_requesters_admit_at_most_capacity_per_window() {
        // Slow refill (one token every 2s) so only the initial burst of 3 can
        // be admitted within the observation window.
        let limiter = Arc::new(RateLimiter::new(&[TierConfig::new("decision", 3, 0.5)]).unwrap());
        let admitted = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let limiter = limiter.clone();
            let admitted = admitted.clone();
            handles.push(tokio::spawn(async move {
                limiter.acquire("decision").await.unwrap();
                admitted.fetch_add(1, Ordering::SeqCst);
            }));
        }

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(
            admitted.load(Ordering::SeqCst),
            3,
            "exactly the burst capacity may pass before the next refill"
        );
        for handle in handles {
            handle.abort();
        }
    }

    #[tokio::test]
    async fn tiers_backpressure_independently() {
        let limiter = Arc::new(
            RateLimiter::new(&[
                TierConfig::new("decision", 1, 0.2),
                TierConfig::new("search", 1, 0.2),
            ])
            .unwrap(),
        );

        // Drain the decision tier.
        limiter.acquire("decision").await.unwrap();

        // The search tier must still admit immediately.
        tokio::time::timeout(Duration::from_millis(50), limiter.acquire("search"))
            .await
            .expect("independent tier must not be blocked")
            .unwrap();
    }
}
