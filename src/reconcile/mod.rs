//! Periodic reconciliation: subscription and routing-rule refresh
//!
//! Both refreshers share the same shape: fetch, validate fully, swap
//! atomically. Failures feed per-source backoff and never touch the
//! last-known-good data.

pub mod routing;
pub mod subscription;

pub use routing::{HttpRulesetFetcher, RoutingReconciler, RoutingRuleset, RulesetFetch};
pub use subscription::{HttpSubscriptionFetcher, SubscriptionFetch, SubscriptionReconciler};

use std::time::Duration;

/// Reconciler tuning shared by both refresh kinds.
#[derive(Debug, Clone, Copy)]
pub struct ReconcileConfig {
    /// Cap for the exponential backoff.
    pub max_backoff: Duration,
    /// Consecutive failures before a source is marked stale.
    pub stale_after: u32,
    /// Per-request network timeout.
    pub fetch_timeout: Duration,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        ReconcileConfig {
            max_backoff: Duration::from_secs(6 * 3600),
            stale_after: 5,
            fetch_timeout: Duration::from_secs(30),
        }
    }
}

/// `base * 2^failures`, saturating at `max`.
pub fn backoff_interval(base: Duration, max: Duration, failures: u32) -> Duration {
    let factor = 1u128 << failures.min(32);
    let ms = base.as_millis().saturating_mul(factor).min(max.as_millis());
    Duration::from_millis(ms as u64)
}
