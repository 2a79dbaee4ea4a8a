//! Operator notifications for breaker transitions.
//!
//! The orchestrator owes at most one degraded alert per open period and one
//! recovery notice after it; this trait is the seam where a paging or chat
//! integration would plug in. The default sink is the structured log.

use async_trait::async_trait;

use crate::breaker::BreakerStats;

#[async_trait]
pub trait Notifier: Send + Sync {
    /// The investigation subsystem has crossed its failure threshold.
    async fn notify_degraded(&self, stats: &BreakerStats);

    /// The subsystem recovered after a degraded alert.
    async fn notify_recovered(&self, stats: &BreakerStats);
}

/// Notifier that writes to the tracing log.
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_degraded(&self, stats: &BreakerStats) {
        tracing::error!(
            failures = stats.failure_count,
            window_secs = stats.window.as_secs(),
            recent_reasons = ?stats.recent_reasons,
            "Investigation subsystem degraded"
        );
    }

    async fn notify_recovered(&self, stats: &BreakerStats) {
        tracing::info!(
            failures = stats.failure_count,
            "Investigation subsystem recovered"
        );
    }
}
