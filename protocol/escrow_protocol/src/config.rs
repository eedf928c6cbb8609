//! Operational parameters of the protocol.

use std::time::Duration as StdDuration;

use chrono::Duration;

#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    /// How long a reviewer's claim lease lasts.
    pub lease_secs: u64,
    /// Resubmissions allowed after rejections before a milestone is final.
    pub max_resubmissions: u32,
    /// Queue items whose campaign deadline is this close are escalated.
    pub escalation_threshold_secs: u64,
    /// Payout attempts per milestone before it is marked `release_failed`.
    pub max_payout_attempts: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    /// Upper bound of the random jitter added to each backoff.
    pub backoff_jitter_ms: u64,
    pub payout_timeout_ms: u64,
    /// Optimistic-concurrency retries before a conflict reaches the caller.
    pub conflict_retries: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            lease_secs: 15 * 60,
            max_resubmissions: 3,
            escalation_threshold_secs: 72 * 3600,
            max_payout_attempts: 5,
            backoff_base_ms: 500,
            backoff_max_ms: 60_000,
            backoff_jitter_ms: 250,
            payout_timeout_ms: 30_000,
            conflict_retries: 5,
        }
    }
}

impl ProtocolConfig {
    pub fn lease_duration(&self) -> Duration {
        Duration::seconds(self.lease_secs as i64)
    }

    pub fn escalation_threshold(&self) -> Duration {
        Duration::seconds(self.escalation_threshold_secs as i64)
    }

    pub fn payout_timeout(&self) -> StdDuration {
        StdDuration::from_millis(self.payout_timeout_ms)
    }
}
