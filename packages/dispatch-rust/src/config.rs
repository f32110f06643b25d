use std::time::Duration;

use crate::inbox::InboxConfiguration;

/// Command processor configuration.
///
/// Controls request/reply deadlines, outbox relay leases and the processor-wide inbox.
#[derive(Debug, Clone)]
pub struct ProcessorConfig {
    /// Deadline for `call` when the caller does not pass one, in milliseconds.
    pub default_call_timeout_ms: u64,
    /// How long a relay may hold an outbox claim before another relay can take it over.
    pub outbox_claim_lease_ms: u64,
    /// When set, every pipeline without its own inbox step gets one as its outermost step.
    pub inbox: Option<InboxConfiguration>,
}

impl ProcessorConfig {
    #[must_use]
    pub fn default_call_timeout(&self) -> Duration {
        Duration::from_millis(self.default_call_timeout_ms)
    }

    #[must_use]
    pub fn outbox_claim_lease(&self) -> Duration {
        Duration::from_millis(self.outbox_claim_lease_ms)
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            default_call_timeout_ms: 500,
            outbox_claim_lease_ms: 30_000,
            inbox: None,
        }
    }
}

/// Outbox sweeper configuration.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Interval between timed sweeps in milliseconds.
    pub interval_ms: u64,
    /// Entries younger than this are left for the explicit `clear_outbox` path.
    pub min_message_age_ms: u64,
    /// Maximum entries relayed per sweep.
    pub batch_size: usize,
    /// Distributed lock resource that keeps sweeps single-active across instances.
    pub lock_resource: String,
}

impl SweeperConfig {
    #[must_use]
    pub fn min_message_age(&self) -> Duration {
        Duration::from_millis(self.min_message_age_ms)
    }
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval_ms: 5_000,
            min_message_age_ms: 5_000,
            batch_size: 100,
            lock_resource: "OutboxSweeper".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let processor = ProcessorConfig::default();
        assert_eq!(processor.default_call_timeout(), Duration::from_millis(500));
        assert_eq!(processor.outbox_claim_lease(), Duration::from_secs(30));
        assert!(processor.inbox.is_none());

        let sweeper = SweeperConfig::default();
        assert_eq!(sweeper.interval_ms, 5_000);
        assert_eq!(sweeper.min_message_age(), Duration::from_secs(5));
        assert_eq!(sweeper.batch_size, 100);
        assert_eq!(sweeper.lock_resource, "OutboxSweeper");
    }
}
