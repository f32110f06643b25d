use std::time::Duration;

/// Consumer configuration for one channel.
///
/// A subscription is served by `no_of_performers` competing performer loops that share one
/// channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub name: String,
    pub channel_name: String,
    pub routing_key: String,
    /// Bound on each receive.
    pub timeout: Duration,
    pub no_of_performers: usize,
    /// Requeues allowed per message before it is rejected. `None` means unlimited.
    pub requeue_count: Option<u32>,
    pub requeue_delay: Duration,
    /// Consecutive unacceptable messages that stop a performer. `0` means unlimited.
    pub unacceptable_message_limit: u32,
    /// Non-durable channels are torn down when closed.
    pub is_durable: bool,
    /// Kept for configuration parity; every performer runs as a tokio task.
    pub is_async: bool,
    /// Pause after a receive that returned nothing.
    pub empty_channel_delay: Duration,
    /// Pause after a receive that failed.
    pub channel_failure_delay: Duration,
}

impl Subscription {
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        channel_name: impl Into<String>,
        routing_key: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            channel_name: channel_name.into(),
            routing_key: routing_key.into(),
            timeout: Duration::from_millis(300),
            no_of_performers: 1,
            requeue_count: None,
            requeue_delay: Duration::ZERO,
            unacceptable_message_limit: 0,
            is_durable: true,
            is_async: true,
            empty_channel_delay: Duration::from_millis(500),
            channel_failure_delay: Duration::from_secs(1),
        }
    }

    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_performers(mut self, n: usize) -> Self {
        self.no_of_performers = n;
        self
    }

    #[must_use]
    pub fn with_requeue_count(mut self, count: u32) -> Self {
        self.requeue_count = Some(count);
        self
    }

    #[must_use]
    pub fn with_requeue_delay(mut self, delay: Duration) -> Self {
        self.requeue_delay = delay;
        self
    }

    #[must_use]
    pub fn with_unacceptable_message_limit(mut self, limit: u32) -> Self {
        self.unacceptable_message_limit = limit;
        self
    }

    #[must_use]
    pub fn durable(mut self, is_durable: bool) -> Self {
        self.is_durable = is_durable;
        self
    }

    #[must_use]
    pub fn with_empty_channel_delay(mut self, delay: Duration) -> Self {
        self.empty_channel_delay = delay;
        self
    }

    #[must_use]
    pub fn with_channel_failure_delay(mut self, delay: Duration) -> Self {
        self.channel_failure_delay = delay;
        self
    }

    /// Whether a message handled `handled_count` times may be requeued again.
    #[must_use]
    pub fn may_requeue(&self, handled_count: u32) -> bool {
        self.requeue_count.is_none_or(|limit| handled_count < limit)
    }

    /// Whether `consecutive` unacceptable messages exceed the limit.
    #[must_use]
    pub fn unacceptable_limit_reached(&self, consecutive: u32) -> bool {
        self.unacceptable_message_limit > 0 && consecutive >= self.unacceptable_message_limit
    }
}
