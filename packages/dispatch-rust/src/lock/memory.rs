use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::debug;

use super::LockToken;
use crate::error::LockError;
use crate::traits::DistributedLock;

#[derive(Debug, Clone)]
struct LockRecord {
    token: LockToken,
    expires_at: Instant,
}

/// Process-local [`DistributedLock`] with lease expiry.
///
/// Only serializes holders that share this instance, which makes it suitable for a single
/// process or for tests. A holder that never releases loses the lock once its lease ends.
#[derive(Debug)]
pub struct InMemoryLock {
    records: DashMap<String, LockRecord>,
    lease: Duration,
}

impl InMemoryLock {
    /// Default lease applied by [`InMemoryLock::default`].
    pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

    #[must_use]
    pub fn new(lease: Duration) -> Self {
        Self {
            records: DashMap::new(),
            lease,
        }
    }

    /// Returns `true` if `resource` is currently held by an unexpired lease.
    #[must_use]
    pub fn is_held(&self, resource: &str) -> bool {
        self.records
            .get(resource)
            .is_some_and(|r| r.expires_at > Instant::now())
    }

    /// Drops every lock. Intended for test teardown.
    pub fn clear(&self) {
        self.records.clear();
    }
}

impl Default for InMemoryLock {
    fn default() -> Self {
        Self::new(Self::DEFAULT_LEASE)
    }
}

#[async_trait]
impl DistributedLock for InMemoryLock {
    async fn obtain_lock(&self, resource: &str) -> Result<Option<LockToken>, LockError> {
        let now = Instant::now();
        let token = LockToken::generate();
        let record = LockRecord {
            token: token.clone(),
            expires_at: now + self.lease,
        };

        // The entry guard holds the shard lock, so check-and-insert is atomic.
        match self.records.entry(resource.to_string()) {
            Entry::Occupied(mut held) => {
                if held.get().expires_at > now {
                    return Ok(None);
                }
                debug!(resource, "taking over expired lock lease");
                held.insert(record);
            }
            Entry::Vacant(slot) => {
                slot.insert(record);
            }
        }
        Ok(Some(token))
    }

    async fn release_lock(&self, resource: &str, token: &LockToken) -> Result<bool, LockError> {
        Ok(self
            .records
            .remove_if(resource, |_, record| &record.token == token)
            .is_some())
    }
}
