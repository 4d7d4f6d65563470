use std::time::{Duration, Instant};

use crate::checkpoint::CheckpointStore;
use crate::client::ShardId;
use crate::error::Result;

/// Tracks the processed and committed positions of one shard
///
/// Positions only move forward: [`advance`](Self::advance) is called in the
/// order batches were processed, and every flush writes the latest one.
#[derive(Debug)]
pub struct CheckpointTracker {
    shard_id: ShardId,
    store: CheckpointStore,
    pending: Option<String>,
    committed: Option<String>,
    last_flush: Instant,
}

impl CheckpointTracker {
    /// Create a tracker for a shard with nothing processed yet
    pub fn new(shard_id: ShardId, store: CheckpointStore) -> Self {
        Self {
            shard_id,
            store,
            pending: None,
            committed: None,
            last_flush: Instant::now(),
        }
    }

    /// Shard this tracker belongs to
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Record that everything before `position` has been processed
    pub fn advance(&mut self, position: impl Into<String>) {
        self.pending = Some(position.into());
    }

    /// Latest processed position
    pub fn pending(&self) -> Option<&str> {
        self.pending.as_deref()
    }

    /// Latest position written to the service
    pub fn committed(&self) -> Option<&str> {
        self.committed.as_deref()
    }

    /// Check if processed progress has not been written yet
    pub fn is_dirty(&self) -> bool {
        self.pending.is_some() && self.pending != self.committed
    }

    /// Write the processed position if it changed since the last write
    ///
    /// Returns whether a write happened. On error the position stays pending.
    pub fn flush(&mut self, force_success: bool) -> Result<bool> {
        self.last_flush = Instant::now();

        if !self.is_dirty() {
            return Ok(false);
        }

        if let Some(position) = self.pending.clone() {
            self.store.update_checkpoint(self.shard_id, &position, force_success)?;
            self.committed = Some(position);
        }
        Ok(true)
    }

    /// Flush without force once `interval` has passed since the last flush
    pub fn flush_if_due(&mut self, interval: Duration) -> Result<bool> {
        if self.last_flush.elapsed() < interval {
            return Ok(false);
        }
        self.flush(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GroupConfig;
    use crate::consumer::ConsumerClient;
    use crate::memory::{InMemoryLogService, Operation};
    use std::sync::Arc;

    fn tracker(service: Arc<InMemoryLogService>) -> Result<CheckpointTracker> {
        let config = GroupConfig::new("endpoint", "proj", "store", "group", "m1").with_credentials("id", "secret");
        let client = ConsumerClient::new(config, service)?;
        client.ensure_group_exists();
        Ok(CheckpointTracker::new(0, CheckpointStore::new(client)))
    }

    #[test]
    fn test_flush_writes_only_new_positions() -> Result<()> {
        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 1));
        service.assign("m1", [0]);
        let mut tracker = tracker(service.clone())?;

        assert!(!tracker.flush(false)?);

        tracker.advance("cursor-1");
        tracker.advance("cursor-3");
        assert_eq!(tracker.pending(), Some("cursor-3"));
        assert!(tracker.is_dirty());
        assert!(tracker.flush(false)?);
        assert_eq!(tracker.committed(), Some("cursor-3"));
        assert_eq!(service.checkpoint("group", 0).unwrap().checkpoint, "cursor-3");

        assert!(!tracker.flush(false)?);
        assert_eq!(service.calls(Operation::UpdateCheckpoint), 1);
        Ok(())
    }

    #[test]
    fn test_failed_flush_keeps_position_pending() -> Result<()> {
        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 1));
        service.assign("m1", [0]);
        let mut tracker = tracker(service.clone())?;
        service.fail_times(Operation::UpdateCheckpoint, 1, 500, "InternalServerError");

        tracker.advance("cursor-2");
        assert!(tracker.flush(false).is_err());
        assert!(tracker.is_dirty());
        assert_eq!(tracker.pending(), Some("cursor-2"));
        assert_eq!(tracker.committed(), None);

        assert!(tracker.flush(false)?);
        assert_eq!(tracker.committed(), Some("cursor-2"));
        Ok(())
    }

    #[test]
    fn test_flush_if_due_respects_interval() -> Result<()> {
        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 1));
        service.assign("m1", [0]);
        let mut tracker = tracker(service)?;

        tracker.advance("cursor-1");
        assert!(!tracker.flush_if_due(Duration::from_secs(3600))?);
        assert!(tracker.flush_if_due(Duration::ZERO)?);
        Ok(())
    }
}
