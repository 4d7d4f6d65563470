//! Checkpoint access
//!
//! The service is the durable owner of checkpoints; this facade writes them
//! without retry and reads them from the group-wide listing, retrying until the
//! service gives an authoritative answer.

use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::client::{Checkpoint, ShardId};
use crate::consumer::ConsumerClient;
use crate::error::Result;

/// Per-shard checkpoint reads and writes for one group member
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    client: ConsumerClient,
}

impl CheckpointStore {
    /// Create a checkpoint store over a consumer handle
    pub fn new(client: ConsumerClient) -> Self {
        Self { client }
    }

    /// Write the checkpoint of a shard
    ///
    /// Errors are returned as-is; the caller owns the retry cadence.
    pub fn update_checkpoint(&self, shard_id: ShardId, position: &str, force_success: bool) -> Result<()> {
        let config = self.client.config();
        let result = self.client.service().update_checkpoint(
            &config.project,
            &config.logstore,
            &config.group_name,
            &config.member_name,
            shard_id,
            position,
            force_success,
        );

        match result {
            Ok(()) => {
                self.client.metrics().increment_checkpoint_writes();
                debug!(shard_id, position, force_success, "checkpoint updated");
                Ok(())
            }
            Err(err) => {
                self.client.metrics().increment_checkpoint_failures();
                warn!(shard_id, force_success, error = %err, "failed to update checkpoint");
                Err(err)
            }
        }
    }

    /// Get the checkpoint of a shard, or an empty string if it has none
    ///
    /// Blocks until the checkpoint listing succeeds.
    pub fn get_checkpoint(&self, shard_id: ShardId) -> String {
        self.get_checkpoint_interruptible(shard_id, |backoff| {
            thread::sleep(backoff);
            false
        })
        .unwrap_or_default()
    }

    /// Get the checkpoint of a shard, giving up when `wait` says so
    ///
    /// `wait` is called with the backoff after every failed listing and
    /// returns `true` to stop retrying, in which case `None` is returned.
    pub fn get_checkpoint_interruptible(
        &self,
        shard_id: ShardId,
        wait: impl FnMut(Duration) -> bool,
    ) -> Option<String> {
        let checkpoints = self.list_until(Some(shard_id), wait)?;
        Some(
            checkpoints
                .into_iter()
                .find(|c| c.shard_id == shard_id)
                .map(|c| c.checkpoint)
                .unwrap_or_default(),
        )
    }

    /// List every checkpoint of the group, retrying until the listing succeeds
    pub fn list_checkpoints(&self) -> Vec<Checkpoint> {
        self.list_until(None, |backoff| {
            thread::sleep(backoff);
            false
        })
        .unwrap_or_default()
    }

    fn list_until(&self, shard_id: Option<ShardId>, mut wait: impl FnMut(Duration) -> bool) -> Option<Vec<Checkpoint>> {
        let config = self.client.config();
        let backoff = self.client.retry_policy().checkpoint_backoff;

        loop {
            match self
                .client
                .service()
                .get_checkpoints(&config.project, &config.logstore, &config.group_name)
            {
                Ok(checkpoints) => return Some(checkpoints),
                Err(err) => {
                    self.client.metrics().increment_checkpoint_list_failures();
                    info!(
                        shard_id = ?shard_id,
                        error = %err,
                        "getting checkpoints failed, trying again"
                    );
                    if wait(backoff) {
                        debug!(shard_id = ?shard_id, "checkpoint lookup abandoned");
                        return None;
                    }
                }
            }
        }
    }
}
