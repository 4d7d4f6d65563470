//! Heartbeat coordination
//!
//! The coordinator is the single owner of the set of shards this member
//! holds. A heartbeat reports that set and receives the authoritative one;
//! reconciliation turns the difference into a [`ShardDelta`] and publishes a
//! new immutable snapshot. No other component changes ownership.

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::client::ShardId;
use crate::consumer::ConsumerClient;
use crate::error::Result;

/// Immutable snapshot of the shards held by this member
pub type OwnedShardSet = Arc<BTreeSet<ShardId>>;

/// Ownership changes produced by one reconciliation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ShardDelta {
    /// Newly granted shards; start a worker
    pub acquired: Vec<ShardId>,
    /// Shards held before and after; nothing to do
    pub retained: Vec<ShardId>,
    /// Revoked shards; stop the worker after flushing its checkpoint
    pub released: Vec<ShardId>,
}

impl ShardDelta {
    /// Compare the previously held shards with the authoritative set
    pub fn compute(previous: &BTreeSet<ShardId>, authoritative: &BTreeSet<ShardId>) -> Self {
        Self {
            acquired: authoritative.difference(previous).copied().collect(),
            retained: authoritative.intersection(previous).copied().collect(),
            released: previous.difference(authoritative).copied().collect(),
        }
    }

    /// Check if ownership did not change
    pub fn is_empty(&self) -> bool {
        self.acquired.is_empty() && self.released.is_empty()
    }
}

/// Maintains group membership and the held shard set
#[derive(Debug)]
pub struct HeartbeatCoordinator {
    client: ConsumerClient,
    held: RwLock<OwnedShardSet>,
}

impl HeartbeatCoordinator {
    /// Create a coordinator holding no shards
    pub fn new(client: ConsumerClient) -> Self {
        Self {
            client,
            held: RwLock::new(Arc::new(BTreeSet::new())),
        }
    }

    /// Snapshot of the shards currently held
    pub fn held_shards(&self) -> OwnedShardSet {
        self.held.read().clone()
    }

    /// Report `currently_held` and return the shards assigned by the service
    ///
    /// A single request; errors are returned without retry.
    pub fn heartbeat(&self, currently_held: &[ShardId]) -> Result<Vec<ShardId>> {
        let config = self.client.config();
        let result = self.client.service().heartbeat(
            &config.project,
            &config.logstore,
            &config.group_name,
            &config.member_name,
            currently_held,
        );

        match &result {
            Ok(_) => self.client.metrics().increment_heartbeats(),
            Err(err) => {
                self.client.metrics().increment_heartbeat_failures();
                warn!(
                    group = %config.group_name,
                    member = %config.member_name,
                    error = %err,
                    "heartbeat failed"
                );
            }
        }

        result
    }

    /// Replace the held set with the authoritative one
    pub fn reconcile(&self, authoritative: &[ShardId]) -> ShardDelta {
        let next: BTreeSet<ShardId> = authoritative.iter().copied().collect();

        let mut held = self.held.write();
        let delta = ShardDelta::compute(&held, &next);
        *held = Arc::new(next);
        drop(held);

        if !delta.is_empty() {
            self.client
                .metrics()
                .record_shard_changes(delta.acquired.len(), delta.released.len());
            info!(
                member = %self.client.config().member_name,
                acquired = ?delta.acquired,
                released = ?delta.released,
                retained = ?delta.retained,
                "shard ownership changed"
            );
        }

        delta
    }

    /// Heartbeat with the held set and reconcile with the answer
    ///
    /// On error the held set is kept; the next tick retries.
    pub fn tick(&self) -> Result<ShardDelta> {
        let held: Vec<ShardId> = self.held_shards().iter().copied().collect();
        let authoritative = self.heartbeat(&held)?;
        Ok(self.reconcile(&authoritative))
    }
}
