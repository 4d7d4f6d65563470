//! Log service capability
//!
//! The consumer talks to the log service only through [`LogServiceClient`].
//! Transport, authentication and the wire encoding of log records live behind
//! implementations of this trait.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Shard handle assigned by the service
pub type ShardId = i32;

/// Consumer group record registered with the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerGroupSpec {
    /// Group name
    pub group_name: String,
    /// Seconds without heartbeat after which a member loses its shards
    pub timeout_secs: u64,
    /// Whether shards are consumed in order across splits and merges
    pub in_order: bool,
}

/// Durable read position of one shard within a group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Shard the checkpoint belongs to
    pub shard_id: ShardId,
    /// Opaque position token
    pub checkpoint: String,
    /// Last time the checkpoint was written
    pub update_time: DateTime<Utc>,
    /// Member that wrote the checkpoint
    pub consumer: String,
}

/// A single log record
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogRecord {
    /// Unix time of the record in seconds
    pub time: u32,
    /// Key/value contents
    pub contents: Vec<(String, String)>,
}

impl LogRecord {
    /// Create a record from key/value pairs
    pub fn new<K, V>(time: u32, contents: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            time,
            contents: contents.into_iter().map(|(k, v)| (k.into(), v.into())).collect(),
        }
    }

    /// Look up a content value by key
    pub fn get(&self, key: &str) -> Option<&str> {
        self.contents
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Records sharing a topic and source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogGroup {
    /// Topic of the group
    pub topic: String,
    /// Source of the group
    pub source: String,
    /// Records in the group
    pub logs: Vec<LogRecord>,
}

/// A batch of log groups returned by one pull
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogGroupList {
    /// Log groups in pull order
    pub log_groups: Vec<LogGroup>,
}

impl LogGroupList {
    /// Create an empty batch
    pub fn empty() -> Self {
        Self::default()
    }

    /// Number of log groups in the batch
    pub fn len(&self) -> usize {
        self.log_groups.len()
    }

    /// Check if the batch has no log groups
    pub fn is_empty(&self) -> bool {
        self.log_groups.is_empty()
    }

    /// Total number of records across all log groups
    pub fn record_count(&self) -> usize {
        self.log_groups.iter().map(|g| g.logs.len()).sum()
    }
}

/// Operations the consumer needs from the log service
///
/// Implementations are shared between the heartbeat thread and every shard
/// worker, so every method takes `&self`.
pub trait LogServiceClient: Send + Sync {
    /// Register a consumer group
    ///
    /// Creating an existing group fails with a `ConsumerGroupAlreadyExist`
    /// service error.
    fn create_consumer_group(&self, project: &str, logstore: &str, group: &ConsumerGroupSpec) -> Result<()>;

    /// Report held shards and receive the shards assigned to the member
    fn heartbeat(
        &self,
        project: &str,
        logstore: &str,
        group_name: &str,
        member_name: &str,
        held_shards: &[ShardId],
    ) -> Result<Vec<ShardId>>;

    /// Write a shard checkpoint
    ///
    /// `force_success` makes the service accept the write from a member that
    /// no longer owns the shard.
    #[allow(clippy::too_many_arguments)]
    fn update_checkpoint(
        &self,
        project: &str,
        logstore: &str,
        group_name: &str,
        member_name: &str,
        shard_id: ShardId,
        checkpoint: &str,
        force_success: bool,
    ) -> Result<()>;

    /// List every checkpoint of a group
    fn get_checkpoints(&self, project: &str, logstore: &str, group_name: &str) -> Result<Vec<Checkpoint>>;

    /// Resolve `from` (a checkpoint, `begin`, `end` or unix seconds) to a cursor
    fn get_cursor(&self, project: &str, logstore: &str, shard_id: ShardId, from: &str) -> Result<String>;

    /// Pull up to `max_count` log groups starting at `cursor`
    ///
    /// Returns the batch and the cursor following it.
    fn pull_logs(
        &self,
        project: &str,
        logstore: &str,
        shard_id: ShardId,
        cursor: &str,
        max_count: u32,
    ) -> Result<(LogGroupList, String)>;
}
