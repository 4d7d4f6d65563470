use crate::client::{LogGroupList, ShardId};
use crate::error::Result;

/// User callback receiving the batches of every owned shard
///
/// One processor is shared by all shard workers, so calls for different
/// shards run concurrently. Calls for a single shard are sequential and in
/// cursor order.
pub trait LogProcessor: Send + Sync {
    /// Process one non-empty batch
    ///
    /// Returning an error leaves the cursor where it was; the batch is pulled
    /// and processed again.
    fn process(&self, shard_id: ShardId, logs: &LogGroupList) -> Result<()>;

    /// Called once when the worker of a shard stops
    fn shutdown(&self, _shard_id: ShardId) {}
}

impl<F> LogProcessor for F
where
    F: Fn(ShardId, &LogGroupList) -> Result<()> + Send + Sync,
{
    fn process(&self, shard_id: ShardId, logs: &LogGroupList) -> Result<()> {
        self(shard_id, logs)
    }
}
