//! Shard consumption
//!
//! This module runs one worker thread per owned shard. The supervisor drives
//! the heartbeat, starts a [`ShardWorker`] for every acquired shard and stops
//! the worker of every released one. Each worker resolves its starting
//! cursor, pulls batches, hands them to a [`LogProcessor`] and commits
//! checkpoints through its [`CheckpointTracker`].

mod processor;
mod supervisor;
mod tracker;
mod worker;

pub use processor::LogProcessor;
pub use supervisor::ShardConsumerSupervisor;
pub use tracker::CheckpointTracker;
pub use worker::ShardWorker;
