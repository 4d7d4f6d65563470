//! # loghub_consumer
//!
//! Client-side consumer group coordination for partitioned log services.
//!
//! A group member registers its consumer group, heartbeats to learn which
//! shards it owns, resolves a starting cursor for every shard from the
//! committed checkpoint or a configured start position, pulls batches with a
//! bounded retry budget and commits progress back as checkpoints.
//!
//! The building blocks can be used on their own:
//!
//! - [`ConsumerClient`] registers the group and shares the configuration
//! - [`HeartbeatCoordinator`] reports and reconciles shard ownership
//! - [`CheckpointStore`] reads and writes per-shard checkpoints
//! - [`CursorResolver`] turns checkpoints and start positions into cursors
//! - [`LogPuller`] fetches batches and reports [`PullOutcome`]s
//!
//! [`ShardConsumerSupervisor`] wires them together and runs one worker thread
//! per owned shard, feeding a user [`LogProcessor`].
//!
//! The service itself is reached through the [`LogServiceClient`] trait;
//! [`InMemoryLogService`] implements it in process.

pub mod checkpoint;
pub mod client;
pub mod config;
pub mod consumer;
pub mod cursor;
pub mod error;
pub mod heartbeat;
pub mod memory;
pub mod metrics;
pub mod puller;
pub mod shard;

pub use checkpoint::CheckpointStore;
pub use client::{Checkpoint, ConsumerGroupSpec, LogGroup, LogGroupList, LogRecord, LogServiceClient, ShardId};
pub use config::{GroupConfig, RetryPolicy, StartPosition};
pub use consumer::{ConsumerClient, GroupJoin};
pub use cursor::{CursorResolver, CursorSource};
pub use error::{Error, ErrorClass, Result, ServiceError};
pub use heartbeat::{HeartbeatCoordinator, OwnedShardSet, ShardDelta};
pub use memory::{InMemoryLogService, Operation};
pub use metrics::ConsumerMetrics;
pub use puller::{LogPuller, PullOutcome};
pub use shard::{CheckpointTracker, LogProcessor, ShardConsumerSupervisor, ShardWorker};
