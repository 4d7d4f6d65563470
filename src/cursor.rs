//! Cursor resolution
//!
//! Turns a checkpoint or a symbolic start position into a cursor usable for
//! the next pull.

use chrono::{DateTime, Utc};
use tracing::debug;

use crate::checkpoint::CheckpointStore;
use crate::client::ShardId;
use crate::config::StartPosition;
use crate::consumer::ConsumerClient;
use crate::error::Result;

/// What a cursor is resolved from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CursorSource {
    /// A previously committed checkpoint token
    Checkpoint(String),
    /// Oldest retained data
    Begin,
    /// Data written from now on
    End,
    /// First data received at or after the given time
    Timestamp(DateTime<Utc>),
}

impl CursorSource {
    /// Use the checkpoint when present, the start position otherwise
    pub fn from_checkpoint_or(checkpoint: String, fallback: StartPosition) -> Self {
        if checkpoint.is_empty() {
            fallback.into()
        } else {
            Self::Checkpoint(checkpoint)
        }
    }

    /// The `from` argument of the cursor RPC
    pub fn as_from(&self) -> String {
        match self {
            Self::Checkpoint(token) => token.clone(),
            Self::Begin => StartPosition::Begin.as_cursor_from(),
            Self::End => StartPosition::End.as_cursor_from(),
            Self::Timestamp(ts) => StartPosition::Timestamp(*ts).as_cursor_from(),
        }
    }
}

impl From<StartPosition> for CursorSource {
    fn from(position: StartPosition) -> Self {
        match position {
            StartPosition::Begin => Self::Begin,
            StartPosition::End => Self::End,
            StartPosition::Timestamp(ts) => Self::Timestamp(ts),
        }
    }
}

/// Resolves cursors for one group member
#[derive(Debug, Clone)]
pub struct CursorResolver {
    client: ConsumerClient,
}

impl CursorResolver {
    /// Create a resolver over a consumer handle
    pub fn new(client: ConsumerClient) -> Self {
        Self { client }
    }

    /// Resolve a cursor with a single request, without retry
    pub fn get_cursor(&self, shard_id: ShardId, from: &CursorSource) -> Result<String> {
        let config = self.client.config();
        let cursor = self
            .client
            .service()
            .get_cursor(&config.project, &config.logstore, shard_id, &from.as_from())?;
        debug!(shard_id, from = ?from, cursor = %cursor, "resolved cursor");
        Ok(cursor)
    }

    /// Resolve the cursor a newly acquired shard starts from
    ///
    /// The committed checkpoint wins; the configured start position is used
    /// when the shard has none.
    pub fn initial_cursor(&self, shard_id: ShardId, checkpoints: &CheckpointStore) -> Result<String> {
        self.cursor_from_checkpoint(shard_id, checkpoints.get_checkpoint(shard_id))
    }

    /// Resolve a cursor from an already fetched checkpoint, empty if none
    pub fn cursor_from_checkpoint(&self, shard_id: ShardId, checkpoint: String) -> Result<String> {
        let source = CursorSource::from_checkpoint_or(checkpoint, self.client.config().start_position);
        self.get_cursor(shard_id, &source)
    }
}
