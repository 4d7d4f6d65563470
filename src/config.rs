//! Configuration for the consumer
//!
//! This module provides the consumer group configuration, the symbolic start
//! positions and the retry policy shared by the service facades.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::client::ConsumerGroupSpec;
use crate::error::{Error, ErrorClass, Result};

/// Default heartbeat interval in seconds
pub const DEFAULT_HEARTBEAT_INTERVAL_SECS: u64 = 20;
/// Default delay between pulls on a caught-up shard, in seconds
pub const DEFAULT_DATA_FETCH_INTERVAL_SECS: u64 = 2;
/// Default maximum number of log groups per pull
pub const DEFAULT_MAX_FETCH_LOG_GROUP_COUNT: u32 = 1000;
/// Default automatic checkpoint commit interval in milliseconds
pub const DEFAULT_AUTO_COMMIT_INTERVAL_MS: u64 = 60_000;

/// Where a shard without a checkpoint starts reading
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StartPosition {
    /// Oldest data still retained by the service
    Begin,
    /// Only data written after the consumer starts
    End,
    /// First data received at or after the given time
    Timestamp(DateTime<Utc>),
}

impl Default for StartPosition {
    fn default() -> Self {
        Self::Begin
    }
}

impl std::fmt::Display for StartPosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Begin => write!(f, "begin"),
            Self::End => write!(f, "end"),
            Self::Timestamp(ts) => write!(f, "{}", ts.to_rfc3339()),
        }
    }
}

impl FromStr for StartPosition {
    type Err = Error;

    /// Parse a start position from `begin`, `end`, unix seconds or RFC 3339
    fn from_str(s: &str) -> Result<Self> {
        let trimmed = s.trim();
        match trimmed.to_lowercase().as_str() {
            "begin" => return Ok(Self::Begin),
            "end" => return Ok(Self::End),
            _ => {}
        }

        if let Ok(secs) = trimmed.parse::<i64>() {
            return Utc
                .timestamp_opt(secs, 0)
                .single()
                .map(Self::Timestamp)
                .ok_or_else(|| Error::config(format!("Timestamp out of range: {}", s)));
        }

        DateTime::parse_from_rfc3339(trimmed)
            .map(|ts| Self::Timestamp(ts.with_timezone(&Utc)))
            .map_err(|_| Error::config(format!("Unknown start position: {}", s)))
    }
}

impl StartPosition {
    /// The `from` argument understood by the cursor RPC
    pub fn as_cursor_from(&self) -> String {
        match self {
            Self::Begin => "begin".to_string(),
            Self::End => "end".to_string(),
            Self::Timestamp(ts) => ts.timestamp().to_string(),
        }
    }
}

/// Backoff and attempt budgets used by the service facades
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per pull before giving up on the batch
    pub max_pull_attempts: u32,
    /// Backoff after a forbidden (403) pull error
    pub forbidden_backoff: Duration,
    /// Backoff after any other service error during a pull
    pub service_backoff: Duration,
    /// Backoff between checkpoint listing attempts
    pub checkpoint_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_pull_attempts: 3,
            forbidden_backoff: Duration::from_secs(5),
            service_backoff: Duration::from_millis(200),
            checkpoint_backoff: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Backoff before the next pull attempt for an error of the given class
    ///
    /// Unclassified errors are retried immediately.
    pub fn backoff_for(&self, class: ErrorClass) -> Option<Duration> {
        match class {
            ErrorClass::Forbidden => Some(self.forbidden_backoff),
            ErrorClass::Conflict | ErrorClass::Transient => Some(self.service_backoff),
            ErrorClass::Unknown => None,
        }
    }

    /// Set the pull attempt budget
    pub fn with_max_pull_attempts(mut self, attempts: u32) -> Self {
        self.max_pull_attempts = attempts;
        self
    }

    /// Set the forbidden backoff
    pub fn with_forbidden_backoff(mut self, backoff: Duration) -> Self {
        self.forbidden_backoff = backoff;
        self
    }

    /// Set the service error backoff
    pub fn with_service_backoff(mut self, backoff: Duration) -> Self {
        self.service_backoff = backoff;
        self
    }

    /// Set the checkpoint listing backoff
    pub fn with_checkpoint_backoff(mut self, backoff: Duration) -> Self {
        self.checkpoint_backoff = backoff;
        self
    }
}

/// Configuration of one consumer group member
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
#[non_exhaustive]
pub struct GroupConfig {
    // Service connection
    /// Log service endpoint
    pub endpoint: String,
    /// Access key id
    pub access_key_id: String,
    /// Access key secret
    pub access_key_secret: String,
    /// Optional STS security token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_token: Option<String>,

    // Consumed log
    /// Project owning the logstore
    pub project: String,
    /// Logstore to consume
    pub logstore: String,

    // Group membership
    /// Consumer group name
    pub group_name: String,
    /// Member name, unique within the group
    pub member_name: String,
    /// Whether shards are consumed in order across splits and merges
    pub in_order: bool,

    // Tunables
    /// Seconds between heartbeats
    pub heartbeat_interval_secs: u64,
    /// Seconds to wait before polling a caught-up shard again
    pub data_fetch_interval_secs: u64,
    /// Maximum number of log groups returned by one pull
    pub max_fetch_log_group_count: u32,
    /// Start position for shards without a checkpoint
    pub start_position: StartPosition,
    /// Whether workers commit checkpoints on their own
    pub auto_commit: bool,
    /// Milliseconds between automatic checkpoint commits
    pub auto_commit_interval_ms: u64,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            access_key_id: String::new(),
            access_key_secret: String::new(),
            security_token: None,

            project: String::new(),
            logstore: String::new(),

            group_name: String::new(),
            member_name: String::new(),
            in_order: false,

            heartbeat_interval_secs: DEFAULT_HEARTBEAT_INTERVAL_SECS,
            data_fetch_interval_secs: DEFAULT_DATA_FETCH_INTERVAL_SECS,
            max_fetch_log_group_count: DEFAULT_MAX_FETCH_LOG_GROUP_COUNT,
            start_position: StartPosition::Begin,
            auto_commit: true,
            auto_commit_interval_ms: DEFAULT_AUTO_COMMIT_INTERVAL_MS,
        }
    }
}

impl GroupConfig {
    /// Create a configuration for a member of a group
    pub fn new(
        endpoint: impl Into<String>,
        project: impl Into<String>,
        logstore: impl Into<String>,
        group_name: impl Into<String>,
        member_name: impl Into<String>,
    ) -> Self {
        Self {
            endpoint: endpoint.into(),
            project: project.into(),
            logstore: logstore.into(),
            group_name: group_name.into(),
            member_name: member_name.into(),
            ..Self::default()
        }
    }

    /// Set the access key pair
    pub fn with_credentials(mut self, key_id: impl Into<String>, key_secret: impl Into<String>) -> Self {
        self.access_key_id = key_id.into();
        self.access_key_secret = key_secret.into();
        self
    }

    /// Set the STS security token
    pub fn with_security_token(mut self, token: impl Into<String>) -> Self {
        self.security_token = Some(token.into());
        self
    }

    /// Set the heartbeat interval in seconds
    pub fn with_heartbeat_interval_secs(mut self, secs: u64) -> Self {
        self.heartbeat_interval_secs = secs;
        self
    }

    /// Set the data fetch interval in seconds
    pub fn with_data_fetch_interval_secs(mut self, secs: u64) -> Self {
        self.data_fetch_interval_secs = secs;
        self
    }

    /// Set the maximum number of log groups per pull
    pub fn with_max_fetch_log_group_count(mut self, count: u32) -> Self {
        self.max_fetch_log_group_count = count;
        self
    }

    /// Set in-order consumption
    pub fn with_in_order(mut self, in_order: bool) -> Self {
        self.in_order = in_order;
        self
    }

    /// Set the start position for shards without a checkpoint
    pub fn with_start_position(mut self, position: StartPosition) -> Self {
        self.start_position = position;
        self
    }

    /// Enable or disable automatic checkpoint commits
    pub fn with_auto_commit(mut self, enabled: bool) -> Self {
        self.auto_commit = enabled;
        self
    }

    /// Set the automatic commit interval in milliseconds
    pub fn with_auto_commit_interval_ms(mut self, ms: u64) -> Self {
        self.auto_commit_interval_ms = ms;
        self
    }

    /// Replace zero-valued tunables with their defaults
    ///
    /// Idempotent: a second call leaves the configuration unchanged.
    pub fn apply_defaults(&mut self) {
        if self.heartbeat_interval_secs == 0 {
            self.heartbeat_interval_secs = DEFAULT_HEARTBEAT_INTERVAL_SECS;
        }
        if self.data_fetch_interval_secs == 0 {
            self.data_fetch_interval_secs = DEFAULT_DATA_FETCH_INTERVAL_SECS;
        }
        if self.max_fetch_log_group_count == 0 {
            self.max_fetch_log_group_count = DEFAULT_MAX_FETCH_LOG_GROUP_COUNT;
        }
        if self.auto_commit_interval_ms == 0 {
            self.auto_commit_interval_ms = DEFAULT_AUTO_COMMIT_INTERVAL_MS;
        }
        if self.member_name.trim().is_empty() {
            self.member_name = format!("member-{}", Uuid::new_v4());
        }
    }

    /// Validate the structural parts of the configuration
    ///
    /// Tunables are never rejected; they are defaulted instead.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("endpoint", &self.endpoint),
            ("access key id", &self.access_key_id),
            ("access key secret", &self.access_key_secret),
            ("project", &self.project),
            ("logstore", &self.logstore),
            ("consumer group name", &self.group_name),
        ];

        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(Error::config(format!("The {} must not be empty", name)));
            }
        }

        Ok(())
    }

    /// Heartbeat timeout advertised to the service, twice the interval
    pub fn heartbeat_timeout_secs(&self) -> u64 {
        self.heartbeat_interval_secs * 2
    }

    /// Identity used to tag requests at the protocol level
    pub fn member_identity(&self) -> String {
        format!("{}_{}", self.group_name, self.member_name)
    }

    /// Group record sent when registering the group
    pub fn group_spec(&self) -> ConsumerGroupSpec {
        ConsumerGroupSpec {
            group_name: self.group_name.clone(),
            timeout_secs: self.heartbeat_timeout_secs(),
            in_order: self.in_order,
        }
    }

    /// Get the heartbeat interval as a Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    /// Get the data fetch interval as a Duration
    pub fn data_fetch_interval(&self) -> Duration {
        Duration::from_secs(self.data_fetch_interval_secs)
    }

    /// Get the automatic commit interval as a Duration
    pub fn auto_commit_interval(&self) -> Duration {
        Duration::from_millis(self.auto_commit_interval_ms)
    }

    /// Parse a configuration from JSON, then apply defaults and validate
    pub fn from_json_str(json: &str) -> Result<Self> {
        let mut config: Self = serde_json::from_str(json)?;
        config.apply_defaults();
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a JSON file
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    /// Create a human-readable string representation of the configuration
    pub fn to_string_pretty(&self) -> String {
        let mut result = String::new();

        result.push_str("=== Consumer Configuration ===\n\n");

        result.push_str("Service:\n");
        result.push_str(&format!("  Endpoint: {}\n", self.endpoint));
        result.push_str(&format!("  Access Key Id: {}\n", mask(&self.access_key_id)));
        result.push_str("  Access Key Secret: ****\n");
        result.push_str(&format!("  Project: {}\n", self.project));
        result.push_str(&format!("  Logstore: {}\n", self.logstore));

        result.push_str("\nGroup:\n");
        result.push_str(&format!("  Group Name: {}\n", self.group_name));
        result.push_str(&format!("  Member Name: {}\n", self.member_name));
        result.push_str(&format!("  In Order: {}\n", self.in_order));
        result.push_str(&format!("  Heartbeat Interval: {} s\n", self.heartbeat_interval_secs));
        result.push_str(&format!("  Heartbeat Timeout: {} s\n", self.heartbeat_timeout_secs()));

        result.push_str("\nFetching:\n");
        result.push_str(&format!("  Data Fetch Interval: {} s\n", self.data_fetch_interval_secs));
        result.push_str(&format!("  Max Log Groups per Fetch: {}\n", self.max_fetch_log_group_count));
        result.push_str(&format!("  Start Position: {}\n", self.start_position));
        result.push_str(&format!("  Auto Commit: {}\n", self.auto_commit));
        result.push_str(&format!("  Auto Commit Interval: {} ms\n", self.auto_commit_interval_ms));

        result
    }
}

fn mask(secret: &str) -> String {
    let visible: String = secret.chars().take(4).collect();
    format!("{}****", visible)
}
