//! Shared consumer handle
//!
//! [`ConsumerClient`] bundles the service client, the resolved configuration,
//! the retry policy and the metrics. It is cheap to clone and every facade
//! (checkpoints, cursors, pulls, heartbeats) holds one.

use std::sync::Arc;

use tracing::{info, warn};

use crate::client::LogServiceClient;
use crate::config::{GroupConfig, RetryPolicy};
use crate::error::{Error, ErrorClass, Result};
use crate::metrics::ConsumerMetrics;

/// Outcome of registering the consumer group
#[derive(Debug)]
pub enum GroupJoin {
    /// The group did not exist and was created
    Created,
    /// The group already existed; the member joins it
    Joined,
    /// Registration failed; heartbeats will surface persistent problems
    Failed(Error),
}

impl GroupJoin {
    /// Whether the member can proceed as part of the group
    pub fn is_member(&self) -> bool {
        matches!(self, Self::Created | Self::Joined)
    }
}

/// Shared handle to the log service for one group member
#[derive(Clone)]
pub struct ConsumerClient {
    service: Arc<dyn LogServiceClient>,
    config: Arc<GroupConfig>,
    retry: RetryPolicy,
    metrics: Arc<ConsumerMetrics>,
}

impl ConsumerClient {
    /// Create a handle, applying configuration defaults and validating it
    ///
    /// No request is sent to the service.
    pub fn new(mut config: GroupConfig, service: Arc<dyn LogServiceClient>) -> Result<Self> {
        config.apply_defaults();
        config.validate()?;

        Ok(Self {
            service,
            config: Arc::new(config),
            retry: RetryPolicy::default(),
            metrics: Arc::new(ConsumerMetrics::new()),
        })
    }

    /// Replace the retry policy
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Share an existing metrics collector
    pub fn with_metrics(mut self, metrics: Arc<ConsumerMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Get the resolved configuration
    pub fn config(&self) -> &GroupConfig {
        &self.config
    }

    /// Get the retry policy
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Get the metrics collector
    pub fn metrics(&self) -> &Arc<ConsumerMetrics> {
        &self.metrics
    }

    /// Get the underlying service client
    pub fn service(&self) -> &dyn LogServiceClient {
        self.service.as_ref()
    }

    /// Create the consumer group unless it already exists
    ///
    /// Best effort: an existing group counts as joined and any other failure
    /// is logged and returned as [`GroupJoin::Failed`] without aborting.
    pub fn ensure_group_exists(&self) -> GroupJoin {
        let config = &self.config;
        let spec = config.group_spec();

        match self.service.create_consumer_group(&config.project, &config.logstore, &spec) {
            Ok(()) => {
                info!(
                    group = %config.group_name,
                    member = %config.member_name,
                    timeout_secs = spec.timeout_secs,
                    in_order = spec.in_order,
                    "created consumer group"
                );
                GroupJoin::Created
            }
            Err(err) if err.classify() == ErrorClass::Conflict => {
                info!(
                    group = %config.group_name,
                    member = %config.member_name,
                    "new consumer joins the existing consumer group"
                );
                GroupJoin::Joined
            }
            Err(err) => {
                warn!(group = %config.group_name, error = %err, "create consumer group error");
                GroupJoin::Failed(err)
            }
        }
    }
}

impl std::fmt::Debug for ConsumerClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConsumerClient")
            .field("group", &self.config.group_name)
            .field("member", &self.config.member_name)
            .field("retry", &self.retry)
            .finish()
    }
}
