//! Bounded-retry log pulls
//!
//! A pull that keeps failing never tears down a shard worker. After the
//! attempt budget is spent the puller answers [`PullOutcome::Retry`] and the
//! caller pulls the same cursor again on its next iteration.

use std::thread;
use std::time::Instant;

use tracing::{info, warn};

use crate::client::{LogGroupList, ShardId};
use crate::consumer::ConsumerClient;
use crate::error::ErrorClass;

/// Result of one pull
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PullOutcome {
    /// The service answered; an empty batch means the shard is caught up
    Delivered {
        /// Pulled log groups
        logs: LogGroupList,
        /// Cursor following the batch
        next_cursor: String,
    },
    /// Every attempt failed; pull the same cursor again later
    Retry,
}

impl PullOutcome {
    /// Check if the pull must be retried with the same cursor
    pub fn is_retry(&self) -> bool {
        matches!(self, Self::Retry)
    }

    /// Check if the service answered with no data
    pub fn is_caught_up(&self) -> bool {
        matches!(self, Self::Delivered { logs, .. } if logs.is_empty())
    }
}

/// Pulls log batches for one group member
#[derive(Debug, Clone)]
pub struct LogPuller {
    client: ConsumerClient,
}

impl LogPuller {
    /// Create a puller over a consumer handle
    pub fn new(client: ConsumerClient) -> Self {
        Self { client }
    }

    /// Pull one batch from `cursor`, retrying within the attempt budget
    pub fn pull_logs(&self, shard_id: ShardId, cursor: &str) -> PullOutcome {
        let config = self.client.config();
        let policy = self.client.retry_policy();
        let metrics = self.client.metrics();
        let attempts = policy.max_pull_attempts.max(1);

        for attempt in 1..=attempts {
            let start = Instant::now();
            let result = self.client.service().pull_logs(
                &config.project,
                &config.logstore,
                shard_id,
                cursor,
                config.max_fetch_log_group_count,
            );
            metrics.record_pull_attempt(start.elapsed());

            let err = match result {
                Ok((logs, next_cursor)) => {
                    metrics.add_log_groups_fetched(logs.len());
                    return PullOutcome::Delivered { logs, next_cursor };
                }
                Err(err) => err,
            };
            metrics.increment_pull_failures();

            let class = err.classify();
            match class {
                ErrorClass::Unknown => {
                    info!(shard_id, cursor, attempt, error = %err, "unknown error when pulling logs");
                }
                _ => {
                    info!(shard_id, attempt, class = %class, error = %err, "pulling logs failed, trying again");
                }
            }

            if attempt < attempts {
                if let Some(backoff) = policy.backoff_for(class) {
                    thread::sleep(backoff);
                }
            }
        }

        metrics.increment_pulls_exhausted();
        warn!(shard_id, cursor, attempts, "pull attempts exhausted, the same cursor will be retried");
        PullOutcome::Retry
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::LogGroup;
    use crate::config::{GroupConfig, RetryPolicy};
    use crate::error::{Error, Result};
    use crate::memory::{InMemoryLogService, Operation};
    use std::sync::Arc;
    use std::time::Duration;

    fn puller(service: Arc<InMemoryLogService>, retry: RetryPolicy) -> Result<LogPuller> {
        let config = GroupConfig::new("endpoint", "proj", "store", "group", "m1")
            .with_credentials("id", "secret")
            .with_max_fetch_log_group_count(2);
        Ok(LogPuller::new(ConsumerClient::new(config, service)?.with_retry_policy(retry)))
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy::default()
            .with_forbidden_backoff(Duration::from_millis(1))
            .with_service_backoff(Duration::from_millis(1))
    }

    #[test]
    fn test_delivered_batch_advances() -> Result<()> {
        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 1));
        service.append(0, vec![LogGroup::default(); 3]);
        let puller = puller(service.clone(), fast_policy())?;

        match puller.pull_logs(0, "cursor-0") {
            PullOutcome::Delivered { logs, next_cursor } => {
                assert_eq!(logs.len(), 2);
                assert_eq!(next_cursor, "cursor-2");
            }
            PullOutcome::Retry => panic!("expected a batch"),
        }
        Ok(())
    }

    #[test]
    fn test_caught_up_is_not_a_failure() -> Result<()> {
        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 1));
        let puller = puller(service, fast_policy())?;

        let outcome = puller.pull_logs(0, "cursor-0");
        assert!(outcome.is_caught_up());
        assert!(!outcome.is_retry());
        Ok(())
    }

    #[test]
    fn test_recovers_within_budget() -> Result<()> {
        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 1));
        service.append(0, vec![LogGroup::default()]);
        service.fail_times(Operation::PullLogs, 2, 502, "ServerBusy");
        let puller = puller(service.clone(), fast_policy())?;

        assert!(!puller.pull_logs(0, "cursor-0").is_retry());
        assert_eq!(service.calls(Operation::PullLogs), 3);
        Ok(())
    }

    #[test]
    fn test_exhausted_budget_returns_retry_and_same_cursor_is_accepted() -> Result<()> {
        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 1));
        service.append(0, vec![LogGroup::default()]);
        service.fail_times(Operation::PullLogs, 2, 500, "InternalServerError");
        service.fail_next(Operation::PullLogs, Error::transport("timed out"));
        let puller = puller(service.clone(), fast_policy())?;

        assert_eq!(puller.pull_logs(0, "cursor-0"), PullOutcome::Retry);
        assert_eq!(service.calls(Operation::PullLogs), 3);
        assert_eq!(puller.client.metrics().get_pulls_exhausted(), 1);

        match puller.pull_logs(0, "cursor-0") {
            PullOutcome::Delivered { logs, next_cursor } => {
                assert_eq!(logs.len(), 1);
                assert_eq!(next_cursor, "cursor-1");
            }
            PullOutcome::Retry => panic!("same cursor must be accepted"),
        }
        Ok(())
    }

    #[test]
    fn test_forbidden_backs_off_longer_than_other_errors() -> Result<()> {
        let retry = RetryPolicy::default()
            .with_forbidden_backoff(Duration::from_millis(150))
            .with_service_backoff(Duration::from_millis(1));

        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 1));
        service.fail_times(Operation::PullLogs, 3, 403, "Unauthorized");
        let forbidden = puller(service, retry)?;
        let start = Instant::now();
        assert!(forbidden.pull_logs(0, "cursor-0").is_retry());
        // Two backoffs: none after the last attempt
        assert!(start.elapsed() >= Duration::from_millis(300));

        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 1));
        service.fail_times(Operation::PullLogs, 3, 500, "InternalServerError");
        let other = puller(service.clone(), retry)?;
        let start = Instant::now();
        assert!(other.pull_logs(0, "cursor-0").is_retry());
        assert!(start.elapsed() < Duration::from_millis(150));
        assert_eq!(service.calls(Operation::PullLogs), 3);
        Ok(())
    }

    #[test]
    fn test_unknown_errors_count_without_backoff() -> Result<()> {
        let retry = RetryPolicy::default()
            .with_forbidden_backoff(Duration::from_secs(5))
            .with_service_backoff(Duration::from_secs(5));
        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 1));
        for _ in 0..3 {
            service.fail_next(Operation::PullLogs, Error::transport("connection refused"));
        }
        let puller = puller(service.clone(), retry)?;

        let start = Instant::now();
        assert!(puller.pull_logs(0, "cursor-0").is_retry());
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(service.calls(Operation::PullLogs), 3);
        Ok(())
    }
}
