use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use tracing::{debug, info, warn};

use crate::checkpoint::CheckpointStore;
use crate::client::ShardId;
use crate::consumer::ConsumerClient;
use crate::cursor::CursorResolver;
use crate::error::{Error, Result};
use crate::puller::{LogPuller, PullOutcome};
use crate::shard::{CheckpointTracker, LogProcessor};

/// Handle to the thread consuming one shard
///
/// Dropping the handle signals the worker to stop without waiting for it.
#[derive(Debug)]
pub struct ShardWorker {
    shard_id: ShardId,
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<()>>,
}

impl ShardWorker {
    /// Start consuming a shard on a new thread
    pub fn spawn(shard_id: ShardId, client: ConsumerClient, processor: Arc<dyn LogProcessor>) -> Result<Self> {
        let (stop_tx, stop_rx) = bounded(1);

        let handle = thread::Builder::new()
            .name(format!("shard-{}", shard_id))
            .spawn(move || ShardLoop::new(shard_id, client, processor, stop_rx).run())?;

        Ok(Self {
            shard_id,
            stop_tx,
            handle: Some(handle),
        })
    }

    /// Shard consumed by this worker
    pub fn shard_id(&self) -> ShardId {
        self.shard_id
    }

    /// Ask the worker to stop after its current pull
    pub fn stop(&self) {
        let _ = self.stop_tx.try_send(());
    }

    /// Check if the worker thread has exited
    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, JoinHandle::is_finished)
    }

    /// Wait for the worker thread to exit
    pub fn join(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| Error::shard(format!("worker of shard {} panicked", self.shard_id))),
            None => Ok(()),
        }
    }
}

impl Drop for ShardWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

/// State owned by a worker thread
struct ShardLoop {
    shard_id: ShardId,
    client: ConsumerClient,
    processor: Arc<dyn LogProcessor>,
    checkpoints: CheckpointStore,
    resolver: CursorResolver,
    puller: LogPuller,
    tracker: CheckpointTracker,
    stop_rx: Receiver<()>,
    stop_requested: bool,
}

impl ShardLoop {
    fn new(shard_id: ShardId, client: ConsumerClient, processor: Arc<dyn LogProcessor>, stop_rx: Receiver<()>) -> Self {
        let checkpoints = CheckpointStore::new(client.clone());
        Self {
            shard_id,
            resolver: CursorResolver::new(client.clone()),
            puller: LogPuller::new(client.clone()),
            tracker: CheckpointTracker::new(shard_id, checkpoints.clone()),
            checkpoints,
            client,
            processor,
            stop_rx,
            stop_requested: false,
        }
    }

    fn run(mut self) {
        info!(shard_id = self.shard_id, "shard worker started");

        if let Some(cursor) = self.initial_cursor() {
            self.consume(cursor);
        }

        self.finish();
    }

    /// Non-blocking check of the stop signal; latches once seen
    fn stopped(&mut self) -> bool {
        if !self.stop_requested {
            self.stop_requested = !matches!(self.stop_rx.try_recv(), Err(TryRecvError::Empty));
        }
        self.stop_requested
    }

    /// Sleep for `delay` unless a stop arrives first; returns whether to stop
    fn wait(&mut self, delay: Duration) -> bool {
        if self.stop_requested {
            return true;
        }
        self.stop_requested = !matches!(self.stop_rx.recv_timeout(delay), Err(RecvTimeoutError::Timeout));
        self.stop_requested
    }

    fn initial_cursor(&mut self) -> Option<String> {
        let retry_delay = self.client.config().data_fetch_interval();

        loop {
            if self.stopped() {
                return None;
            }

            // A stop must not wait for the checkpoint listing to recover
            let checkpoints = self.checkpoints.clone();
            let checkpoint = checkpoints.get_checkpoint_interruptible(self.shard_id, |backoff| self.wait(backoff))?;

            match self.resolver.cursor_from_checkpoint(self.shard_id, checkpoint) {
                Ok(cursor) => {
                    info!(shard_id = self.shard_id, cursor = %cursor, "shard starts consuming");
                    return Some(cursor);
                }
                Err(err) => {
                    warn!(shard_id = self.shard_id, error = %err, "failed to resolve starting cursor");
                    if self.wait(retry_delay) {
                        return None;
                    }
                }
            }
        }
    }

    fn consume(&mut self, mut cursor: String) {
        let config = self.client.config();
        let fetch_interval = config.data_fetch_interval();
        let auto_commit = config.auto_commit;
        let commit_interval = config.auto_commit_interval();

        loop {
            if self.stopped() {
                return;
            }

            let (logs, next_cursor) = match self.puller.pull_logs(self.shard_id, &cursor) {
                PullOutcome::Delivered { logs, next_cursor } => (logs, next_cursor),
                PullOutcome::Retry => {
                    if self.wait(fetch_interval) {
                        return;
                    }
                    continue;
                }
            };

            // Ownership loss wins over a batch that arrived late
            if self.stopped() {
                debug!(shard_id = self.shard_id, "discarding batch pulled after stop");
                return;
            }

            let caught_up = logs.is_empty();
            if !caught_up {
                if let Err(err) = self.processor.process(self.shard_id, &logs) {
                    warn!(shard_id = self.shard_id, cursor = %cursor, error = %err, "processor failed, batch will be pulled again");
                    if self.wait(fetch_interval) {
                        return;
                    }
                    continue;
                }
                debug!(
                    shard_id = self.shard_id,
                    log_groups = logs.len(),
                    records = logs.record_count(),
                    "batch processed"
                );
            }

            if next_cursor != cursor {
                self.tracker.advance(next_cursor.clone());
            }
            cursor = next_cursor;

            // Failed commits stay pending and are retried on the next batch
            if auto_commit {
                let _ = self.tracker.flush_if_due(commit_interval);
            }

            if caught_up && self.wait(fetch_interval) {
                return;
            }
        }
    }

    fn finish(&mut self) {
        match self.tracker.flush(true) {
            Ok(true) => info!(
                shard_id = self.shard_id,
                checkpoint = self.tracker.committed().unwrap_or_default(),
                "final checkpoint flushed"
            ),
            Ok(false) => {}
            Err(err) => warn!(shard_id = self.shard_id, error = %err, "final checkpoint flush failed"),
        }

        self.processor.shutdown(self.shard_id);
        info!(shard_id = self.shard_id, "shard worker stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{LogGroup, LogGroupList, LogRecord};
    use crate::config::GroupConfig;
    use crate::memory::{InMemoryLogService, Operation};
    use parking_lot::Mutex;
    use std::time::Instant;

    fn client(service: Arc<InMemoryLogService>) -> Result<ConsumerClient> {
        let config = GroupConfig::new("endpoint", "proj", "store", "group", "m1")
            .with_credentials("id", "secret")
            .with_data_fetch_interval_secs(1)
            .with_max_fetch_log_group_count(2);
        let client = ConsumerClient::new(config, service)?;
        client.ensure_group_exists();
        Ok(client)
    }

    fn groups(range: std::ops::Range<u32>) -> Vec<LogGroup> {
        range
            .map(|i| LogGroup {
                logs: vec![LogRecord::new(i, [("seq", i.to_string())])],
                ..LogGroup::default()
            })
            .collect()
    }

    fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn test_worker_consumes_and_flushes_on_stop() -> Result<()> {
        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 1));
        service.append(0, groups(0..5));
        service.assign("m1", [0]);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let processor = move |_shard: ShardId, logs: &LogGroupList| -> Result<()> {
            sink.lock().extend(logs.log_groups.iter().map(|g| g.logs[0].time));
            Ok(())
        };

        let worker = ShardWorker::spawn(0, client(service.clone())?, Arc::new(processor))?;
        assert!(wait_until(Duration::from_secs(5), || seen.lock().len() == 5));

        worker.stop();
        worker.join()?;

        assert_eq!(*seen.lock(), vec![0, 1, 2, 3, 4]);
        assert_eq!(service.checkpoint("group", 0).unwrap().checkpoint, "cursor-5");
        Ok(())
    }

    #[test]
    fn test_processor_error_repulls_same_batch() -> Result<()> {
        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 1));
        service.append(0, groups(0..1));
        service.assign("m1", [0]);

        let calls = Arc::new(Mutex::new(0usize));
        let counter = calls.clone();
        let processor = move |_shard: ShardId, _logs: &LogGroupList| -> Result<()> {
            let mut calls = counter.lock();
            *calls += 1;
            if *calls == 1 {
                return Err(Error::processor("downstream unavailable"));
            }
            Ok(())
        };

        let worker = ShardWorker::spawn(0, client(service.clone())?, Arc::new(processor))?;
        assert!(wait_until(Duration::from_secs(5), || *calls.lock() >= 2));
        worker.stop();
        worker.join()?;

        assert_eq!(*calls.lock(), 2);
        assert_eq!(service.checkpoint("group", 0).unwrap().checkpoint, "cursor-1");
        Ok(())
    }

    #[test]
    fn test_pull_failures_keep_worker_alive() -> Result<()> {
        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 1));
        service.append(0, groups(0..2));
        service.assign("m1", [0]);
        service.fail_times(Operation::PullLogs, 3, 500, "InternalServerError");

        let seen = Arc::new(Mutex::new(0usize));
        let sink = seen.clone();
        let processor = move |_shard: ShardId, logs: &LogGroupList| -> Result<()> {
            *sink.lock() += logs.len();
            Ok(())
        };

        let client = client(service.clone())?.with_retry_policy(
            crate::config::RetryPolicy::default().with_service_backoff(Duration::from_millis(1)),
        );
        let worker = ShardWorker::spawn(0, client, Arc::new(processor))?;
        assert!(wait_until(Duration::from_secs(5), || *seen.lock() == 2));
        assert!(!worker.is_finished());

        worker.stop();
        worker.join()?;
        Ok(())
    }

    #[test]
    fn test_stop_interrupts_checkpoint_outage() -> Result<()> {
        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 1));
        service.assign("m1", [0]);
        service.fail_times(Operation::GetCheckpoints, 50, 500, "InternalServerError");

        let client = client(service.clone())?.with_retry_policy(
            crate::config::RetryPolicy::default().with_checkpoint_backoff(Duration::from_millis(100)),
        );
        let processor = |_shard: ShardId, _logs: &LogGroupList| -> Result<()> { Ok(()) };
        let worker = ShardWorker::spawn(0, client, Arc::new(processor))?;

        thread::sleep(Duration::from_millis(300));
        let stopping = Instant::now();
        worker.stop();
        worker.join()?;

        assert!(stopping.elapsed() < Duration::from_millis(500));
        assert!(service.calls(Operation::GetCheckpoints) < 10);
        assert_eq!(service.calls(Operation::PullLogs), 0);
        Ok(())
    }

    #[test]
    fn test_batch_pulled_after_stop_is_discarded() -> Result<()> {
        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 1));
        service.append(0, groups(0..4));
        service.assign("m1", [0]);

        let client = client(service.clone())?;
        CheckpointStore::new(client.clone()).update_checkpoint(0, "cursor-1", false)?;
        service.set_pull_delay(0, Duration::from_millis(500));

        let calls = Arc::new(Mutex::new(0usize));
        let counter = calls.clone();
        let processor = move |_shard: ShardId, _logs: &LogGroupList| -> Result<()> {
            *counter.lock() += 1;
            Ok(())
        };

        let worker = ShardWorker::spawn(0, client, Arc::new(processor))?;
        assert!(wait_until(Duration::from_secs(5), || service.calls(Operation::PullLogs) == 1));
        worker.stop();
        worker.join()?;

        assert_eq!(*calls.lock(), 0);
        assert_eq!(service.shard_len(0), 4);
        assert_eq!(service.checkpoint("group", 0).unwrap().checkpoint, "cursor-1");
        Ok(())
    }
}
