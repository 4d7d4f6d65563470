use std::collections::HashMap;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{bounded, select, Receiver, Sender};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::client::ShardId;
use crate::consumer::{ConsumerClient, GroupJoin};
use crate::error::{Error, Result};
use crate::heartbeat::{HeartbeatCoordinator, OwnedShardSet, ShardDelta};
use crate::metrics::ConsumerMetrics;
use crate::shard::{LogProcessor, ShardWorker};

/// How often a shard waiting on its retiring worker is checked again
const DEFERRED_RESTART_POLL: Duration = Duration::from_millis(100);

/// Runs a group member: heartbeats, ownership changes and shard workers
///
/// ```no_run
/// use std::sync::Arc;
/// use loghub_consumer::{ConsumerClient, GroupConfig, InMemoryLogService, LogGroupList, ShardConsumerSupervisor};
///
/// # fn main() -> loghub_consumer::Result<()> {
/// let service = Arc::new(InMemoryLogService::with_shards("project", "logstore", 2));
/// let config = GroupConfig::new("endpoint", "project", "logstore", "group", "member-1")
///     .with_credentials("key-id", "key-secret");
/// let client = ConsumerClient::new(config, service)?;
///
/// let processor = |shard_id: loghub_consumer::ShardId, logs: &LogGroupList| -> loghub_consumer::Result<()> {
///     println!("shard {} delivered {} log groups", shard_id, logs.len());
///     Ok(())
/// };
/// let supervisor = ShardConsumerSupervisor::new(client, Arc::new(processor));
/// supervisor.start()?;
/// // ...
/// supervisor.shutdown()?;
/// # Ok(())
/// # }
/// ```
pub struct ShardConsumerSupervisor {
    inner: Arc<Inner>,
    heartbeat: Mutex<Option<HeartbeatThread>>,
    wake_rx: Receiver<()>,
}

struct HeartbeatThread {
    stop_tx: Sender<()>,
    handle: JoinHandle<()>,
}

#[derive(Default)]
struct WorkerSet {
    active: HashMap<ShardId, ShardWorker>,
    retiring: Vec<ShardWorker>,
}

struct Inner {
    client: ConsumerClient,
    processor: Arc<dyn LogProcessor>,
    coordinator: HeartbeatCoordinator,
    workers: Mutex<WorkerSet>,
    /// Serializes heartbeat ticks with the worker changes they cause
    reconcile: Mutex<()>,
    /// Wakes the heartbeat thread when a restart was deferred
    wake_tx: Sender<()>,
    is_open: RwLock<bool>,
}

impl ShardConsumerSupervisor {
    /// Create a supervisor; nothing runs until [`start`](Self::start)
    pub fn new(client: ConsumerClient, processor: Arc<dyn LogProcessor>) -> Self {
        let (wake_tx, wake_rx) = bounded(1);
        Self {
            inner: Arc::new(Inner {
                coordinator: HeartbeatCoordinator::new(client.clone()),
                client,
                processor,
                workers: Mutex::new(WorkerSet::default()),
                reconcile: Mutex::new(()),
                wake_tx,
                is_open: RwLock::new(true),
            }),
            heartbeat: Mutex::new(None),
            wake_rx,
        }
    }

    /// Register the group and start the heartbeat thread
    ///
    /// Registration failures are logged and reported in the returned
    /// [`GroupJoin`]; the heartbeat starts regardless.
    pub fn start(&self) -> Result<GroupJoin> {
        let mut heartbeat = self.heartbeat.lock();
        if !self.is_open() {
            return Err(Error::Closed);
        }
        if heartbeat.is_some() {
            return Err(Error::other("consumer already started"));
        }

        let join = self.inner.client.ensure_group_exists();

        let (stop_tx, stop_rx) = bounded(1);
        let inner = self.inner.clone();
        let wake_rx = self.wake_rx.clone();
        let interval = inner.client.config().heartbeat_interval();

        let handle = thread::Builder::new()
            .name("heartbeat".to_string())
            .spawn(move || {
                let mut next_heartbeat = Instant::now();
                loop {
                    let deferred = if Instant::now() >= next_heartbeat {
                        next_heartbeat = Instant::now() + interval;
                        match inner.heartbeat_once() {
                            Ok((_, deferred)) => deferred,
                            Err(err) => {
                                debug!(error = %err, "heartbeat tick failed, keeping current shards");
                                false
                            }
                        }
                    } else {
                        inner.restart_deferred()
                    };

                    let mut wait = next_heartbeat.saturating_duration_since(Instant::now());
                    if deferred {
                        wait = wait.min(DEFERRED_RESTART_POLL);
                    }
                    select! {
                        recv(stop_rx) -> _ => break,
                        recv(wake_rx) -> _ => {}
                        default(wait) => {}
                    }
                }
            })?;

        *heartbeat = Some(HeartbeatThread { stop_tx, handle });

        let config = self.inner.client.config();
        info!(
            group = %config.group_name,
            member = %config.member_name,
            heartbeat_interval_secs = config.heartbeat_interval_secs,
            "consumer started"
        );
        Ok(join)
    }

    /// Run one heartbeat and apply the resulting ownership change
    pub fn heartbeat_once(&self) -> Result<ShardDelta> {
        self.inner.heartbeat_once().map(|(delta, _)| delta)
    }

    /// Snapshot of the shards currently held
    pub fn owned_shards(&self) -> OwnedShardSet {
        self.inner.coordinator.held_shards()
    }

    /// Shards with a running worker, in ascending order
    pub fn active_workers(&self) -> Vec<ShardId> {
        let mut shards: Vec<ShardId> = self.inner.workers.lock().active.keys().copied().collect();
        shards.sort_unstable();
        shards
    }

    /// Get the metrics collector shared with every worker
    pub fn metrics(&self) -> &Arc<ConsumerMetrics> {
        self.inner.client.metrics()
    }

    /// Check if the supervisor has not been shut down
    pub fn is_open(&self) -> bool {
        *self.inner.is_open.read()
    }

    /// Stop heartbeating, stop every worker and wait for their final checkpoints
    ///
    /// Calling it again is a no-op.
    pub fn shutdown(&self) -> Result<()> {
        {
            let mut is_open = self.inner.is_open.write();
            if !*is_open {
                return Ok(());
            }
            *is_open = false;
        }

        let heartbeat = self.heartbeat.lock().take();
        if let Some(heartbeat) = heartbeat {
            let _ = heartbeat.stop_tx.send(());
            heartbeat
                .handle
                .join()
                .map_err(|_| Error::other("heartbeat thread panicked"))?;
        }

        let workers: Vec<ShardWorker> = {
            let mut guard = self.inner.workers.lock();
            let set = &mut *guard;
            set.active.drain().map(|(_, worker)| worker).chain(set.retiring.drain(..)).collect()
        };

        for worker in &workers {
            worker.stop();
        }

        let mut first_error = None;
        for worker in workers {
            let shard_id = worker.shard_id();
            if let Err(err) = worker.join() {
                warn!(shard_id, error = %err, "shard worker did not stop cleanly");
                first_error.get_or_insert(err);
            }
        }

        info!(member = %self.inner.client.config().member_name, "consumer stopped");
        first_error.map_or(Ok(()), Err)
    }
}

impl Inner {
    /// Heartbeat and apply the delta; also reports whether a held shard is still without a worker
    fn heartbeat_once(&self) -> Result<(ShardDelta, bool)> {
        let _serial = self.reconcile.lock();
        if !*self.is_open.read() {
            return Err(Error::Closed);
        }

        let delta = self.coordinator.tick()?;
        let deferred = self.apply(&delta);
        if deferred {
            let _ = self.wake_tx.try_send(());
        }
        Ok((delta, deferred))
    }

    /// Start workers for held shards whose previous worker has exited since
    fn restart_deferred(&self) -> bool {
        let _serial = self.reconcile.lock();
        if !*self.is_open.read() {
            return false;
        }
        self.sync_workers(&mut self.workers.lock())
    }

    /// Stop released workers and make sure every held shard has one
    fn apply(&self, delta: &ShardDelta) -> bool {
        let mut workers = self.workers.lock();

        for shard_id in &delta.released {
            if let Some(worker) = workers.active.remove(shard_id) {
                debug!(shard_id, "stopping worker of released shard");
                worker.stop();
                workers.retiring.push(worker);
            }
        }

        self.sync_workers(&mut workers)
    }

    /// Returns whether some held shard is still without a worker
    fn sync_workers(&self, workers: &mut WorkerSet) -> bool {
        Self::reap(&mut workers.retiring);

        if !*self.is_open.read() {
            return false;
        }

        let mut deferred = false;
        for &shard_id in self.coordinator.held_shards().iter() {
            if workers.active.contains_key(&shard_id) {
                continue;
            }
            // The previous worker of a re-acquired shard must flush first
            if workers.retiring.iter().any(|w| w.shard_id() == shard_id) {
                debug!(shard_id, "shard still retiring, deferring restart");
                deferred = true;
                continue;
            }

            match ShardWorker::spawn(shard_id, self.client.clone(), self.processor.clone()) {
                Ok(worker) => {
                    workers.active.insert(shard_id, worker);
                }
                Err(err) => {
                    warn!(shard_id, error = %err, "failed to start shard worker");
                    deferred = true;
                }
            }
        }
        deferred
    }

    fn reap(retiring: &mut Vec<ShardWorker>) {
        let (finished, running): (Vec<_>, Vec<_>) = retiring.drain(..).partition(ShardWorker::is_finished);
        *retiring = running;

        for worker in finished {
            let shard_id = worker.shard_id();
            if let Err(err) = worker.join() {
                warn!(shard_id, error = %err, "released shard worker failed");
            }
        }
    }
}

impl Drop for ShardConsumerSupervisor {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl std::fmt::Debug for ShardConsumerSupervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardConsumerSupervisor")
            .field("client", &self.inner.client)
            .field("owned_shards", &self.owned_shards())
            .field("active_workers", &self.active_workers())
            .field("is_open", &self.is_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{LogGroup, LogGroupList, LogRecord};
    use crate::config::GroupConfig;
    use crate::memory::{InMemoryLogService, Operation};
    use std::collections::BTreeMap;
    use std::time::{Duration, Instant};

    type Seen = Arc<Mutex<BTreeMap<ShardId, Vec<u32>>>>;

    fn supervisor(service: Arc<InMemoryLogService>, heartbeat_secs: u64) -> Result<(ShardConsumerSupervisor, Seen)> {
        let config = GroupConfig::new("endpoint", "proj", "store", "group", "m1")
            .with_credentials("id", "secret")
            .with_heartbeat_interval_secs(heartbeat_secs)
            .with_data_fetch_interval_secs(1);
        let client = ConsumerClient::new(config, service)?;

        let seen: Seen = Arc::new(Mutex::new(BTreeMap::new()));
        let sink = seen.clone();
        let processor = move |shard_id: ShardId, logs: &LogGroupList| -> Result<()> {
            let mut seen = sink.lock();
            let times = seen.entry(shard_id).or_default();
            times.extend(logs.log_groups.iter().map(|g| g.logs[0].time));
            Ok(())
        };

        Ok((ShardConsumerSupervisor::new(client, Arc::new(processor)), seen))
    }

    fn fill(service: &InMemoryLogService, shard_id: ShardId, count: u32) {
        service.append(
            shard_id,
            (0..count).map(|i| LogGroup {
                logs: vec![LogRecord::new(i, [("shard", shard_id.to_string())])],
                ..LogGroup::default()
            }),
        );
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

    fn delivered(seen: &Seen, shard_id: ShardId) -> usize {
        seen.lock().get(&shard_id).map_or(0, Vec::len)
    }

    #[test_log::test]
    fn test_start_consumes_assigned_shards() -> Result<()> {
        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 2));
        fill(&service, 0, 3);
        fill(&service, 1, 4);
        service.assign("m1", [0, 1]);

        let (supervisor, seen) = supervisor(service.clone(), 3600)?;
        assert!(supervisor.start()?.is_member());

        assert!(wait_until(Duration::from_secs(5), || {
            delivered(&seen, 0) == 3 && delivered(&seen, 1) == 4
        }));
        assert_eq!(supervisor.active_workers(), vec![0, 1]);
        assert_eq!(seen.lock()[&1], vec![0, 1, 2, 3]);

        supervisor.shutdown()?;
        assert!(supervisor.active_workers().is_empty());
        assert_eq!(service.checkpoint("group", 0).unwrap().checkpoint, "cursor-3");
        assert_eq!(service.checkpoint("group", 1).unwrap().checkpoint, "cursor-4");
        Ok(())
    }

    #[test_log::test]
    fn test_revoked_shard_flushes_and_stops() -> Result<()> {
        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 3));
        for shard_id in 0..3 {
            fill(&service, shard_id, 2);
        }
        service.assign("m1", [0, 1]);

        let (supervisor, seen) = supervisor(service.clone(), 3600)?;
        supervisor.start()?;
        assert!(wait_until(Duration::from_secs(5), || delivered(&seen, 0) == 2));

        service.assign("m1", [1, 2]);
        let delta = supervisor.heartbeat_once()?;
        assert_eq!(delta.released, vec![0]);
        assert_eq!(delta.acquired, vec![2]);
        assert_eq!(supervisor.active_workers(), vec![1, 2]);

        // The flush after revocation is forced since ownership is gone
        assert!(wait_until(Duration::from_secs(5), || {
            service.checkpoint("group", 0).map(|c| c.checkpoint) == Some("cursor-2".to_string())
        }));
        assert!(wait_until(Duration::from_secs(5), || delivered(&seen, 2) == 2));

        supervisor.shutdown()?;
        assert_eq!(supervisor.metrics().get_shards_released(), 1);
        Ok(())
    }

    #[test_log::test]
    fn test_background_heartbeat_follows_assignment() -> Result<()> {
        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 2));
        fill(&service, 0, 1);
        service.assign("m1", [0]);

        let (supervisor, seen) = supervisor(service.clone(), 1)?;
        supervisor.start()?;
        assert!(wait_until(Duration::from_secs(5), || delivered(&seen, 0) == 1));

        fill(&service, 1, 2);
        service.assign("m1", [1]);
        assert!(wait_until(Duration::from_secs(5), || supervisor.active_workers() == vec![1]));
        assert!(wait_until(Duration::from_secs(5), || delivered(&seen, 1) == 2));
        assert!(wait_until(Duration::from_secs(5), || service.last_reported("m1") == Some(vec![1])));

        supervisor.shutdown()?;
        assert!(service.calls(Operation::Heartbeat) >= 2);
        Ok(())
    }

    #[test_log::test]
    fn test_heartbeat_failure_keeps_workers() -> Result<()> {
        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 1));
        service.assign("m1", [0]);

        let (supervisor, _seen) = supervisor(service.clone(), 3600)?;
        supervisor.start()?;
        assert!(wait_until(Duration::from_secs(5), || supervisor.active_workers() == vec![0]));

        service.fail_times(Operation::Heartbeat, 1, 500, "InternalServerError");
        assert!(supervisor.heartbeat_once().is_err());
        assert_eq!(supervisor.active_workers(), vec![0]);
        assert_eq!(supervisor.owned_shards().len(), 1);

        supervisor.shutdown()?;
        Ok(())
    }

    #[test_log::test]
    fn test_start_twice_and_shutdown_idempotent() -> Result<()> {
        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 1));
        let (supervisor, _seen) = supervisor(service, 3600)?;

        supervisor.start()?;
        assert!(supervisor.start().is_err());

        supervisor.shutdown()?;
        supervisor.shutdown()?;
        assert!(!supervisor.is_open());
        assert!(supervisor.start().unwrap_err().is_closed());
        assert!(supervisor.heartbeat_once().unwrap_err().is_closed());
        Ok(())
    }

    #[test_log::test]
    fn test_slow_shard_does_not_delay_others() -> Result<()> {
        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 2));
        fill(&service, 0, 2);
        fill(&service, 1, 3);
        service.set_pull_delay(0, Duration::from_secs(2));
        service.assign("m1", [0, 1]);

        let (supervisor, seen) = supervisor(service.clone(), 3600)?;
        let started = Instant::now();
        supervisor.start()?;

        assert!(wait_until(Duration::from_millis(1500), || delivered(&seen, 1) == 3));
        assert_eq!(delivered(&seen, 0), 0);

        service.assign("m1", [1]);
        let revoking = Instant::now();
        let delta = supervisor.heartbeat_once()?;
        assert!(revoking.elapsed() < Duration::from_millis(500));
        assert_eq!(delta.released, vec![0]);
        assert_eq!(supervisor.active_workers(), vec![1]);
        assert!(started.elapsed() < Duration::from_secs(2));

        supervisor.shutdown()?;
        Ok(())
    }

    #[test_log::test]
    fn test_shutdown_during_checkpoint_outage() -> Result<()> {
        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 2));
        service.assign("m1", [0, 1]);
        service.fail_times(Operation::GetCheckpoints, 200, 500, "InternalServerError");

        let config = GroupConfig::new("endpoint", "proj", "store", "group", "m1")
            .with_credentials("id", "secret")
            .with_heartbeat_interval_secs(3600);
        let client = ConsumerClient::new(config, service.clone())?.with_retry_policy(
            crate::config::RetryPolicy::default().with_checkpoint_backoff(Duration::from_millis(100)),
        );
        let processor = |_shard: ShardId, _logs: &LogGroupList| -> Result<()> { Ok(()) };
        let supervisor = ShardConsumerSupervisor::new(client, Arc::new(processor));

        supervisor.start()?;
        assert!(wait_until(Duration::from_secs(5), || supervisor.active_workers() == vec![0, 1]));
        thread::sleep(Duration::from_millis(300));

        let stopping = Instant::now();
        supervisor.shutdown()?;
        assert!(stopping.elapsed() < Duration::from_secs(1));
        assert!(service.calls(Operation::GetCheckpoints) < 50);
        Ok(())
    }

    #[test_log::test]
    fn test_reacquired_shard_restarts_once_retired() -> Result<()> {
        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 1));
        fill(&service, 0, 2);
        service.set_pull_delay(0, Duration::from_millis(500));
        service.assign("m1", [0]);

        let (supervisor, seen) = supervisor(service.clone(), 3600)?;
        supervisor.start()?;
        assert!(wait_until(Duration::from_secs(5), || service.calls(Operation::PullLogs) == 1));

        service.assign("m1", Vec::<ShardId>::new());
        assert_eq!(supervisor.heartbeat_once()?.released, vec![0]);

        service.assign("m1", [0]);
        assert_eq!(supervisor.heartbeat_once()?.acquired, vec![0]);
        assert!(supervisor.active_workers().is_empty());

        // No further heartbeat is due; the restart follows the old worker's exit
        assert!(wait_until(Duration::from_secs(3), || supervisor.active_workers() == vec![0]));
        assert!(wait_until(Duration::from_secs(5), || delivered(&seen, 0) == 2));
        assert_eq!(seen.lock()[&0], vec![0, 1]);
        assert_eq!(service.calls(Operation::Heartbeat), 3);

        supervisor.shutdown()?;
        Ok(())
    }

    #[test_log::test]
    fn test_concurrent_ticks_converge_on_assignment() -> Result<()> {
        let service = Arc::new(InMemoryLogService::with_shards("proj", "store", 4));
        service.assign("m1", [0, 1]);

        let (supervisor, _seen) = supervisor(service.clone(), 3600)?;
        supervisor.start()?;

        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..20 {
                        let _ = supervisor.heartbeat_once();
                    }
                });
            }
            for round in 0..20 {
                if round % 2 == 0 {
                    service.assign("m1", [2, 3]);
                } else {
                    service.assign("m1", [0, 1]);
                }
                thread::sleep(Duration::from_millis(5));
            }
        });

        service.assign("m1", [1, 2]);
        supervisor.heartbeat_once()?;
        assert_eq!(supervisor.owned_shards().iter().copied().collect::<Vec<_>>(), vec![1, 2]);
        assert!(wait_until(Duration::from_secs(5), || supervisor.active_workers() == vec![1, 2]));

        supervisor.shutdown()?;
        Ok(())
    }
}
