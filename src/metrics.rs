use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Mirror a counter increment to the `metrics` facade when enabled
macro_rules! mirror {
    ($name:literal, $value:expr) => {
        #[cfg(feature = "metrics")]
        ::metrics::counter!($name, $value as u64);
        #[cfg(not(feature = "metrics"))]
        let _ = $value;
    };
}

/// Counters describing the consumer's activity
#[derive(Debug)]
pub struct ConsumerMetrics {
    // Pull metrics
    /// Number of pull RPC attempts
    pull_attempts: AtomicUsize,
    /// Number of failed pull RPC attempts
    pull_failures: AtomicUsize,
    /// Number of pulls that exhausted their attempt budget
    pulls_exhausted: AtomicUsize,
    /// Number of log groups delivered
    log_groups_fetched: AtomicUsize,
    /// Total time spent in pull RPCs in nanoseconds
    pull_duration_ns: AtomicU64,

    // Membership metrics
    /// Number of successful heartbeats
    heartbeats: AtomicUsize,
    /// Number of failed heartbeats
    heartbeat_failures: AtomicUsize,
    /// Number of shards acquired through reconciliation
    shards_acquired: AtomicUsize,
    /// Number of shards released through reconciliation
    shards_released: AtomicUsize,

    // Checkpoint metrics
    /// Number of successful checkpoint writes
    checkpoint_writes: AtomicUsize,
    /// Number of failed checkpoint writes
    checkpoint_failures: AtomicUsize,
    /// Number of failed checkpoint listings
    checkpoint_list_failures: AtomicUsize,

    // Internal state
    /// Start time of the metrics collector
    start_time: Instant,
}

impl Default for ConsumerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsumerMetrics {
    /// Create a new metrics collector
    pub fn new() -> Self {
        Self {
            pull_attempts: AtomicUsize::new(0),
            pull_failures: AtomicUsize::new(0),
            pulls_exhausted: AtomicUsize::new(0),
            log_groups_fetched: AtomicUsize::new(0),
            pull_duration_ns: AtomicU64::new(0),

            heartbeats: AtomicUsize::new(0),
            heartbeat_failures: AtomicUsize::new(0),
            shards_acquired: AtomicUsize::new(0),
            shards_released: AtomicUsize::new(0),

            checkpoint_writes: AtomicUsize::new(0),
            checkpoint_failures: AtomicUsize::new(0),
            checkpoint_list_failures: AtomicUsize::new(0),

            start_time: Instant::now(),
        }
    }

    // Pull metrics

    /// Record one pull attempt and how long it took
    pub fn record_pull_attempt(&self, duration: Duration) {
        self.pull_attempts.fetch_add(1, Ordering::Relaxed);
        self.pull_duration_ns.fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
        mirror!("loghub_consumer_pull_attempts_total", 1);
    }

    /// Increment failed pull attempts
    pub fn increment_pull_failures(&self) {
        self.pull_failures.fetch_add(1, Ordering::Relaxed);
        mirror!("loghub_consumer_pull_failures_total", 1);
    }

    /// Increment pulls that gave up after the attempt budget
    pub fn increment_pulls_exhausted(&self) {
        self.pulls_exhausted.fetch_add(1, Ordering::Relaxed);
        mirror!("loghub_consumer_pulls_exhausted_total", 1);
    }

    /// Add delivered log groups
    pub fn add_log_groups_fetched(&self, count: usize) {
        self.log_groups_fetched.fetch_add(count, Ordering::Relaxed);
        mirror!("loghub_consumer_log_groups_fetched_total", count);
    }

    // Membership metrics

    /// Increment successful heartbeats
    pub fn increment_heartbeats(&self) {
        self.heartbeats.fetch_add(1, Ordering::Relaxed);
        mirror!("loghub_consumer_heartbeats_total", 1);
    }

    /// Increment failed heartbeats
    pub fn increment_heartbeat_failures(&self) {
        self.heartbeat_failures.fetch_add(1, Ordering::Relaxed);
        mirror!("loghub_consumer_heartbeat_failures_total", 1);
    }

    /// Record shard ownership changes
    pub fn record_shard_changes(&self, acquired: usize, released: usize) {
        self.shards_acquired.fetch_add(acquired, Ordering::Relaxed);
        self.shards_released.fetch_add(released, Ordering::Relaxed);
        mirror!("loghub_consumer_shards_acquired_total", acquired);
        mirror!("loghub_consumer_shards_released_total", released);
    }

    // Checkpoint metrics

    /// Increment successful checkpoint writes
    pub fn increment_checkpoint_writes(&self) {
        self.checkpoint_writes.fetch_add(1, Ordering::Relaxed);
        mirror!("loghub_consumer_checkpoint_writes_total", 1);
    }

    /// Increment failed checkpoint writes
    pub fn increment_checkpoint_failures(&self) {
        self.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
        mirror!("loghub_consumer_checkpoint_failures_total", 1);
    }

    /// Increment failed checkpoint listings
    pub fn increment_checkpoint_list_failures(&self) {
        self.checkpoint_list_failures.fetch_add(1, Ordering::Relaxed);
        mirror!("loghub_consumer_checkpoint_list_failures_total", 1);
    }

    // Getters

    /// Get pull attempts
    pub fn get_pull_attempts(&self) -> usize {
        self.pull_attempts.load(Ordering::Relaxed)
    }

    /// Get failed pull attempts
    pub fn get_pull_failures(&self) -> usize {
        self.pull_failures.load(Ordering::Relaxed)
    }

    /// Get exhausted pulls
    pub fn get_pulls_exhausted(&self) -> usize {
        self.pulls_exhausted.load(Ordering::Relaxed)
    }

    /// Get delivered log groups
    pub fn get_log_groups_fetched(&self) -> usize {
        self.log_groups_fetched.load(Ordering::Relaxed)
    }

    /// Get total time spent pulling
    pub fn get_pull_duration(&self) -> Duration {
        Duration::from_nanos(self.pull_duration_ns.load(Ordering::Relaxed))
    }

    /// Get successful heartbeats
    pub fn get_heartbeats(&self) -> usize {
        self.heartbeats.load(Ordering::Relaxed)
    }

    /// Get failed heartbeats
    pub fn get_heartbeat_failures(&self) -> usize {
        self.heartbeat_failures.load(Ordering::Relaxed)
    }

    /// Get acquired shards
    pub fn get_shards_acquired(&self) -> usize {
        self.shards_acquired.load(Ordering::Relaxed)
    }

    /// Get released shards
    pub fn get_shards_released(&self) -> usize {
        self.shards_released.load(Ordering::Relaxed)
    }

    /// Get successful checkpoint writes
    pub fn get_checkpoint_writes(&self) -> usize {
        self.checkpoint_writes.load(Ordering::Relaxed)
    }

    /// Get failed checkpoint writes
    pub fn get_checkpoint_failures(&self) -> usize {
        self.checkpoint_failures.load(Ordering::Relaxed)
    }

    /// Get failed checkpoint listings
    pub fn get_checkpoint_list_failures(&self) -> usize {
        self.checkpoint_list_failures.load(Ordering::Relaxed)
    }

    /// Fraction of pull attempts that failed
    pub fn get_pull_failure_rate(&self) -> f64 {
        let attempts = self.get_pull_attempts();
        if attempts == 0 {
            return 0.0;
        }
        self.get_pull_failures() as f64 / attempts as f64
    }

    /// Get uptime of the collector
    pub fn get_uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Get a human-readable report
    pub fn get_report(&self) -> String {
        let mut report = String::new();

        report.push_str("=== Consumer Metrics ===\n\n");
        report.push_str(&format!("Uptime: {:?}\n\n", self.get_uptime()));

        report.push_str("Pulls:\n");
        report.push_str(&format!("  Attempts: {}\n", self.get_pull_attempts()));
        report.push_str(&format!("  Failures: {}\n", self.get_pull_failures()));
        report.push_str(&format!("  Exhausted: {}\n", self.get_pulls_exhausted()));
        report.push_str(&format!("  Log Groups: {}\n", self.get_log_groups_fetched()));
        report.push_str(&format!("  Failure Rate: {:.2}%\n", self.get_pull_failure_rate() * 100.0));

        report.push_str("\nMembership:\n");
        report.push_str(&format!("  Heartbeats: {}\n", self.get_heartbeats()));
        report.push_str(&format!("  Heartbeat Failures: {}\n", self.get_heartbeat_failures()));
        report.push_str(&format!("  Shards Acquired: {}\n", self.get_shards_acquired()));
        report.push_str(&format!("  Shards Released: {}\n", self.get_shards_released()));

        report.push_str("\nCheckpoints:\n");
        report.push_str(&format!("  Writes: {}\n", self.get_checkpoint_writes()));
        report.push_str(&format!("  Write Failures: {}\n", self.get_checkpoint_failures()));
        report.push_str(&format!("  List Failures: {}\n", self.get_checkpoint_list_failures()));

        report
    }

    /// Reset all counters
    pub fn reset(&self) {
        for counter in [
            &self.pull_attempts,
            &self.pull_failures,
            &self.pulls_exhausted,
            &self.log_groups_fetched,
            &self.heartbeats,
            &self.heartbeat_failures,
            &self.shards_acquired,
            &self.shards_released,
            &self.checkpoint_writes,
            &self.checkpoint_failures,
            &self.checkpoint_list_failures,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
        self.pull_duration_ns.store(0, Ordering::Relaxed);
    }
}
