//! In-process log service
//!
//! [`InMemoryLogService`] implements [`LogServiceClient`] on top of in-memory
//! shard logs. Shard assignment is explicit, and failures can be scripted per
//! operation, which makes it the backend of choice for tests and demos.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;

use crate::client::{Checkpoint, ConsumerGroupSpec, LogGroup, LogGroupList, LogServiceClient, ShardId};
use crate::error::{Error, Result, ServiceError, GROUP_ALREADY_EXISTS};

const CURSOR_PREFIX: &str = "cursor-";

/// Operations of the log service, used for failure injection and call counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `create_consumer_group`
    CreateGroup,
    /// `heartbeat`
    Heartbeat,
    /// `update_checkpoint`
    UpdateCheckpoint,
    /// `get_checkpoints`
    GetCheckpoints,
    /// `get_cursor`
    GetCursor,
    /// `pull_logs`
    PullLogs,
}

#[derive(Default)]
struct ServiceState {
    groups: HashMap<String, ConsumerGroupSpec>,
    shards: BTreeMap<ShardId, Vec<LogGroup>>,
    assignments: HashMap<String, Vec<ShardId>>,
    reported: HashMap<String, Vec<ShardId>>,
    checkpoints: HashMap<(String, ShardId), Checkpoint>,
    faults: HashMap<Operation, VecDeque<Error>>,
    calls: HashMap<Operation, usize>,
    pull_delays: HashMap<ShardId, Duration>,
}

/// Thread-safe in-memory implementation of the log service
pub struct InMemoryLogService {
    project: String,
    logstore: String,
    state: Mutex<ServiceState>,
}

impl InMemoryLogService {
    /// Create a service hosting a single project/logstore
    pub fn new(project: impl Into<String>, logstore: impl Into<String>) -> Self {
        Self {
            project: project.into(),
            logstore: logstore.into(),
            state: Mutex::new(ServiceState::default()),
        }
    }

    /// Create a service with empty shards `0..count`
    pub fn with_shards(project: impl Into<String>, logstore: impl Into<String>, count: ShardId) -> Self {
        let service = Self::new(project, logstore);
        for shard_id in 0..count {
            service.add_shard(shard_id);
        }
        service
    }

    /// Add an empty shard
    pub fn add_shard(&self, shard_id: ShardId) {
        self.state.lock().shards.entry(shard_id).or_default();
    }

    /// Append log groups to a shard, creating it if needed
    pub fn append(&self, shard_id: ShardId, groups: impl IntoIterator<Item = LogGroup>) {
        self.state.lock().shards.entry(shard_id).or_default().extend(groups);
    }

    /// Number of log groups stored in a shard
    pub fn shard_len(&self, shard_id: ShardId) -> usize {
        self.state.lock().shards.get(&shard_id).map_or(0, Vec::len)
    }

    /// Set the shards the service hands to a member on its next heartbeat
    pub fn assign(&self, member_name: impl Into<String>, shards: impl IntoIterator<Item = ShardId>) {
        let mut shards: Vec<ShardId> = shards.into_iter().collect();
        shards.sort_unstable();
        shards.dedup();
        self.state.lock().assignments.insert(member_name.into(), shards);
    }

    /// Shards a member reported as held in its last heartbeat
    pub fn last_reported(&self, member_name: &str) -> Option<Vec<ShardId>> {
        self.state.lock().reported.get(member_name).cloned()
    }

    /// The registered group record, if any
    pub fn group(&self, group_name: &str) -> Option<ConsumerGroupSpec> {
        self.state.lock().groups.get(group_name).cloned()
    }

    /// The checkpoint of a shard, if any
    pub fn checkpoint(&self, group_name: &str, shard_id: ShardId) -> Option<Checkpoint> {
        self.state
            .lock()
            .checkpoints
            .get(&(group_name.to_string(), shard_id))
            .cloned()
    }

    /// Make the next call of `op` fail with `error`
    ///
    /// Scripted failures queue up and are consumed in order.
    pub fn fail_next(&self, op: Operation, error: Error) {
        self.state.lock().faults.entry(op).or_default().push_back(error);
    }

    /// Make the next `times` calls of `op` fail with a service error
    pub fn fail_times(&self, op: Operation, times: usize, http_status: u16, code: &str) {
        let mut state = self.state.lock();
        let queue = state.faults.entry(op).or_default();
        for _ in 0..times {
            queue.push_back(Error::service(http_status, code, "injected failure"));
        }
    }

    /// Delay every pull on a shard, simulating a slow backend
    pub fn set_pull_delay(&self, shard_id: ShardId, delay: Duration) {
        self.state.lock().pull_delays.insert(shard_id, delay);
    }

    /// Number of calls made to an operation, failed ones included
    pub fn calls(&self, op: Operation) -> usize {
        self.state.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Count the call and return the scripted failure, if any
    fn enter(&self, op: Operation, project: &str, logstore: &str) -> Result<()> {
        let mut state = self.state.lock();
        *state.calls.entry(op).or_insert(0) += 1;

        if let Some(err) = state.faults.get_mut(&op).and_then(VecDeque::pop_front) {
            return Err(err);
        }

        if project != self.project {
            return Err(not_found("ProjectNotExist", project));
        }
        if logstore != self.logstore {
            return Err(not_found("LogStoreNotExist", logstore));
        }

        Ok(())
    }
}

fn not_found(code: &str, what: &str) -> Error {
    Error::Service(ServiceError::new(404, code, format!("{} does not exist", what)))
}

fn encode_cursor(position: usize) -> String {
    format!("{}{}", CURSOR_PREFIX, position)
}

fn decode_cursor(cursor: &str) -> Option<usize> {
    cursor.strip_prefix(CURSOR_PREFIX)?.parse().ok()
}

fn invalid_cursor(cursor: &str) -> Error {
    Error::service(400, "InvalidCursor", format!("cursor {} is invalid", cursor))
}

fn group_time(group: &LogGroup) -> u32 {
    group.logs.first().map_or(0, |record| record.time)
}

impl LogServiceClient for InMemoryLogService {
    fn create_consumer_group(&self, project: &str, logstore: &str, group: &ConsumerGroupSpec) -> Result<()> {
        self.enter(Operation::CreateGroup, project, logstore)?;

        let mut state = self.state.lock();
        if state.groups.contains_key(&group.group_name) {
            return Err(Error::service(
                400,
                GROUP_ALREADY_EXISTS,
                format!("consumer group {} already exists", group.group_name),
            ));
        }
        state.groups.insert(group.group_name.clone(), group.clone());
        Ok(())
    }

    fn heartbeat(
        &self,
        project: &str,
        logstore: &str,
        group_name: &str,
        member_name: &str,
        held_shards: &[ShardId],
    ) -> Result<Vec<ShardId>> {
        self.enter(Operation::Heartbeat, project, logstore)?;

        let mut state = self.state.lock();
        if !state.groups.contains_key(group_name) {
            return Err(not_found("ConsumerGroupNotExist", group_name));
        }
        state.reported.insert(member_name.to_string(), held_shards.to_vec());
        Ok(state.assignments.get(member_name).cloned().unwrap_or_default())
    }

    fn update_checkpoint(
        &self,
        project: &str,
        logstore: &str,
        group_name: &str,
        member_name: &str,
        shard_id: ShardId,
        checkpoint: &str,
        force_success: bool,
    ) -> Result<()> {
        self.enter(Operation::UpdateCheckpoint, project, logstore)?;

        let mut state = self.state.lock();
        if !state.groups.contains_key(group_name) {
            return Err(not_found("ConsumerGroupNotExist", group_name));
        }

        let owns = state
            .assignments
            .get(member_name)
            .map_or(false, |shards| shards.contains(&shard_id));
        if !owns && !force_success {
            return Err(Error::service(
                400,
                "ConsumerNotMatch",
                format!("member {} does not own shard {}", member_name, shard_id),
            ));
        }

        state.checkpoints.insert(
            (group_name.to_string(), shard_id),
            Checkpoint {
                shard_id,
                checkpoint: checkpoint.to_string(),
                update_time: Utc::now(),
                consumer: member_name.to_string(),
            },
        );
        Ok(())
    }

    fn get_checkpoints(&self, project: &str, logstore: &str, group_name: &str) -> Result<Vec<Checkpoint>> {
        self.enter(Operation::GetCheckpoints, project, logstore)?;

        let state = self.state.lock();
        if !state.groups.contains_key(group_name) {
            return Err(not_found("ConsumerGroupNotExist", group_name));
        }

        let mut checkpoints: Vec<Checkpoint> = state
            .checkpoints
            .iter()
            .filter(|((group, _), _)| group == group_name)
            .map(|(_, checkpoint)| checkpoint.clone())
            .collect();
        checkpoints.sort_by_key(|c| c.shard_id);
        Ok(checkpoints)
    }

    fn get_cursor(&self, project: &str, logstore: &str, shard_id: ShardId, from: &str) -> Result<String> {
        self.enter(Operation::GetCursor, project, logstore)?;

        let state = self.state.lock();
        let log = state
            .shards
            .get(&shard_id)
            .ok_or_else(|| not_found("ShardNotExist", &shard_id.to_string()))?;

        let position = match from {
            "begin" => 0,
            "end" => log.len(),
            other => {
                if let Some(position) = decode_cursor(other) {
                    if position > log.len() {
                        return Err(invalid_cursor(other));
                    }
                    position
                } else if let Ok(secs) = other.parse::<u32>() {
                    log.iter().position(|g| group_time(g) >= secs).unwrap_or(log.len())
                } else {
                    return Err(Error::service(400, "ParameterInvalid", format!("invalid from: {}", other)));
                }
            }
        };

        Ok(encode_cursor(position))
    }

    fn pull_logs(
        &self,
        project: &str,
        logstore: &str,
        shard_id: ShardId,
        cursor: &str,
        max_count: u32,
    ) -> Result<(LogGroupList, String)> {
        self.enter(Operation::PullLogs, project, logstore)?;

        let delay = self.state.lock().pull_delays.get(&shard_id).copied();
        if let Some(delay) = delay {
            std::thread::sleep(delay);
        }

        let state = self.state.lock();
        let log = state
            .shards
            .get(&shard_id)
            .ok_or_else(|| not_found("ShardNotExist", &shard_id.to_string()))?;

        let start = decode_cursor(cursor)
            .filter(|p| *p <= log.len())
            .ok_or_else(|| invalid_cursor(cursor))?;
        let end = (start + max_count as usize).min(log.len());

        let batch = LogGroupList {
            log_groups: log[start..end].to_vec(),
        };
        Ok((batch, encode_cursor(end)))
    }
}
