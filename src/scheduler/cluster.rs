//! Cluster-job backend.
//!
//! Every frame becomes one batch job named by [`job_name`], labelled with the
//! owning Play and the frame id, and owned by the Play so the platform
//! garbage-collects it with the Play. A job's `Complete` condition maps to
//! exit code 0 and its `Failed` condition to 1.
//!
//! The platform is reached through the [`JobClient`] trait.
//! [`InMemoryJobClient`] implements it in memory; tests and embedders drive
//! job conditions through [`InMemoryJobClient::set_condition`].

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use strum::{Display, EnumString};
use tracing::{debug, info};

use super::{JobHandle, SchedulerBackend, StatusWriter, job_name};
use crate::controller::WatchEvent;
use crate::error::{EngineError, Result};
use crate::types::{Action, FRAME_LABEL, PLAY_LABEL, Play, RestartPolicy};

/// Link from a job to the Play that owns it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnerReference {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    pub uid: String,
    pub controller: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobMeta {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub owner_references: Vec<OwnerReference>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
pub enum JobConditionType {
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobCondition {
    #[serde(rename = "type")]
    pub condition_type: JobConditionType,
    pub status: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    #[serde(default)]
    pub conditions: Vec<JobCondition>,
    #[serde(default)]
    pub active: i32,
    #[serde(default)]
    pub succeeded: i32,
    #[serde(default)]
    pub failed: i32,
}

/// A batch job as the platform stores it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchJob {
    pub metadata: JobMeta,
    pub spec: Action,
    #[serde(default)]
    pub status: JobStatus,
}

impl BatchJob {
    /// Builds the job for `frame_id` of `play`.
    pub fn for_frame(play: &Play, frame_id: &str) -> Result<Self> {
        let frame = play.frame(frame_id).ok_or_else(|| {
            EngineError::submission(format!("play {} has no frame {}", play.key(), frame_id))
        })?;
        let name = job_name(play.name(), frame_id);

        let mut spec = frame.action.clone();
        spec.backoff_limit.get_or_insert(0);
        spec.restart_policy.get_or_insert(RestartPolicy::Never);
        if let [container] = spec.containers.as_mut_slice() {
            container.name = name.clone();
        }

        Ok(Self {
            metadata: JobMeta {
                name,
                namespace: play.namespace().to_string(),
                labels: BTreeMap::from([
                    (PLAY_LABEL.to_string(), play.name().to_string()),
                    (FRAME_LABEL.to_string(), frame_id.to_string()),
                ]),
                owner_references: vec![OwnerReference {
                    api_version: play.api_version.clone(),
                    kind: play.kind.clone(),
                    name: play.name().to_string(),
                    uid: play.metadata.uid.clone(),
                    controller: true,
                }],
            },
            spec,
            status: JobStatus {
                active: 1,
                ..JobStatus::default()
            },
        })
    }

    /// 0 once complete, 1 once failed, `None` while running.
    pub fn exit_code(&self) -> Option<i32> {
        self.status
            .conditions
            .iter()
            .filter(|c| c.status)
            .find_map(|c| match c.condition_type {
                JobConditionType::Complete => Some(0),
                JobConditionType::Failed => Some(1),
            })
    }

    pub fn play_name(&self) -> Option<&str> {
        self.metadata.labels.get(PLAY_LABEL).map(String::as_str)
    }

    pub fn frame_id(&self) -> Option<&str> {
        self.metadata.labels.get(FRAME_LABEL).map(String::as_str)
    }
}

/// Access to the platform's batch jobs.
pub trait JobClient: Send + Sync {
    /// Returns `NotFound` if there is no such job.
    fn get(&self, namespace: &str, name: &str) -> Result<BatchJob>;

    /// Returns `AlreadyExists` if the name is taken.
    fn create(&self, job: &BatchJob) -> Result<BatchJob>;

    /// Jobs in `namespace` carrying every label of `selector`.
    fn list(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<BatchJob>>;

    /// Stream of job changes from now on.
    fn watch(&self) -> Result<Receiver<BatchJob>>;
}

// ============================================================================
// Backend
// ============================================================================

/// Backend that runs frames as cluster batch jobs.
pub struct ClusterJobBackend {
    client: Arc<dyn JobClient>,
    writer: Arc<StatusWriter>,
    poll_interval: Duration,
}

impl ClusterJobBackend {
    pub fn new(client: Arc<dyn JobClient>, writer: Arc<StatusWriter>) -> Self {
        Self {
            client,
            writer,
            poll_interval: Duration::from_secs(5),
        }
    }

    /// How often `await_exit` re-reads the job when no watch event arrives.
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Jobs created for `play`, found by label.
    pub fn jobs_for(&self, play: &Play) -> Result<Vec<BatchJob>> {
        let selector = BTreeMap::from([(PLAY_LABEL.to_string(), play.name().to_string())]);
        self.client.list(play.namespace(), &selector)
    }

    fn lookup(&self, namespace: &str, name: &str) -> Result<Option<BatchJob>> {
        match self.client.get(namespace, name) {
            Ok(job) => Ok(Some(job)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

impl SchedulerBackend for ClusterJobBackend {
    fn name(&self) -> &'static str {
        "cluster"
    }

    fn submit(&self, play: &Play, frame_id: &str) -> Result<JobHandle> {
        let job = BatchJob::for_frame(play, frame_id)?;
        let handle = |recovered| JobHandle {
            play: play.key(),
            frame_id: frame_id.to_string(),
            job_name: job.metadata.name.clone(),
            recovered,
        };

        let existing = self
            .lookup(play.namespace(), &job.metadata.name)
            .map_err(|e| EngineError::submission(e.to_string()))?;
        if existing.is_some() {
            info!(play = %play.key(), frame = frame_id, job = %job.metadata.name, "recovered existing job");
            return Ok(handle(true));
        }

        match self.client.create(&job) {
            Ok(_) => {
                info!(play = %play.key(), frame = frame_id, job = %job.metadata.name, "created job");
                Ok(handle(false))
            }
            // Lost a race against another submitter; the job is there either way
            Err(e) if e.is_already_exists() => Ok(handle(true)),
            Err(e) => Err(EngineError::submission(format!(
                "creating job {}: {}",
                job.metadata.name, e
            ))),
        }
    }

    fn await_exit(&self, handle: &JobHandle) -> Result<i32> {
        let namespace = &handle.play.namespace;
        // Subscribe before the first read so no transition slips between them
        let events = self.client.watch()?;
        loop {
            let job = self.client.get(namespace, &handle.job_name)?;
            if let Some(code) = job.exit_code() {
                debug!(job = %handle.job_name, code, "job finished");
                return Ok(code);
            }
            match events.recv_timeout(self.poll_interval) {
                Ok(job) if job.metadata.name == handle.job_name => {
                    if let Some(code) = job.exit_code() {
                        return Ok(code);
                    }
                }
                Ok(_) | Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(EngineError::state(format!(
                        "job watch closed while waiting for {}",
                        handle.job_name
                    )));
                }
            }
        }
    }

    fn observe(&self, play: &Play, frame_id: &str) -> Result<Option<i32>> {
        let name = job_name(play.name(), frame_id);
        Ok(self
            .lookup(play.namespace(), &name)?
            .and_then(|job| job.exit_code()))
    }

    fn watch(&self, events: Sender<WatchEvent>) -> Result<()> {
        let jobs = self.client.watch()?;
        std::thread::Builder::new()
            .name("job-watch".to_string())
            .spawn(move || {
                for job in jobs {
                    if job.exit_code().is_none() || job.play_name().is_none() {
                        continue;
                    }
                    if events.send(WatchEvent::Job(job)).is_err() {
                        debug!("controller gone, stopping job watch");
                        break;
                    }
                }
            })?;
        Ok(())
    }

    fn status_writer(&self) -> &StatusWriter {
        &self.writer
    }
}

// ============================================================================
// In-memory job client
// ============================================================================

#[derive(Default)]
struct JobTable {
    jobs: BTreeMap<(String, String), BatchJob>,
    watchers: Vec<Sender<BatchJob>>,
    created: usize,
    create_failure: Option<String>,
}

impl JobTable {
    fn broadcast(&mut self, job: &BatchJob) {
        self.watchers.retain(|tx| tx.send(job.clone()).is_ok());
    }
}

/// Job client holding jobs in memory.
#[derive(Default)]
pub struct InMemoryJobClient {
    table: Mutex<JobTable>,
}

impl InMemoryJobClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a job terminal and notifies watchers.
    pub fn set_condition(
        &self,
        namespace: &str,
        name: &str,
        condition: JobConditionType,
    ) -> Result<()> {
        let mut table = self.table.lock()?;
        let job = table
            .jobs
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| EngineError::not_found(format!("job {}/{}", namespace, name)))?;
        job.status.conditions.push(JobCondition {
            condition_type: condition,
            status: true,
        });
        job.status.active = 0;
        match condition {
            JobConditionType::Complete => job.status.succeeded += 1,
            JobConditionType::Failed => job.status.failed += 1,
        }
        let job = job.clone();
        table.broadcast(&job);
        Ok(())
    }

    /// Number of successful `create` calls so far.
    pub fn created_count(&self) -> usize {
        self.table.lock().map(|t| t.created).unwrap_or(0)
    }

    /// Makes every following `create` fail with `message`.
    pub fn fail_creates(&self, message: impl Into<String>) -> Result<()> {
        self.table.lock()?.create_failure = Some(message.into());
        Ok(())
    }

    pub fn jobs(&self) -> Vec<BatchJob> {
        self.table
            .lock()
            .map(|t| t.jobs.values().cloned().collect())
            .unwrap_or_default()
    }
}

impl JobClient for InMemoryJobClient {
    fn get(&self, namespace: &str, name: &str) -> Result<BatchJob> {
        self.table
            .lock()?
            .jobs
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("job {}/{}", namespace, name)))
    }

    fn create(&self, job: &BatchJob) -> Result<BatchJob> {
        let mut table = self.table.lock()?;
        if let Some(message) = &table.create_failure {
            return Err(EngineError::submission(message.clone()));
        }
        let key = (job.metadata.namespace.clone(), job.metadata.name.clone());
        if table.jobs.contains_key(&key) {
            return Err(EngineError::already_exists(format!("job {}", job.metadata.name)));
        }
        table.jobs.insert(key, job.clone());
        table.created += 1;
        table.broadcast(job);
        Ok(job.clone())
    }

    fn list(&self, namespace: &str, selector: &BTreeMap<String, String>) -> Result<Vec<BatchJob>> {
        Ok(self
            .table
            .lock()?
            .jobs
            .values()
            .filter(|job| job.metadata.namespace == namespace)
            .filter(|job| {
                selector
                    .iter()
                    .all(|(k, v)| job.metadata.labels.get(k) == Some(v))
            })
            .cloned()
            .collect())
    }

    fn watch(&self) -> Result<Receiver<BatchJob>> {
        let (tx, rx) = mpsc::channel();
        self.table.lock()?.watchers.push(tx);
        Ok(rx)
    }
}
