//! Local-process backend.
//!
//! Runs a frame's containers as child processes on this host, init containers
//! first and then regular containers, one after another. The container image
//! is ignored; `command` names the program and `args` are appended to it.
//! A frame exits 0 when every process exits 0 and 1 otherwise.
//!
//! Every process starts in its own process group and is registered with the
//! global [`ChildRegistry`], so it is torn down with the engine. Output is
//! forwarded to the log line by line.
//!
//! Jobs live in memory keyed by their job name, which makes submission
//! get-or-create within one engine process.

use std::collections::{BTreeMap, HashMap};
use std::io::{BufRead, BufReader, Read};
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use tracing::{debug, error, info, warn};

use super::{JobHandle, SchedulerBackend, StatusWriter, job_name};
use crate::controller::WatchEvent;
use crate::error::{EngineError, Result};
use crate::process_guard::{ChildRegistry, CommandProcessGroup};
use crate::provision::Provisioner;
use crate::types::{Container, Play, PlayKey};

/// One process to run for a frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessSpec {
    pub container: String,
    pub program: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Running,
    Exited(i32),
}

#[derive(Debug)]
struct LocalJob {
    play: PlayKey,
    frame_id: String,
    state: JobState,
}

type JobKey = (String, String);

#[derive(Default)]
struct JobTable {
    jobs: Mutex<HashMap<JobKey, LocalJob>>,
    exited: Condvar,
}

/// Backend that runs frames as local child processes.
pub struct LocalProcessBackend {
    writer: Arc<StatusWriter>,
    provisioner: Arc<dyn Provisioner>,
    work_dir: Option<PathBuf>,
    table: Arc<JobTable>,
    events: Arc<Mutex<Option<Sender<WatchEvent>>>>,
}

impl LocalProcessBackend {
    pub fn new(writer: Arc<StatusWriter>, provisioner: Arc<dyn Provisioner>) -> Self {
        Self {
            writer,
            provisioner,
            work_dir: None,
            table: Arc::new(JobTable::default()),
            events: Arc::new(Mutex::new(None)),
        }
    }

    /// Directory processes run in when their container names none.
    pub fn with_work_dir(mut self, work_dir: impl Into<PathBuf>) -> Self {
        self.work_dir = Some(work_dir.into());
        self
    }

    /// Number of jobs this backend still tracks.
    pub fn job_count(&self) -> usize {
        self.table.jobs.lock().map(|jobs| jobs.len()).unwrap_or(0)
    }

    /// Resolves the processes to run for `frame_id`.
    ///
    /// Environment comes from the config objects named in `envFrom`, then from
    /// `env`, which wins on conflicts.
    pub fn plan(&self, play: &Play, frame_id: &str) -> Result<Vec<ProcessSpec>> {
        let frame = play.frame(frame_id).ok_or_else(|| {
            EngineError::submission(format!("play {} has no frame {}", play.key(), frame_id))
        })?;
        frame
            .action
            .all_containers()
            .map(|container| self.process_for(play, container))
            .collect()
    }

    fn process_for(&self, play: &Play, container: &Container) -> Result<ProcessSpec> {
        let (program, rest) = container.command.split_first().ok_or_else(|| {
            EngineError::submission(format!(
                "container {:?} has no command to run locally",
                container.name
            ))
        })?;

        let mut env = BTreeMap::new();
        for source in &container.env_from {
            let data = self
                .provisioner
                .config_data(play.namespace(), &source.config_map_ref.name)
                .map_err(|e| EngineError::submission(e.to_string()))?;
            env.extend(data);
        }
        env.extend(
            container
                .env
                .iter()
                .map(|e| (e.name.clone(), e.value.clone())),
        );

        Ok(ProcessSpec {
            container: container.name.clone(),
            program: program.clone(),
            args: rest.iter().chain(container.args.iter()).cloned().collect(),
            env,
            working_dir: container
                .working_dir
                .as_ref()
                .map(PathBuf::from)
                .or_else(|| self.work_dir.clone()),
        })
    }
}

impl SchedulerBackend for LocalProcessBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    fn submit(&self, play: &Play, frame_id: &str) -> Result<JobHandle> {
        let name = job_name(play.name(), frame_id);
        let key = (play.namespace().to_string(), name.clone());
        let handle = |recovered| JobHandle {
            play: play.key(),
            frame_id: frame_id.to_string(),
            job_name: name.clone(),
            recovered,
        };

        let mut jobs = self.table.jobs.lock()?;
        if jobs.contains_key(&key) {
            debug!(play = %play.key(), frame = frame_id, job = %name, "recovered local job");
            return Ok(handle(true));
        }

        let processes = self.plan(play, frame_id)?;
        jobs.insert(
            key.clone(),
            LocalJob {
                play: play.key(),
                frame_id: frame_id.to_string(),
                state: JobState::Running,
            },
        );
        drop(jobs);

        info!(play = %play.key(), frame = frame_id, job = %name, "starting local job");
        let table = Arc::clone(&self.table);
        let events = Arc::clone(&self.events);
        let job = name.clone();
        let spawned = thread::Builder::new()
            .name(format!("job-{}", name))
            .spawn(move || {
                let code = run_processes(&job, &processes);
                finish(&table, &events, &key, code);
            });
        if let Err(e) = spawned {
            // Leave no Running entry behind that nothing will ever finish
            if let Ok(mut jobs) = self.table.jobs.lock() {
                jobs.remove(&(play.namespace().to_string(), name.clone()));
            }
            return Err(EngineError::submission(format!("spawning job thread: {}", e)));
        }
        Ok(handle(false))
    }

    fn await_exit(&self, handle: &JobHandle) -> Result<i32> {
        let key = (handle.play.namespace.clone(), handle.job_name.clone());
        let mut jobs = self.table.jobs.lock()?;
        loop {
            match jobs.get(&key).map(|job| job.state) {
                Some(JobState::Exited(code)) => return Ok(code),
                Some(JobState::Running) => jobs = self.table.exited.wait(jobs)?,
                None => {
                    return Err(EngineError::not_found(format!("local job {}", handle.job_name)));
                }
            }
        }
    }

    fn observe(&self, play: &Play, frame_id: &str) -> Result<Option<i32>> {
        let key = (
            play.namespace().to_string(),
            job_name(play.name(), frame_id),
        );
        Ok(match self.table.jobs.lock()?.get(&key).map(|job| job.state) {
            Some(JobState::Exited(code)) => Some(code),
            _ => None,
        })
    }

    fn watch(&self, events: Sender<WatchEvent>) -> Result<()> {
        *self.events.lock()? = Some(events);
        Ok(())
    }

    fn status_writer(&self) -> &StatusWriter {
        &self.writer
    }

    fn release(&self, play: &PlayKey) -> Result<()> {
        let mut jobs = self.table.jobs.lock()?;
        let before = jobs.len();
        jobs.retain(|_, job| job.play != *play);
        let released = before - jobs.len();
        if released > 0 {
            debug!(play = %play, jobs = released, "released local jobs");
        }
        Ok(())
    }
}

fn finish(
    table: &JobTable,
    events: &Mutex<Option<Sender<WatchEvent>>>,
    key: &JobKey,
    code: i32,
) {
    let notify = match table.jobs.lock() {
        Ok(mut jobs) => jobs.get_mut(key).map(|job| {
            job.state = JobState::Exited(code);
            (job.play.clone(), job.frame_id.clone())
        }),
        Err(e) => {
            error!(job = %key.1, "job table poisoned: {}", e);
            None
        }
    };
    table.exited.notify_all();

    let Some((play, frame_id)) = notify else {
        return;
    };
    if let Ok(events) = events.lock() {
        if let Some(tx) = events.as_ref() {
            if tx.send(WatchEvent::Frame { play, frame_id }).is_err() {
                debug!(job = %key.1, "no controller listening for frame events");
            }
        }
    }
}

/// Runs `processes` in order, stopping at the first failure. Returns 0 or 1.
fn run_processes(job: &str, processes: &[ProcessSpec]) -> i32 {
    for process in processes {
        match run_process(job, process) {
            Ok(true) => {}
            Ok(false) => return 1,
            Err(e) => {
                warn!(job, container = %process.container, "could not run process: {}", e);
                return 1;
            }
        }
    }
    info!(job, "local job succeeded");
    0
}

fn run_process(job: &str, process: &ProcessSpec) -> std::io::Result<bool> {
    debug!(
        job,
        container = %process.container,
        program = %process.program,
        args = ?process.args,
        "spawning process"
    );

    let mut cmd = Command::new(&process.program);
    cmd.args(&process.args)
        .envs(&process.env)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .in_new_process_group();
    if let Some(dir) = &process.working_dir {
        cmd.current_dir(dir);
    }

    let mut child = cmd.spawn()?;
    let pid = child.id();
    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.register(pid, job);
    }

    let stdout = child
        .stdout
        .take()
        .map(|out| forward_lines(job.to_string(), out, false));
    let stderr = child
        .stderr
        .take()
        .map(|err| forward_lines(job.to_string(), err, true));

    let status = child.wait();
    for forwarder in [stdout, stderr].into_iter().flatten() {
        let _ = forwarder.join();
    }
    if let Ok(mut registry) = ChildRegistry::global().lock() {
        registry.unregister(pid);
    }

    let status = status?;
    if !status.success() {
        info!(job, container = %process.container, code = ?status.code(), "process failed");
    }
    Ok(status.success())
}

fn forward_lines<R: Read + Send + 'static>(
    job: String,
    stream: R,
    is_stderr: bool,
) -> thread::JoinHandle<()> {
    thread::spawn(move || {
        for line in BufReader::new(stream).lines().map_while(|l| l.ok()) {
            if is_stderr {
                warn!(job = %job, "{}", line);
            } else {
                info!(job = %job, "{}", line);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::{ConfigObject, MemoryProvisioner};
    use crate::store::{MemoryStore, PlayStore};
    use crate::types::{
        Action, EnvFromSource, EnvVar, Frame, LocalObjectReference, PlaySpec, Scene, Screenplay,
    };
    use std::sync::mpsc;
    use std::time::Duration;

    fn play_with(frames: Vec<Frame>) -> Play {
        Play::new(
            "ci",
            "build",
            PlaySpec {
                screenplays: vec![Screenplay {
                    name: "main".to_string(),
                    scenes: vec![Scene {
                        name: "s".to_string(),
                        frames,
                        ..Scene::default()
                    }],
                }],
                ..PlaySpec::default()
            },
        )
    }

    fn frame(id: &str, command: &[&str]) -> Frame {
        Frame {
            id: id.to_string(),
            name: id.to_string(),
            action: Action {
                containers: vec![Container::with_command(id, command.iter().copied())],
                ..Action::default()
            },
            ..Frame::default()
        }
    }

    fn backend(provisioner: Arc<MemoryProvisioner>) -> LocalProcessBackend {
        let store: Arc<dyn PlayStore> = Arc::new(MemoryStore::new());
        LocalProcessBackend::new(Arc::new(StatusWriter::new(store, 3)), provisioner)
    }

    #[test]
    fn test_exit_codes_are_zero_or_one() {
        let backend = backend(Arc::new(MemoryProvisioner::new()));
        let play = play_with(vec![
            frame("ok", &["true"]),
            frame("bad", &["sh", "-c", "exit 7"]),
        ]);

        let ok = backend.submit(&play, "ok").expect("submit ok");
        let bad = backend.submit(&play, "bad").expect("submit bad");
        assert_eq!(backend.await_exit(&ok).expect("await"), 0);
        assert_eq!(backend.await_exit(&bad).expect("await"), 1);
        assert_eq!(backend.observe(&play, "bad").expect("observe"), Some(1));
    }

    #[test]
    fn test_missing_program_fails_frame() {
        let backend = backend(Arc::new(MemoryProvisioner::new()));
        let play = play_with(vec![frame("ghost", &["/nonexistent/scenerun-binary"])]);
        let handle = backend.submit(&play, "ghost").expect("submit");
        assert_eq!(backend.await_exit(&handle).expect("await"), 1);
    }

    #[test]
    fn test_submit_is_get_or_create() {
        let backend = backend(Arc::new(MemoryProvisioner::new()));
        let play = play_with(vec![frame("once", &["true"])]);
        let first = backend.submit(&play, "once").expect("submit");
        let second = backend.submit(&play, "once").expect("resubmit");
        assert!(!first.recovered);
        assert!(second.recovered);
        assert_eq!(backend.job_count(), 1);
        assert_eq!(backend.await_exit(&second).expect("await"), 0);
    }

    #[test]
    fn test_release_drops_only_that_plays_jobs() {
        let backend = backend(Arc::new(MemoryProvisioner::new()));
        let build = play_with(vec![frame("a", &["true"]), frame("b", &["true"])]);
        let mut deploy = play_with(vec![frame("a", &["true"])]);
        deploy.metadata.name = "deploy".to_string();

        for (play, id) in [(&build, "a"), (&build, "b"), (&deploy, "a")] {
            let handle = backend.submit(play, id).expect("submit");
            backend.await_exit(&handle).expect("await");
        }
        assert_eq!(backend.job_count(), 3);

        backend.release(&build.key()).expect("release");
        assert_eq!(backend.job_count(), 1);
        assert_eq!(backend.observe(&build, "a").expect("observe"), None);
        assert_eq!(backend.observe(&deploy, "a").expect("observe"), Some(0));

        backend.release(&build.key()).expect("release again");
        assert_eq!(backend.job_count(), 1);
    }

    #[test]
    fn test_container_without_command_is_rejected() {
        let backend = backend(Arc::new(MemoryProvisioner::new()));
        let mut f = frame("empty", &["true"]);
        f.action.containers[0].command.clear();
        let play = play_with(vec![f]);
        let err = backend.submit(&play, "empty").unwrap_err();
        assert!(matches!(err, EngineError::Submission(_)));
        assert_eq!(backend.job_count(), 0);
    }

    #[test]
    fn test_plan_merges_env_sources() {
        let provisioner = Arc::new(MemoryProvisioner::new());
        provisioner
            .insert_config(ConfigObject {
                name: "build-vars".to_string(),
                namespace: "ci".to_string(),
                data: BTreeMap::from([
                    ("ENV".to_string(), "prod".to_string()),
                    ("REGION".to_string(), "eu".to_string()),
                ]),
                ..ConfigObject::default()
            })
            .expect("seed");
        let backend = backend(provisioner);

        let mut f = frame("envy", &["sh", "-c"]);
        let container = &mut f.action.containers[0];
        container.args.push("test \"$ENV\" = prod".to_string());
        container.env.push(EnvVar::new("REGION", "us"));
        container.env_from.push(EnvFromSource {
            config_map_ref: LocalObjectReference {
                name: "build-vars".to_string(),
            },
        });
        let play = play_with(vec![f]);

        let plan = backend.plan(&play, "envy").expect("plan");
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].program, "sh");
        assert_eq!(plan[0].args, vec!["-c", "test \"$ENV\" = prod"]);
        assert_eq!(plan[0].env.get("ENV").map(String::as_str), Some("prod"));
        assert_eq!(plan[0].env.get("REGION").map(String::as_str), Some("us"));

        let handle = backend.submit(&play, "envy").expect("submit");
        assert_eq!(backend.await_exit(&handle).expect("await"), 0);
    }

    #[test]
    fn test_init_containers_run_first_and_gate() {
        let backend = backend(Arc::new(MemoryProvisioner::new()));
        let mut f = frame("gated", &["true"]);
        f.action
            .init_containers
            .push(Container::with_command("setup", ["false"]));
        let play = play_with(vec![f]);
        let handle = backend.submit(&play, "gated").expect("submit");
        assert_eq!(backend.await_exit(&handle).expect("await"), 1);
    }

    #[test]
    fn test_completion_is_announced() {
        let backend = backend(Arc::new(MemoryProvisioner::new()));
        let (tx, rx) = mpsc::channel();
        backend.watch(tx).expect("watch");

        let play = play_with(vec![frame("loud", &["true"])]);
        backend.submit(&play, "loud").expect("submit");
        match rx.recv_timeout(Duration::from_secs(5)).expect("event") {
            WatchEvent::Frame { play: key, frame_id } => {
                assert_eq!(key, play.key());
                assert_eq!(frame_id, "loud");
            }
            other => panic!("unexpected event {:?}", other),
        }
    }
}
