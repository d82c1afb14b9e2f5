//! Play reconciliation.
//!
//! [`Engine::reconcile`] reads a Play, performs at most one phase transition,
//! persists the result and returns. It never waits for a frame to finish.
//!
//! | Phase               | Action                                                        | Next                       |
//! |---------------------|---------------------------------------------------------------|----------------------------|
//! | unset / `Created`   | none                                                          | `Init`                     |
//! | `Init`              | validate, resolve vars, provision, expand, assign frame ids   | `Running`, or `Error`      |
//! | `Running`           | adopt if owned by another runner, collect results, submit      | `Running`/`Complete`/`Failed`/`Error` |
//! | terminal            | release backend jobs, delete provisioned volumes              | stays                      |
//!
//! Configuration, provisioning and submission errors end the Play in `Error`.
//! Retryable errors (version conflicts, IO, poisoned state) are returned as a
//! requeue instead and never change the phase.

use std::collections::HashSet;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use crate::config::ExecutionMode;
use crate::controller::WatchEvent;
use crate::error::{EngineError, Result};
use crate::executor::SceneExecutor;
use crate::expand;
use crate::ids;
use crate::phase::PlayPhase;
use crate::provision::{self, Provisioner};
use crate::scheduler::{SchedulerBackend, StatusWriter};
use crate::store::PlayStore;
use crate::types::{Play, PlayKey};

/// What the caller should do after a reconciliation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileOutcome {
    /// Phase the Play is in afterwards; `None` if it no longer exists
    pub phase: Option<PlayPhase>,
    /// Reconcile again right away
    pub requeue: bool,
    /// Reconcile again after this delay unless an event comes first
    pub requeue_after: Option<Duration>,
}

impl ReconcileOutcome {
    pub fn done(phase: Option<PlayPhase>) -> Self {
        Self {
            phase,
            requeue: false,
            requeue_after: None,
        }
    }

    pub fn requeue(phase: Option<PlayPhase>) -> Self {
        Self {
            phase,
            requeue: true,
            requeue_after: None,
        }
    }

    pub fn requeue_after(phase: Option<PlayPhase>, delay: Duration) -> Self {
        Self {
            phase,
            requeue: false,
            requeue_after: Some(delay),
        }
    }

    /// True once the Play is terminal and nothing is left to clean up.
    pub fn is_settled(&self) -> bool {
        !self.requeue
            && self.requeue_after.is_none()
            && self.phase.is_none_or(PlayPhase::is_terminal)
    }
}

/// Drives Plays through their phases.
pub struct Engine {
    store: Arc<dyn PlayStore>,
    backend: Arc<dyn SchedulerBackend>,
    provisioner: Arc<dyn Provisioner>,
    executor: SceneExecutor,
    runner_id: String,
    mode: ExecutionMode,
    requeue_interval: Duration,
    /// Plays with a live blocking screenplay thread in this process
    active: Arc<Mutex<HashSet<PlayKey>>>,
    events: Arc<Mutex<Option<Sender<WatchEvent>>>>,
}

impl Engine {
    /// An engine with a fresh random runner id.
    ///
    /// The backend's status writer must be backed by `store`.
    pub fn new(
        store: Arc<dyn PlayStore>,
        backend: Arc<dyn SchedulerBackend>,
        provisioner: Arc<dyn Provisioner>,
    ) -> Self {
        Self {
            executor: SceneExecutor::new(Arc::clone(&backend)),
            store,
            backend,
            provisioner,
            runner_id: ids::random_id(),
            mode: ExecutionMode::default(),
            requeue_interval: Duration::from_secs(2),
            active: Arc::new(Mutex::new(HashSet::new())),
            events: Arc::new(Mutex::new(None)),
        }
    }

    pub fn with_mode(mut self, mode: ExecutionMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_requeue_interval(mut self, interval: Duration) -> Self {
        self.requeue_interval = interval;
        self
    }

    /// Replaces the runner id, e.g. to resume as a known instance.
    pub fn with_runner_id(mut self, runner_id: impl Into<String>) -> Self {
        self.runner_id = runner_id.into();
        self
    }

    pub fn runner_id(&self) -> &str {
        &self.runner_id
    }

    pub fn store(&self) -> &Arc<dyn PlayStore> {
        &self.store
    }

    pub fn backend(&self) -> &Arc<dyn SchedulerBackend> {
        &self.backend
    }

    pub fn mode(&self) -> ExecutionMode {
        self.mode
    }

    pub fn requeue_interval(&self) -> Duration {
        self.requeue_interval
    }

    /// Announces Plays whose blocking run ended on `events`.
    pub fn set_events(&self, events: Sender<WatchEvent>) -> Result<()> {
        *self.events.lock()? = Some(events);
        Ok(())
    }

    fn writer(&self) -> &StatusWriter {
        self.backend.status_writer()
    }

    /// Performs one reconciliation of the Play at `key`.
    pub fn reconcile(&self, key: &PlayKey) -> Result<ReconcileOutcome> {
        let play = match self.store.get(key) {
            Ok(play) => play,
            Err(e) if e.is_not_found() => {
                debug!(play = %key, "play gone, nothing to reconcile");
                return Ok(ReconcileOutcome::done(None));
            }
            Err(e) => return Err(e),
        };
        let phase = play.phase();

        let result = match phase {
            None | Some(PlayPhase::Created) => self.begin(&play),
            Some(PlayPhase::Init) => self.initialize(&play),
            Some(PlayPhase::Running) => self.run(play),
            Some(_) => self.finalize(&play),
        };

        match result {
            Err(e) if e.is_retryable() => {
                warn!(play = %key, "reconcile will be retried: {}", e);
                Ok(ReconcileOutcome::requeue(phase))
            }
            other => other,
        }
    }

    fn begin(&self, play: &Play) -> Result<ReconcileOutcome> {
        let play = self.writer().update_phase(&play.key(), PlayPhase::Init)?;
        Ok(ReconcileOutcome::requeue(play.phase()))
    }

    fn initialize(&self, play: &Play) -> Result<ReconcileOutcome> {
        match self.prepare(play) {
            Ok(play) => {
                info!(
                    play = %play.key(),
                    runner = %self.runner_id,
                    frames = play.frames().count(),
                    "play running"
                );
                Ok(ReconcileOutcome::requeue(play.phase()))
            }
            Err(e) if e.is_retryable() => Err(e),
            Err(e) => self.fail(&play.key(), e),
        }
    }

    /// Provisions, expands and moves the Play to `Running` in a single write.
    fn prepare(&self, play: &Play) -> Result<Play> {
        play.validate()?;

        let provisioner = self.provisioner.as_ref();
        let vars = provision::resolve_vars(provisioner, play)?;
        let vars_config = if vars.is_empty() {
            String::new()
        } else {
            provision::provision_vars_config(provisioner, play, &vars)?
        };
        let volumes = provision::provision_volumes(provisioner, play)?;

        let runner = self.runner_id.as_str();
        self.writer().modify(&play.key(), false, |current| {
            if current.phase() != Some(PlayPhase::Init) {
                return Ok(false);
            }
            PlayPhase::check_transition(current.phase(), PlayPhase::Running)?;
            current.spec.vars = vars.clone();
            current.status.vars_config_map = vars_config.clone();
            current.status.provisioned_volumes = volumes.clone();
            expand::expand_play(current);
            // Generated ids and copy suffixes can still collide after expansion
            current.check_frame_identity()?;
            current.status.phase = Some(PlayPhase::Running);
            current.status.runner = runner.to_string();
            Ok(true)
        })
    }

    fn run(&self, mut play: Play) -> Result<ReconcileOutcome> {
        let key = play.key();
        if play.status.runner != self.runner_id {
            info!(
                play = %key,
                previous = %play.status.runner,
                runner = %self.runner_id,
                "recovering play from another runner"
            );
            play = self.adopt(&key)?;
        }

        match self.mode {
            ExecutionMode::NonBlocking => match self.executor.step(&mut play) {
                Ok(progress) => match progress.terminal_phase() {
                    Some(phase) => {
                        let play = self.writer().update_phase(&key, phase)?;
                        Ok(ReconcileOutcome::requeue(play.phase()))
                    }
                    None => Ok(ReconcileOutcome::requeue_after(
                        play.phase(),
                        self.requeue_interval,
                    )),
                },
                Err(e) if e.is_retryable() => Err(e),
                Err(e) => self.fail(&key, e),
            },
            ExecutionMode::Blocking => {
                // Missing main is fatal before anything is launched
                if let Err(e) = play.main_screenplay() {
                    return self.fail(&key, e);
                }
                self.launch(&key)?;
                Ok(ReconcileOutcome::requeue_after(
                    play.phase(),
                    self.requeue_interval,
                ))
            }
        }
    }

    /// Records this engine as the Play's runner.
    fn adopt(&self, key: &PlayKey) -> Result<Play> {
        let runner = self.runner_id.as_str();
        self.writer().modify(key, true, |play| {
            if play.status.runner == runner {
                return Ok(false);
            }
            play.status.runner = runner.to_string();
            Ok(true)
        })
    }

    /// Starts the blocking screenplay thread for `key` unless one is running.
    fn launch(&self, key: &PlayKey) -> Result<()> {
        if !self.active.lock()?.insert(key.clone()) {
            return Ok(());
        }

        let executor = self.executor.clone();
        let active = Arc::clone(&self.active);
        let events = Arc::clone(&self.events);
        let key = key.clone();
        let spawned = thread::Builder::new()
            .name(format!("play-{}", key.name))
            .spawn({
                let key = key.clone();
                move || {
                    // Dropped on panic too, so a later reconcile can launch again
                    let run = ActiveRun {
                        active,
                        key: key.clone(),
                    };
                    let writer = executor.backend().status_writer();
                    let phase = match executor.run_screenplay(&key) {
                        Ok(phase) => phase,
                        Err(e) => {
                            error!(play = %key, "screenplay run failed: {}", e);
                            PlayPhase::Error
                        }
                    };
                    if let Err(e) = writer.update_phase(&key, phase) {
                        error!(play = %key, "could not record final phase {}: {}", phase, e);
                    }
                    drop(run);
                    if let Ok(events) = events.lock() {
                        if let Some(tx) = events.as_ref() {
                            let _ = tx.send(WatchEvent::Play(key.clone()));
                        }
                    }
                }
            });

        if let Err(e) = spawned {
            self.active.lock()?.remove(&key);
            return Err(EngineError::state(format!("spawning screenplay thread: {}", e)));
        }
        debug!(play = %key, "launched blocking screenplay run");
        Ok(())
    }

    /// Number of blocking screenplay runs in flight.
    pub fn active_runs(&self) -> usize {
        self.active.lock().map(|active| active.len()).unwrap_or(0)
    }

    fn finalize(&self, play: &Play) -> Result<ReconcileOutcome> {
        self.backend.release(&play.key())?;
        if play.status.provisioned_volumes.is_empty() {
            return Ok(ReconcileOutcome::done(play.phase()));
        }
        provision::delete_volumes(self.provisioner.as_ref(), play)?;
        let play = self.writer().modify(&play.key(), true, |current| {
            if current.status.provisioned_volumes.is_empty() {
                return Ok(false);
            }
            current.status.provisioned_volumes.clear();
            Ok(true)
        })?;
        Ok(ReconcileOutcome::done(play.phase()))
    }

    /// Moves the Play to `Error` because of `cause`.
    fn fail(&self, key: &PlayKey, cause: EngineError) -> Result<ReconcileOutcome> {
        error!(play = %key, "play failed: {}", cause);
        let play = self.writer().update_phase(key, PlayPhase::Error)?;
        Ok(ReconcileOutcome::requeue(play.phase()))
    }
}

/// Membership of a Play in the set of running blocking screenplays, removed
/// when dropped.
struct ActiveRun {
    active: Arc<Mutex<HashSet<PlayKey>>>,
    key: PlayKey,
}

impl Drop for ActiveRun {
    fn drop(&mut self) {
        let mut active = match self.active.lock() {
            Ok(active) => active,
            Err(poisoned) => poisoned.into_inner(),
        };
        active.remove(&self.key);
        if thread::panicking() {
            warn!(play = %self.key, "screenplay thread panicked, play can be launched again");
        }
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("runner_id", &self.runner_id)
            .field("backend", &self.backend.name())
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}
