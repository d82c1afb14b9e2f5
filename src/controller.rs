//! Event-driven reconcile loop.
//!
//! The controller keeps a queue of Plays that need attention. A Play is queued
//! when it is first handed to the controller, when a backend reports one of
//! its jobs finished, when its requeue delay runs out, and on every resync
//! tick. Each dequeued Play gets exactly one [`Engine::reconcile`] call.

use std::collections::{BTreeMap, HashSet, VecDeque};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::time::{Duration, Instant};
use tracing::{debug, error, info};

use crate::engine::Engine;
use crate::error::{EngineError, Result};
use crate::phase::PlayPhase;
use crate::scheduler::cluster::BatchJob;
use crate::types::PlayKey;

/// Something happened that may move a Play forward.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    /// The Play itself changed or asked to be looked at
    Play(PlayKey),
    /// A cluster job reached a terminal condition
    Job(BatchJob),
    /// A local job exited
    Frame { play: PlayKey, frame_id: String },
}

impl WatchEvent {
    /// The Play this event concerns, if it can be told.
    pub fn play_key(&self) -> Option<PlayKey> {
        match self {
            Self::Play(key) => Some(key.clone()),
            Self::Frame { play, .. } => Some(play.clone()),
            Self::Job(job) => job
                .play_name()
                .map(|name| PlayKey::new(&job.metadata.namespace, name)),
        }
    }
}

/// Drives a set of Plays until each of them is terminal.
pub struct Controller {
    engine: Arc<Engine>,
    tx: Sender<WatchEvent>,
    rx: Receiver<WatchEvent>,
    resync: Duration,
}

impl Controller {
    /// Wires `engine` and its backend to a fresh event channel.
    pub fn new(engine: Arc<Engine>, resync: Duration) -> Result<Self> {
        let (tx, rx) = mpsc::channel();
        engine.set_events(tx.clone())?;
        engine.backend().watch(tx.clone())?;
        Ok(Self {
            engine,
            tx,
            rx,
            resync,
        })
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Sender for injecting events from outside.
    pub fn sender(&self) -> Sender<WatchEvent> {
        self.tx.clone()
    }

    /// Asks for `key` to be reconciled.
    pub fn enqueue(&self, key: PlayKey) -> Result<()> {
        self.tx
            .send(WatchEvent::Play(key))
            .map_err(|_| EngineError::state("controller event channel closed"))
    }

    /// Reconciles `keys` until every one of them is terminal and cleaned up.
    ///
    /// Returns the final phase of each Play that still exists. Fails if
    /// `timeout` passes first.
    pub fn run_until_terminal(
        &self,
        keys: &[PlayKey],
        timeout: Option<Duration>,
    ) -> Result<BTreeMap<PlayKey, PlayPhase>> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let tracked: HashSet<PlayKey> = keys.iter().cloned().collect();
        let mut queue = WorkQueue::default();
        let mut delayed: BTreeMap<PlayKey, Instant> = BTreeMap::new();
        let mut settled: BTreeMap<PlayKey, Option<PlayPhase>> = BTreeMap::new();

        for key in keys {
            queue.push(key.clone());
        }
        info!(plays = tracked.len(), runner = %self.engine.runner_id(), "controller started");

        loop {
            if settled.len() == tracked.len() {
                break;
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                let waiting: Vec<String> = tracked
                    .iter()
                    .filter(|k| !settled.contains_key(*k))
                    .map(ToString::to_string)
                    .collect();
                return Err(EngineError::state(format!(
                    "timed out waiting for plays: {}",
                    waiting.join(", ")
                )));
            }

            let now = Instant::now();
            let due: Vec<PlayKey> = delayed
                .iter()
                .filter(|&(_, at)| *at <= now)
                .map(|(key, _)| key.clone())
                .collect();
            for key in due {
                delayed.remove(&key);
                queue.push(key);
            }

            if let Some(key) = queue.pop() {
                self.process(&key, &mut queue, &mut delayed, &mut settled, &tracked);
                continue;
            }

            let mut wait = self.resync;
            if let Some(next) = delayed.values().min() {
                wait = wait.min(next.saturating_duration_since(now));
            }
            if let Some(d) = deadline {
                wait = wait.min(d.saturating_duration_since(now));
            }

            match self.rx.recv_timeout(wait) {
                Ok(event) => self.route(event, &mut queue, &tracked, &settled),
                Err(RecvTimeoutError::Timeout) => {
                    if delayed.is_empty() {
                        debug!("resync");
                        for key in tracked.iter().filter(|k| !settled.contains_key(*k)) {
                            queue.push(key.clone());
                        }
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(EngineError::state("controller event channel closed"));
                }
            }
            // Drain whatever else arrived so one burst leads to one reconcile
            while let Ok(event) = self.rx.try_recv() {
                self.route(event, &mut queue, &tracked, &settled);
            }
        }

        Ok(settled
            .into_iter()
            .filter_map(|(key, phase)| phase.map(|phase| (key, phase)))
            .collect())
    }

    fn route(
        &self,
        event: WatchEvent,
        queue: &mut WorkQueue,
        tracked: &HashSet<PlayKey>,
        settled: &BTreeMap<PlayKey, Option<PlayPhase>>,
    ) {
        let Some(key) = event.play_key() else {
            debug!(?event, "event without a play, ignoring");
            return;
        };
        if !tracked.contains(&key) || settled.contains_key(&key) {
            debug!(play = %key, "event for a play not being driven, ignoring");
            return;
        }
        queue.push(key);
    }

    fn process(
        &self,
        key: &PlayKey,
        queue: &mut WorkQueue,
        delayed: &mut BTreeMap<PlayKey, Instant>,
        settled: &mut BTreeMap<PlayKey, Option<PlayPhase>>,
        tracked: &HashSet<PlayKey>,
    ) {
        let outcome = match self.engine.reconcile(key) {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(play = %key, "reconcile failed: {}", e);
                delayed.insert(key.clone(), Instant::now() + self.resync);
                return;
            }
        };

        if outcome.requeue {
            queue.push(key.clone());
        } else if let Some(after) = outcome.requeue_after {
            let at = Instant::now() + after;
            delayed
                .entry(key.clone())
                .and_modify(|existing| *existing = (*existing).min(at))
                .or_insert(at);
        } else if outcome.is_settled() && tracked.contains(key) {
            delayed.remove(key);
            info!(
                play = %key,
                phase = %outcome.phase.map(|p| p.to_string()).unwrap_or_else(|| "deleted".to_string()),
                "play settled"
            );
            settled.insert(key.clone(), outcome.phase);
        }
    }
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("engine", &self.engine)
            .field("resync", &self.resync)
            .finish_non_exhaustive()
    }
}

/// FIFO of Play keys where a key is held at most once.
#[derive(Default)]
struct WorkQueue {
    order: VecDeque<PlayKey>,
    queued: HashSet<PlayKey>,
}

impl WorkQueue {
    fn push(&mut self, key: PlayKey) {
        if self.queued.insert(key.clone()) {
            self.order.push_back(key);
        }
    }

    fn pop(&mut self) -> Option<PlayKey> {
        let key = self.order.pop_front()?;
        self.queued.remove(&key);
        Some(key)
    }
}
