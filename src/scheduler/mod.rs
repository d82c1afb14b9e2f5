//! Scheduler backends.
//!
//! A backend turns one frame into one job and reports the job's terminal exit
//! code. Submission is get-or-create on a deterministic job name, so
//! submitting a frame again after a crash attaches to the job that is already
//! running instead of starting a second one.
//!
//! Two implementations ship with the crate:
//!
//! - [`cluster::ClusterJobBackend`] creates batch jobs through a [`cluster::JobClient`]
//! - [`local::LocalProcessBackend`] runs the frame's commands as child processes
//!
//! Both write Play status through a shared [`StatusWriter`], which serializes
//! read-modify-write cycles per Play and retries on version conflicts.

pub mod cluster;
pub mod local;

use std::collections::HashMap;
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::controller::WatchEvent;
use crate::error::{EngineError, Result};
use crate::phase::PlayPhase;
use crate::store::PlayStore;
use crate::types::{Play, PlayKey};

/// Length limit of backend object names.
pub const MAX_JOB_NAME_LENGTH: usize = 63;
/// Characters of the Play name kept in a job name.
pub const JOB_NAME_PLAY_CHARS: usize = 46;
/// Characters of the frame id kept in a job name.
pub const JOB_NAME_FRAME_CHARS: usize = 16;

/// Deterministic backend job name for a frame of a Play.
///
/// The Play name is cut to 46 characters and the frame id to 16, so the result
/// never exceeds 63 characters.
pub fn job_name(play: &str, frame_id: &str) -> String {
    format!(
        "{:.play_width$}-{:.frame_width$}",
        play,
        frame_id,
        play_width = JOB_NAME_PLAY_CHARS,
        frame_width = JOB_NAME_FRAME_CHARS
    )
}

/// Reference to a submitted (or recovered) job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub play: PlayKey,
    pub frame_id: String,
    pub job_name: String,
    /// True when submission found an existing job instead of creating one
    pub recovered: bool,
}

/// Pluggable execution target for frames.
pub trait SchedulerBackend: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Submits `frame_id` of `play`, or recovers its existing job.
    fn submit(&self, play: &Play, frame_id: &str) -> Result<JobHandle>;

    /// Blocks the calling thread until the job is terminal. Returns its exit code.
    fn await_exit(&self, handle: &JobHandle) -> Result<i32>;

    /// Exit code of the frame's job if it is terminal, `None` if it is still
    /// running or was never submitted.
    fn observe(&self, play: &Play, frame_id: &str) -> Result<Option<i32>>;

    /// Starts forwarding job state changes to `events`.
    fn watch(&self, events: Sender<WatchEvent>) -> Result<()>;

    fn status_writer(&self) -> &StatusWriter;

    /// Forgets the jobs of a Play that reached a terminal phase. Called on
    /// every reconcile of a terminal Play, so it must be idempotent.
    fn release(&self, _play: &PlayKey) -> Result<()> {
        Ok(())
    }

    fn update_phase(&self, key: &PlayKey, phase: PlayPhase) -> Result<Play> {
        self.status_writer().update_phase(key, phase)
    }

    fn record_frame_result(&self, key: &PlayKey, frame_id: &str, exit_code: i32) -> Result<Play> {
        self.status_writer()
            .record_frame_result(key, frame_id, exit_code)
    }
}

/// Serialized, conflict-retrying writer of Play status.
///
/// Writers for the same Play take a per-Play lock, re-read the latest stored
/// object, apply their change and write it back. A version conflict (another
/// process wrote in between) causes a fresh read and another attempt, up to
/// `max_attempts`.
pub struct StatusWriter {
    store: Arc<dyn PlayStore>,
    locks: Mutex<HashMap<PlayKey, Arc<Mutex<()>>>>,
    max_attempts: u32,
}

impl StatusWriter {
    pub fn new(store: Arc<dyn PlayStore>, max_attempts: u32) -> Self {
        Self {
            store,
            locks: Mutex::new(HashMap::new()),
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn store(&self) -> &Arc<dyn PlayStore> {
        &self.store
    }

    fn lock_for(&self, key: &PlayKey) -> Result<Arc<Mutex<()>>> {
        let mut locks = self.locks.lock()?;
        Ok(locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    /// Read-modify-write of a whole Play.
    ///
    /// `change` returns `Ok(false)` when there is nothing to write; the stored
    /// Play is then returned untouched. With `status_only` the spec part of
    /// the change is discarded by the store.
    pub fn modify<F>(&self, key: &PlayKey, status_only: bool, mut change: F) -> Result<Play>
    where
        F: FnMut(&mut Play) -> Result<bool>,
    {
        let lock = self.lock_for(key)?;
        let _guard = lock.lock()?;

        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut play = self.store.get(key)?;
            if !change(&mut play)? {
                return Ok(play);
            }
            let written = if status_only {
                self.store.update_status(&play)
            } else {
                self.store.update(&play)
            };
            match written {
                Ok(play) => return Ok(play),
                Err(EngineError::Conflict(msg)) if attempt < self.max_attempts => {
                    debug!(play = %key, attempt, "status conflict, retrying: {}", msg);
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Moves the Play to `phase`.
    ///
    /// Writing the phase the Play is already in is a no-op, so a retried
    /// reconciliation does not trip over its own earlier write.
    pub fn update_phase(&self, key: &PlayKey, phase: PlayPhase) -> Result<Play> {
        self.modify(key, true, |play| {
            if play.status.phase == Some(phase) {
                return Ok(false);
            }
            PlayPhase::check_transition(play.status.phase, phase)?;
            info!(play = %key, from = ?play.status.phase, to = %phase, "{}", phase.description());
            play.status.phase = Some(phase);
            Ok(true)
        })
    }

    /// Records the exit code of a finished frame.
    ///
    /// The first recorded result wins; a frame that already has one keeps it.
    pub fn record_frame_result(
        &self,
        key: &PlayKey,
        frame_id: &str,
        exit_code: i32,
    ) -> Result<Play> {
        self.modify(key, true, |play| {
            if let Some(existing) = play.frame_result(frame_id) {
                if existing != exit_code {
                    warn!(
                        play = %key,
                        frame = frame_id,
                        existing,
                        exit_code,
                        "frame result already recorded, keeping the first"
                    );
                }
                return Ok(false);
            }
            info!(play = %key, frame = frame_id, exit_code, "frame finished");
            play.status.frames.insert(frame_id.to_string(), exit_code);
            Ok(true)
        })
    }
}

impl std::fmt::Debug for StatusWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusWriter")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::types::PlaySpec;
    use std::thread;

    fn writer_with_play() -> (StatusWriter, PlayKey) {
        let store = Arc::new(MemoryStore::new());
        let play = store
            .create(Play::new("ci", "build", PlaySpec::default()))
            .expect("create");
        (StatusWriter::new(store, 5), play.key())
    }

    #[test]
    fn test_job_name_truncates_both_parts() {
        let play = "p".repeat(80);
        let frame = "f".repeat(20);
        let name = job_name(&play, &frame);
        assert_eq!(name.len(), MAX_JOB_NAME_LENGTH);
        assert_eq!(name, format!("{}-{}", "p".repeat(46), "f".repeat(16)));
        assert_eq!(job_name("build", "abc"), "build-abc");
    }

    #[test]
    fn test_update_phase_checks_transitions() {
        let (writer, key) = writer_with_play();
        writer.update_phase(&key, PlayPhase::Init).expect("init");
        let play = writer.update_phase(&key, PlayPhase::Init).expect("no-op");
        assert_eq!(play.phase(), Some(PlayPhase::Init));

        let err = writer.update_phase(&key, PlayPhase::Complete).unwrap_err();
        assert!(matches!(err, EngineError::Transition(_)));
    }

    #[test]
    fn test_record_frame_result_keeps_first() {
        let (writer, key) = writer_with_play();
        writer.record_frame_result(&key, "a", 1).expect("record");
        let play = writer.record_frame_result(&key, "a", 0).expect("record again");
        assert_eq!(play.frame_result("a"), Some(1));
    }

    #[test]
    fn test_concurrent_frame_results_are_all_kept() {
        let (writer, key) = writer_with_play();
        let writer = Arc::new(writer);

        let handles: Vec<_> = (0..16)
            .map(|i| {
                let writer = Arc::clone(&writer);
                let key = key.clone();
                thread::spawn(move || {
                    writer
                        .record_frame_result(&key, &format!("frame-{}", i), i % 2)
                        .expect("record");
                })
            })
            .collect();
        for handle in handles {
            handle.join().expect("writer thread");
        }

        let play = writer.store().get(&key).expect("get");
        assert_eq!(play.status.frames.len(), 16);
        assert_eq!(play.frame_result("frame-3"), Some(1));
    }

    #[test]
    fn test_modify_retries_on_conflict() {
        let (writer, key) = writer_with_play();
        let store = Arc::clone(writer.store());
        let mut interfered = false;

        let play = writer
            .modify(&key, true, |play| {
                if !interfered {
                    // Another writer sneaks in after our read
                    interfered = true;
                    let mut other = store.get(&key)?;
                    other.status.runner = "other".to_string();
                    store.update_status(&other)?;
                }
                play.status.frames.insert("x".to_string(), 0);
                Ok(true)
            })
            .expect("retry succeeds");

        assert_eq!(play.status.runner, "other");
        assert_eq!(play.frame_result("x"), Some(0));
    }
}
