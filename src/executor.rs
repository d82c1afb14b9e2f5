//! Scene and frame execution.
//!
//! Scenes of the `main` screenplay run strictly in order; the frames of one
//! scene run concurrently. A frame that has an entry in `status.frames` is
//! finished and is never submitted again.
//!
//! Two execution shapes are supported:
//!
//! - [`SceneExecutor::step`] is non-blocking. It collects results that became
//!   available, submits the unfinished frames of the current scene and returns.
//!   A later call, usually triggered by a job event, picks up from there.
//! - [`SceneExecutor::run_screenplay`] is blocking. It walks every scene,
//!   running one thread per frame, and returns once the screenplay is decided.
//!
//! A scene whose non-empty `when` gate is false is skipped and counts as
//! passed. Once all frames of a scene are finished its outcome is:
//!
//! 1. passed if the scene has `ignoreErrors`
//! 2. otherwise the value of its `pass` condition, if non-empty
//! 3. otherwise passed iff the bitwise OR of the frame exit codes is 0, where
//!    a frame with `ignoreErrors` contributes 0
//!
//! The first scene that does not pass stops the screenplay.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};
use crate::phase::PlayPhase;
use crate::scheduler::SchedulerBackend;
use crate::types::{Play, PlayKey, Scene, Vars};

/// Where the main screenplay stands after a non-blocking step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SceneProgress {
    /// Scene `scene` has unfinished frames; `pending` are submitted or running
    InFlight { scene: usize, pending: Vec<String> },
    /// Scene `scene` finished without passing
    Failed { scene: usize },
    /// Every scene finished and passed; nothing is left to run
    NoMoreFrames,
}

impl SceneProgress {
    /// The terminal phase this progress leads to, if any.
    pub fn terminal_phase(&self) -> Option<PlayPhase> {
        match self {
            Self::InFlight { .. } => None,
            Self::Failed { .. } => Some(PlayPhase::Failed),
            Self::NoMoreFrames => Some(PlayPhase::Complete),
        }
    }
}

/// Bitwise OR of the effective exit codes of the scene's finished frames.
pub fn aggregate_exit_codes(scene: &Scene, results: &BTreeMap<String, i32>) -> i32 {
    scene
        .frames
        .iter()
        .filter_map(|frame| results.get(&frame.id).map(|&code| frame.effective_exit(code)))
        .fold(0, |acc, code| acc | code)
}

/// Outcome of a finished scene with the given aggregate.
pub fn scene_passed(scene: &Scene, aggregate: i32, vars: &Vars) -> bool {
    if scene.ignore_errors {
        true
    } else if !scene.pass.is_empty() {
        scene.pass.evaluate(vars)
    } else {
        aggregate == 0
    }
}

fn unfinished_frames(scene: &Scene, play: &Play) -> Vec<String> {
    scene
        .frames
        .iter()
        .filter(|frame| !play.is_frame_finished(&frame.id))
        .map(|frame| frame.id.clone())
        .collect()
}

fn finished_scene_passed(scene: &Scene, play: &Play) -> bool {
    let aggregate = aggregate_exit_codes(scene, &play.status.frames);
    let passed = scene_passed(scene, aggregate, &play.spec.vars);
    if passed {
        debug!(play = %play.key(), scene = %scene.name, aggregate, "scene passed");
    } else {
        info!(play = %play.key(), scene = %scene.name, aggregate, "scene failed");
    }
    passed
}

/// Runs the scenes of a Play's main screenplay on a scheduler backend.
#[derive(Clone)]
pub struct SceneExecutor {
    backend: Arc<dyn SchedulerBackend>,
}

impl SceneExecutor {
    pub fn new(backend: Arc<dyn SchedulerBackend>) -> Self {
        Self { backend }
    }

    pub fn backend(&self) -> &Arc<dyn SchedulerBackend> {
        &self.backend
    }

    /// Advances the main screenplay without waiting for any frame.
    ///
    /// Results that are already available from the backend are recorded, which
    /// refreshes `play` from the store. If that finishes the current scene and
    /// it passed, the next scene's frames are submitted in the same call.
    pub fn step(&self, play: &mut Play) -> Result<SceneProgress> {
        let scene_count = play.main_screenplay()?.scenes.len();
        for index in 0..scene_count {
            let scene = play.main_screenplay()?.scenes[index].clone();
            if !scene.when.permits(&play.spec.vars) {
                debug!(play = %play.key(), scene = %scene.name, "scene gated off by when, skipping");
                continue;
            }

            for frame_id in unfinished_frames(&scene, play) {
                if let Some(code) = self.backend.observe(play, &frame_id)? {
                    *play = self
                        .backend
                        .record_frame_result(&play.key(), &frame_id, code)?;
                }
            }

            let pending = unfinished_frames(&scene, play);
            if pending.is_empty() {
                if finished_scene_passed(&scene, play) {
                    continue;
                }
                return Ok(SceneProgress::Failed { scene: index });
            }

            for frame_id in &pending {
                self.backend.submit(play, frame_id)?;
            }
            debug!(
                play = %play.key(),
                scene = %scene.name,
                pending = pending.len(),
                "scene in flight"
            );
            return Ok(SceneProgress::InFlight {
                scene: index,
                pending,
            });
        }
        Ok(SceneProgress::NoMoreFrames)
    }

    /// Runs the unfinished frames of scene `index` to completion, one thread
    /// per frame, and records every result.
    ///
    /// Returns whether the scene passed. If any frame could not be submitted
    /// the error is returned after the other frames have finished.
    pub fn run_scene(&self, key: &PlayKey, index: usize) -> Result<bool> {
        let store = Arc::clone(self.backend.status_writer().store());
        let play = store.get(key)?;
        let scene = play
            .main_screenplay()?
            .scenes
            .get(index)
            .cloned()
            .ok_or_else(|| EngineError::config(format!("play {} has no scene {}", key, index)))?;

        if !scene.when.permits(&play.spec.vars) {
            debug!(play = %key, scene = %scene.name, "scene gated off by when, skipping");
            return Ok(true);
        }

        let pending = unfinished_frames(&scene, &play);
        let (tx, rx) = mpsc::channel();
        for frame_id in &pending {
            let backend = Arc::clone(&self.backend);
            let play = play.clone();
            let frame_id = frame_id.clone();
            let tx = tx.clone();
            thread::spawn(move || {
                let result = backend
                    .submit(&play, &frame_id)
                    .and_then(|handle| backend.await_exit(&handle))
                    .and_then(|code| {
                        backend.record_frame_result(&play.key(), &frame_id, code)?;
                        Ok(code)
                    });
                // The receiver only disappears if run_scene itself is gone
                let _ = tx.send((frame_id, result));
            });
        }
        drop(tx);

        let mut first_error = None;
        for _ in 0..pending.len() {
            let (frame_id, result) = rx
                .recv()
                .map_err(|_| EngineError::state("frame thread exited without reporting"))?;
            match result {
                Ok(code) => debug!(play = %key, frame = %frame_id, code, "frame done"),
                Err(e) => {
                    warn!(play = %key, frame = %frame_id, "frame could not run: {}", e);
                    first_error.get_or_insert(e);
                }
            }
        }
        if let Some(e) = first_error {
            return Err(e);
        }

        let play = store.get(key)?;
        Ok(finished_scene_passed(&scene, &play))
    }

    /// Runs the whole main screenplay, blocking until it is decided.
    ///
    /// Returns `Complete` if every scene passed and `Failed` at the first scene
    /// that did not.
    pub fn run_screenplay(&self, key: &PlayKey) -> Result<PlayPhase> {
        let store = Arc::clone(self.backend.status_writer().store());
        let scene_count = store.get(key)?.main_screenplay()?.scenes.len();
        for index in 0..scene_count {
            if !self.run_scene(key, index)? {
                return Ok(PlayPhase::Failed);
            }
        }
        Ok(PlayPhase::Complete)
    }
}

impl std::fmt::Debug for SceneExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneExecutor")
            .field("backend", &self.backend.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::condition::Condition;
    use crate::types::{Frame, Var};

    fn scene(frames: &[(&str, bool)]) -> Scene {
        Scene {
            name: "s".to_string(),
            frames: frames
                .iter()
                .map(|(id, ignore)| Frame {
                    id: id.to_string(),
                    ignore_errors: *ignore,
                    ..Frame::default()
                })
                .collect(),
            ..Scene::default()
        }
    }

    fn results(pairs: &[(&str, i32)]) -> BTreeMap<String, i32> {
        pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect()
    }

    #[test]
    fn test_aggregate_is_bitwise_or() {
        let s = scene(&[("a", false), ("b", false), ("c", false)]);
        assert_eq!(aggregate_exit_codes(&s, &results(&[("a", 0), ("b", 0)])), 0);
        assert_eq!(aggregate_exit_codes(&s, &results(&[("a", 1), ("b", 2), ("c", 0)])), 3);
    }

    #[test]
    fn test_frame_ignore_errors_contributes_zero() {
        let s = scene(&[("a", true), ("b", false)]);
        assert_eq!(aggregate_exit_codes(&s, &results(&[("a", 1), ("b", 0)])), 0);
    }

    #[test]
    fn test_scene_ignore_errors_forces_pass() {
        let mut s = scene(&[("a", false), ("b", false)]);
        let aggregate = aggregate_exit_codes(&s, &results(&[("a", 0), ("b", 1)]));
        assert!(!scene_passed(&s, aggregate, &Vars::default()));
        s.ignore_errors = true;
        assert!(scene_passed(&s, aggregate, &Vars::default()));
    }

    #[test]
    fn test_pass_condition_overrides_aggregate() {
        let mut s = scene(&[("a", false)]);
        s.pass = Condition::clause([("tolerate", "yes")]);
        let tolerant = Vars::from(vec![Var::new("tolerate", "yes")]);
        let strict = Vars::from(vec![Var::new("tolerate", "no")]);
        assert!(scene_passed(&s, 1, &tolerant));
        assert!(!scene_passed(&s, 0, &strict));
    }

    #[test]
    fn test_terminal_phase_of_progress() {
        assert_eq!(SceneProgress::NoMoreFrames.terminal_phase(), Some(PlayPhase::Complete));
        assert_eq!(
            SceneProgress::Failed { scene: 0 }.terminal_phase(),
            Some(PlayPhase::Failed)
        );
        assert_eq!(
            SceneProgress::InFlight {
                scene: 0,
                pending: vec!["a".to_string()]
            }
            .terminal_phase(),
            None
        );
    }
}
