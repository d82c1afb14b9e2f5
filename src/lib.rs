//! scenerun library
//!
//! A resumable engine that runs Plays: ordered scenes whose frames execute in
//! parallel as jobs on a pluggable scheduler backend. All progress lives in the
//! Play's persisted status, so a restarted engine picks up where the previous
//! one stopped.

pub mod cli;
pub mod condition;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod executor;
pub mod expand;
pub mod ids;
pub mod phase;
pub mod process_guard;
pub mod provision;
pub mod scheduler;
pub mod store;
pub mod types;

// Re-export main types for convenience
pub use condition::Condition;
pub use config::{BackendKind, EngineConfig, ExecutionMode};
pub use controller::{Controller, WatchEvent};
pub use engine::{Engine, ReconcileOutcome};
pub use error::{EngineError, Result};
pub use executor::{SceneExecutor, SceneProgress};
pub use phase::{PhaseTransitionError, PlayPhase};
pub use process_guard::{ChildRegistry, CommandProcessGroup, ProcessGuard};
pub use provision::{DirectoryProvisioner, MemoryProvisioner, Provisioner};
pub use scheduler::cluster::{ClusterJobBackend, InMemoryJobClient, JobClient};
pub use scheduler::local::LocalProcessBackend;
pub use scheduler::{JobHandle, SchedulerBackend, StatusWriter, job_name};
pub use store::{FileStore, MemoryStore, PlayStore};
pub use types::{Frame, Play, PlayKey, PlaySpec, PlayStatus, Scene, Screenplay, Var, Vars};
