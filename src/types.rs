//! Data model for Plays.
//!
//! A [`Play`] is the persisted unit of execution. Its `spec` holds the
//! screenplays, volume claim templates and vars the author wrote; its `status`
//! is owned by the engine and the scheduler backends.
//!
//! The JSON shape mirrors a custom resource:
//!
//! ```json
//! {
//!   "metadata": {"name": "build", "namespace": "ci"},
//!   "spec": {
//!     "screenplays": [{"name": "main", "scenes": [{"name": "test", "frames": [...]}]}],
//!     "vars": [{"name": "env", "value": "prod"}]
//!   },
//!   "status": {"phase": "Running", "frames": {"k3j9x0a1b2": 0}}
//! }
//! ```

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use strum::{Display, EnumString};

use crate::condition::Condition;
use crate::error::{EngineError, Result};
use crate::expand;
use crate::phase::PlayPhase;
use crate::scheduler;

/// Name of the entry-point screenplay.
pub const MAIN_SCREENPLAY: &str = "main";
/// API version written on Plays and on owner references.
pub const API_VERSION: &str = "core.scenerun.io/v1alpha1";
/// Kind written on Plays and on owner references.
pub const PLAY_KIND: &str = "Play";
/// Namespace used when a Play does not name one.
pub const DEFAULT_NAMESPACE: &str = "default";
/// Label carrying the owning Play's name on every object the engine creates.
pub const PLAY_LABEL: &str = "scenerun.io/play";
/// Label carrying the frame id on backend jobs.
pub const FRAME_LABEL: &str = "scenerun.io/frame-id";
/// Length limit of Play, namespace, frame id and template names.
pub const MAX_NAME_LENGTH: usize = 63;

// ============================================================================
// Identity
// ============================================================================

/// Namespaced identity of a Play.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PlayKey {
    pub namespace: String,
    pub name: String,
}

impl PlayKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for PlayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.to_string()
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    PLAY_KIND.to_string()
}

/// Object metadata maintained by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    pub name: String,
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// Assigned by the store on create
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub uid: String,
    /// Bumped by the store on every write; used for optimistic concurrency
    #[serde(default)]
    pub resource_version: u64,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
}

impl Default for ObjectMeta {
    fn default() -> Self {
        Self {
            name: String::new(),
            namespace: default_namespace(),
            uid: String::new(),
            resource_version: 0,
            labels: BTreeMap::new(),
        }
    }
}

// ============================================================================
// Play
// ============================================================================

/// One instantiated pipeline execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Play {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: PlaySpec,
    #[serde(default)]
    pub status: PlayStatus,
}

/// Desired state of a Play.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaySpec {
    pub screenplays: Vec<Screenplay>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_claim_templates: Vec<VolumeClaimTemplate>,
    #[serde(default, skip_serializing_if = "Vars::is_empty")]
    pub vars: Vars,
    /// Upstream trigger payload that `inputRef` vars select from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<serde_json::Value>,
}

/// Observed state of a Play, written only by the engine and its backends.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayStatus {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<PlayPhase>,
    /// Frame id → exit code. Presence means the frame is finished.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub frames: BTreeMap<String, i32>,
    /// Identifier of the engine instance that owns this Play while Running
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub runner: String,
    /// Volume claim template name → provisioned volume name
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub provisioned_volumes: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub vars_config_map: String,
}

impl Play {
    /// A new Play with an empty status.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>, spec: PlaySpec) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta {
                name: name.into(),
                namespace: namespace.into(),
                ..ObjectMeta::default()
            },
            spec,
            status: PlayStatus::default(),
        }
    }

    pub fn key(&self) -> PlayKey {
        PlayKey::new(&self.metadata.namespace, &self.metadata.name)
    }

    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    pub fn namespace(&self) -> &str {
        &self.metadata.namespace
    }

    /// Current phase; `None` means no status has been written yet.
    pub fn phase(&self) -> Option<PlayPhase> {
        self.status.phase
    }

    /// Finds a screenplay by name.
    pub fn screenplay(&self, name: &str) -> Option<&Screenplay> {
        self.spec.screenplays.iter().find(|s| s.name == name)
    }

    /// The entry-point screenplay. Its absence is a configuration error.
    pub fn main_screenplay(&self) -> Result<&Screenplay> {
        self.screenplay(MAIN_SCREENPLAY).ok_or_else(|| {
            EngineError::config(format!(
                "play {} has no \"{}\" screenplay",
                self.key(),
                MAIN_SCREENPLAY
            ))
        })
    }

    /// All frames across every screenplay and scene.
    pub fn frames(&self) -> impl Iterator<Item = &Frame> {
        self.spec
            .screenplays
            .iter()
            .flat_map(|s| s.scenes.iter())
            .flat_map(|scene| scene.frames.iter())
    }

    pub fn frames_mut(&mut self) -> impl Iterator<Item = &mut Frame> {
        self.spec
            .screenplays
            .iter_mut()
            .flat_map(|s| s.scenes.iter_mut())
            .flat_map(|scene| scene.frames.iter_mut())
    }

    /// Finds a frame by id.
    pub fn frame(&self, frame_id: &str) -> Option<&Frame> {
        self.frames().find(|f| f.id == frame_id)
    }

    /// Recorded exit code of a frame, if it has finished.
    pub fn frame_result(&self, frame_id: &str) -> Option<i32> {
        self.status.frames.get(frame_id).copied()
    }

    pub fn is_frame_finished(&self, frame_id: &str) -> bool {
        self.status.frames.contains_key(frame_id)
    }

    /// Structural checks run before a Play starts executing.
    pub fn validate(&self) -> Result<()> {
        if self.metadata.name.trim().is_empty() {
            return Err(EngineError::config("play name must be specified"));
        }
        check_name("play name", &self.metadata.name)?;
        check_name("namespace", &self.metadata.namespace)?;
        self.main_screenplay()?;

        let mut screenplay_names = HashSet::new();
        for screenplay in &self.spec.screenplays {
            if !screenplay_names.insert(screenplay.name.as_str()) {
                return Err(EngineError::config(format!(
                    "duplicate screenplay name: {}",
                    screenplay.name
                )));
            }
            for scene in &screenplay.scenes {
                scene.when.validate()?;
                scene.pass.validate()?;
                for frame in &scene.frames {
                    if frame.action.containers.is_empty() {
                        return Err(EngineError::config(format!(
                            "frame {:?} in scene {:?} has no containers",
                            frame.name, scene.name
                        )));
                    }
                }
            }
        }

        for frame in self.frames().filter(|f| !f.id.is_empty()) {
            check_name("frame id", &frame.id)?;
        }
        self.check_frame_identity()?;

        if self.spec.vars.iter().any(|v| v.name.trim().is_empty()) {
            return Err(EngineError::config("var names must not be empty"));
        }

        let mut template_names = HashSet::new();
        for template in &self.spec.volume_claim_templates {
            check_name("volume claim template", &template.name)?;
            if !template_names.insert(template.name.as_str()) {
                return Err(EngineError::config(format!(
                    "duplicate volume claim template: {}",
                    template.name
                )));
            }
        }

        Ok(())
    }

    /// Rejects frames that would share an id or a backend job name once
    /// copies are fanned out. Frames without an id yet are skipped.
    ///
    /// Job names keep only a prefix of the frame id, and submission is
    /// get-or-create on the job name, so two frames mapping to one name
    /// would run as a single job.
    pub fn check_frame_identity(&self) -> Result<()> {
        let mut ids = HashSet::new();
        let mut jobs: HashMap<String, String> = HashMap::new();
        for frame in self.frames() {
            for id in expand::expanded_ids(frame) {
                let job = scheduler::job_name(self.name(), &id);
                if let Some(other) = jobs.get(&job) {
                    if *other != id {
                        return Err(EngineError::config(format!(
                            "frame ids {} and {} both map to job {}",
                            other, id, job
                        )));
                    }
                }
                if !ids.insert(id.clone()) {
                    return Err(EngineError::config(format!("duplicate frame id: {}", id)));
                }
                jobs.insert(job, id);
            }
        }
        Ok(())
    }
}

/// True for a lowercase DNS label: `[a-z0-9]([-a-z0-9]*[a-z0-9])?`, at most
/// [`MAX_NAME_LENGTH`] characters.
pub fn is_dns_label(value: &str) -> bool {
    let bytes = value.as_bytes();
    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            bytes.len() <= MAX_NAME_LENGTH
                && alnum(first)
                && alnum(last)
                && bytes.iter().all(|b| alnum(b) || *b == b'-')
        }
        _ => false,
    }
}

/// Fails with a `Config` error unless `value` is a DNS label.
///
/// Names end up in file paths and backend object names, so anything else
/// is refused before it gets there.
pub fn check_name(what: &str, value: &str) -> Result<()> {
    if is_dns_label(value) {
        Ok(())
    } else {
        Err(EngineError::config(format!(
            "{} {:?} must be lowercase letters, digits and '-', start and end with a letter or digit, and be at most {} characters",
            what, value, MAX_NAME_LENGTH
        )))
    }
}

// ============================================================================
// Screenplay / Scene / Frame
// ============================================================================

/// Named, ordered list of scenes.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Screenplay {
    pub name: String,
    #[serde(default)]
    pub scenes: Vec<Scene>,
}

/// A step whose frames run concurrently.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scene {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub frames: Vec<Frame>,
    /// Evaluated after the frames ran; overrides the aggregate result
    #[serde(default, skip_serializing_if = "Condition::is_empty")]
    pub pass: Condition,
    /// Evaluated before the frames run; false skips the scene
    #[serde(default, skip_serializing_if = "Condition::is_empty")]
    pub when: Condition,
    #[serde(default)]
    pub ignore_errors: bool,
}

/// The atomic unit of work.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Frame {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub action: Action,
    #[serde(default)]
    pub ignore_errors: bool,
    #[serde(default)]
    pub copies: u32,
}

impl Frame {
    /// Exit code as it counts towards the scene aggregate.
    pub fn effective_exit(&self, exit: i32) -> i32 {
        if self.ignore_errors { 0 } else { exit }
    }
}

// ============================================================================
// Action (opaque job payload)
// ============================================================================

/// Job restart policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString)]
pub enum RestartPolicy {
    #[default]
    Never,
    OnFailure,
    Always,
}

/// What a frame executes: a job made of containers.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
    #[serde(default)]
    pub containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub init_containers: Vec<Container>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
}

impl Action {
    /// Init containers first, then regular containers.
    pub fn all_containers(&self) -> impl Iterator<Item = &Container> {
        self.init_containers.iter().chain(self.containers.iter())
    }

    pub fn all_containers_mut(&mut self) -> impl Iterator<Item = &mut Container> {
        self.init_containers
            .iter_mut()
            .chain(self.containers.iter_mut())
    }

    pub fn volume(&self, name: &str) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.name == name)
    }

    /// True if any container mounts a volume called `name`.
    pub fn mounts(&self, name: &str) -> bool {
        self.all_containers()
            .any(|c| c.volume_mounts.iter().any(|m| m.name == name))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Container {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub image: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub command: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env: Vec<EnvVar>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub env_from: Vec<EnvFromSource>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volume_mounts: Vec<VolumeMount>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub working_dir: Option<String>,
}

impl Container {
    /// A container running `command` (first element is the program).
    pub fn with_command<I, S>(name: impl Into<String>, command: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            command: command.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn env_value(&self, name: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|e| e.name == name)
            .map(|e| e.value.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    #[serde(default)]
    pub value: String,
}

impl EnvVar {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalObjectReference {
    pub name: String,
}

/// Binds every key of a config object as environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvFromSource {
    pub config_map_ref: LocalObjectReference,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    #[serde(flatten)]
    pub source: VolumeSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum VolumeSource {
    PersistentVolumeClaim(ClaimSource),
    ConfigMap(LocalObjectReference),
    EmptyDir(EmptyDirSource),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimSource {
    pub claim_name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmptyDirSource {}

/// Template for a volume provisioned for the lifetime of a Play.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VolumeClaimTemplate {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub access_modes: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_class_name: Option<String>,
}

// ============================================================================
// Vars
// ============================================================================

/// A named value shared by every frame of a Play.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Var {
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<VarSource>,
}

impl Var {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            value_from: None,
        }
    }
}

/// Where a var's value is resolved from at provisioning time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VarSource {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_map_key_ref: Option<KeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<KeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_ref: Option<InputFieldSelector>,
}

/// Selects `key` from the object called `name`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeySelector {
    pub name: String,
    pub key: String,
}

/// Dotted path into the Play's input payload, e.g. `push.ref` or `commits.0.id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFieldSelector {
    pub path: String,
}

/// Ordered var list with by-name lookup.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vars(pub Vec<Var>);

impl Vars {
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|v| v.name == name)
            .map(|v| v.value.as_str())
    }

    /// Sets the value of a declared var. Undeclared names are rejected.
    pub fn set(&mut self, name: &str, value: impl Into<String>) -> Result<()> {
        match self.0.iter_mut().find(|v| v.name == name) {
            Some(var) => {
                var.value = value.into();
                Ok(())
            }
            None => Err(EngineError::config(format!("var {:?} is not declared", name))),
        }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Var> {
        self.0.iter()
    }

    pub fn iter_mut(&mut self) -> std::slice::IterMut<'_, Var> {
        self.0.iter_mut()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Name → value map, as stored in the vars config object.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        self.0
            .iter()
            .map(|v| (v.name.clone(), v.value.clone()))
            .collect()
    }
}

impl From<Vec<Var>> for Vars {
    fn from(vars: Vec<Var>) -> Self {
        Self(vars)
    }
}

impl<'a> IntoIterator for &'a Vars {
    type Item = &'a Var;
    type IntoIter = std::slice::Iter<'a, Var>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(name: &str) -> Frame {
        Frame {
            name: name.to_string(),
            action: Action {
                containers: vec![Container::with_command(name, ["true"])],
                ..Action::default()
            },
            ..Frame::default()
        }
    }

    fn play_with(screenplays: Vec<Screenplay>) -> Play {
        Play::new(
            "default",
            "demo",
            PlaySpec {
                screenplays,
                ..PlaySpec::default()
            },
        )
    }

    fn main_with(frames: Vec<Frame>) -> Screenplay {
        Screenplay {
            name: MAIN_SCREENPLAY.to_string(),
            scenes: vec![Scene {
                name: "only".to_string(),
                frames,
                ..Scene::default()
            }],
        }
    }

    #[test]
    fn test_main_screenplay_lookup() {
        let play = play_with(vec![main_with(vec![frame("a")])]);
        assert!(play.main_screenplay().is_ok());

        let play = play_with(vec![Screenplay {
            name: "other".to_string(),
            scenes: vec![],
        }]);
        assert!(matches!(play.main_screenplay(), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_frame_lookup_and_results() {
        let mut f = frame("a");
        f.id = "abc".to_string();
        let mut play = play_with(vec![main_with(vec![f])]);
        assert_eq!(play.frame("abc").map(|f| f.name.as_str()), Some("a"));
        assert!(play.frame("zzz").is_none());

        assert!(!play.is_frame_finished("abc"));
        play.status.frames.insert("abc".to_string(), 1);
        assert!(play.is_frame_finished("abc"));
        assert_eq!(play.frame_result("abc"), Some(1));
    }

    #[test]
    fn test_validate_rejects_duplicate_frame_ids() {
        let mut a = frame("a");
        a.id = "same".to_string();
        let mut b = frame("b");
        b.id = "same".to_string();
        let play = play_with(vec![main_with(vec![a, b])]);
        let err = play.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate frame id"));
    }

    #[test]
    fn test_validate_rejects_ids_sharing_a_job_name() {
        let mut a = frame("a");
        a.id = "integration-test-a".to_string();
        let mut b = frame("b");
        b.id = "integration-test-b".to_string();
        let play = play_with(vec![main_with(vec![a, b])]);
        let err = play.validate().unwrap_err();
        assert!(matches!(err, EngineError::Config(_)));
        assert!(err.to_string().contains("demo-integration-test"));
    }

    #[test]
    fn test_validate_rejects_copies_clashing_with_ids() {
        let mut sharded = frame("s");
        sharded.id = "shardedtestsuite".to_string();
        sharded.copies = 3;
        let play = play_with(vec![main_with(vec![sharded])]);
        assert!(matches!(play.validate(), Err(EngineError::Config(_))));

        let mut x = frame("x");
        x.id = "x".to_string();
        x.copies = 2;
        let mut explicit = frame("y");
        explicit.id = "x-0".to_string();
        let play = play_with(vec![main_with(vec![x, explicit])]);
        let err = play.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate frame id: x-0"));

        let mut short = frame("short");
        short.id = "shard".to_string();
        short.copies = 3;
        play_with(vec![main_with(vec![short])])
            .validate()
            .expect("short ids fan out to distinct jobs");
    }

    #[test]
    fn test_validate_requires_dns_label_names() {
        let valid = play_with(vec![main_with(vec![frame("a")])]);

        let mut p = valid.clone();
        p.metadata.name = "../../escaped".to_string();
        assert!(matches!(p.validate(), Err(EngineError::Config(_))));

        let mut p = valid.clone();
        p.metadata.name = "Build".to_string();
        assert!(p.validate().is_err());

        let mut p = valid.clone();
        p.metadata.name = "a".repeat(MAX_NAME_LENGTH + 1);
        assert!(p.validate().is_err());
        p.metadata.name = "a".repeat(MAX_NAME_LENGTH);
        p.validate().expect("63 characters is allowed");

        let mut p = valid.clone();
        p.metadata.namespace = "../ci".to_string();
        assert!(p.validate().is_err());

        let mut p = valid.clone();
        for f in p.frames_mut() {
            f.id = "unit_tests".to_string();
        }
        assert!(p.validate().is_err());

        let mut p = valid.clone();
        p.spec.volume_claim_templates.push(VolumeClaimTemplate {
            name: "../cache".to_string(),
            ..VolumeClaimTemplate::default()
        });
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_dns_labels() {
        for ok in ["a", "build", "ci-1", "0x", "a-b-c"] {
            assert!(is_dns_label(ok), "{ok}");
        }
        for bad in ["", "-a", "a-", "A", "a.b", "a/b", "..", "a_b"] {
            assert!(!is_dns_label(bad), "{bad}");
        }
    }

    #[test]
    fn test_validate_rejects_frame_without_containers() {
        let play = play_with(vec![main_with(vec![Frame {
            name: "empty".to_string(),
            ..Frame::default()
        }])]);
        assert!(play.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_minimal_play() {
        let play = play_with(vec![main_with(vec![frame("a"), frame("b")])]);
        play.validate().expect("Should be valid");
    }

    #[test]
    fn test_vars_get_and_set() {
        let mut vars = Vars::from(vec![Var::new("env", "dev")]);
        assert_eq!(vars.get("env"), Some("dev"));
        vars.set("env", "prod").expect("Should set declared var");
        assert_eq!(vars.get("env"), Some("prod"));
        assert!(vars.set("missing", "x").is_err());
        assert_eq!(vars.to_map().get("env").map(String::as_str), Some("prod"));
    }

    #[test]
    fn test_play_json_shape() {
        let json = r#"{
            "metadata": {"name": "build"},
            "spec": {
                "screenplays": [{
                    "name": "main",
                    "scenes": [{
                        "name": "test",
                        "ignoreErrors": true,
                        "frames": [{
                            "name": "unit",
                            "copies": 2,
                            "action": {
                                "containers": [{"name": "unit", "command": ["cargo", "test"]}],
                                "volumes": [{"name": "cache", "persistentVolumeClaim": {"claimName": "build-cache"}}]
                            }
                        }]
                    }]
                }],
                "vars": [{"name": "ref", "valueFrom": {"inputRef": {"path": "push.ref"}}}]
            },
            "status": {"phase": "Running", "frames": {"abc": 0}}
        }"#;
        let play: Play = serde_json::from_str(json).expect("Should parse");
        assert_eq!(play.namespace(), DEFAULT_NAMESPACE);
        assert_eq!(play.kind, PLAY_KIND);
        assert_eq!(play.phase(), Some(PlayPhase::Running));
        let scene = &play.main_screenplay().expect("main").scenes[0];
        assert!(scene.ignore_errors);
        assert_eq!(scene.frames[0].copies, 2);
        assert_eq!(
            scene.frames[0].action.volumes[0].source,
            VolumeSource::PersistentVolumeClaim(ClaimSource {
                claim_name: "build-cache".to_string()
            })
        );
        assert!(play.spec.vars.0[0].value_from.is_some());

        let back = serde_json::to_value(&play).expect("Should serialize");
        assert_eq!(back["status"]["frames"]["abc"], 0);
        assert_eq!(
            back["spec"]["screenplays"][0]["scenes"][0]["frames"][0]["action"]["volumes"][0]
                ["persistentVolumeClaim"]["claimName"],
            "build-cache"
        );
    }

    #[test]
    fn test_effective_exit_respects_ignore_errors() {
        let mut f = frame("a");
        assert_eq!(f.effective_exit(3), 3);
        f.ignore_errors = true;
        assert_eq!(f.effective_exit(3), 0);
    }
}
