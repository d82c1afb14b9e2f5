//! Resource provisioning for Plays.
//!
//! Before a Play starts running the engine resolves its vars, stores them in a
//! config object named `{play}-vars` and provisions one volume per volume claim
//! template, named `{play}-{template}`. Names are deterministic, so a
//! reconciliation that is retried after a crash finds the objects it already
//! created; "already exists" counts as success.
//!
//! The [`Provisioner`] trait is the seam to whatever actually holds config
//! objects, secrets and volumes. [`MemoryProvisioner`] keeps them in memory;
//! [`DirectoryProvisioner`] lays them out on the local filesystem for the local
//! backend.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info};

use crate::error::{EngineError, Result};
use crate::types::{PLAY_LABEL, Play, Vars, VolumeClaimTemplate, check_name};

/// A named key/value object, such as the resolved vars of a Play.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigObject {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}

/// A provisioned volume and the template it was created from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeClaim {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
    pub template: VolumeClaimTemplate,
}

/// Creates and removes the objects a Play depends on.
pub trait Provisioner: Send + Sync {
    /// Creates a config object. Returns `AlreadyExists` if the name is taken.
    fn create_config(&self, object: &ConfigObject) -> Result<()>;

    /// Creates a volume. Returns `AlreadyExists` if the name is taken.
    fn create_volume(&self, claim: &VolumeClaim) -> Result<()>;

    /// Deletes a volume. Deleting a missing volume is not an error.
    fn delete_volume(&self, namespace: &str, name: &str) -> Result<()>;

    fn config_data(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>>;

    fn secret_data(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>>;
}

/// Name of the vars config object of `play`.
pub fn vars_config_name(play: &str) -> String {
    format!("{}-vars", play)
}

/// Name of the volume provisioned for `template` in `play`.
pub fn volume_name(play: &str, template: &str) -> String {
    format!("{}-{}", play, template)
}

fn owner_labels(play: &Play) -> BTreeMap<String, String> {
    BTreeMap::from([(PLAY_LABEL.to_string(), play.name().to_string())])
}

/// Resolves every `valueFrom` var of `play` to a literal value.
///
/// Vars without `valueFrom` keep their value. A missing config object, secret,
/// key or input path is a provisioning error.
pub fn resolve_vars(provisioner: &dyn Provisioner, play: &Play) -> Result<Vars> {
    let namespace = play.namespace();
    let mut vars = play.spec.vars.clone();
    for var in vars.iter_mut() {
        let Some(source) = &var.value_from else {
            continue;
        };

        let value = if let Some(selector) = &source.config_map_key_ref {
            lookup_key(
                provisioner.config_data(namespace, &selector.name),
                "config object",
                &selector.name,
                &selector.key,
            )?
        } else if let Some(selector) = &source.secret_key_ref {
            lookup_key(
                provisioner.secret_data(namespace, &selector.name),
                "secret",
                &selector.name,
                &selector.key,
            )?
        } else if let Some(selector) = &source.input_ref {
            let input = play.spec.input.as_ref().ok_or_else(|| {
                EngineError::provisioning(format!(
                    "var {:?} reads input path {:?} but the play has no input",
                    var.name, selector.path
                ))
            })?;
            input_value(input, &selector.path).ok_or_else(|| {
                EngineError::provisioning(format!(
                    "var {:?}: input path {:?} not found",
                    var.name, selector.path
                ))
            })?
        } else {
            continue;
        };

        debug!(play = %play.key(), var = %var.name, "resolved var");
        var.value = value;
    }
    Ok(vars)
}

fn lookup_key(
    data: Result<BTreeMap<String, String>>,
    kind: &str,
    name: &str,
    key: &str,
) -> Result<String> {
    let data = data.map_err(|e| match e {
        EngineError::NotFound(_) => {
            EngineError::provisioning(format!("{} {:?} not found", kind, name))
        }
        other => other,
    })?;
    data.get(key).cloned().ok_or_else(|| {
        EngineError::provisioning(format!("{} {:?} has no key {:?}", kind, name, key))
    })
}

/// Looks up a dotted path such as `push.commits.0.id` in `input`.
///
/// Strings are returned verbatim; other scalars and nested values are rendered
/// as JSON, and `null` becomes an empty string.
pub fn input_value(input: &Value, path: &str) -> Option<String> {
    let mut current = input;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        current = match current {
            Value::Object(map) => map.get(segment)?,
            Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(match current {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    })
}

/// Creates the vars config object of `play` from `vars`. Returns its name.
pub fn provision_vars_config(
    provisioner: &dyn Provisioner,
    play: &Play,
    vars: &Vars,
) -> Result<String> {
    let object = ConfigObject {
        name: vars_config_name(play.name()),
        namespace: play.namespace().to_string(),
        labels: owner_labels(play),
        data: vars.to_map(),
    };
    match provisioner.create_config(&object) {
        Ok(()) => info!(play = %play.key(), config = %object.name, "created vars config"),
        Err(e) if e.is_already_exists() => {
            debug!(play = %play.key(), config = %object.name, "vars config already exists")
        }
        Err(e) => return Err(as_provisioning(e)),
    }
    Ok(object.name)
}

/// Provisions one volume per volume claim template of `play`.
///
/// Returns template name → provisioned volume name.
pub fn provision_volumes(
    provisioner: &dyn Provisioner,
    play: &Play,
) -> Result<BTreeMap<String, String>> {
    let mut provisioned = BTreeMap::new();
    for template in &play.spec.volume_claim_templates {
        let claim = VolumeClaim {
            name: volume_name(play.name(), &template.name),
            namespace: play.namespace().to_string(),
            labels: owner_labels(play),
            template: template.clone(),
        };
        match provisioner.create_volume(&claim) {
            Ok(()) => info!(play = %play.key(), volume = %claim.name, "created volume"),
            Err(e) if e.is_already_exists() => {
                debug!(play = %play.key(), volume = %claim.name, "volume already exists")
            }
            Err(e) => return Err(as_provisioning(e)),
        }
        provisioned.insert(template.name.clone(), claim.name);
    }
    Ok(provisioned)
}

/// Deletes every volume recorded in the Play's status.
pub fn delete_volumes(provisioner: &dyn Provisioner, play: &Play) -> Result<()> {
    for volume in play.status.provisioned_volumes.values() {
        provisioner.delete_volume(play.namespace(), volume)?;
        info!(play = %play.key(), volume = %volume, "deleted volume");
    }
    Ok(())
}

fn as_provisioning(err: EngineError) -> EngineError {
    match err {
        EngineError::Provisioning(_) => err,
        other => EngineError::provisioning(other.to_string()),
    }
}

type ObjectKey = (String, String);

fn object_key(namespace: &str, name: &str) -> ObjectKey {
    (namespace.to_string(), name.to_string())
}

// ============================================================================
// In-memory provisioner
// ============================================================================

#[derive(Debug, Default)]
struct MemoryObjects {
    configs: BTreeMap<ObjectKey, ConfigObject>,
    secrets: BTreeMap<ObjectKey, BTreeMap<String, String>>,
    volumes: BTreeMap<ObjectKey, VolumeClaim>,
    volume_failure: Option<String>,
}

/// Provisioner that keeps everything in memory.
#[derive(Debug, Default)]
pub struct MemoryProvisioner {
    objects: Mutex<MemoryObjects>,
}

impl MemoryProvisioner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a config object that vars can reference.
    pub fn insert_config(&self, object: ConfigObject) -> Result<()> {
        let key = object_key(&object.namespace, &object.name);
        self.objects.lock()?.configs.insert(key, object);
        Ok(())
    }

    /// Seeds a secret that vars can reference.
    pub fn insert_secret(
        &self,
        namespace: &str,
        name: &str,
        data: BTreeMap<String, String>,
    ) -> Result<()> {
        self.objects
            .lock()?
            .secrets
            .insert(object_key(namespace, name), data);
        Ok(())
    }

    /// Makes every following volume creation fail with `message`.
    pub fn fail_volumes(&self, message: impl Into<String>) -> Result<()> {
        self.objects.lock()?.volume_failure = Some(message.into());
        Ok(())
    }

    pub fn config(&self, namespace: &str, name: &str) -> Option<ConfigObject> {
        let objects = self.objects.lock().ok()?;
        objects.configs.get(&object_key(namespace, name)).cloned()
    }

    /// Names of existing volumes in `namespace`.
    pub fn volumes(&self, namespace: &str) -> Vec<String> {
        match self.objects.lock() {
            Ok(objects) => objects
                .volumes
                .keys()
                .filter(|(ns, _)| ns == namespace)
                .map(|(_, name)| name.clone())
                .collect(),
            Err(_) => Vec::new(),
        }
    }
}

impl Provisioner for MemoryProvisioner {
    fn create_config(&self, object: &ConfigObject) -> Result<()> {
        let mut objects = self.objects.lock()?;
        let key = object_key(&object.namespace, &object.name);
        if objects.configs.contains_key(&key) {
            return Err(EngineError::already_exists(format!("config {}", object.name)));
        }
        objects.configs.insert(key, object.clone());
        Ok(())
    }

    fn create_volume(&self, claim: &VolumeClaim) -> Result<()> {
        let mut objects = self.objects.lock()?;
        if let Some(message) = &objects.volume_failure {
            return Err(EngineError::provisioning(message.clone()));
        }
        let key = object_key(&claim.namespace, &claim.name);
        if objects.volumes.contains_key(&key) {
            return Err(EngineError::already_exists(format!("volume {}", claim.name)));
        }
        objects.volumes.insert(key, claim.clone());
        Ok(())
    }

    fn delete_volume(&self, namespace: &str, name: &str) -> Result<()> {
        self.objects
            .lock()?
            .volumes
            .remove(&object_key(namespace, name));
        Ok(())
    }

    fn config_data(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>> {
        self.objects
            .lock()?
            .configs
            .get(&object_key(namespace, name))
            .map(|c| c.data.clone())
            .ok_or_else(|| EngineError::not_found(format!("config {}/{}", namespace, name)))
    }

    fn secret_data(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>> {
        self.objects
            .lock()?
            .secrets
            .get(&object_key(namespace, name))
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("secret {}/{}", namespace, name)))
    }
}

// ============================================================================
// Directory provisioner
// ============================================================================

/// Provisioner backed by a directory tree:
///
/// ```text
/// {root}/{namespace}/configs/{name}.json   config objects
/// {root}/{namespace}/secrets/{name}.json   secrets (plain key/value JSON)
/// {root}/{namespace}/volumes/{name}/       volumes
/// ```
#[derive(Debug, Clone)]
pub struct DirectoryProvisioner {
    root: PathBuf,
}

impl DirectoryProvisioner {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, namespace: &str, kind: &str, name: &str) -> Result<PathBuf> {
        check_name("namespace", namespace)?;
        check_object_name(name)?;
        Ok(self
            .root
            .join(namespace)
            .join(kind)
            .join(format!("{}.json", name)))
    }

    fn config_path(&self, namespace: &str, name: &str) -> Result<PathBuf> {
        self.object_path(namespace, "configs", name)
    }

    fn secret_path(&self, namespace: &str, name: &str) -> Result<PathBuf> {
        self.object_path(namespace, "secrets", name)
    }

    /// Directory backing a provisioned volume.
    pub fn volume_path(&self, namespace: &str, name: &str) -> Result<PathBuf> {
        check_name("namespace", namespace)?;
        check_object_name(name)?;
        Ok(self.root.join(namespace).join("volumes").join(name))
    }
}

/// Object names become single path components: lowercase letters, digits,
/// '-' and '.', starting and ending with a letter or digit.
fn check_object_name(name: &str) -> Result<()> {
    let bytes = name.as_bytes();
    let alnum = |b: &u8| b.is_ascii_lowercase() || b.is_ascii_digit();
    let valid = match (bytes.first(), bytes.last()) {
        (Some(first), Some(last)) => {
            alnum(first)
                && alnum(last)
                && bytes.iter().all(|b| alnum(b) || matches!(*b, b'-' | b'.'))
        }
        _ => false,
    };
    if valid {
        Ok(())
    } else {
        Err(EngineError::config(format!("invalid object name {:?}", name)))
    }
}

fn read_json<T: serde::de::DeserializeOwned>(path: &Path, what: &str) -> Result<T> {
    match fs::read_to_string(path) {
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(EngineError::not_found(format!("{} {}", what, path.display())))
        }
        Err(e) => Err(e.into()),
    }
}

impl Provisioner for DirectoryProvisioner {
    fn create_config(&self, object: &ConfigObject) -> Result<()> {
        let path = self.config_path(&object.namespace, &object.name)?;
        if path.exists() {
            return Err(EngineError::already_exists(format!("config {}", object.name)));
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&path, serde_json::to_string_pretty(object)?)?;
        Ok(())
    }

    fn create_volume(&self, claim: &VolumeClaim) -> Result<()> {
        let path = self.volume_path(&claim.namespace, &claim.name)?;
        if path.exists() {
            return Err(EngineError::already_exists(format!("volume {}", claim.name)));
        }
        fs::create_dir_all(&path)?;
        Ok(())
    }

    fn delete_volume(&self, namespace: &str, name: &str) -> Result<()> {
        match fs::remove_dir_all(self.volume_path(namespace, name)?) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn config_data(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>> {
        let object: ConfigObject = read_json(&self.config_path(namespace, name)?, "config")?;
        Ok(object.data)
    }

    fn secret_data(&self, namespace: &str, name: &str) -> Result<BTreeMap<String, String>> {
        read_json(&self.secret_path(namespace, name)?, "secret")
    }
}
