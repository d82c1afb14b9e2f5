//! Engine configuration.
//!
//! Loaded from a JSON file; every field is optional and falls back to its
//! default. Command-line flags are applied on top by the binary.
//!
//! ```json
//! {
//!   "namespace": "ci",
//!   "backend": "local",
//!   "execution_mode": "non-blocking",
//!   "requeue_interval_ms": 2000,
//!   "state_dir": ".scenerun"
//! }
//! ```

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use strum::{Display, EnumIter, EnumString};

/// Where frames are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum BackendKind {
    /// Child processes on this host
    #[default]
    Local,
    /// Batch jobs on the cluster
    Cluster,
}

/// How the engine waits for frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ExecutionMode {
    /// Submit and return; later reconciliations pick up results
    #[default]
    NonBlocking,
    /// A background thread per Play waits on every frame
    Blocking,
}

/// Engine settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Namespace for Plays that do not name one
    pub namespace: String,
    pub backend: BackendKind,
    pub execution_mode: ExecutionMode,
    /// Delay before a Running Play is reconciled again without an event
    pub requeue_interval_ms: u64,
    /// Attempts per status write before a conflict is surfaced
    pub status_retry_limit: u32,
    /// Holds the Play store and provisioned objects
    pub state_dir: PathBuf,
    /// Working directory for local processes
    pub work_dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            namespace: crate::types::DEFAULT_NAMESPACE.to_string(),
            backend: BackendKind::default(),
            execution_mode: ExecutionMode::default(),
            requeue_interval_ms: 2_000,
            status_retry_limit: 5,
            state_dir: PathBuf::from(".scenerun"),
            work_dir: None,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requeue_interval(&self) -> Duration {
        Duration::from_millis(self.requeue_interval_ms)
    }

    /// Directory of the file-backed Play store.
    pub fn plays_dir(&self) -> PathBuf {
        self.state_dir.join("plays")
    }

    /// Directory of the directory provisioner.
    pub fn objects_dir(&self) -> PathBuf {
        self.state_dir.join("objects")
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize engine configuration")?;
        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;
        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;
        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let namespace = self.namespace.trim();
        if namespace.is_empty() {
            anyhow::bail!("Namespace must be specified");
        }
        if namespace.len() > 63 {
            anyhow::bail!("Namespace must be at most 63 characters long");
        }
        if !namespace
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            anyhow::bail!("Namespace can only contain lowercase letters, digits and '-'");
        }
        if self.requeue_interval_ms == 0 {
            anyhow::bail!("Requeue interval must be greater than zero");
        }
        if self.status_retry_limit == 0 {
            anyhow::bail!("Status retry limit must be at least 1");
        }
        if self.state_dir.as_os_str().is_empty() {
            anyhow::bail!("State directory must be specified");
        }
        Ok(())
    }
}
