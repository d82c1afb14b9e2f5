//! Persistence of Play objects.
//!
//! The engine treats the store the way a controller treats its API server:
//! every write carries the `resourceVersion` it was based on and is rejected
//! with [`EngineError::Conflict`] when another writer got there first. The
//! caller re-reads and retries.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::debug;

use crate::error::{EngineError, Result};
use crate::ids;
use crate::types::{Play, PlayKey, check_name};

/// Strongly consistent Play persistence with optimistic concurrency.
pub trait PlayStore: Send + Sync {
    fn get(&self, key: &PlayKey) -> Result<Play>;

    /// Stores a new Play, assigning its uid and first resource version.
    fn create(&self, play: Play) -> Result<Play>;

    /// Replaces spec and status. Fails with `Conflict` on a stale resource version.
    fn update(&self, play: &Play) -> Result<Play>;

    /// Replaces status only. Fails with `Conflict` on a stale resource version.
    fn update_status(&self, play: &Play) -> Result<Play>;

    fn list(&self) -> Result<Vec<Play>>;
}

fn check_version(stored: &Play, incoming: &Play) -> Result<()> {
    if stored.metadata.resource_version != incoming.metadata.resource_version {
        return Err(EngineError::conflict(format!(
            "play {} was modified (have version {}, stored version {})",
            incoming.key(),
            incoming.metadata.resource_version,
            stored.metadata.resource_version
        )));
    }
    Ok(())
}

/// Applies a write to `stored` and bumps its version.
fn apply(stored: &Play, incoming: &Play, status_only: bool) -> Result<Play> {
    check_version(stored, incoming)?;
    let mut next = stored.clone();
    if !status_only {
        next.spec = incoming.spec.clone();
        next.metadata.labels = incoming.metadata.labels.clone();
    }
    next.status = incoming.status.clone();
    next.metadata.resource_version += 1;
    Ok(next)
}

fn prepare_new(mut play: Play) -> Play {
    if play.metadata.uid.is_empty() {
        play.metadata.uid = ids::random_string(16);
    }
    play.metadata.resource_version = 1;
    play
}

// ============================================================================
// In-memory store
// ============================================================================

/// Process-local store, used by tests and by embedders that persist elsewhere.
#[derive(Debug, Default)]
pub struct MemoryStore {
    plays: Mutex<BTreeMap<PlayKey, Play>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PlayStore for MemoryStore {
    fn get(&self, key: &PlayKey) -> Result<Play> {
        self.plays
            .lock()?
            .get(key)
            .cloned()
            .ok_or_else(|| EngineError::not_found(format!("play {}", key)))
    }

    fn create(&self, play: Play) -> Result<Play> {
        let mut plays = self.plays.lock()?;
        let key = play.key();
        if plays.contains_key(&key) {
            return Err(EngineError::already_exists(format!("play {}", key)));
        }
        let play = prepare_new(play);
        plays.insert(key, play.clone());
        Ok(play)
    }

    fn update(&self, play: &Play) -> Result<Play> {
        let mut plays = self.plays.lock()?;
        let key = play.key();
        let stored = plays
            .get(&key)
            .ok_or_else(|| EngineError::not_found(format!("play {}", key)))?;
        let next = apply(stored, play, false)?;
        plays.insert(key, next.clone());
        Ok(next)
    }

    fn update_status(&self, play: &Play) -> Result<Play> {
        let mut plays = self.plays.lock()?;
        let key = play.key();
        let stored = plays
            .get(&key)
            .ok_or_else(|| EngineError::not_found(format!("play {}", key)))?;
        let next = apply(stored, play, true)?;
        plays.insert(key, next.clone());
        Ok(next)
    }

    fn list(&self) -> Result<Vec<Play>> {
        Ok(self.plays.lock()?.values().cloned().collect())
    }
}

// ============================================================================
// File store
// ============================================================================

/// One pretty-printed JSON file per Play under `{root}/{namespace}/{name}.json`.
///
/// Writes go through a temporary file and a rename so a crash never leaves a
/// half-written Play behind. A process-wide lock serializes read-compare-write.
#[derive(Debug)]
pub struct FileStore {
    root: PathBuf,
    lock: Mutex<()>,
}

impl FileStore {
    /// Opens (and creates if needed) a store rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            lock: Mutex::new(()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// File of the Play under `key`. Names that are not DNS labels never
    /// reach the filesystem.
    fn path_for(&self, key: &PlayKey) -> Result<PathBuf> {
        check_name("namespace", &key.namespace)?;
        check_name("play name", &key.name)?;
        Ok(self
            .root
            .join(&key.namespace)
            .join(format!("{}.json", key.name)))
    }

    fn read(&self, key: &PlayKey) -> Result<Play> {
        let path = self.path_for(key)?;
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(EngineError::not_found(format!("play {}", key)));
            }
            Err(e) => return Err(e.into()),
        };
        Ok(serde_json::from_str(&content)?)
    }

    fn write(&self, play: &Play) -> Result<()> {
        let path = self.path_for(&play.key())?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(play)?)?;
        fs::rename(&tmp, &path)?;
        debug!(
            play = %play.key(),
            version = play.metadata.resource_version,
            "persisted play"
        );
        Ok(())
    }

    fn write_back(&self, play: &Play, status_only: bool) -> Result<Play> {
        let _guard = self.lock.lock()?;
        let stored = self.read(&play.key())?;
        let next = apply(&stored, play, status_only)?;
        self.write(&next)?;
        Ok(next)
    }
}

impl PlayStore for FileStore {
    fn get(&self, key: &PlayKey) -> Result<Play> {
        let _guard = self.lock.lock()?;
        self.read(key)
    }

    fn create(&self, play: Play) -> Result<Play> {
        let _guard = self.lock.lock()?;
        let key = play.key();
        if self.path_for(&key)?.exists() {
            return Err(EngineError::already_exists(format!("play {}", key)));
        }
        let play = prepare_new(play);
        self.write(&play)?;
        Ok(play)
    }

    fn update(&self, play: &Play) -> Result<Play> {
        self.write_back(play, false)
    }

    fn update_status(&self, play: &Play) -> Result<Play> {
        self.write_back(play, true)
    }

    fn list(&self) -> Result<Vec<Play>> {
        let _guard = self.lock.lock()?;
        let mut plays = Vec::new();
        for namespace in fs::read_dir(&self.root)? {
            let namespace = namespace?;
            if !namespace.file_type()?.is_dir() {
                continue;
            }
            for entry in fs::read_dir(namespace.path())? {
                let path = entry?.path();
                if path.extension().and_then(|e| e.to_str()) != Some("json") {
                    continue;
                }
                let content = fs::read_to_string(&path)?;
                plays.push(serde_json::from_str(&content)?);
            }
        }
        plays.sort_by_key(Play::key);
        Ok(plays)
    }
}
