//! Durable record of the volume names the driver owns.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use crate::driver::VolumeError;

/// Set of tracked volume names, as the caller spelled them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TrackingSet {
    names: BTreeSet<String>,
}

impl TrackingSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Returns `false` if the name was already present.
    pub fn insert(&mut self, name: impl Into<String>) -> bool {
        self.names.insert(name.into())
    }

    /// Returns `false` if the name was not present.
    pub fn remove(&mut self, name: &str) -> bool {
        self.names.remove(name)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }
}

impl FromIterator<String> for TrackingSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().collect(),
        }
    }
}

/// Empty per-volume record. Serializes as `{}`.
#[derive(Debug, Default, Serialize, Deserialize)]
struct Marker {}

/// On-disk layout: `{"name": {}, ...}`.
type PersistedState = BTreeMap<String, Marker>;

/// Reads and writes the tracking set at a fixed path.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the tracking set. A missing file is an empty set; anything that
    /// cannot be read or parsed is [`VolumeError::StateCorrupt`].
    pub async fn load(&self) -> Result<TrackingSet, VolumeError> {
        let data = match tokio::fs::read_to_string(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no persisted state file, starting empty");
                return Ok(TrackingSet::new());
            }
            Err(e) => return Err(self.corrupt(e)),
        };

        let persisted: PersistedState =
            serde_json::from_str(&data).map_err(|e| self.corrupt(e))?;

        let tracked: TrackingSet = persisted.into_keys().collect();
        info!(path = %self.path.display(), count = tracked.len(), "loaded tracked volumes");
        Ok(tracked)
    }

    /// Persist the full tracking set. Failures are logged, not returned: the
    /// in-memory set stays authoritative for the running process.
    pub async fn save(&self, tracked: &TrackingSet) {
        if let Err(e) = self.try_save(tracked).await {
            error!(
                path = %self.path.display(),
                volumes = tracked.len(),
                error = %format!("{:#}", e),
                "failed to persist volume state"
            );
        }
    }

    async fn try_save(&self, tracked: &TrackingSet) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("creating state directory: {}", parent.display()))?;
            }
        }

        let persisted: PersistedState = tracked
            .iter()
            .map(|name| (name.to_string(), Marker::default()))
            .collect();
        let data = serde_json::to_string(&persisted).context("serializing state")?;

        // Write to temp file then rename (atomic on same filesystem)
        let tmp_path = self.path.with_extension("tmp");
        tokio::fs::write(&tmp_path, &data)
            .await
            .with_context(|| format!("writing temp state file: {}", tmp_path.display()))?;
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| format!("renaming temp state file to: {}", self.path.display()))?;

        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        tokio::fs::set_permissions(&self.path, perms).await.ok();

        debug!(path = %self.path.display(), volumes = tracked.len(), "persisted volume state");
        Ok(())
    }

    fn corrupt(&self, err: impl std::fmt::Display) -> VolumeError {
        VolumeError::StateCorrupt {
            path: self.path.clone(),
            reason: err.to_string(),
        }
    }
}
