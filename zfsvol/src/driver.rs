//! Volume lifecycle: create/adopt, remove/retain, and lookups.
//!
//! # Locking discipline
//!
//! The tracking set sits behind a single async mutex. `create` and `remove`
//! hold it for the whole check, backend call, mutation and save, so two
//! requests for the same name are serialized end to end. Lookups hold it
//! only long enough to check membership or clone a snapshot, then release
//! it before talking to the backend.

use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::SecondsFormat;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::config::Config;
use crate::naming::{MountScope, NameResolver};
use crate::state::{StateStore, TrackingSet};
use crate::storage::{Dataset, DatasetBackend};

/// Create option naming a mountpoint sub-path under the volume base.
pub const MOUNTPOINT_OPTION: &str = "mountpoint";
/// Create option overriding the retention default.
pub const KEEP_OPTION: &str = "keep";

#[derive(Debug, Error)]
pub enum VolumeError {
    #[error("invalid volume name {name:?}")]
    InvalidName { name: String },

    #[error("volume name '{name}' is not a dataset path and no parent dataset is configured")]
    NoParentScope { name: String },

    #[error("volume '{name}' already exists")]
    AlreadyTracked { name: String },

    #[error("dataset '{dataset}' already exists and is mounted, refusing to adopt it")]
    AttachConflict { dataset: String },

    #[error("volume '{name}' not found")]
    NotFound { name: String },

    #[error("invalid value for option '{key}': {value:?}")]
    InvalidOption { key: String, value: String },

    #[error("zfs {op} failed for dataset '{dataset}'")]
    Backend {
        dataset: String,
        op: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("state file {} is corrupt: {reason}", .path.display())]
    StateCorrupt { path: PathBuf, reason: String },
}

/// A volume as reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Volume {
    pub name: String,
    pub mountpoint: String,
    /// RFC 3339 creation time, when the backend reports one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Scope {
    Local,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Capabilities {
    pub scope: Scope,
}

/// Parse a retention value. Accepts the ZFS `on`/`off` spellings and the
/// usual boolean words.
pub fn parse_keep(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "on" | "true" | "yes" | "1" => Some(true),
        "off" | "false" | "no" | "0" => Some(false),
        _ => None,
    }
}

fn keep_value(keep: bool) -> &'static str {
    if keep {
        "on"
    } else {
        "off"
    }
}

fn backend_error(dataset: &str, op: &'static str) -> impl FnOnce(anyhow::Error) -> VolumeError {
    let dataset = dataset.to_string();
    move |source| VolumeError::Backend {
        dataset,
        op,
        source,
    }
}

/// Maps volume names onto datasets of a single backend and tracks which
/// of them this driver owns.
pub struct VolumeDriver<B> {
    backend: B,
    names: NameResolver,
    mounts: MountScope,
    store: StateStore,
    keep_property: String,
    keep_new_default: bool,
    keep_existing_default: bool,
    tracked: Mutex<TrackingSet>,
}

impl<B: DatasetBackend> VolumeDriver<B> {
    /// Build a driver, loading tracked volumes from the configured state file.
    ///
    /// Fails with [`VolumeError::StateCorrupt`] if the state file exists but
    /// cannot be parsed.
    pub async fn new(config: &Config, backend: B) -> Result<Self, VolumeError> {
        let store = StateStore::new(&config.state.state_file);
        let tracked = store.load().await?;

        info!(
            parent = ?config.driver.parent_dataset(),
            volumes = tracked.len(),
            "volume driver initialized"
        );

        Ok(Self {
            backend,
            names: NameResolver::from_config(&config.driver),
            mounts: MountScope::from_config(&config.mounts),
            store,
            keep_property: config.driver.retention_property.clone(),
            keep_new_default: config.driver.keep_new_default,
            keep_existing_default: config.driver.keep_existing_default,
            tracked: Mutex::new(tracked),
        })
    }

    #[cfg(test)]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// The key under which `name` is tracked: itself, or its alternate
    /// spelling (simple vs. fully-qualified).
    fn tracked_key(&self, tracked: &TrackingSet, name: &str) -> Option<String> {
        if tracked.contains(name) {
            return Some(name.to_string());
        }
        self.names
            .alternate_name(name)
            .filter(|alt| tracked.contains(alt))
    }

    async fn require_tracked(&self, name: &str) -> Result<(), VolumeError> {
        let tracked = self.tracked.lock().await;
        match self.tracked_key(&tracked, name) {
            Some(_) => Ok(()),
            None => Err(VolumeError::NotFound {
                name: name.to_string(),
            }),
        }
    }

    async fn fetch(&self, name: &str, dataset: &str) -> Result<Dataset, VolumeError> {
        self.backend
            .get(dataset)
            .await
            .map_err(backend_error(dataset, "get"))?
            .ok_or_else(|| VolumeError::NotFound {
                name: name.to_string(),
            })
    }

    /// Create a volume, or adopt an existing unmounted dataset of the same name.
    ///
    /// `options` other than `mountpoint` and `keep` are passed to the backend
    /// as dataset properties on creation.
    #[instrument(skip(self, options))]
    pub async fn create(
        &self,
        name: &str,
        options: &BTreeMap<String, String>,
    ) -> Result<(), VolumeError> {
        debug!(options = ?options, "create");

        let mut tracked = self.tracked.lock().await;
        if self.tracked_key(&tracked, name).is_some() {
            return Err(VolumeError::AlreadyTracked {
                name: name.to_string(),
            });
        }

        let dataset = self.names.build_dataset_name(name)?;

        let mut properties = options.clone();
        let keep = match properties.remove(KEEP_OPTION) {
            Some(value) => Some(parse_keep(&value).ok_or_else(|| VolumeError::InvalidOption {
                key: KEEP_OPTION.to_string(),
                value,
            })?),
            None => None,
        };

        let exists = self
            .backend
            .exists(&dataset)
            .await
            .map_err(backend_error(&dataset, "exists"))?;

        if exists {
            let existing = self.fetch(name, &dataset).await?;
            if existing.mounted {
                return Err(VolumeError::AttachConflict { dataset });
            }

            let keep = keep.unwrap_or(self.keep_existing_default);
            self.backend
                .set_property(&dataset, &self.keep_property, keep_value(keep))
                .await
                .map_err(backend_error(&dataset, "set"))?;

            info!(dataset = %dataset, keep, "adopted existing dataset");
        } else {
            // The caller's mountpoint is only honoured as a sub-path of the
            // volume base, which is the part of the host visible to us.
            let sub_path = properties
                .remove(MOUNTPOINT_OPTION)
                .unwrap_or_else(|| dataset.clone());
            properties.insert(
                MOUNTPOINT_OPTION.to_string(),
                self.mounts.volume_mountpoint(&sub_path),
            );

            let keep = keep.unwrap_or(self.keep_new_default);
            properties.insert(self.keep_property.clone(), keep_value(keep).to_string());

            self.backend
                .create_recursive(&dataset, &properties)
                .await
                .map_err(backend_error(&dataset, "create"))?;

            info!(dataset = %dataset, keep, "created dataset");
        }

        tracked.insert(name);
        self.store.save(&tracked).await;
        Ok(())
    }

    /// Stop tracking a volume, destroying its dataset unless the retention
    /// marker is set.
    #[instrument(skip(self))]
    pub async fn remove(&self, name: &str) -> Result<(), VolumeError> {
        let mut tracked = self.tracked.lock().await;
        let key = self
            .tracked_key(&tracked, name)
            .ok_or_else(|| VolumeError::NotFound {
                name: name.to_string(),
            })?;

        let dataset = self.names.build_dataset_name(name)?;
        self.fetch(name, &dataset).await?;

        let marker = self
            .backend
            .get_property(&dataset, &self.keep_property)
            .await
            .map_err(backend_error(&dataset, "get"))?;

        let keep = match marker.as_deref() {
            None => false,
            Some(value) => parse_keep(value).unwrap_or_else(|| {
                warn!(
                    dataset = %dataset,
                    value = %value,
                    "unrecognized retention marker, keeping dataset"
                );
                true
            }),
        };

        if keep {
            info!(dataset = %dataset, "retention marker set, releasing without destroy");
        } else {
            self.backend
                .destroy(&dataset)
                .await
                .map_err(backend_error(&dataset, "destroy"))?;
            info!(dataset = %dataset, "destroyed dataset");
        }

        tracked.remove(&key);
        self.store.save(&tracked).await;
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn get(&self, name: &str) -> Result<Volume, VolumeError> {
        self.require_tracked(name).await?;
        self.volume(name).await
    }

    /// All tracked volumes. Entries the backend cannot describe are logged
    /// and left out.
    #[instrument(skip(self))]
    pub async fn list(&self) -> Result<Vec<Volume>, VolumeError> {
        let snapshot = self.tracked.lock().await.clone();

        let mut volumes = Vec::with_capacity(snapshot.len());
        for name in snapshot.iter() {
            match self.volume(name).await {
                Ok(volume) => volumes.push(volume),
                Err(e) => {
                    warn!(volume = %name, error = %e, "failed to get volume info, skipping");
                }
            }
        }
        Ok(volumes)
    }

    #[instrument(skip(self))]
    pub async fn path(&self, name: &str) -> Result<String, VolumeError> {
        self.require_tracked(name).await?;
        self.mountpoint(name).await
    }

    /// Mountpoint for a container about to use the volume. Datasets are kept
    /// mounted by ZFS itself, so this performs no mount.
    #[instrument(skip(self))]
    pub async fn mount(&self, name: &str) -> Result<String, VolumeError> {
        self.require_tracked(name).await?;
        self.mountpoint(name).await
    }

    /// No-op: the dataset stays mounted for other containers and for ZFS.
    #[instrument(skip(self))]
    pub async fn unmount(&self, name: &str) -> Result<(), VolumeError> {
        debug!("unmount");
        Ok(())
    }

    pub fn capabilities(&self) -> Capabilities {
        Capabilities {
            scope: Scope::Local,
        }
    }

    async fn volume(&self, name: &str) -> Result<Volume, VolumeError> {
        let dataset = self.names.build_dataset_name(name)?;
        let ds = self.fetch(name, &dataset).await?;
        let mountpoint = self.scoped_mountpoint(&ds)?;

        let created_at = match ds.creation {
            Some(ts) => Some(ts.to_rfc3339_opts(SecondsFormat::Secs, true)),
            None => {
                warn!(dataset = %dataset, "dataset has no creation time");
                None
            }
        };

        Ok(Volume {
            name: self.names.extract_display_name(&dataset),
            mountpoint,
            created_at,
        })
    }

    async fn mountpoint(&self, name: &str) -> Result<String, VolumeError> {
        let dataset = self.names.build_dataset_name(name)?;
        let ds = self.fetch(name, &dataset).await?;
        self.scoped_mountpoint(&ds)
    }

    fn scoped_mountpoint(&self, ds: &Dataset) -> Result<String, VolumeError> {
        match &ds.mountpoint {
            Some(mp) => Ok(self.mounts.scope_mount(mp)),
            None => Err(VolumeError::Backend {
                dataset: ds.name.clone(),
                op: "get",
                source: anyhow::anyhow!("dataset has no mountpoint"),
            }),
        }
    }
}
