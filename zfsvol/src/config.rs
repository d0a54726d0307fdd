use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the zfsvol driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub driver: DriverConfig,
    pub mounts: MountConfig,
    pub state: StateConfig,
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading config: {}", path.display()))?;
        let config: Config =
            toml::from_str(&content).with_context(|| format!("parsing config: {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if let Some(parent) = self.driver.parent_dataset() {
            anyhow::ensure!(
                !parent.starts_with('/') && !parent.ends_with('/'),
                "driver.parent_dataset must not start or end with '/': {}",
                parent
            );
            anyhow::ensure!(
                !parent.contains('@'),
                "driver.parent_dataset must name a filesystem, not a snapshot: {}",
                parent
            );
        }
        // ZFS only accepts user properties whose name contains a colon.
        anyhow::ensure!(
            self.driver.retention_property.contains(':'),
            "driver.retention_property must be a ZFS user property (module:name): {}",
            self.driver.retention_property
        );
        anyhow::ensure!(
            !self.driver.zfs_binary.is_empty(),
            "driver.zfs_binary must not be empty"
        );
        anyhow::ensure!(
            self.mounts.volume_base.starts_with('/'),
            "mounts.volume_base must be an absolute path: {}",
            self.mounts.volume_base
        );
        anyhow::ensure!(
            self.state.state_file.file_name().is_some(),
            "state.state_file must name a file: {}",
            self.state.state_file.display()
        );
        Ok(())
    }
}

/// Naming and retention policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverConfig {
    /// Dataset that simple volume names are created under (e.g. "tank/docker").
    /// Unset or empty means only fully-qualified names are accepted.
    pub parent_dataset: Option<String>,
    /// Report fully-qualified dataset names instead of stripping the parent.
    pub show_full_dataset: bool,
    /// Retention for datasets the driver creates.
    pub keep_new_default: bool,
    /// Retention for pre-existing datasets the driver adopts.
    pub keep_existing_default: bool,
    /// ZFS user property holding the retention marker.
    pub retention_property: String,
    /// Path or name of the `zfs` binary.
    pub zfs_binary: String,
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            parent_dataset: None,
            show_full_dataset: false,
            keep_new_default: false,
            keep_existing_default: true,
            retention_property: "zfsvol:keep".into(),
            zfs_binary: "zfs".into(),
        }
    }
}

impl DriverConfig {
    /// The configured parent dataset, treating an empty string as unset.
    pub fn parent_dataset(&self) -> Option<&str> {
        self.parent_dataset.as_deref().filter(|p| !p.is_empty())
    }
}

/// Mount path translation between the host and the caller's namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MountConfig {
    /// Prepended verbatim to every mountpoint handed back to callers.
    pub propagated_mount_prefix: String,
    /// Host directory new datasets are mounted under.
    pub volume_base: String,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            propagated_mount_prefix:
                "/var/lib/docker/plugins/pluginHash/propagated-mount/../../../../../..".into(),
            volume_base: "/var/lib/docker/volumes/".into(),
        }
    }
}

/// Tracking state persistence.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StateConfig {
    /// Path to persist the tracked volume names as JSON.
    pub state_file: PathBuf,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            state_file: PathBuf::from("/var/lib/zfsvol/state.json"),
        }
    }
}
