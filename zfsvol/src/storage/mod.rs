#[cfg(test)]
pub mod memory;
pub mod zfs;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

pub use zfs::ZfsBackend;

/// Snapshot of a dataset as reported by the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dataset {
    /// Fully-qualified dataset name (e.g. "tank/docker/postgres").
    pub name: String,
    /// Host mountpoint, or `None` for `none`/`legacy`/`-`.
    pub mountpoint: Option<String>,
    /// Whether the filesystem is currently mounted.
    pub mounted: bool,
    /// Creation time, when the backend could report one.
    pub creation: Option<DateTime<Utc>>,
}

/// Storage operations the volume driver needs from a dataset backend.
///
/// Implementations are shared across concurrent requests and must not hold
/// any per-call state of their own.
#[async_trait]
pub trait DatasetBackend: Send + Sync {
    /// Whether a dataset with this exact name exists.
    async fn exists(&self, dataset: &str) -> Result<bool>;

    /// Fetch a dataset, or `None` if it does not exist.
    async fn get(&self, dataset: &str) -> Result<Option<Dataset>>;

    /// Read a property. Returns `None` when the property is unset.
    async fn get_property(&self, dataset: &str, key: &str) -> Result<Option<String>>;

    async fn set_property(&self, dataset: &str, key: &str, value: &str) -> Result<()>;

    async fn destroy(&self, dataset: &str) -> Result<()>;

    /// Create a filesystem dataset and any missing ancestors, applying
    /// `properties` to the leaf.
    async fn create_recursive(
        &self,
        dataset: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<Dataset>;
}
