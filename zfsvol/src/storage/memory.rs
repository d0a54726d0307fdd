//! In-memory dataset backend used by driver tests.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};

use super::{Dataset, DatasetBackend};

#[derive(Debug, Clone)]
struct Entry {
    dataset: Dataset,
    properties: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct Inner {
    datasets: BTreeMap<String, Entry>,
    /// Datasets whose next mutating call (create/destroy/set) fails.
    failing: BTreeSet<String>,
    /// Datasets whose `get` fails.
    unreadable: BTreeSet<String>,
}

#[derive(Debug, Default)]
pub struct MemoryBackend {
    inner: Mutex<Inner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a dataset as if it had been created outside the driver.
    pub fn insert(&self, name: &str, mountpoint: &str, mounted: bool) {
        let dataset = Dataset {
            name: name.to_string(),
            mountpoint: Some(mountpoint.to_string()),
            mounted,
            creation: Utc.timestamp_opt(1_700_000_000, 0).single(),
        };
        self.inner.lock().unwrap().datasets.insert(
            name.to_string(),
            Entry {
                dataset,
                properties: BTreeMap::new(),
            },
        );
    }

    pub fn property(&self, name: &str, key: &str) -> Option<String> {
        let inner = self.inner.lock().unwrap();
        inner
            .datasets
            .get(name)
            .and_then(|e| e.properties.get(key).cloned())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().unwrap().datasets.contains_key(name)
    }

    pub fn fail_mutations(&self, name: &str) {
        self.inner.lock().unwrap().failing.insert(name.to_string());
    }

    pub fn fail_reads(&self, name: &str) {
        self.inner.lock().unwrap().unreadable.insert(name.to_string());
    }

    pub fn clear_creation(&self, name: &str) {
        if let Some(entry) = self.inner.lock().unwrap().datasets.get_mut(name) {
            entry.dataset.creation = None;
        }
    }
}

#[async_trait]
impl DatasetBackend for MemoryBackend {
    async fn exists(&self, dataset: &str) -> Result<bool> {
        Ok(self.contains(dataset))
    }

    async fn get(&self, dataset: &str) -> Result<Option<Dataset>> {
        let inner = self.inner.lock().unwrap();
        if inner.unreadable.contains(dataset) {
            bail!("injected read failure for {}", dataset);
        }
        Ok(inner.datasets.get(dataset).map(|e| e.dataset.clone()))
    }

    async fn get_property(&self, dataset: &str, key: &str) -> Result<Option<String>> {
        let inner = self.inner.lock().unwrap();
        match inner.datasets.get(dataset) {
            Some(entry) => Ok(entry.properties.get(key).cloned()),
            None => bail!("dataset does not exist: {}", dataset),
        }
    }

    async fn set_property(&self, dataset: &str, key: &str, value: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing.contains(dataset) {
            bail!("injected set failure for {}", dataset);
        }
        match inner.datasets.get_mut(dataset) {
            Some(entry) => {
                entry.properties.insert(key.to_string(), value.to_string());
                Ok(())
            }
            None => bail!("dataset does not exist: {}", dataset),
        }
    }

    async fn destroy(&self, dataset: &str) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing.contains(dataset) {
            bail!("injected destroy failure for {}", dataset);
        }
        match inner.datasets.remove(dataset) {
            Some(_) => Ok(()),
            None => bail!("dataset does not exist: {}", dataset),
        }
    }

    async fn create_recursive(
        &self,
        dataset: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<Dataset> {
        let mut inner = self.inner.lock().unwrap();
        if inner.failing.contains(dataset) {
            bail!("injected create failure for {}", dataset);
        }
        if inner.datasets.contains_key(dataset) {
            bail!("dataset already exists: {}", dataset);
        }

        let mut properties = properties.clone();
        let mountpoint = properties
            .remove("mountpoint")
            .unwrap_or_else(|| format!("/{}", dataset));
        let created = Dataset {
            name: dataset.to_string(),
            mountpoint: Some(mountpoint),
            mounted: true,
            creation: Some(Utc::now()),
        };
        inner.datasets.insert(
            dataset.to_string(),
            Entry {
                dataset: created.clone(),
                properties,
            },
        );
        Ok(created)
    }
}
