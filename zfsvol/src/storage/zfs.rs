use std::collections::BTreeMap;
use std::process::Output;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::process::Command;
use tracing::{debug, instrument};

use super::{Dataset, DatasetBackend};

/// Dataset backend that shells out to the `zfs` CLI.
#[derive(Debug, Clone)]
pub struct ZfsBackend {
    /// Path or name of the `zfs` binary.
    binary: String,
}

impl Default for ZfsBackend {
    fn default() -> Self {
        Self::new("zfs")
    }
}

impl ZfsBackend {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run a `zfs` command and return the raw process output.
    async fn exec(&self, args: &[&str]) -> Result<Output> {
        debug!(args = ?args, "running zfs command");

        Command::new(&self.binary)
            .args(args)
            .output()
            .await
            .with_context(|| format!("failed to execute {} command", self.binary))
    }

    /// Run a `zfs` command and check for success.
    async fn run(&self, args: &[&str]) -> Result<()> {
        self.run_output(args).await.map(|_| ())
    }

    /// Run a `zfs` command and return its stdout.
    async fn run_output(&self, args: &[&str]) -> Result<String> {
        let output = self.exec(args).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("zfs {} failed: {}", args.first().unwrap_or(&""), stderr.trim());
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }
}

#[async_trait]
impl DatasetBackend for ZfsBackend {
    /// Runs: `zfs list -H -o name {dataset}`
    async fn exists(&self, dataset: &str) -> Result<bool> {
        let output = self.exec(&["list", "-H", "-o", "name", dataset]).await?;
        let stderr = String::from_utf8_lossy(&output.stderr);
        exists_from_status(dataset, output.status.success(), &stderr)
    }

    /// Runs: `zfs list -H -p -o name,mountpoint,mounted,creation {dataset}`
    #[instrument(skip(self))]
    async fn get(&self, dataset: &str) -> Result<Option<Dataset>> {
        let output = self
            .exec(&[
                "list", "-H", "-p",
                "-o", "name,mountpoint,mounted,creation",
                dataset,
            ])
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if is_missing_dataset_error(&stderr) {
                return Ok(None);
            }
            bail!("zfs list failed for {}: {}", dataset, stderr.trim());
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let line = stdout.lines().next().context("empty output from zfs list")?;
        parse_dataset_line(line).map(Some)
    }

    /// Runs: `zfs get -H -o value,source {key} {dataset}`
    async fn get_property(&self, dataset: &str, key: &str) -> Result<Option<String>> {
        let output = self
            .run_output(&["get", "-H", "-o", "value,source", key, dataset])
            .await
            .with_context(|| format!("failed to read property {} on {}", key, dataset))?;

        Ok(parse_property_value(&output))
    }

    /// Runs: `zfs set {key}={value} {dataset}`
    #[instrument(skip(self))]
    async fn set_property(&self, dataset: &str, key: &str, value: &str) -> Result<()> {
        let assignment = format!("{}={}", key, value);
        self.run(&["set", &assignment, dataset])
            .await
            .with_context(|| format!("failed to set {} on {}", assignment, dataset))
    }

    /// Runs: `zfs destroy {dataset}`
    ///
    /// Refuses to destroy a pool root. Snapshots and children are not
    /// destroyed recursively; ZFS rejects the call if any exist.
    #[instrument(skip(self))]
    async fn destroy(&self, dataset: &str) -> Result<()> {
        if !dataset.contains('/') {
            bail!("refusing to destroy '{}': it is a pool root", dataset);
        }

        let output = self.exec(&["destroy", dataset]).await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stderr_trimmed = stderr.trim();

            if stderr_trimmed.contains("busy") {
                bail!(
                    "cannot destroy dataset '{}': it is busy (likely still in use by a container). \
                     ZFS error: {}",
                    dataset,
                    stderr_trimmed,
                );
            }

            bail!("failed to destroy dataset '{}': {}", dataset, stderr_trimmed);
        }

        Ok(())
    }

    /// Runs: `zfs create -p [-o key=value]... {dataset}`
    #[instrument(skip(self))]
    async fn create_recursive(
        &self,
        dataset: &str,
        properties: &BTreeMap<String, String>,
    ) -> Result<Dataset> {
        let args = build_create_args(dataset, properties);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        self.run(&args)
            .await
            .with_context(|| format!("failed to create dataset {}", dataset))?;

        self.get(dataset)
            .await?
            .with_context(|| format!("dataset {} missing after create", dataset))
    }
}

/// Whether `zfs` stderr reports that the named dataset does not exist.
pub(crate) fn is_missing_dataset_error(stderr: &str) -> bool {
    stderr.contains("dataset does not exist")
}

/// Interpret a `zfs list` exit. Only a missing-dataset failure means absent.
pub(crate) fn exists_from_status(dataset: &str, success: bool, stderr: &str) -> Result<bool> {
    if success {
        return Ok(true);
    }
    if is_missing_dataset_error(stderr) {
        return Ok(false);
    }
    bail!("zfs list failed for {}: {}", dataset, stderr.trim())
}

/// Parse a tab-separated `zfs list -H -p` line.
///
/// Expected format: name\tmountpoint\tmounted\tcreation
pub(crate) fn parse_dataset_line(line: &str) -> Result<Dataset> {
    let parts: Vec<&str> = line.split('\t').collect();
    if parts.len() < 4 {
        bail!("unexpected zfs list output: {}", line);
    }

    let mountpoint = match parts[1].trim() {
        "-" | "none" | "legacy" => None,
        mp => Some(mp.to_string()),
    };

    let creation = parts[3]
        .trim()
        .parse::<i64>()
        .ok()
        .and_then(|secs| DateTime::<Utc>::from_timestamp(secs, 0));

    Ok(Dataset {
        name: parts[0].to_string(),
        mountpoint,
        mounted: parts[2].trim() == "yes",
        creation,
    })
}

/// Parse `zfs get -H -o value,source` output. Unset user properties are
/// reported as `-\t-`.
pub(crate) fn parse_property_value(output: &str) -> Option<String> {
    let line = output.lines().next()?;
    let (value, source) = line.split_once('\t').unwrap_or((line, ""));
    let value = value.trim();
    if value.is_empty() || (value == "-" && matches!(source.trim(), "-" | "")) {
        None
    } else {
        Some(value.to_string())
    }
}

/// Build the argument vector for `zfs create -p`.
pub(crate) fn build_create_args(
    dataset: &str,
    properties: &BTreeMap<String, String>,
) -> Vec<String> {
    let mut args = vec!["create".to_string(), "-p".to_string()];
    for (key, value) in properties {
        args.push("-o".to_string());
        args.push(format!("{}={}", key, value));
    }
    args.push(dataset.to_string());
    args
}
