//! Subcommand implementations.
//!
//! `check` and `status` inspect the host and the state file without building
//! a driver. The volume commands build one against the real `zfs` backend and
//! call straight into it.

use std::collections::BTreeMap;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::config::Config;
use crate::driver::VolumeDriver;
use crate::state::StateStore;
use crate::storage::ZfsBackend;

// ---------------------------------------------------------------------------
// check
// ---------------------------------------------------------------------------

struct Check {
    label: &'static str,
    ok: bool,
    detail: String,
    fix: Option<String>,
}

impl Check {
    fn pass(label: &'static str, detail: impl Into<String>) -> Self {
        Self { label, ok: true, detail: detail.into(), fix: None }
    }

    fn fail(label: &'static str, detail: impl Into<String>, fix: impl Into<String>) -> Self {
        Self { label, ok: false, detail: detail.into(), fix: Some(fix.into()) }
    }
}

/// Run `zfsvol check`. Returns `Ok(())` if all checks pass, `Err` otherwise.
pub async fn run_check(config: &Config) -> Result<()> {
    println!("Checking prerequisites...\n");

    let checks = vec![
        check_zfs(config),
        check_parent_dataset(config),
        check_volume_base(config),
        check_state_dir(config),
        check_state_file(config).await,
    ];

    for c in &checks {
        let icon = if c.ok { "\u{2713}" } else { "\u{2717}" };
        println!("  {} {} ({})", icon, c.label, c.detail);
        if let (false, Some(fix)) = (c.ok, &c.fix) {
            println!("    Fix: {}", fix);
        }
    }

    println!();
    let failed = checks.iter().filter(|c| !c.ok).count();
    if failed == 0 {
        println!("All checks passed.");
        Ok(())
    } else {
        anyhow::bail!("{} check(s) failed", failed)
    }
}

fn check_zfs(config: &Config) -> Check {
    let binary = &config.driver.zfs_binary;
    match std::process::Command::new(binary).arg("version").output() {
        Ok(out) if out.status.success() => {
            let version = String::from_utf8_lossy(&out.stdout);
            let version = version.lines().next().unwrap_or("unknown").trim().to_string();
            Check::pass("ZFS", version)
        }
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            Check::fail(
                "ZFS",
                format!("{} exited with error: {}", binary, stderr.trim()),
                "Install ZFS: apt install zfsutils-linux",
            )
        }
        Err(e) => Check::fail(
            "ZFS",
            format!("{} not found: {}", binary, e),
            "Install ZFS: apt install zfsutils-linux",
        ),
    }
}

fn check_parent_dataset(config: &Config) -> Check {
    let Some(parent) = config.driver.parent_dataset() else {
        return Check::pass("Parent dataset", "not set, only full dataset names accepted");
    };

    match std::process::Command::new(&config.driver.zfs_binary)
        .args(["list", "-H", "-o", "name", parent])
        .output()
    {
        Ok(out) if out.status.success() => Check::pass("Parent dataset", parent),
        Ok(out) => {
            let stderr = String::from_utf8_lossy(&out.stderr);
            Check::fail(
                "Parent dataset",
                format!("{} not found: {}", parent, stderr.trim()),
                format!("zfs create -p {}", parent),
            )
        }
        Err(e) => Check::fail(
            "Parent dataset",
            format!("zfs list {} failed: {}", parent, e),
            format!("zfs create -p {}", parent),
        ),
    }
}

fn check_volume_base(config: &Config) -> Check {
    let base = PathBuf::from(&config.mounts.volume_base);
    if base.is_dir() {
        Check::pass("Volume base", base.display().to_string())
    } else {
        Check::fail(
            "Volume base",
            format!("{} is not a directory", base.display()),
            format!("mkdir -p {} (or bind-mount it into the plugin)", base.display()),
        )
    }
}

fn check_state_dir(config: &Config) -> Check {
    let state_file = &config.state.state_file;
    let parent = match state_file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => {
            return Check::fail(
                "State directory",
                format!("state_file path {} has no parent", state_file.display()),
                "Set state.state_file to an absolute path",
            );
        }
    };

    if !parent.exists() {
        return Check::fail(
            "State directory",
            format!("{} does not exist", parent.display()),
            format!("mkdir -p {}", parent.display()),
        );
    }

    let probe = parent.join(".zfsvol-check");
    match std::fs::OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&probe)
    {
        Ok(_) => {
            let _ = std::fs::remove_file(&probe);
            Check::pass("State directory", parent.display().to_string())
        }
        Err(e) => Check::fail(
            "State directory",
            format!("{} is not writable: {}", parent.display(), e),
            format!("chown $(whoami) {}", parent.display()),
        ),
    }
}

async fn check_state_file(config: &Config) -> Check {
    let store = StateStore::new(&config.state.state_file);
    match store.load().await {
        Ok(tracked) => Check::pass("State file", format!("{} tracked volume(s)", tracked.len())),
        Err(e) => Check::fail(
            "State file",
            e.to_string(),
            format!("Fix or move aside {}", store.path().display()),
        ),
    }
}

// ---------------------------------------------------------------------------
// status
// ---------------------------------------------------------------------------

/// Run `zfsvol status`: print the tracked names from the state file.
pub async fn run_status(config: &Config) -> Result<()> {
    let store = StateStore::new(&config.state.state_file);

    if !store.path().exists() {
        println!("No state file at {}", store.path().display());
        return Ok(());
    }

    let tracked = store.load().await?;
    println!("State file: {}\n", store.path().display());
    println!("Volumes: {}", tracked.len());
    if tracked.is_empty() {
        println!("  (none)");
    }
    for name in tracked.iter() {
        println!("  {}", name);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// volume commands
// ---------------------------------------------------------------------------

/// A volume operation invoked from the command line.
#[derive(Debug, Clone)]
pub enum VolumeCommand {
    Create {
        name: String,
        options: BTreeMap<String, String>,
    },
    Remove { name: String },
    Inspect { name: String },
    List,
    Path { name: String },
    Mount { name: String },
    Unmount { name: String },
    Capabilities,
}

/// Build a driver on the `zfs` CLI and run one command against it.
pub async fn run_volume(config: &Config, command: VolumeCommand) -> Result<()> {
    let backend = ZfsBackend::new(&config.driver.zfs_binary);
    let driver = VolumeDriver::new(config, backend)
        .await
        .context("failed to initialize volume driver")?;

    match command {
        VolumeCommand::Create { name, options } => {
            driver.create(&name, &options).await?;
            println!("{}", name);
        }
        VolumeCommand::Remove { name } => {
            driver.remove(&name).await?;
            println!("{}", name);
        }
        VolumeCommand::Inspect { name } => {
            let volume = driver.get(&name).await?;
            println!("{}", serde_json::to_string_pretty(&volume)?);
        }
        VolumeCommand::List => {
            let volumes = driver.list().await?;
            println!("{:<32} {:<26} MOUNTPOINT", "NAME", "CREATED");
            for v in volumes {
                println!(
                    "{:<32} {:<26} {}",
                    v.name,
                    v.created_at.as_deref().unwrap_or("-"),
                    v.mountpoint
                );
            }
        }
        VolumeCommand::Path { name } => {
            println!("{}", driver.path(&name).await?);
        }
        VolumeCommand::Mount { name } => {
            println!("{}", driver.mount(&name).await?);
        }
        VolumeCommand::Unmount { name } => {
            driver.unmount(&name).await?;
        }
        VolumeCommand::Capabilities => {
            println!("{}", serde_json::to_string_pretty(&driver.capabilities())?);
        }
    }
    Ok(())
}

/// Parse a `key=value` create option.
pub fn parse_option(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        _ => Err(format!("expected key=value, got '{}'", s)),
    }
}

/// Load a config from an optional path, falling back to defaults.
pub fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    match config_path {
        Some(path) => Config::load(&path),
        None => Ok(Config::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_option_key_value() {
        assert_eq!(
            parse_option("compression=lz4").unwrap(),
            ("compression".to_string(), "lz4".to_string())
        );
        assert_eq!(
            parse_option("mountpoint=/a=b").unwrap(),
            ("mountpoint".to_string(), "/a=b".to_string())
        );
        assert_eq!(parse_option("keep=").unwrap(), ("keep".to_string(), String::new()));
    }

    #[test]
    fn parse_option_rejects_malformed() {
        assert!(parse_option("keep").is_err());
        assert!(parse_option("=on").is_err());
    }

    #[test]
    fn load_config_defaults_without_path() {
        let config = load_config(None).unwrap();
        assert_eq!(config.driver.retention_property, "zfsvol:keep");
    }

    #[tokio::test]
    async fn status_reports_missing_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.state.state_file = dir.path().join("state.json");
        run_status(&config).await.unwrap();
    }

    #[tokio::test]
    async fn status_fails_on_corrupt_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.state.state_file = dir.path().join("state.json");
        tokio::fs::write(&config.state.state_file, "{").await.unwrap();
        assert!(run_status(&config).await.is_err());
    }

    #[tokio::test]
    async fn check_state_file_counts_volumes() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.state.state_file = dir.path().join("state.json");
        tokio::fs::write(&config.state.state_file, r#"{"a":{},"b":{}}"#)
            .await
            .unwrap();

        let check = check_state_file(&config).await;
        assert!(check.ok);
        assert_eq!(check.detail, "2 tracked volume(s)");
        assert!(check_state_dir(&config).ok);
    }
}
