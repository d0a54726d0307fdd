//! Volume name resolution and mount path translation.
//!
//! A volume name without a `/` is a *simple* name and lives under the
//! configured parent dataset. Any name containing a `/` is already a full
//! dataset path and is used verbatim.

use crate::config::{DriverConfig, MountConfig};
use crate::driver::VolumeError;

const SEPARATOR: char = '/';

/// Maps volume names to dataset names and back.
#[derive(Debug, Clone, Default)]
pub struct NameResolver {
    parent: Option<String>,
    show_full: bool,
}

impl NameResolver {
    pub fn new(parent: Option<&str>, show_full: bool) -> Self {
        Self {
            parent: parent.filter(|p| !p.is_empty()).map(str::to_string),
            show_full,
        }
    }

    pub fn from_config(config: &DriverConfig) -> Self {
        Self::new(config.parent_dataset(), config.show_full_dataset)
    }

    /// Full dataset name for a volume name.
    ///
    /// Empty names and names with an empty leading or trailing segment are
    /// rejected before anything is resolved.
    pub fn build_dataset_name(&self, name: &str) -> Result<String, VolumeError> {
        if name.is_empty() || name.starts_with(SEPARATOR) || name.ends_with(SEPARATOR) {
            return Err(VolumeError::InvalidName {
                name: name.to_string(),
            });
        }
        if !is_simple_name(name) {
            return Ok(name.to_string());
        }
        match &self.parent {
            Some(parent) => Ok(format!("{}{}{}", parent, SEPARATOR, name)),
            None => Err(VolumeError::NoParentScope {
                name: name.to_string(),
            }),
        }
    }

    /// Name reported back to callers for a dataset.
    pub fn extract_display_name(&self, dataset: &str) -> String {
        if self.show_full {
            return dataset.to_string();
        }
        self.strip_parent(dataset).unwrap_or(dataset).to_string()
    }

    /// The other spelling of `name` that resolves to the same dataset, if any:
    /// the full path for a simple name, the simple name for a path directly
    /// under the parent.
    pub fn alternate_name(&self, name: &str) -> Option<String> {
        if is_simple_name(name) {
            self.build_dataset_name(name).ok()
        } else {
            self.strip_parent(name)
                .filter(|short| is_simple_name(short))
                .map(str::to_string)
        }
    }

    fn strip_parent<'a>(&self, dataset: &'a str) -> Option<&'a str> {
        let parent = self.parent.as_deref()?;
        dataset
            .strip_prefix(parent)
            .and_then(|rest| rest.strip_prefix(SEPARATOR))
            .filter(|rest| !rest.is_empty())
    }
}

pub fn is_simple_name(name: &str) -> bool {
    !name.contains(SEPARATOR)
}

/// Rewrites host mountpoints into paths valid in the caller's namespace.
#[derive(Debug, Clone)]
pub struct MountScope {
    propagated_prefix: String,
    volume_base: String,
}

impl MountScope {
    pub fn new(propagated_prefix: impl Into<String>, volume_base: impl Into<String>) -> Self {
        Self {
            propagated_prefix: propagated_prefix.into(),
            volume_base: volume_base.into(),
        }
    }

    pub fn from_config(config: &MountConfig) -> Self {
        Self::new(&config.propagated_mount_prefix, &config.volume_base)
    }

    /// Prefix a backend mountpoint for the caller.
    ///
    /// Plain concatenation: the prefix walks back out of the caller's mount
    /// namespace with `..` segments, and path normalization would collapse them.
    pub fn scope_mount(&self, backend_path: &str) -> String {
        format!("{}{}", self.propagated_prefix, backend_path)
    }

    /// Host mountpoint for a new dataset, `sub_path` placed under the volume base.
    pub fn volume_mountpoint(&self, sub_path: &str) -> String {
        format!(
            "{}/{}",
            self.volume_base.trim_end_matches(SEPARATOR),
            sub_path.trim_matches(SEPARATOR)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> NameResolver {
        NameResolver::new(Some("tank/docker"), false)
    }

    #[test]
    fn test_build_simple_name() {
        assert_eq!(resolver().build_dataset_name("pg").unwrap(), "tank/docker/pg");
    }

    #[test]
    fn test_build_qualified_name_unchanged() {
        let r = resolver();
        assert_eq!(r.build_dataset_name("other/pg").unwrap(), "other/pg");
        assert_eq!(r.build_dataset_name("tank/docker/pg").unwrap(), "tank/docker/pg");
        // Never prefixed, even when it looks like the parent's last segment.
        assert_eq!(r.build_dataset_name("docker/pg").unwrap(), "docker/pg");
    }

    #[test]
    fn test_build_rejects_empty_segments() {
        let r = resolver();
        for name in ["", "/", "docker/", "/pg", "tank/docker/"] {
            assert!(
                matches!(r.build_dataset_name(name), Err(VolumeError::InvalidName { .. })),
                "{name:?}"
            );
        }
        // Checked before the parent scope.
        assert!(matches!(
            NameResolver::new(None, false).build_dataset_name(""),
            Err(VolumeError::InvalidName { .. })
        ));
        assert_eq!(r.alternate_name(""), None);
    }

    #[test]
    fn test_build_without_parent() {
        let r = NameResolver::new(None, false);
        assert!(matches!(
            r.build_dataset_name("pg"),
            Err(VolumeError::NoParentScope { .. })
        ));
        assert_eq!(r.build_dataset_name("tank/pg").unwrap(), "tank/pg");

        let r = NameResolver::new(Some(""), false);
        assert!(r.build_dataset_name("pg").is_err());
    }

    #[test]
    fn test_display_name_round_trip() {
        let r = resolver();
        for name in ["pg", "redis-data", "a.b_c"] {
            let ds = r.build_dataset_name(name).unwrap();
            assert_eq!(r.extract_display_name(&ds), name);
        }
    }

    #[test]
    fn test_display_name_outside_parent() {
        let r = resolver();
        assert_eq!(r.extract_display_name("other/pg"), "other/pg");
        // Shares a prefix but is not a child of the parent.
        assert_eq!(r.extract_display_name("tank/dockerx/pg"), "tank/dockerx/pg");
        assert_eq!(r.extract_display_name("tank/docker"), "tank/docker");
    }

    #[test]
    fn test_display_name_show_full() {
        let r = NameResolver::new(Some("tank/docker"), true);
        assert_eq!(r.extract_display_name("tank/docker/pg"), "tank/docker/pg");
    }

    #[test]
    fn test_alternate_name() {
        let r = resolver();
        assert_eq!(r.alternate_name("pg").as_deref(), Some("tank/docker/pg"));
        assert_eq!(r.alternate_name("tank/docker/pg").as_deref(), Some("pg"));
        assert_eq!(r.alternate_name("tank/docker/a/b"), None);
        assert_eq!(r.alternate_name("other/pg"), None);
        assert_eq!(NameResolver::new(None, false).alternate_name("pg"), None);
    }

    #[test]
    fn test_is_simple_name() {
        assert!(is_simple_name("pg"));
        assert!(!is_simple_name("tank/pg"));
        assert!(!is_simple_name("/"));
    }

    #[test]
    fn test_scope_mount_keeps_parent_segments() {
        let scope = MountScope::new("/plugins/x/propagated-mount/../../..", "/var/lib/docker/volumes/");
        assert_eq!(
            scope.scope_mount("/var/lib/docker/volumes/pg"),
            "/plugins/x/propagated-mount/../../../var/lib/docker/volumes/pg"
        );
    }

    #[test]
    fn test_volume_mountpoint() {
        let scope = MountScope::new("", "/var/lib/docker/volumes/");
        assert_eq!(scope.volume_mountpoint("tank/docker/pg"), "/var/lib/docker/volumes/tank/docker/pg");
        assert_eq!(scope.volume_mountpoint("/custom/path/"), "/var/lib/docker/volumes/custom/path");

        let scope = MountScope::new("", "/srv/volumes");
        assert_eq!(scope.volume_mountpoint("pg"), "/srv/volumes/pg");
    }
}
