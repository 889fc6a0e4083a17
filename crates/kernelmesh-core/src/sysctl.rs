//! Writes to the sysctl pseudo-filesystem.
//!
//! Values are written relative to a configurable root so the same code
//! serves `/proc/sys` in production and a temporary directory in tests.
//! Paths under `/proc/sys/net` resolve against the network namespace of the
//! writing thread, so callers wrap writes in a namespace-scoped section.

use std::path::{Path, PathBuf};

use kernelmesh_common::error::{KernelmeshError, Result};

/// Kernel boundary for toggling sysctl values.
pub trait KernelFs: Send + Sync {
    /// Writes `value` to the sysctl at `relative` (e.g. `net/ipv4/ip_forward`).
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or written.
    fn write_sysctl(&self, relative: &str, value: &str) -> Result<()>;
}

/// Production [`KernelFs`] writing below a sysctl root directory.
#[derive(Debug, Clone)]
pub struct ProcFs {
    root: PathBuf,
}

impl ProcFs {
    /// Creates a writer rooted at `root` (normally `/proc/sys`).
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the sysctl root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl KernelFs for ProcFs {
    fn write_sysctl(&self, relative: &str, value: &str) -> Result<()> {
        let path = self.root.join(relative);
        std::fs::write(&path, value).map_err(|e| KernelmeshError::Configuration {
            target: path.display().to_string(),
            message: format!("failed to write {value:?}: {e}"),
        })?;
        tracing::debug!(path = %path.display(), value, "sysctl written");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_creates_value_under_root() {
        let dir = tempfile::tempdir().expect("tempdir");
        let conf = dir.path().join("net/ipv4/conf/nsm-1");
        std::fs::create_dir_all(&conf).expect("mkdir");

        let fs = ProcFs::new(dir.path());
        fs.write_sysctl("net/ipv4/conf/nsm-1/route_localnet", "1")
            .expect("write");

        let written = std::fs::read_to_string(conf.join("route_localnet")).expect("read");
        assert_eq!(written, "1");
    }

    #[test]
    fn write_truncates_previous_value() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(dir.path().join("flag"), "0000").expect("seed");

        ProcFs::new(dir.path()).write_sysctl("flag", "1").expect("write");

        assert_eq!(
            std::fs::read_to_string(dir.path().join("flag")).expect("read"),
            "1"
        );
    }

    #[test]
    fn missing_interface_directory_is_configuration_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = ProcFs::new(dir.path())
            .write_sysctl("net/ipv4/conf/absent/route_localnet", "1")
            .unwrap_err();
        match err {
            KernelmeshError::Configuration { target, .. } => {
                assert!(target.ends_with("absent/route_localnet"), "got: {target}");
            }
            other => unreachable!("unexpected error: {other}"),
        }
    }
}
