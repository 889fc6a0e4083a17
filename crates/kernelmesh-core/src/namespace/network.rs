//! Network namespace switching through `/proc` and `setns(2)`.

use std::path::Path;

use kernelmesh_common::constants::THREAD_NETNS_PATH;
use kernelmesh_common::error::{KernelmeshError, Result};

use super::{NetnsSwitcher, NsHandle, netns_path_from_url};

/// Production [`NetnsSwitcher`] backed by `/proc` namespace files.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcNetns;

impl ProcNetns {
    /// Creates the switcher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl NetnsSwitcher for ProcNetns {
    fn current(&self) -> Result<NsHandle> {
        NsHandle::open(Path::new(THREAD_NETNS_PATH), THREAD_NETNS_PATH)
    }

    fn open(&self, url: &str) -> Result<NsHandle> {
        let path = netns_path_from_url(url)?;
        NsHandle::open(&path, url)
    }

    #[cfg(target_os = "linux")]
    fn enter(&self, ns: &NsHandle) -> Result<()> {
        use nix::sched::{CloneFlags, setns};
        use std::os::fd::AsFd;

        setns(ns.as_fd(), CloneFlags::CLONE_NEWNET).map_err(|e| KernelmeshError::Namespace {
            url: ns.origin().to_string(),
            message: format!("setns failed: {e}"),
        })?;
        tracing::trace!(netns = ns.origin(), "switched network namespace");
        Ok(())
    }

    /// Stub for non-Linux platforms.
    #[cfg(not(target_os = "linux"))]
    fn enter(&self, ns: &NsHandle) -> Result<()> {
        Err(KernelmeshError::Namespace {
            url: ns.origin().to_string(),
            message: "Linux required for namespace switching".into(),
        })
    }
}
