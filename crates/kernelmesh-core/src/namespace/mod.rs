//! Network namespace handles and switching.
//!
//! A namespace is referenced by URL (`file:///var/run/netns/<name>` or an
//! absolute path) and held open as an [`NsHandle`] for as long as a scope
//! needs it. Switching is per-thread, see [`executor::NsExecutor`].

pub mod executor;
pub mod network;

use std::fs::File;
use std::os::fd::{AsFd, BorrowedFd, OwnedFd};
use std::path::{Path, PathBuf};

use kernelmesh_common::constants::FILE_URL_SCHEME;
use kernelmesh_common::error::{KernelmeshError, Result};

/// Exclusively owned handle to one network namespace.
///
/// The descriptor is closed when the handle is dropped.
#[derive(Debug)]
pub struct NsHandle {
    fd: OwnedFd,
    origin: String,
}

impl NsHandle {
    /// Wraps an already opened namespace descriptor.
    #[must_use]
    pub fn new(fd: OwnedFd, origin: impl Into<String>) -> Self {
        Self {
            fd,
            origin: origin.into(),
        }
    }

    /// Opens the namespace file at `path`.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: &Path, origin: impl Into<String>) -> Result<Self> {
        let origin = origin.into();
        let file = File::open(path).map_err(|e| KernelmeshError::Namespace {
            url: origin.clone(),
            message: format!("failed to open {}: {e}", path.display()),
        })?;
        Ok(Self::new(OwnedFd::from(file), origin))
    }

    /// URL or path the handle was opened from.
    #[must_use]
    pub fn origin(&self) -> &str {
        &self.origin
    }
}

impl AsFd for NsHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

/// Kernel boundary for namespace lookup and switching.
pub trait NetnsSwitcher: Send + Sync {
    /// Opens the namespace the calling thread is currently in.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace cannot be opened.
    fn current(&self) -> Result<NsHandle>;

    /// Opens the namespace referenced by `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the URL is unsupported or the namespace cannot be opened.
    fn open(&self, url: &str) -> Result<NsHandle>;

    /// Moves the calling thread into `ns`.
    ///
    /// # Errors
    ///
    /// Returns an error if the switch is refused by the kernel.
    fn enter(&self, ns: &NsHandle) -> Result<()>;
}

/// Resolves a namespace URL to a filesystem path.
///
/// Accepts `file://` URLs and absolute paths.
///
/// # Errors
///
/// Returns an error for any other scheme or a relative path.
pub fn netns_path_from_url(url: &str) -> Result<PathBuf> {
    let path = url.strip_prefix(FILE_URL_SCHEME).unwrap_or(url);
    if !path.starts_with('/') {
        return Err(KernelmeshError::Namespace {
            url: url.to_string(),
            message: "unsupported namespace URL".into(),
        });
    }
    Ok(PathBuf::from(path))
}
