//! Unified error types for the kernelmesh workspace.
//!
//! Every fallible operation in the namespace, pipeline, and liveness crates
//! reports one of these variants.

use std::path::PathBuf;

use thiserror::Error;

/// Top-level error type shared across the workspace.
#[derive(Debug, Error)]
pub enum KernelmeshError {
    /// An I/O operation failed.
    #[error("I/O error at {path}: {source}")]
    Io {
        /// Path where the I/O error occurred.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A configuration value or descriptor field is invalid.
    #[error("invalid configuration: {message}")]
    Config {
        /// Description of the invalid configuration.
        message: String,
    },

    /// Looking up, opening, or entering a network namespace failed.
    #[error("namespace error ({url}): {message}")]
    Namespace {
        /// Namespace URL or handle origin involved.
        url: String,
        /// Description of the failure.
        message: String,
    },

    /// Switching the thread back to its original namespace failed.
    ///
    /// The thread that raised this must not be reused for further work.
    #[error("failed to restore network namespace {url}: {message}")]
    NamespaceRestore {
        /// Origin of the namespace that could not be restored.
        url: String,
        /// Description of the failure.
        message: String,
    },

    /// A namespace-scoped kernel configuration call failed.
    #[error("failed to configure {target}: {message}")]
    Configuration {
        /// Affected interface or pseudo-filesystem path.
        target: String,
        /// Description of the failure.
        message: String,
    },

    /// Creating or tearing down a virtual function failed.
    #[error("VF {vf} lifecycle error: {message}")]
    VfLifecycle {
        /// `pf/vf` identity of the virtual function.
        vf: String,
        /// Description of the failure.
        message: String,
    },

    /// Compensating a failed request also failed.
    ///
    /// The original cause is always kept and printed first.
    #[error("{cause}: connection closed with error: {close}")]
    Rollback {
        /// Error that triggered the rollback.
        cause: Box<KernelmeshError>,
        /// Errors raised while undoing already-applied work.
        close: String,
    },

    /// A release was requested for an interface nobody holds.
    #[error("reference count underflow for interface {key}")]
    RefCountUnderflow {
        /// Interface key whose count is already zero.
        key: String,
    },

    /// A single liveness probe failed at the transport level.
    #[error("probe {src} -> {dst} failed: {message}")]
    Probe {
        /// Source address of the probe.
        src: String,
        /// Destination address of the probe.
        dst: String,
        /// Description of the failure.
        message: String,
    },
}

impl KernelmeshError {
    /// Appends compensation failures to this error.
    ///
    /// Returns `self` unchanged when `close_errors` is empty.
    #[must_use]
    pub fn with_close_errors(self, close_errors: &[Self]) -> Self {
        if close_errors.is_empty() {
            return self;
        }
        let close = close_errors
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join("; ");
        Self::Rollback {
            cause: Box::new(self),
            close,
        }
    }
}

/// Convenience alias used throughout the workspace.
pub type Result<T> = std::result::Result<T, KernelmeshError>;
