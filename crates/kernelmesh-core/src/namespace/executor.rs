//! Namespace-scoped execution of privileged operations.
//!
//! The network namespace is an attribute of an OS thread, so each scoped
//! section runs on a dedicated thread spawned for it. No section ever
//! borrows a pooled or async worker thread, and two sections never share a
//! thread.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use kernelmesh_common::error::{KernelmeshError, Result};

use super::{NetnsSwitcher, NsHandle};

const WORKER_NAME: &str = "netns-exec";

/// Runs work inside a target network namespace and switches back afterwards.
pub struct NsExecutor {
    switcher: Arc<dyn NetnsSwitcher>,
}

impl NsExecutor {
    /// Creates an executor over the given namespace switcher.
    #[must_use]
    pub fn new(switcher: Arc<dyn NetnsSwitcher>) -> Self {
        Self { switcher }
    }

    /// Opens the namespace referenced by `url`.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace cannot be opened.
    pub fn open(&self, url: &str) -> Result<NsHandle> {
        self.switcher.open(url)
    }

    /// Runs `work` with the network namespace switched to `target_url`.
    ///
    /// The section runs on its own thread: the current namespace is opened,
    /// the thread enters the target, `work` runs, and the original namespace
    /// is restored exactly once, whether `work` succeeded, failed, or
    /// panicked. Both handles are closed before this returns.
    ///
    /// # Errors
    ///
    /// Returns the error from `work`, or a namespace error if the target
    /// cannot be opened or entered. A failure to restore the original
    /// namespace is returned as [`KernelmeshError::NamespaceRestore`] and
    /// takes precedence over the result of `work`.
    pub fn run_in<T, F>(&self, target_url: &str, work: F) -> Result<T>
    where
        F: FnOnce() -> Result<T> + Send,
        T: Send,
    {
        let target = self.switcher.open(target_url)?;
        std::thread::scope(|scope| {
            let worker = std::thread::Builder::new()
                .name(WORKER_NAME.into())
                .spawn_scoped(scope, || self.run_pinned(&target, work))
                .map_err(|e| KernelmeshError::Namespace {
                    url: target_url.to_string(),
                    message: format!("failed to spawn namespace worker: {e}"),
                })?;
            match worker.join() {
                Ok(result) => result,
                Err(payload) => panic::resume_unwind(payload),
            }
        })
    }

    fn run_pinned<T>(&self, target: &NsHandle, work: impl FnOnce() -> Result<T>) -> Result<T> {
        let original = self.switcher.current()?;
        self.switcher.enter(target)?;
        tracing::trace!(netns = target.origin(), "entered namespace-scoped section");

        let outcome = panic::catch_unwind(AssertUnwindSafe(work));

        if let Err(e) = self.switcher.enter(&original) {
            tracing::error!(
                netns = original.origin(),
                error = %e,
                "failed to restore network namespace"
            );
            let mut message = e.to_string();
            if let Err(payload) = &outcome {
                let panicked = panic_message(payload.as_ref());
                tracing::error!(
                    netns = target.origin(),
                    panic = panicked,
                    "namespace-scoped work panicked before the failed restore"
                );
                message = format!("{message}; work panicked: {panicked}");
            }
            return Err(KernelmeshError::NamespaceRestore {
                url: original.origin().to_string(),
                message,
            });
        }
        drop(original);

        match outcome {
            Ok(result) => result,
            Err(payload) => panic::resume_unwind(payload),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
