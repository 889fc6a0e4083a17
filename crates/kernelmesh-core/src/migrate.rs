//! Reference-counted migration of shared interfaces between namespaces.
//!
//! Several connections can multiplex over one interface (typically a VF).
//! The interface is moved into the target namespace when the first
//! connection takes it and moved back when the last one releases it.
//!
//! The table lock only guards slot lookup. Each key has its own lock that
//! is held across the count update *and* the physical move, so two
//! first-time requests for the same key cannot both migrate the link while
//! unrelated keys never wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use kernelmesh_common::error::{KernelmeshError, Result};
use kernelmesh_common::types::Connection;

use crate::link::LinkOps;
use crate::namespace::executor::NsExecutor;
use crate::vf::VfConfig;

/// Where one connection's interface moves from and to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Placement {
    /// Reference-count key.
    pub key: String,
    /// Link name in the source namespace.
    pub link: String,
    /// Link name in the target namespace.
    pub target_name: String,
    /// Namespace the link lives in while unused.
    pub source_netns_url: String,
    /// Namespace the link is placed into.
    pub target_netns_url: String,
}

impl Placement {
    /// Placement of the kernel interface carried by `conn`.
    ///
    /// VF-backed connections move the VF netdev and share the VF key;
    /// other connections move the named interface as-is.
    #[must_use]
    pub fn for_connection(conn: &Connection, source_netns_url: &str) -> Self {
        if let Some(vf) = VfConfig::load(conn, source_netns_url) {
            return vf.placement();
        }
        let mechanism = &conn.mechanism;
        Self {
            key: mechanism.interface_name.clone(),
            link: mechanism.interface_name.clone(),
            target_name: mechanism.interface_name.clone(),
            source_netns_url: source_netns_url.to_string(),
            target_netns_url: mechanism.netns_url.clone(),
        }
    }
}

type Slot = Arc<Mutex<usize>>;

/// Moves interfaces into target namespaces, tracking concurrent owners.
pub struct Migrator {
    executor: Arc<NsExecutor>,
    links: Arc<dyn LinkOps>,
    table: Mutex<HashMap<String, Slot>>,
}

impl Migrator {
    /// Creates a migrator with an empty reference-count table.
    #[must_use]
    pub fn new(executor: Arc<NsExecutor>, links: Arc<dyn LinkOps>) -> Self {
        Self {
            executor,
            links,
            table: Mutex::new(HashMap::new()),
        }
    }

    /// Takes a reference on the interface, moving it on the 0→1 transition.
    ///
    /// Returns the count after the increment.
    ///
    /// # Errors
    ///
    /// Returns an error if the physical move fails; the count is unchanged.
    pub fn inject(&self, placement: &Placement) -> Result<usize> {
        self.inject_with(placement, || Ok(()), || Ok(()))
    }

    /// Like [`inject`](Self::inject), running `create` before the move on
    /// the 0→1 transition and `undo` if that move then fails.
    ///
    /// Both hooks run under the per-key lock, so no other caller can take
    /// the interface between a failed move and its undo. They are skipped
    /// while the interface is already held.
    ///
    /// # Errors
    ///
    /// Returns the error of `create`, or the move error with any `undo`
    /// error appended. The count is unchanged in both cases.
    pub fn inject_with<C, U>(&self, placement: &Placement, create: C, undo: U) -> Result<usize>
    where
        C: FnOnce() -> Result<()>,
        U: FnOnce() -> Result<()>,
    {
        let slot = self.slot(&placement.key);
        let mut count = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if *count == 0 {
            if let Err(e) = self.first_reference(placement, create, undo) {
                drop(count);
                self.release_slot(&placement.key, &slot);
                return Err(e);
            }
        }
        *count += 1;
        tracing::debug!(key = %placement.key, count = *count, "interface reference taken");
        Ok(*count)
    }

    /// Drops a reference on the interface, moving it back on the 1→0 transition.
    ///
    /// Returns the count after the decrement.
    ///
    /// # Errors
    ///
    /// Returns [`KernelmeshError::RefCountUnderflow`] if nobody holds the
    /// interface, or the error of the physical move-back.
    pub fn eject(&self, placement: &Placement) -> Result<usize> {
        self.eject_with(placement, || Ok(()))
    }

    /// Like [`eject`](Self::eject), running `destroy` after the move-back on
    /// the 1→0 transition.
    ///
    /// `destroy` runs even if the move-back failed. The count reaches zero
    /// either way.
    ///
    /// # Errors
    ///
    /// Returns [`KernelmeshError::RefCountUnderflow`] if nobody holds the
    /// interface, otherwise the move-back error merged with the `destroy`
    /// error.
    pub fn eject_with<F>(&self, placement: &Placement, destroy: F) -> Result<usize>
    where
        F: FnOnce() -> Result<()>,
    {
        let Some(slot) = self.existing_slot(&placement.key) else {
            return Err(KernelmeshError::RefCountUnderflow {
                key: placement.key.clone(),
            });
        };
        let mut count = slot.lock().unwrap_or_else(PoisonError::into_inner);
        if *count == 0 {
            return Err(KernelmeshError::RefCountUnderflow {
                key: placement.key.clone(),
            });
        }
        *count -= 1;
        tracing::debug!(key = %placement.key, count = *count, "interface reference dropped");
        if *count > 0 {
            return Ok(*count);
        }
        let moved_back = self.move_out(placement);
        let destroyed = destroy();
        drop(count);
        self.release_slot(&placement.key, &slot);
        match (moved_back, destroyed) {
            (Ok(()), Ok(())) => Ok(0),
            (Err(e), Ok(())) | (Ok(()), Err(e)) => Err(e),
            (Err(moved), Err(destroyed)) => Err(moved.with_close_errors(&[destroyed])),
        }
    }

    /// Current number of connections holding `key`.
    #[must_use]
    pub fn count(&self, key: &str) -> usize {
        self.existing_slot(key)
            .map_or(0, |slot| *slot.lock().unwrap_or_else(PoisonError::into_inner))
    }

    fn slot(&self, key: &str) -> Slot {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(table.entry(key.to_string()).or_default())
    }

    fn existing_slot(&self, key: &str) -> Option<Slot> {
        let table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        table.get(key).map(Arc::clone)
    }

    /// Removes an emptied slot unless another caller already cloned it.
    fn release_slot(&self, key: &str, slot: &Slot) {
        let mut table = self.table.lock().unwrap_or_else(PoisonError::into_inner);
        let idle = table
            .get(key)
            .is_some_and(|current| Arc::ptr_eq(current, slot) && Arc::strong_count(slot) == 2);
        if idle {
            let _ = table.remove(key);
        }
    }

    /// Creates and places the interface. Caller holds the per-key lock.
    fn first_reference<C, U>(&self, placement: &Placement, create: C, undo: U) -> Result<()>
    where
        C: FnOnce() -> Result<()>,
        U: FnOnce() -> Result<()>,
    {
        create()?;
        let Err(moved) = self.move_in(placement) else {
            return Ok(());
        };
        match undo() {
            Ok(()) => Err(moved),
            Err(undone) => {
                tracing::error!(key = %placement.key, error = %undone, "undo after failed move failed");
                Err(moved.with_close_errors(&[undone]))
            }
        }
    }

    fn move_in(&self, placement: &Placement) -> Result<()> {
        self.executor.run_in(&placement.source_netns_url, || {
            let dest = self.executor.open(&placement.target_netns_url)?;
            self.links
                .move_link(&placement.link, &placement.target_name, &dest)
        })?;
        tracing::info!(
            key = %placement.key,
            netns = %placement.target_netns_url,
            "interface injected"
        );
        Ok(())
    }

    fn move_out(&self, placement: &Placement) -> Result<()> {
        self.executor.run_in(&placement.target_netns_url, || {
            let dest = self.executor.open(&placement.source_netns_url)?;
            self.links
                .move_link(&placement.target_name, &placement.link, &dest)
        })?;
        tracing::info!(
            key = %placement.key,
            netns = %placement.source_netns_url,
            "interface returned"
        );
        Ok(())
    }
}
