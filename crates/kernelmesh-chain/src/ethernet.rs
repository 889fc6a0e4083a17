//! Ethernet context of kernel interfaces: VF lifecycle and hardware address.
//!
//! A VF-backed interface is programmed on its PF and placed into the
//! target namespace when the first connection takes it, and returned and
//! cleared when the last one releases it. Sibling connections multiplexed
//! on the same VF only move the reference count.

use std::sync::Arc;

use kernelmesh_common::context::Context;
use kernelmesh_common::error::Result;
use kernelmesh_common::types::Connection;
use kernelmesh_core::link::LinkOps;
use kernelmesh_core::migrate::Migrator;
use kernelmesh_core::namespace::executor::NsExecutor;
use kernelmesh_core::vf::VfConfig;

use crate::element::{Element, Next, finish_close, rollback};

/// VF lifecycle stage.
pub struct VfEthernet {
    executor: Arc<NsExecutor>,
    links: Arc<dyn LinkOps>,
    migrator: Migrator,
    source_netns_url: String,
}

impl VfEthernet {
    /// Creates the stage. VFs live in `source_netns_url` while unused.
    #[must_use]
    pub fn new(
        executor: Arc<NsExecutor>,
        links: Arc<dyn LinkOps>,
        source_netns_url: impl Into<String>,
    ) -> Self {
        let migrator = Migrator::new(Arc::clone(&executor), Arc::clone(&links));
        Self {
            executor,
            links,
            migrator,
            source_netns_url: source_netns_url.into(),
        }
    }

    /// Number of connections currently holding the VF `key` (`pf/index`).
    #[must_use]
    pub fn holders(&self, key: &str) -> usize {
        self.migrator.count(key)
    }

    fn create(&self, vf: &VfConfig) -> Result<()> {
        self.executor
            .run_in(&vf.source_netns_url, || self.links.create_vf(vf))
    }

    fn destroy(&self, vf: &VfConfig) -> Result<()> {
        self.executor
            .run_in(&vf.source_netns_url, || self.links.destroy_vf(vf))
    }

    fn set_hw_address(&self, conn: &Connection) -> Result<()> {
        let mechanism = &conn.mechanism;
        let Some(mac) = mechanism.hw_address else {
            return Ok(());
        };
        self.executor.run_in(&mechanism.netns_url, || {
            self.links.set_hw_address(&mechanism.interface_name, mac)
        })?;
        tracing::debug!(id = %conn.id, %mac, "hardware address set");
        Ok(())
    }

    /// Takes a reference on the VF, creating and placing it if unused.
    ///
    /// A VF created here is cleared again if placing it fails. That happens
    /// under the VF's reference-count lock, before any sibling can take it.
    fn establish(&self, vf: &VfConfig) -> Result<()> {
        let _ = self.migrator.inject_with(
            &vf.placement(),
            || self.create(vf),
            || self.destroy(vf),
        )?;
        Ok(())
    }

    fn release(&self, conn: &mut Connection) -> Result<()> {
        let Some(vf) = VfConfig::load(conn, &self.source_netns_url) else {
            return Ok(());
        };
        if !vf.established {
            return Ok(());
        }
        let released = self.migrator.eject_with(&vf.placement(), || {
            if let Err(e) = self.destroy(&vf) {
                tracing::error!(vf = %vf.key(), error = %e, "VF cleanup failed");
            }
            Ok(())
        });
        conn.mechanism.established = false;
        let remaining = released?;
        tracing::info!(id = %conn.id, vf = %vf.key(), remaining, "VF released");
        Ok(())
    }
}

impl Element for VfEthernet {
    fn name(&self) -> &'static str {
        "vf-ethernet"
    }

    fn request(&self, ctx: &Context, conn: Connection, next: Next<'_>) -> Result<Connection> {
        let mut conn = next.request(ctx, conn)?;
        if !conn.mechanism.is_kernel() {
            return Ok(conn);
        }
        match VfConfig::load(&conn, &self.source_netns_url) {
            Some(vf) if vf.established => {
                tracing::debug!(id = %conn.id, vf = %vf.key(), "VF already established");
            }
            Some(vf) => {
                if let Err(cause) = self.establish(&vf) {
                    return Err(rollback(self.name(), ctx, &mut conn, next, cause, |_| Ok(())));
                }
                conn.mechanism.established = true;
                tracing::info!(
                    id = %conn.id,
                    vf = %vf.key(),
                    netns = %vf.target_netns_url,
                    "VF established"
                );
            }
            None => {
                if let Err(cause) = self.set_hw_address(&conn) {
                    return Err(rollback(self.name(), ctx, &mut conn, next, cause, |_| Ok(())));
                }
            }
        }
        Ok(conn)
    }

    fn close(&self, ctx: &Context, conn: &mut Connection, next: Next<'_>) -> Result<()> {
        let local = self.release(conn);
        if let Err(e) = &local {
            tracing::error!(id = %conn.id, error = %e, "VF release failed");
        }
        finish_close(local, next.close(ctx, conn))
    }
}
