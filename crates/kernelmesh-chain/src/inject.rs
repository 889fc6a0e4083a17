//! Placement of plain kernel interfaces into the target namespace.
//!
//! VF-backed interfaces are placed by [`VfEthernet`](crate::ethernet::VfEthernet)
//! together with their VF programming and are left alone here.

use std::sync::Arc;

use kernelmesh_common::context::Context;
use kernelmesh_common::error::Result;
use kernelmesh_common::types::Connection;
use kernelmesh_core::link::LinkOps;
use kernelmesh_core::migrate::{Migrator, Placement};
use kernelmesh_core::namespace::executor::NsExecutor;

use crate::element::{Element, Next, finish_close, rollback};

/// Moves the connection interface in on Request and back on Close.
pub struct Inject {
    migrator: Migrator,
    source_netns_url: String,
}

impl Inject {
    /// Creates the stage. Interfaces live in `source_netns_url` while unused.
    #[must_use]
    pub fn new(
        executor: Arc<NsExecutor>,
        links: Arc<dyn LinkOps>,
        source_netns_url: impl Into<String>,
    ) -> Self {
        Self {
            migrator: Migrator::new(executor, links),
            source_netns_url: source_netns_url.into(),
        }
    }

    /// Number of connections currently holding the interface `key`.
    #[must_use]
    pub fn holders(&self, key: &str) -> usize {
        self.migrator.count(key)
    }

    fn handles(conn: &Connection) -> bool {
        conn.mechanism.is_kernel() && conn.mechanism.vf.is_none()
    }
}

impl Element for Inject {
    fn name(&self) -> &'static str {
        "inject"
    }

    fn request(&self, ctx: &Context, conn: Connection, next: Next<'_>) -> Result<Connection> {
        let mut conn = next.request(ctx, conn)?;
        if !Self::handles(&conn) || conn.mechanism.established {
            return Ok(conn);
        }
        let placement = Placement::for_connection(&conn, &self.source_netns_url);
        if let Err(cause) = self.migrator.inject(&placement) {
            return Err(rollback(self.name(), ctx, &mut conn, next, cause, |_| Ok(())));
        }
        conn.mechanism.established = true;
        Ok(conn)
    }

    fn close(&self, ctx: &Context, conn: &mut Connection, next: Next<'_>) -> Result<()> {
        let local = if Self::handles(conn) && conn.mechanism.established {
            let placement = Placement::for_connection(conn, &self.source_netns_url);
            conn.mechanism.established = false;
            self.migrator.eject(&placement).map(|_| ())
        } else {
            Ok(())
        };
        if let Err(e) = &local {
            tracing::error!(id = %conn.id, error = %e, "failed to return interface");
        }
        finish_close(local, next.close(ctx, conn))
    }
}
