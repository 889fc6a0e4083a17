//! Route-local-net stages.
//!
//! `route_localnet` lets the kernel route to 127.0.0.0/8 over a regular
//! interface. The server side marks the mechanism, and the kernel
//! connection-context stage applies the mark inside the target namespace.

use std::sync::Arc;

use kernelmesh_common::constants::route_localnet_path;
use kernelmesh_common::context::Context;
use kernelmesh_common::error::Result;
use kernelmesh_common::types::Connection;
use kernelmesh_core::namespace::executor::NsExecutor;
use kernelmesh_core::sysctl::KernelFs;

use crate::element::{Chain, Element, Next, rollback};

/// Marks kernel mechanisms so that [`RouteLocalNet`] enables the switch.
#[derive(Debug, Default, Clone, Copy)]
pub struct SetRouteLocalNet;

impl Element for SetRouteLocalNet {
    fn name(&self) -> &'static str {
        "set-route-local-net"
    }

    fn request(&self, ctx: &Context, mut conn: Connection, next: Next<'_>) -> Result<Connection> {
        if conn.mechanism.is_kernel() {
            conn.mechanism.route_local_net = true;
        }
        next.request(ctx, conn)
    }

    fn close(&self, ctx: &Context, conn: &mut Connection, next: Next<'_>) -> Result<()> {
        next.close(ctx, conn)
    }
}

/// Enables `route_localnet` on the connection interface when requested.
pub struct RouteLocalNet {
    executor: Arc<NsExecutor>,
    fs: Arc<dyn KernelFs>,
}

impl RouteLocalNet {
    /// Creates the stage over a namespace executor and a sysctl writer.
    #[must_use]
    pub fn new(executor: Arc<NsExecutor>, fs: Arc<dyn KernelFs>) -> Self {
        Self { executor, fs }
    }

    fn enable(&self, conn: &Connection) -> Result<()> {
        let mechanism = &conn.mechanism;
        let path = route_localnet_path(&mechanism.interface_name);
        self.executor
            .run_in(&mechanism.netns_url, || self.fs.write_sysctl(&path, "1"))?;
        tracing::info!(
            id = %conn.id,
            interface = %mechanism.interface_name,
            "route_localnet enabled"
        );
        Ok(())
    }
}

impl Element for RouteLocalNet {
    fn name(&self) -> &'static str {
        "route-local-net"
    }

    fn request(&self, ctx: &Context, conn: Connection, next: Next<'_>) -> Result<Connection> {
        let mut conn = next.request(ctx, conn)?;
        if conn.mechanism.is_kernel() && conn.mechanism.route_local_net {
            if let Err(cause) = self.enable(&conn) {
                return Err(rollback(self.name(), ctx, &mut conn, next, cause, |_| Ok(())));
            }
        }
        Ok(conn)
    }

    fn close(&self, ctx: &Context, conn: &mut Connection, next: Next<'_>) -> Result<()> {
        next.close(ctx, conn)
    }
}

/// Kernel per-property stages, applied once the interface is in place.
#[must_use]
pub fn connection_context_kernel(executor: Arc<NsExecutor>, fs: Arc<dyn KernelFs>) -> Chain {
    Chain::new(vec![Arc::new(RouteLocalNet::new(executor, fs))])
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernelmesh_common::error::KernelmeshError;
    use kernelmesh_common::types::{Mechanism, MechanismKind};
    use kernelmesh_core::namespace::NetnsSwitcher;
    use kernelmesh_core::testing::{FakeNetns, FsWrite, RecordingFs};

    const POD: &str = "file:///var/run/netns/pod";

    fn stage(fs: &Arc<RecordingFs>) -> RouteLocalNet {
        let netns: Arc<dyn NetnsSwitcher> = Arc::new(FakeNetns::new());
        RouteLocalNet::new(
            Arc::new(NsExecutor::new(netns)),
            Arc::clone(fs) as Arc<dyn KernelFs>,
        )
    }

    #[test]
    fn flag_unset_writes_nothing() {
        let fs = Arc::new(RecordingFs::new());
        let chain = Chain::new(vec![Arc::new(stage(&fs))]);

        let _ = chain
            .apply(&Context::new(), Connection::new(Mechanism::kernel("nsm-1", POD)))
            .expect("request");

        assert!(fs.writes().is_empty());
    }

    #[test]
    fn flag_set_writes_one_inside_target_namespace() {
        let fs = Arc::new(RecordingFs::new());
        let chain = Chain::new(vec![Arc::new(SetRouteLocalNet), Arc::new(stage(&fs))]);

        let conn = chain
            .apply(&Context::new(), Connection::new(Mechanism::kernel("nsm-1", POD)))
            .expect("request");

        assert!(conn.mechanism.route_local_net);
        assert_eq!(
            fs.writes(),
            vec![FsWrite {
                path: "net/ipv4/conf/nsm-1/route_localnet".into(),
                value: "1".into(),
                netns: POD.into(),
            }]
        );
    }

    #[test]
    fn setter_ignores_other_mechanisms() {
        let fs = Arc::new(RecordingFs::new());
        let chain = Chain::new(vec![Arc::new(SetRouteLocalNet), Arc::new(stage(&fs))]);
        let mut mechanism = Mechanism::kernel("memif0", POD);
        mechanism.kind = MechanismKind::Other("MEMIF".into());

        let conn = chain
            .apply(&Context::new(), Connection::new(mechanism))
            .expect("request");

        assert!(!conn.mechanism.route_local_net);
        assert!(fs.writes().is_empty());
    }

    #[test]
    fn write_failure_surfaces_configuration_error() {
        let fs = Arc::new(RecordingFs::new());
        fs.set_failing(true);
        let mut mechanism = Mechanism::kernel("nsm-1", POD);
        mechanism.route_local_net = true;

        let err = Chain::new(vec![Arc::new(stage(&fs))])
            .apply(&Context::new(), Connection::new(mechanism))
            .unwrap_err();

        assert!(matches!(err, KernelmeshError::Configuration { ref target, .. }
            if target.ends_with("route_localnet")));
    }

    #[test]
    fn composite_contains_route_local_net() {
        let fs = Arc::new(RecordingFs::new());
        let netns: Arc<dyn NetnsSwitcher> = Arc::new(FakeNetns::new());
        let composite = connection_context_kernel(
            Arc::new(NsExecutor::new(netns)),
            Arc::clone(&fs) as Arc<dyn KernelFs>,
        );
        let mut mechanism = Mechanism::kernel("nsm-2", POD);
        mechanism.route_local_net = true;

        let _ = composite
            .apply(&Context::new(), Connection::new(mechanism))
            .expect("request");

        assert_eq!(composite.len(), 1);
        assert_eq!(fs.writes().len(), 1);
    }
}
