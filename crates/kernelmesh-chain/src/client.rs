//! Assembly of the kernel pipelines.

use std::sync::Arc;

use kernelmesh_common::config::ForwarderConfig;
use kernelmesh_core::link::{LinkOps, Netlink};
use kernelmesh_core::namespace::NetnsSwitcher;
use kernelmesh_core::namespace::executor::NsExecutor;
use kernelmesh_core::namespace::network::ProcNetns;
use kernelmesh_core::sysctl::{KernelFs, ProcFs};

use crate::element::{Chain, Element};
use crate::ethernet::VfEthernet;
use crate::inject::Inject;
use crate::route_local_net::{SetRouteLocalNet, connection_context_kernel};

/// Kernel boundaries shared by the stages of one pipeline.
#[derive(Clone)]
pub struct KernelComponents {
    executor: Arc<NsExecutor>,
    fs: Arc<dyn KernelFs>,
    links: Arc<dyn LinkOps>,
    forwarder_netns_url: String,
}

impl KernelComponents {
    /// Bundles explicit kernel boundaries.
    #[must_use]
    pub fn new(
        switcher: Arc<dyn NetnsSwitcher>,
        fs: Arc<dyn KernelFs>,
        links: Arc<dyn LinkOps>,
        forwarder_netns_url: impl Into<String>,
    ) -> Self {
        Self {
            executor: Arc::new(NsExecutor::new(switcher)),
            fs,
            links,
            forwarder_netns_url: forwarder_netns_url.into(),
        }
    }

    /// Production boundaries: `/proc` namespaces, sysctl writes, and rtnetlink.
    #[must_use]
    pub fn from_config(config: &ForwarderConfig) -> Self {
        tracing::info!(
            sysctl = %config.proc_sys_root.display(),
            netns = %config.forwarder_netns_url,
            "kernel components initialised"
        );
        Self::new(
            Arc::new(ProcNetns::new()),
            Arc::new(ProcFs::new(config.proc_sys_root.clone())),
            Arc::new(Netlink::new()),
            config.forwarder_netns_url.clone(),
        )
    }

    /// Shared namespace executor.
    #[must_use]
    pub const fn executor(&self) -> &Arc<NsExecutor> {
        &self.executor
    }

    fn context_kernel(&self) -> Chain {
        connection_context_kernel(Arc::clone(&self.executor), Arc::clone(&self.fs))
    }

    fn vf_ethernet(&self) -> VfEthernet {
        VfEthernet::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.links),
            self.forwarder_netns_url.clone(),
        )
    }

    fn inject(&self) -> Inject {
        Inject::new(
            Arc::clone(&self.executor),
            Arc::clone(&self.links),
            self.forwarder_netns_url.clone(),
        )
    }
}

impl std::fmt::Debug for KernelComponents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KernelComponents")
            .field("forwarder_netns_url", &self.forwarder_netns_url)
            .finish_non_exhaustive()
    }
}

/// Client-side kernel pipeline.
///
/// Plain interfaces are placed first, then the VF stage programs VFs or
/// hardware addresses, then per-property configuration runs in the target
/// namespace. Each call builds fresh stages with their own reference counts.
#[must_use]
pub fn kernel_client(components: &KernelComponents) -> Chain {
    Chain::new(vec![
        Arc::new(components.context_kernel()) as Arc<dyn Element>,
        Arc::new(components.vf_ethernet()),
        Arc::new(components.inject()),
    ])
}

/// Server-side kernel pipeline: [`kernel_client`] plus route-local-net marking.
#[must_use]
pub fn kernel_server(components: &KernelComponents) -> Chain {
    Chain::new(vec![
        Arc::new(SetRouteLocalNet) as Arc<dyn Element>,
        Arc::new(components.context_kernel()),
        Arc::new(components.vf_ethernet()),
        Arc::new(components.inject()),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernelmesh_common::context::Context;
    use kernelmesh_common::types::{Connection, Mechanism};
    use kernelmesh_core::testing::{FakeLinks, FakeNetns, LinkOp, RecordingFs};

    const POD: &str = "file:///var/run/netns/pod";

    fn components(links: &Arc<FakeLinks>, fs: &Arc<RecordingFs>) -> KernelComponents {
        KernelComponents::new(
            Arc::new(FakeNetns::new()),
            Arc::clone(fs) as Arc<dyn KernelFs>,
            Arc::clone(links) as Arc<dyn LinkOps>,
            "file:///proc/self/ns/net",
        )
    }

    #[test]
    fn from_config_assembles_both_pipelines() {
        let components = KernelComponents::from_config(&ForwarderConfig::default());
        assert_eq!(kernel_client(&components).len(), 3);
        assert_eq!(kernel_server(&components).len(), 4);
    }

    #[test]
    fn client_places_plain_interface_without_route_local_net() {
        let links = Arc::new(FakeLinks::new());
        let fs = Arc::new(RecordingFs::new());
        let chain = kernel_client(&components(&links, &fs));

        let conn = chain
            .apply(&Context::new(), Connection::new(Mechanism::kernel("tap0", POD)))
            .expect("request");

        assert!(conn.mechanism.established);
        assert_eq!(links.count(LinkOp::MoveLink), 1);
        assert!(fs.writes().is_empty());
    }

    #[test]
    fn server_enables_route_local_net_after_placement() {
        let links = Arc::new(FakeLinks::new());
        let fs = Arc::new(RecordingFs::new());
        let chain = kernel_server(&components(&links, &fs));

        let conn = chain
            .apply(&Context::new(), Connection::new(Mechanism::kernel("tap0", POD)))
            .expect("request");

        assert!(conn.mechanism.route_local_net);
        let writes = fs.writes();
        assert_eq!(writes.len(), 1);
        assert_eq!(writes[0].netns, POD);
        assert_eq!(chain.len(), 4);
    }
}
