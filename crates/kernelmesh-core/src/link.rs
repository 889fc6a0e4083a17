//! Link-level kernel operations.
//!
//! Every call acts on the network namespace of the calling thread; callers
//! run them inside [`NsExecutor`](crate::namespace::executor::NsExecutor)
//! sections. The production implementation speaks rtnetlink over a socket
//! opened on the calling thread, so the socket belongs to that namespace.

use kernelmesh_common::error::Result;
use kernelmesh_common::types::MacAddress;

use crate::namespace::NsHandle;
use crate::vf::VfConfig;

/// Kernel boundary for link configuration.
pub trait LinkOps: Send + Sync {
    /// Programs `mac` on `link`.
    ///
    /// # Errors
    ///
    /// Returns an error if the link does not exist or rejects the address.
    fn set_hw_address(&self, link: &str, mac: MacAddress) -> Result<()>;

    /// Programs the VF on its PF and brings the VF netdev up.
    ///
    /// # Errors
    ///
    /// Returns an error if the PF refuses the VF configuration.
    fn create_vf(&self, vf: &VfConfig) -> Result<()>;

    /// Clears the VF programming. Succeeds if there is nothing to clear.
    ///
    /// # Errors
    ///
    /// Returns an error if the PF refuses the reset.
    fn destroy_vf(&self, vf: &VfConfig) -> Result<()>;

    /// Renames `link` to `new_name` and moves it into `dest`.
    ///
    /// # Errors
    ///
    /// Returns an error if the link is missing or the move is refused.
    fn move_link(&self, link: &str, new_name: &str, dest: &NsHandle) -> Result<()>;
}

/// Production [`LinkOps`] over rtnetlink.
///
/// Each call drives its requests on a private single-threaded runtime and
/// must not be made from inside an async task. Namespace sections run on
/// plain threads, which satisfies this.
#[derive(Debug, Clone, Copy, Default)]
pub struct Netlink;

impl Netlink {
    /// Creates the netlink link driver.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "linux")]
mod linux {
    use std::future::Future;
    use std::os::fd::{AsFd, AsRawFd};

    use futures::TryStreamExt;
    use rtnetlink::packet_route::link::{LinkAttribute, LinkVfInfo, VfInfo, VfInfoMac};
    use rtnetlink::{Handle, LinkUnspec};

    use kernelmesh_common::error::{KernelmeshError, Result};
    use kernelmesh_common::types::MacAddress;

    use super::{LinkOps, Netlink};
    use crate::namespace::NsHandle;
    use crate::vf::VfConfig;

    fn configuration(target: &str, message: impl std::fmt::Display) -> KernelmeshError {
        KernelmeshError::Configuration {
            target: target.to_string(),
            message: message.to_string(),
        }
    }

    fn vf_error(vf: &VfConfig, err: &KernelmeshError) -> KernelmeshError {
        KernelmeshError::VfLifecycle {
            vf: vf.key(),
            message: err.to_string(),
        }
    }

    /// Runs `requests` against a fresh netlink connection.
    fn with_handle<T, F, Fut>(target: &str, requests: F) -> Result<T>
    where
        F: FnOnce(Handle) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_io()
            .build()
            .map_err(|e| configuration(target, format!("netlink runtime: {e}")))?;
        runtime.block_on(async {
            let (connection, handle, _) = rtnetlink::new_connection()
                .map_err(|e| configuration(target, format!("netlink socket: {e}")))?;
            let driver = tokio::spawn(connection);
            let result = requests(handle).await;
            driver.abort();
            result
        })
    }

    async fn index_of(handle: &Handle, link: &str) -> Result<u32> {
        handle
            .link()
            .get()
            .match_name(link.to_string())
            .execute()
            .try_next()
            .await
            .map_err(|e| configuration(link, e))?
            .map(|msg| msg.header.index)
            .ok_or_else(|| configuration(link, "no such link"))
    }

    async fn set_vf_mac(handle: &Handle, vf: &VfConfig, mac: MacAddress) -> Result<()> {
        let pf = index_of(handle, &vf.pf_interface_name).await?;
        let vf_info = LinkVfInfo(vec![VfInfo::Mac(VfInfoMac::new(
            vf.vf_index,
            &mac.octets(),
        ))]);
        handle
            .link()
            .set(
                LinkUnspec::new_with_index(pf)
                    .append_extra_attribute(LinkAttribute::VfInfoList(vec![vf_info]))
                    .build(),
            )
            .execute()
            .await
            .map_err(|e| configuration(&vf.pf_interface_name, e))
    }

    impl LinkOps for Netlink {
        fn set_hw_address(&self, link: &str, mac: MacAddress) -> Result<()> {
            with_handle(link, |handle| async move {
                let index = index_of(&handle, link).await?;
                handle
                    .link()
                    .set(
                        LinkUnspec::new_with_index(index)
                            .address(mac.octets().to_vec())
                            .build(),
                    )
                    .execute()
                    .await
                    .map_err(|e| configuration(link, e))
            })
        }

        fn create_vf(&self, vf: &VfConfig) -> Result<()> {
            with_handle(&vf.vf_interface_name, |handle| async move {
                if let Some(mac) = vf.hw_address {
                    set_vf_mac(&handle, vf, mac).await?;
                }
                let index = index_of(&handle, &vf.vf_interface_name).await?;
                handle
                    .link()
                    .set(LinkUnspec::new_with_index(index).up().build())
                    .execute()
                    .await
                    .map_err(|e| configuration(&vf.vf_interface_name, e))
            })
            .map_err(|e| vf_error(vf, &e))
        }

        fn destroy_vf(&self, vf: &VfConfig) -> Result<()> {
            if vf.hw_address.is_none() {
                return Ok(());
            }
            with_handle(&vf.pf_interface_name, |handle| async move {
                set_vf_mac(&handle, vf, MacAddress::zero()).await
            })
            .map_err(|e| vf_error(vf, &e))
        }

        fn move_link(&self, link: &str, new_name: &str, dest: &NsHandle) -> Result<()> {
            let dest_fd = dest.as_fd().as_raw_fd();
            with_handle(link, |handle| async move {
                let index = index_of(&handle, link).await?;
                handle
                    .link()
                    .set(LinkUnspec::new_with_index(index).down().build())
                    .execute()
                    .await
                    .map_err(|e| configuration(link, e))?;
                if link != new_name {
                    handle
                        .link()
                        .set(
                            LinkUnspec::new_with_index(index)
                                .name(new_name.to_string())
                                .build(),
                        )
                        .execute()
                        .await
                        .map_err(|e| configuration(link, e))?;
                }
                handle
                    .link()
                    .set(LinkUnspec::new_with_index(index).setns_by_fd(dest_fd).build())
                    .execute()
                    .await
                    .map_err(|e| configuration(new_name, e))
            })?;
            tracing::info!(link, new_name, netns = dest.origin(), "link moved");
            Ok(())
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl LinkOps for Netlink {
    fn set_hw_address(&self, link: &str, _mac: MacAddress) -> Result<()> {
        Err(unsupported(link))
    }

    fn create_vf(&self, vf: &VfConfig) -> Result<()> {
        Err(unsupported(&vf.vf_interface_name))
    }

    fn destroy_vf(&self, vf: &VfConfig) -> Result<()> {
        if vf.hw_address.is_none() {
            return Ok(());
        }
        Err(unsupported(&vf.pf_interface_name))
    }

    fn move_link(&self, link: &str, _new_name: &str, _dest: &NsHandle) -> Result<()> {
        Err(unsupported(link))
    }
}

#[cfg(not(target_os = "linux"))]
fn unsupported(target: &str) -> kernelmesh_common::error::KernelmeshError {
    kernelmesh_common::error::KernelmeshError::Configuration {
        target: target.to_string(),
        message: "rtnetlink requires Linux".into(),
    }
}
