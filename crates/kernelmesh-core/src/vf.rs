//! Per-connection view of a virtual function.
//!
//! Derived from the connection descriptor on every call; nothing here is
//! persisted between Request and Close.

use kernelmesh_common::types::{Connection, MacAddress};

use crate::migrate::Placement;

/// VF facts needed to create, place, and tear down a VF-backed interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfConfig {
    /// Physical function netdev in the source namespace.
    pub pf_interface_name: String,
    /// Index of the VF on its physical function.
    pub vf_index: u32,
    /// VF netdev name in the source namespace.
    pub vf_interface_name: String,
    /// Name the interface takes in the target namespace.
    pub target_interface_name: String,
    /// Namespace the VF lives in before placement.
    pub source_netns_url: String,
    /// Container namespace the VF is placed into.
    pub target_netns_url: String,
    /// MAC to program on the VF.
    pub hw_address: Option<MacAddress>,
    /// The VF was already placed by a prior stage or call.
    pub established: bool,
}

impl VfConfig {
    /// Derives the VF view of `conn`.
    ///
    /// Returns `None` when the connection is not a VF-backed kernel interface.
    #[must_use]
    pub fn load(conn: &Connection, source_netns_url: &str) -> Option<Self> {
        let mechanism = &conn.mechanism;
        if !mechanism.is_kernel() {
            return None;
        }
        let vf = mechanism.vf.as_ref()?;
        Some(Self {
            pf_interface_name: vf.pf_interface_name.clone(),
            vf_index: vf.vf_index,
            vf_interface_name: vf.vf_interface_name.clone(),
            target_interface_name: mechanism.interface_name.clone(),
            source_netns_url: source_netns_url.to_string(),
            target_netns_url: mechanism.netns_url.clone(),
            hw_address: mechanism.hw_address,
            established: mechanism.established,
        })
    }

    /// Reference-count key identifying the VF across connections.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}/{}", self.pf_interface_name, self.vf_index)
    }

    /// Where the VF netdev moves from and to.
    #[must_use]
    pub fn placement(&self) -> Placement {
        Placement {
            key: self.key(),
            link: self.vf_interface_name.clone(),
            target_name: self.target_interface_name.clone(),
            source_netns_url: self.source_netns_url.clone(),
            target_netns_url: self.target_netns_url.clone(),
        }
    }
}
