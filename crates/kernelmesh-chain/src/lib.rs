//! # kernelmesh-chain
//!
//! Rollback-safe pipeline of kernel configuration stages.
//!
//! - [`Element`](element::Element), [`Next`](element::Next), and
//!   [`Chain`](element::Chain): the two-phase Request/Close contract and its
//!   composition.
//! - [`VfEthernet`](ethernet::VfEthernet): VF lifecycle and hardware addresses.
//! - [`Inject`](inject::Inject): placement of plain kernel interfaces.
//! - [`route_local_net`]: route-local-net marking and the kernel
//!   connection-context stages.
//! - [`client`]: production assembly from a
//!   [`ForwarderConfig`](kernelmesh_common::config::ForwarderConfig).

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod client;
pub mod element;
pub mod ethernet;
pub mod inject;
pub mod route_local_net;
