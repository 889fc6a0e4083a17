//! # kernelmesh-core
//!
//! Kernel-facing primitives for the kernelmesh forwarder.
//!
//! This crate provides safe abstractions over:
//! - **Namespaces**: handles, switching, and the namespace-scoped executor
//!   that pins every switched section to its own OS thread.
//! - **Sysctl**: writes to the `/proc/sys` pseudo-filesystem.
//! - **Links**: hardware addresses, VF programming, and moving links
//!   between namespaces.
//! - **Migration**: reference-counted placement of shared interfaces.
//!
//! Each kernel boundary is a trait so that pipeline stages can be exercised
//! against the doubles in [`testing`].

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod link;
pub mod migrate;
pub mod namespace;
pub mod sysctl;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod vf;
