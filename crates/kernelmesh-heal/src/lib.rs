//! # kernelmesh-heal
//!
//! Data-plane liveness checks for kernel connections.
//!
//! Provides two entry points:
//! - [`LivenessChecker`](checker::LivenessChecker): probes every address pair
//!   of a connection concurrently and returns one verdict within a deadline.
//! - [`PingerFactory`](pinger::PingerFactory): the pluggable echo probe, with
//!   [`SystemPingerFactory`](pinger::SystemPingerFactory) running `ping`.
//!
//! # Example
//!
//! ```rust,no_run
//! use kernelmesh_common::context::Context;
//! use kernelmesh_common::types::{Connection, Mechanism};
//! use kernelmesh_heal::checker::LivenessChecker;
//!
//! # async fn run() {
//! let mut conn = Connection::new(Mechanism::kernel("nsm-1", "file:///var/run/netns/pod"));
//! conn.context.ip_context.src_ip_addrs = vec!["172.16.0.1/32".into()];
//! conn.context.ip_context.dst_ip_addrs = vec!["172.16.0.2/32".into()];
//!
//! let alive = LivenessChecker::builder()
//!     .packet_count(2)
//!     .build()
//!     .check(&Context::new(), &conn)
//!     .await;
//! # let _ = alive;
//! # }
//! ```

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod checker;
pub mod pinger;
