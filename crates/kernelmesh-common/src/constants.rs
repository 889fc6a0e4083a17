//! System-wide constants and default paths.

use std::time::Duration;

/// Mount point of the sysctl pseudo-filesystem.
pub const DEFAULT_PROC_SYS_ROOT: &str = "/proc/sys";

/// URL of the forwarder's own network namespace.
///
/// `/proc/self` resolves to the thread-group leader, so this names the
/// process namespace even when read from a namespace-switched thread.
pub const FORWARDER_NETNS_URL: &str = "file:///proc/self/ns/net";

/// Path of the calling thread's network namespace.
pub const THREAD_NETNS_PATH: &str = "/proc/thread-self/ns/net";

/// URL scheme accepted for namespace references.
pub const FILE_URL_SCHEME: &str = "file://";

/// Name of the ping binary used by the default liveness prober.
pub const PING_BINARY: &str = "ping";

/// Timeout applied to a liveness check when the caller sets no deadline.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(1);

/// Echo requests sent per address pair during a liveness check.
pub const LIVENESS_PACKET_COUNT: usize = 4;

/// Extra time the liveness aggregator waits past the deadline for late probes.
pub const LIVENESS_GRACE: Duration = Duration::from_millis(500);

/// Sysctl path, relative to the sysctl root, of an interface's route-local-net switch.
#[must_use]
pub fn route_localnet_path(interface: &str) -> String {
    format!("net/ipv4/conf/{interface}/route_localnet")
}
