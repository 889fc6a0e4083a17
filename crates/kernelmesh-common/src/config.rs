//! Configuration model for the kernel forwarder components.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::constants;

/// Root configuration for the kernel forwarder components.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Mount point of the sysctl pseudo-filesystem.
    pub proc_sys_root: PathBuf,
    /// URL of the namespace interfaces are moved out of and back into.
    pub forwarder_netns_url: String,
    /// Liveness check settings.
    pub liveness: LivenessSettings,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            proc_sys_root: PathBuf::from(constants::DEFAULT_PROC_SYS_ROOT),
            forwarder_netns_url: constants::FORWARDER_NETNS_URL.to_string(),
            liveness: LivenessSettings::default(),
        }
    }
}

/// Settings for the liveness checker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LivenessSettings {
    /// Timeout in milliseconds used when the caller sets no deadline.
    pub default_timeout_ms: u64,
    /// Echo requests per address pair.
    pub packet_count: usize,
    /// Milliseconds the aggregator waits past the deadline.
    pub grace_ms: u64,
    /// ping binary name or path.
    pub ping_binary: String,
}

impl LivenessSettings {
    /// Default timeout as a [`Duration`].
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    /// Grace period as a [`Duration`].
    #[must_use]
    pub const fn grace(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }
}

impl Default for LivenessSettings {
    #[allow(clippy::cast_possible_truncation)]
    fn default() -> Self {
        Self {
            default_timeout_ms: constants::DEFAULT_LIVENESS_TIMEOUT.as_millis() as u64,
            packet_count: constants::LIVENESS_PACKET_COUNT,
            grace_ms: constants::LIVENESS_GRACE.as_millis() as u64,
            ping_binary: constants::PING_BINARY.to_string(),
        }
    }
}
