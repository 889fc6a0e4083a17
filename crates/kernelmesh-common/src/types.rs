//! Connection descriptor types used across the kernelmesh workspace.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{KernelmeshError, Result};

/// Unique identifier for a service connection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId(String);

impl ConnectionId {
    /// Creates a new connection ID from a string value.
    #[must_use]
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generates a random connection ID.
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    /// Returns the inner string representation.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ethernet hardware address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; 6]);

impl MacAddress {
    /// Creates an address from raw octets.
    #[must_use]
    pub const fn new(octets: [u8; 6]) -> Self {
        Self(octets)
    }

    /// Returns the raw octets.
    #[must_use]
    pub const fn octets(&self) -> [u8; 6] {
        self.0
    }

    /// The all-zero address, used to clear a VF's programmed MAC.
    #[must_use]
    pub const fn zero() -> Self {
        Self([0; 6])
    }
}

impl FromStr for MacAddress {
    type Err = KernelmeshError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || KernelmeshError::Config {
            message: format!("invalid hardware address: {s}"),
        };
        let mut octets = [0u8; 6];
        let mut parts = s.split(':');
        for octet in &mut octets {
            let part = parts.next().ok_or_else(invalid)?;
            if part.len() != 2 {
                return Err(invalid());
            }
            *octet = u8::from_str_radix(part, 16).map_err(|_| invalid())?;
        }
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Self(octets))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = KernelmeshError;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> Self {
        mac.to_string()
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

/// Transport type of a connection mechanism.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MechanismKind {
    /// Kernel network interface.
    Kernel,
    /// Any other mechanism, identified by its type name.
    Other(String),
}

impl fmt::Display for MechanismKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Kernel => write!(f, "KERNEL"),
            Self::Other(name) => write!(f, "{name}"),
        }
    }
}

/// Virtual function backing a kernel interface.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfBinding {
    /// Name of the physical function netdev in the forwarder namespace.
    pub pf_interface_name: String,
    /// Index of the virtual function on its physical function.
    pub vf_index: u32,
    /// Name of the VF netdev in the forwarder namespace.
    pub vf_interface_name: String,
}

/// Mechanism half of a connection descriptor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mechanism {
    /// Transport type.
    pub kind: MechanismKind,
    /// Name of the kernel interface inside the target namespace.
    pub interface_name: String,
    /// URL of the target namespace.
    pub netns_url: String,
    /// Whether route-local-net must be enabled on the interface.
    #[serde(default)]
    pub route_local_net: bool,
    /// Virtual function backing the interface, if any.
    #[serde(default)]
    pub vf: Option<VfBinding>,
    /// Hardware address to program on the interface.
    #[serde(default)]
    pub hw_address: Option<MacAddress>,
    /// Set once the interface has been placed in the target namespace.
    #[serde(default)]
    pub established: bool,
}

impl Mechanism {
    /// Creates a kernel mechanism for `interface_name` in the namespace at `netns_url`.
    #[must_use]
    pub fn kernel(interface_name: impl Into<String>, netns_url: impl Into<String>) -> Self {
        Self {
            kind: MechanismKind::Kernel,
            interface_name: interface_name.into(),
            netns_url: netns_url.into(),
            route_local_net: false,
            vf: None,
            hw_address: None,
            established: false,
        }
    }

    /// Returns `true` for kernel interface mechanisms.
    #[must_use]
    pub fn is_kernel(&self) -> bool {
        self.kind == MechanismKind::Kernel
    }
}

/// A route to install alongside an address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Destination prefix in CIDR notation.
    pub prefix: String,
    /// Optional next hop address.
    #[serde(default)]
    pub next_hop: Option<String>,
}

/// IP addressing facts of a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpContext {
    /// Source addresses in CIDR notation.
    #[serde(default)]
    pub src_ip_addrs: Vec<String>,
    /// Destination addresses in CIDR notation.
    #[serde(default)]
    pub dst_ip_addrs: Vec<String>,
    /// Routes reachable via the source side.
    #[serde(default)]
    pub src_routes: Vec<Route>,
    /// Routes reachable via the destination side.
    #[serde(default)]
    pub dst_routes: Vec<Route>,
}

/// Context half of a connection descriptor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionContext {
    /// Addressing facts.
    #[serde(default)]
    pub ip_context: IpContext,
    /// Interface MTU, `0` when unset.
    #[serde(default)]
    pub mtu: u32,
}

/// Descriptor of one service connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    /// Connection identifier.
    pub id: ConnectionId,
    /// How the connection is plumbed into the kernel.
    pub mechanism: Mechanism,
    /// Addressing facts.
    #[serde(default)]
    pub context: ConnectionContext,
}

impl Connection {
    /// Creates a connection with a generated id and an empty context.
    #[must_use]
    pub fn new(mechanism: Mechanism) -> Self {
        Self {
            id: ConnectionId::generate(),
            mechanism,
            context: ConnectionContext::default(),
        }
    }
}

/// Parses the address part of a CIDR string such as `10.0.0.1/32`.
///
/// A bare address without prefix length is accepted too.
///
/// # Errors
///
/// Returns an error if the address or prefix length is malformed.
pub fn parse_ip_net(cidr: &str) -> Result<IpAddr> {
    let invalid = || KernelmeshError::Config {
        message: format!("invalid IP network: {cidr}"),
    };
    let (addr, prefix) = match cidr.split_once('/') {
        Some((addr, prefix)) => (addr, Some(prefix)),
        None => (cidr, None),
    };
    let ip: IpAddr = addr.trim().parse().map_err(|_| invalid())?;
    if let Some(prefix) = prefix {
        let len: u8 = prefix.trim().parse().map_err(|_| invalid())?;
        let max = if ip.is_ipv4() { 32 } else { 128 };
        if len > max {
            return Err(invalid());
        }
    }
    Ok(ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parses_and_displays_lowercase() {
        let mac: MacAddress = "0A:1b:2C:3d:4E:5f".parse().expect("valid mac");
        assert_eq!(mac.octets(), [0x0a, 0x1b, 0x2c, 0x3d, 0x4e, 0x5f]);
        assert_eq!(mac.to_string(), "0a:1b:2c:3d:4e:5f");
    }

    #[test]
    fn mac_rejects_short_and_long_input() {
        assert!("0a:1b:2c:3d:4e".parse::<MacAddress>().is_err());
        assert!("0a:1b:2c:3d:4e:5f:60".parse::<MacAddress>().is_err());
        assert!("0a:1b:2c:3d:4e:zz".parse::<MacAddress>().is_err());
    }

    #[test]
    fn parse_ip_net_accepts_cidr_and_bare() {
        assert_eq!(
            parse_ip_net("10.0.0.1/32").expect("v4"),
            "10.0.0.1".parse::<IpAddr>().expect("ip")
        );
        assert!(parse_ip_net("fd00::1/128").expect("v6").is_ipv6());
        assert!(parse_ip_net("172.16.0.9").expect("bare").is_ipv4());
    }

    #[test]
    fn parse_ip_net_rejects_bad_prefix() {
        assert!(parse_ip_net("10.0.0.1/33").is_err());
        assert!(parse_ip_net("10.0.0.1/x").is_err());
        assert!(parse_ip_net("not-an-ip/24").is_err());
    }

    #[test]
    fn kernel_mechanism_defaults() {
        let m = Mechanism::kernel("nsm-1", "file:///var/run/netns/pod");
        assert!(m.is_kernel());
        assert!(!m.route_local_net);
        assert!(!m.established);
        assert!(m.vf.is_none());
    }

    #[test]
    fn connection_deserializes_with_sparse_fields() {
        let json = r#"{
            "id": "conn-1",
            "mechanism": {
                "kind": "Kernel",
                "interface_name": "nsm-1",
                "netns_url": "file:///var/run/netns/pod",
                "hw_address": "02:00:00:00:00:01"
            }
        }"#;
        let conn: Connection = serde_json::from_str(json).expect("should deserialize");
        assert_eq!(conn.id.as_str(), "conn-1");
        assert_eq!(
            conn.mechanism.hw_address,
            Some(MacAddress::new([2, 0, 0, 0, 0, 1]))
        );
        assert!(conn.context.ip_context.src_ip_addrs.is_empty());
    }
}
