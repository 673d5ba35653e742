//! Namespace-scoped view of the kernel's links, addresses, routes, rules
//! and neighbors.

mod iproute2;
mod parse;

#[cfg(test)]
pub(crate) mod fake;

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use async_trait::async_trait;
use ipnet::IpNet;

pub use iproute2::IpRoute2;

use crate::error::Result;
use crate::netns::Netns;

pub const TABLE_UNSPEC: u32 = 0;
pub const TABLE_DEFAULT: u32 = 253;
pub const TABLE_MAIN: u32 = 254;
pub const TABLE_LOCAL: u32 = 255;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkInfo {
    pub index: u32,
    pub name: String,
    pub mtu: u32,
    pub up: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddrInfo {
    pub net: IpNet,
    /// Duplicate address detection has not finished yet.
    pub tentative: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RouteScope {
    #[default]
    Universe,
    Link,
    Host,
}

impl RouteScope {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Universe => "global",
            Self::Link => "link",
            Self::Host => "host",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSpec {
    /// Destination. A default route is `0.0.0.0/0` or `::/0`.
    pub dst: IpNet,
    pub gateway: Option<IpAddr>,
    pub link: Option<String>,
    pub table: u32,
    pub scope: RouteScope,
    pub onlink: bool,
}

impl RouteSpec {
    pub fn new(dst: IpNet, table: u32) -> Self {
        Self {
            dst,
            gateway: None,
            link: None,
            table,
            scope: RouteScope::Universe,
            onlink: false,
        }
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.dst, IpNet::V6(_))
    }
}

/// Inclusive transport port range of a rule selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortRange {
    pub start: u16,
    pub end: u16,
}

impl PortRange {
    pub fn single(port: u16) -> Self {
        Self {
            start: port,
            end: port,
        }
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.start == self.end {
            write!(f, "{}", self.start)
        } else {
            write!(f, "{}-{}", self.start, self.end)
        }
    }
}

impl FromStr for PortRange {
    type Err = String;

    /// Accepts `"443"` or `"1000-2000"`.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parse_port = |p: &str| {
            p.trim()
                .parse::<u16>()
                .map_err(|e| format!("invalid port {p:?}: {e}"))
        };
        let range = match s.split_once('-') {
            Some((start, end)) => Self {
                start: parse_port(start)?,
                end: parse_port(end)?,
            },
            None => Self::single(parse_port(s)?),
        };
        if range.start > range.end {
            return Err(format!(
                "range start {} is greater than end {}",
                range.start, range.end
            ));
        }
        Ok(range)
    }
}

/// A policy-routing rule. Selectors left as `None` match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleSpec {
    /// Set on rules read back from the kernel.
    pub priority: Option<u32>,
    pub src: Option<IpNet>,
    pub ipproto: Option<u8>,
    pub dport: Option<PortRange>,
    pub sport: Option<PortRange>,
    pub table: u32,
}

impl RuleSpec {
    /// Same selector, whatever table the rule points at.
    pub fn same_selector(&self, other: &RuleSpec) -> bool {
        self.src == other.src
            && self.ipproto == other.ipproto
            && self.dport == other.dport
            && self.sport == other.sport
    }

    pub fn is_ipv6(&self) -> bool {
        matches!(self.src, Some(IpNet::V6(_)))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MacAddr(pub [u8; 6]);

impl FromStr for MacAddr {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let mut bytes = [0u8; 6];
        let mut parts = s.split([':', '-']);
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or("too few octets")?;
            if part.len() != 2 {
                return Err(format!("invalid octet {part:?}"));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|e| format!("invalid octet {part:?}: {e}"))?;
        }
        if parts.next().is_some() {
            return Err("too many octets".into());
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [a, b, c, d, e, g] = self.0;
        write!(f, "{a:02x}:{b:02x}:{c:02x}:{d:02x}:{e:02x}:{g:02x}")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NeighborSpec {
    pub ip: IpAddr,
    pub lladdr: MacAddr,
}

/// Kernel network API bound to one namespace per call.
///
/// Every call re-resolves links by name: indices change when a link moves
/// between namespaces.
#[async_trait]
pub trait KernelOps: Send + Sync {
    // -- links --
    async fn link_by_name(&self, ns: &Netns, name: &str) -> Result<LinkInfo>;
    async fn link_set_up(&self, ns: &Netns, name: &str) -> Result<()>;
    async fn link_set_mtu(&self, ns: &Netns, name: &str, mtu: u32) -> Result<()>;
    async fn link_rename(&self, ns: &Netns, name: &str, new_name: &str) -> Result<()>;
    async fn link_set_netns(&self, ns: &Netns, name: &str, target: &Netns) -> Result<()>;
    async fn link_delete(&self, ns: &Netns, name: &str) -> Result<()>;
    /// Name of the host interface bound to a PCI function.
    async fn pci_interface_name(&self, pci_address: &str) -> Result<String>;

    // -- addresses --
    async fn addr_list(&self, ns: &Netns, link: &str) -> Result<Vec<AddrInfo>>;
    /// Add or update an address. IPv6 addresses skip duplicate address
    /// detection.
    async fn addr_replace(&self, ns: &Netns, link: &str, addr: IpNet) -> Result<()>;
    async fn addr_delete(&self, ns: &Netns, link: &str, addr: IpNet) -> Result<()>;

    // -- routes and rules --
    /// Routes of one table, or of every table when `table` is `None`.
    async fn route_list(&self, ns: &Netns, table: Option<u32>) -> Result<Vec<RouteSpec>>;
    async fn route_replace(&self, ns: &Netns, route: &RouteSpec) -> Result<()>;
    async fn route_delete(&self, ns: &Netns, route: &RouteSpec) -> Result<()>;
    async fn rule_list(&self, ns: &Netns) -> Result<Vec<RuleSpec>>;
    async fn rule_add(&self, ns: &Netns, rule: &RuleSpec) -> Result<()>;
    async fn rule_delete(&self, ns: &Netns, rule: &RuleSpec) -> Result<()>;

    // -- misc --
    async fn neigh_replace(&self, ns: &Netns, link: &str, neigh: &NeighborSpec) -> Result<()>;
    /// Write `/proc/sys/<key>` as seen from inside `ns`.
    async fn sysctl_write(&self, ns: &Netns, key: &str, value: &str) -> Result<()>;
}
