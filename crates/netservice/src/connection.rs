use std::net::IpAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Longest interface name the kernel accepts (`IFNAMSIZ` minus the NUL).
pub const MAX_INTERFACE_NAME_LEN: usize = 15;

/// Prefix used when a mechanism does not name its interface.
const DEFAULT_INTERFACE_PREFIX: &str = "nsm-";

/// One point-to-point path being established or torn down.
///
/// The kernel elements only read the mechanism and context; anything they
/// need to remember between Request and Close is kept on their side, keyed
/// by `id`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: String,
    #[serde(default)]
    pub mechanism: Option<Mechanism>,
    #[serde(default)]
    pub context: ConnectionContext,
}

impl Connection {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    /// The kernel mechanism, when this connection is realized by one.
    pub fn kernel(&self) -> Option<&KernelMechanism> {
        match &self.mechanism {
            Some(Mechanism::Kernel(kernel)) => Some(kernel),
            _ => None,
        }
    }

    /// The kernel mechanism of a connection that is not a VLAN
    /// sub-interface. IP configuration is skipped for VLAN-tagged links.
    pub fn untagged_kernel(&self) -> Option<&KernelMechanism> {
        self.kernel().filter(|kernel| kernel.vlan == 0)
    }

    pub fn ip_context(&self) -> &IpContext {
        &self.context.ip_context
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Mechanism {
    Kernel(KernelMechanism),
    Vlan(VlanMechanism),
    Other { name: String },
}

/// Parameters of a kernel interface living in some network namespace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KernelMechanism {
    /// `file://` URL of the namespace, e.g. `file:///proc/1234/ns/net`.
    pub netns_url: String,
    #[serde(default)]
    pub interface_name: String,
    #[serde(default)]
    pub vlan: u32,
    #[serde(default)]
    pub route_localnet: bool,
    #[serde(default)]
    pub vf: Option<VfConfig>,
}

impl KernelMechanism {
    /// Interface name inside the target namespace, cut to what the kernel
    /// accepts. An unnamed mechanism falls back to `nsm-<connection id>`.
    pub fn interface_name(&self, conn_id: &str) -> String {
        if self.interface_name.is_empty() {
            truncate_interface_name(&format!("{DEFAULT_INTERFACE_PREFIX}{conn_id}"))
        } else {
            truncate_interface_name(&self.interface_name)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VlanMechanism {
    pub vlan_id: u32,
    #[serde(default)]
    pub via: String,
}

/// Virtual function handed to a connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VfConfig {
    pub pf_interface_name: String,
    pub vf_interface_name: String,
    #[serde(default)]
    pub pci_address: Option<String>,
    #[serde(default)]
    pub vf_num: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionContext {
    #[serde(default)]
    pub ip_context: IpContext,
    #[serde(default)]
    pub mtu: u32,
}

/// Desired IP state of a connection. Values are kept as the control plane
/// sent them and parsed by the element that applies them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IpContext {
    pub src_ip_addrs: Vec<String>,
    pub dst_ip_addrs: Vec<String>,
    pub src_routes: Vec<Route>,
    pub dst_routes: Vec<Route>,
    pub ip_neighbors: Vec<IpNeighbor>,
    pub policies: Vec<PolicyRoute>,
}

impl IpContext {
    /// Host routes towards every source address.
    pub fn src_ip_routes(&self) -> Vec<Route> {
        host_routes(&self.src_ip_addrs)
    }

    /// Host routes towards every destination address.
    pub fn dst_ip_routes(&self) -> Vec<Route> {
        host_routes(&self.dst_ip_addrs)
    }

    pub fn src_routes_with_explicit_next_hop(&self) -> Vec<Route> {
        with_next_hop(&self.src_routes)
    }

    pub fn dst_routes_with_explicit_next_hop(&self) -> Vec<Route> {
        with_next_hop(&self.dst_routes)
    }
}

fn host_routes(addrs: &[String]) -> Vec<Route> {
    addrs
        .iter()
        .map(|addr| Route {
            prefix: addr.clone(),
            next_hop: None,
        })
        .collect()
}

fn with_next_hop(routes: &[Route]) -> Vec<Route> {
    routes
        .iter()
        .filter(|route| route.next_hop.as_deref().is_some_and(|hop| !hop.is_empty()))
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    pub prefix: String,
    #[serde(default)]
    pub next_hop: Option<String>,
}

impl Route {
    /// Destination network, masked to its prefix length.
    pub fn prefix_net(&self) -> Result<IpNet> {
        parse_net("route prefix", &self.prefix).map(|net| net.trunc())
    }

    pub fn next_hop_addr(&self) -> Result<Option<IpAddr>> {
        match self.next_hop.as_deref() {
            None | Some("") => Ok(None),
            Some(hop) => hop
                .parse()
                .map(Some)
                .map_err(|e| Error::parse("next hop", hop, e)),
        }
    }
}

/// A routing-table selector plus the routes of the table it selects.
///
/// Identity is the selector alone (`from`, `proto`, `dst_port`,
/// `src_port`). Two policies with the same selector and different routes
/// are the same policy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyRoute {
    pub from: String,
    pub proto: String,
    pub dst_port: String,
    pub src_port: String,
    pub routes: Vec<Route>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpNeighbor {
    pub ip: String,
    pub hardware_address: String,
}

/// Parse an address with or without a prefix length. A bare address is a
/// host network (`/32` or `/128`).
pub fn parse_net(what: &'static str, value: &str) -> Result<IpNet> {
    if value.contains('/') {
        return value.parse().map_err(|e| Error::parse(what, value, e));
    }
    value
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|e| Error::parse(what, value, e))
}

/// Cut `name` to at most [`MAX_INTERFACE_NAME_LEN`] bytes on a character
/// boundary.
pub fn truncate_interface_name(name: &str) -> String {
    let mut end = 0;
    for (idx, ch) in name.char_indices() {
        if idx + ch.len_utf8() > MAX_INTERFACE_NAME_LEN {
            break;
        }
        end = idx + ch.len_utf8();
    }
    name.get(..end).unwrap_or_default().to_string()
}
