use std::collections::{BTreeMap, HashSet};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;
use netservice::{Error, PolicyRoute, Result};

use super::tables::InstalledPolicy;
use crate::kernel::{PortRange, RouteScope, RouteSpec, RuleSpec};

/// Identity of a policy: its selector fields as the control plane sent
/// them. Routes are not part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PolicyKey {
    pub dst_port: String,
    pub src_port: String,
    pub from: String,
    pub proto: String,
}

impl From<&PolicyRoute> for PolicyKey {
    fn from(policy: &PolicyRoute) -> Self {
        Self {
            dst_port: policy.dst_port.clone(),
            src_port: policy.src_port.clone(),
            from: policy.from.clone(),
            proto: policy.proto.clone(),
        }
    }
}

/// Split desired policies against installed ones.
///
/// Returns the policies to install, in the order they were asked for, and
/// the installed tables whose policy is no longer wanted. Duplicate
/// selectors in `desired` are installed once.
pub fn diff<'a>(
    installed: &BTreeMap<u32, InstalledPolicy>,
    desired: &'a [PolicyRoute],
) -> (Vec<&'a PolicyRoute>, Vec<(u32, InstalledPolicy)>) {
    let mut remaining: BTreeMap<u32, &InstalledPolicy> =
        installed.iter().map(|(table, p)| (*table, p)).collect();
    let mut seen = HashSet::new();
    let mut to_add = Vec::new();

    for policy in desired {
        let key = PolicyKey::from(policy);
        if !seen.insert(key.clone()) {
            continue;
        }
        let existing = remaining
            .iter()
            .find(|(_, p)| PolicyKey::from(&p.policy) == key)
            .map(|(table, _)| *table);
        match existing {
            Some(table) => {
                remaining.remove(&table);
            }
            None => to_add.push(policy),
        }
    }

    let to_remove = remaining
        .into_iter()
        .map(|(table, p)| (table, p.clone()))
        .collect();
    (to_add, to_remove)
}

/// Build the rule selector of a policy. The table is left unset.
pub fn selector(policy: &PolicyRoute) -> Result<RuleSpec> {
    let src = match policy.from.as_str() {
        "" => None,
        from => Some(
            from.parse::<IpNet>()
                .map_err(|e| Error::parse("policy source network", from, e))?,
        ),
    };
    let ipproto = match policy.proto.as_str() {
        "" => None,
        proto => Some(
            proto
                .parse::<u8>()
                .map_err(|e| Error::parse("ip protocol number", proto, e))?,
        ),
    };
    Ok(RuleSpec {
        priority: None,
        src,
        ipproto,
        dport: port_range("destination port range", &policy.dst_port)?,
        sport: port_range("source port range", &policy.src_port)?,
        table: 0,
    })
}

fn port_range(what: &'static str, value: &str) -> Result<Option<PortRange>> {
    if value.is_empty() {
        return Ok(None);
    }
    value
        .parse::<PortRange>()
        .map(Some)
        .map_err(|e| Error::parse(what, value, e))
}

/// Routes to install into `table` for `policy`.
///
/// A policy without routes gets a default route, of the source's address
/// family, so the table never ends up empty.
pub fn table_routes(policy: &PolicyRoute, rule: &RuleSpec, link: &str, table: u32) -> Result<Vec<RouteSpec>> {
    if policy.routes.is_empty() {
        let any = if rule.is_ipv6() {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        let dst = IpNet::new(any, 0).map_err(|e| Error::parse("default route", any.to_string(), e))?;
        return Ok(vec![RouteSpec {
            link: Some(link.to_string()),
            ..RouteSpec::new(dst, table)
        }]);
    }

    policy
        .routes
        .iter()
        .map(|route| -> Result<RouteSpec> {
            let gateway = route.next_hop_addr()?;
            Ok(RouteSpec {
                dst: route.prefix_net()?,
                gateway,
                link: Some(link.to_string()),
                table,
                scope: RouteScope::Universe,
                onlink: gateway.is_some(),
            })
        })
        .collect()
}
