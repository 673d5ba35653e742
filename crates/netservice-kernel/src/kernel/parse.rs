//! Decoding of `ip -j -N` output.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use ipnet::IpNet;
use serde::Deserialize;
use tracing::debug;

use super::{
    AddrInfo, LinkInfo, PortRange, RouteScope, RouteSpec, RuleSpec, TABLE_DEFAULT, TABLE_LOCAL,
    TABLE_MAIN, TABLE_UNSPEC,
};
use crate::error::{KernelError, Result};

/// Numbers with `-N`, names on older iproute2 builds.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum NumberOrName {
    Number(u32),
    Name(String),
}

#[derive(Debug, Deserialize)]
struct JsonLink {
    ifindex: u32,
    ifname: String,
    #[serde(default)]
    flags: Vec<String>,
    #[serde(default)]
    mtu: u32,
}

#[derive(Debug, Deserialize)]
struct JsonAddrLink {
    #[serde(default)]
    addr_info: Vec<JsonAddr>,
}

#[derive(Debug, Deserialize)]
struct JsonAddr {
    local: Option<String>,
    prefixlen: Option<u8>,
    #[serde(default)]
    tentative: bool,
}

#[derive(Debug, Deserialize)]
struct JsonRoute {
    dst: String,
    gateway: Option<String>,
    dev: Option<String>,
    table: Option<NumberOrName>,
    scope: Option<NumberOrName>,
    #[serde(default)]
    flags: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct JsonRule {
    priority: Option<u32>,
    src: Option<String>,
    srclen: Option<u8>,
    table: Option<NumberOrName>,
    ipproto: Option<NumberOrName>,
    dport: Option<u16>,
    dport_start: Option<u16>,
    dport_end: Option<u16>,
    sport: Option<u16>,
    sport_start: Option<u16>,
    sport_end: Option<u16>,
}

fn decode<T: for<'de> Deserialize<'de>>(output: &str) -> Result<Vec<T>> {
    if output.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(output).map_err(|e| KernelError::Parse(e.to_string()))
}

pub(super) fn links(output: &str) -> Result<Vec<LinkInfo>> {
    Ok(decode::<JsonLink>(output)?
        .into_iter()
        .map(|link| LinkInfo {
            up: link.flags.iter().any(|f| f == "UP"),
            index: link.ifindex,
            name: link.ifname,
            mtu: link.mtu,
        })
        .collect())
}

pub(super) fn addresses(output: &str) -> Result<Vec<AddrInfo>> {
    let mut out = Vec::new();
    for link in decode::<JsonAddrLink>(output)? {
        for addr in link.addr_info {
            let (Some(local), Some(prefixlen)) = (addr.local, addr.prefixlen) else {
                continue;
            };
            let ip: IpAddr = local
                .parse()
                .map_err(|e| KernelError::Parse(format!("address {local:?}: {e}")))?;
            let net = IpNet::new(ip, prefixlen)
                .map_err(|e| KernelError::Parse(format!("address {local}/{prefixlen}: {e}")))?;
            out.push(AddrInfo {
                net,
                tentative: addr.tentative,
            });
        }
    }
    Ok(out)
}

/// Routes of one address family. `ipv6` decides what `"default"` means.
pub(super) fn routes(output: &str, ipv6: bool) -> Result<Vec<RouteSpec>> {
    let mut out = Vec::new();
    for route in decode::<JsonRoute>(output)? {
        let Some(dst) = route_dst(&route.dst, ipv6) else {
            debug!(dst = %route.dst, "skipping route with unrecognized destination");
            continue;
        };
        let gateway = match route.gateway.as_deref() {
            Some(gw) => Some(
                gw.parse()
                    .map_err(|e| KernelError::Parse(format!("gateway {gw:?}: {e}")))?,
            ),
            None => None,
        };
        out.push(RouteSpec {
            dst,
            gateway,
            link: route.dev,
            // `ip route` leaves out the table of routes in main.
            table: match route.table {
                Some(table) => table_id(&table)?,
                None => TABLE_MAIN,
            },
            scope: route.scope.as_ref().map(scope).unwrap_or_default(),
            onlink: route.flags.iter().any(|f| f == "onlink"),
        });
    }
    Ok(out)
}

pub(super) fn rules(output: &str) -> Result<Vec<RuleSpec>> {
    decode::<JsonRule>(output)?
        .into_iter()
        .map(|rule| -> Result<RuleSpec> {
            let src = match rule.src.as_deref() {
                None | Some("all") => None,
                Some(src) => {
                    let ip: IpAddr = src
                        .parse()
                        .map_err(|e| KernelError::Parse(format!("rule source {src:?}: {e}")))?;
                    let len = rule.srclen.unwrap_or(if ip.is_ipv4() { 32 } else { 128 });
                    Some(IpNet::new(ip, len).map_err(|e| {
                        KernelError::Parse(format!("rule source {src}/{len}: {e}"))
                    })?)
                }
            };
            Ok(RuleSpec {
                priority: rule.priority,
                src,
                ipproto: rule.ipproto.as_ref().map(protocol).transpose()?,
                dport: port_range(rule.dport, rule.dport_start, rule.dport_end),
                sport: port_range(rule.sport, rule.sport_start, rule.sport_end),
                table: match rule.table {
                    Some(table) => table_id(&table)?,
                    None => TABLE_UNSPEC,
                },
            })
        })
        .collect()
}

fn route_dst(dst: &str, ipv6: bool) -> Option<IpNet> {
    if dst == "default" {
        let any = if ipv6 {
            IpAddr::V6(Ipv6Addr::UNSPECIFIED)
        } else {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        };
        return IpNet::new(any, 0).ok();
    }
    if dst.contains('/') {
        return dst.parse().ok();
    }
    dst.parse::<IpAddr>().ok().map(IpNet::from)
}

fn port_range(single: Option<u16>, start: Option<u16>, end: Option<u16>) -> Option<PortRange> {
    match (single, start, end) {
        (Some(port), _, _) => Some(PortRange::single(port)),
        (None, Some(start), Some(end)) => Some(PortRange { start, end }),
        _ => None,
    }
}

fn table_id(table: &NumberOrName) -> Result<u32> {
    match table {
        NumberOrName::Number(id) => Ok(*id),
        NumberOrName::Name(name) => match name.as_str() {
            "unspec" => Ok(TABLE_UNSPEC),
            "default" => Ok(TABLE_DEFAULT),
            "main" => Ok(TABLE_MAIN),
            "local" => Ok(TABLE_LOCAL),
            other => other
                .parse()
                .map_err(|_| KernelError::Parse(format!("unknown routing table {other:?}"))),
        },
    }
}

fn scope(scope: &NumberOrName) -> RouteScope {
    match scope {
        NumberOrName::Number(253) => RouteScope::Link,
        NumberOrName::Number(254) => RouteScope::Host,
        NumberOrName::Name(name) if name == "link" || name == "253" => RouteScope::Link,
        NumberOrName::Name(name) if name == "host" || name == "254" => RouteScope::Host,
        _ => RouteScope::Universe,
    }
}

fn protocol(proto: &NumberOrName) -> Result<u8> {
    let name = match proto {
        NumberOrName::Number(n) => {
            return u8::try_from(*n).map_err(|e| KernelError::Parse(format!("ipproto {n}: {e}")));
        }
        NumberOrName::Name(name) => name.as_str(),
    };
    let known = match name {
        "icmp" => Some(1),
        "igmp" => Some(2),
        "tcp" => Some(6),
        "udp" => Some(17),
        "gre" => Some(47),
        "esp" => Some(50),
        "ah" => Some(51),
        "ipv6-icmp" | "icmpv6" => Some(58),
        "sctp" => Some(132),
        "udplite" => Some(136),
        _ => None,
    };
    if let Some(n) = known {
        return Ok(n);
    }
    name.strip_prefix("ipproto-")
        .unwrap_or(name)
        .parse()
        .map_err(|_| KernelError::Parse(format!("unknown ip protocol {name:?}")))
}
