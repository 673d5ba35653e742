use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use ipnet::IpNet;

use super::{AddrInfo, KernelOps, LinkInfo, NeighborSpec, RouteSpec, RuleSpec, parse};
use crate::command::{CommandError, exec_blocking};
use crate::error::{KernelError, Result};
use crate::netns::{self, Netns};

const SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// What a "no such object" answer from `ip` refers to.
enum Subject<'a> {
    Link(&'a str),
    Object(String),
}

/// [`KernelOps`] backed by the iproute2 `ip` tool.
///
/// Each call runs `ip` from a thread that has entered the target
/// namespace, so the namespace does not need a name under `/run/netns`.
#[derive(Debug, Clone)]
pub struct IpRoute2 {
    binary: PathBuf,
}

impl Default for IpRoute2 {
    fn default() -> Self {
        Self::new("ip")
    }
}

impl IpRoute2 {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    async fn run(&self, ns: &Netns, args: Vec<String>, subject: Subject<'_>) -> Result<String> {
        let binary = self.binary.clone();
        let output = netns::run_in(ns, move || {
            exec_blocking(&binary, &args).map_err(KernelError::Command)
        })
        .await;
        output.map_err(|e| classify(e, &subject))
    }

    async fn list_both_families(
        &self,
        ns: &Netns,
        what: &str,
        tail: &[&str],
    ) -> Result<Vec<(bool, String)>> {
        let mut out = Vec::with_capacity(2);
        for (family, ipv6) in [("-4", false), ("-6", true)] {
            let mut args = strings(&["-j", "-N", family, what]);
            args.extend(tail.iter().map(|s| s.to_string()));
            match self.run(ns, args, Subject::Object(what.to_string())).await {
                Ok(output) => out.push((ipv6, output)),
                // IPv6 compiled out or disabled at boot.
                Err(KernelError::Command(e))
                    if ipv6 && e.detail.contains("Address family not supported") => {}
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn family(ipv6: bool) -> String {
    if ipv6 { "-6".into() } else { "-4".into() }
}

/// Map iproute2 error text onto the kernel error taxonomy.
fn classify(err: KernelError, subject: &Subject<'_>) -> KernelError {
    let KernelError::Command(command) = err else {
        return err;
    };
    let detail = command.detail.as_str();
    let link_missing = detail.contains("Cannot find device") || detail.contains("does not exist");
    let object_missing = detail.contains("No such file or directory")
        || detail.contains("No such process")
        || detail.contains("Cannot assign requested address");
    match subject {
        Subject::Link(name) if link_missing => KernelError::LinkNotFound {
            name: name.to_string(),
        },
        Subject::Link(name) if object_missing => KernelError::NotFound {
            what: format!("object on link {name}"),
        },
        Subject::Object(what) if link_missing || object_missing => KernelError::NotFound {
            what: what.clone(),
        },
        Subject::Link(_) | Subject::Object(_) if detail.contains("File exists") => {
            KernelError::Exists {
                what: command.command.clone(),
            }
        }
        _ => KernelError::Command(command),
    }
}

fn rule_args(verb: &str, rule: &RuleSpec) -> Vec<String> {
    let mut args = vec![family(rule.is_ipv6()), "rule".into(), verb.into()];
    if let Some(priority) = rule.priority {
        args.extend(["priority".into(), priority.to_string()]);
    }
    args.push("from".into());
    args.push(rule.src.map_or_else(|| "all".to_string(), |src| src.to_string()));
    if let Some(proto) = rule.ipproto {
        args.extend(["ipproto".into(), proto.to_string()]);
    }
    if let Some(dport) = rule.dport {
        args.extend(["dport".into(), dport.to_string()]);
    }
    if let Some(sport) = rule.sport {
        args.extend(["sport".into(), sport.to_string()]);
    }
    args.extend(["lookup".into(), rule.table.to_string()]);
    args
}

fn route_args(verb: &str, route: &RouteSpec) -> Vec<String> {
    let mut args = vec![
        family(route.is_ipv6()),
        "route".into(),
        verb.into(),
        route.dst.to_string(),
    ];
    if let Some(gateway) = route.gateway {
        args.extend(["via".into(), gateway.to_string()]);
    }
    if let Some(link) = &route.link {
        args.extend(["dev".into(), link.clone()]);
    }
    args.extend(["table".into(), route.table.to_string()]);
    if verb != "del" {
        args.extend(["scope".into(), route.scope.as_str().into()]);
        if route.onlink {
            args.push("onlink".into());
        }
    }
    args
}

fn sysctl_path(key: &str) -> PathBuf {
    Path::new("/proc/sys").join(key.trim_start_matches('/'))
}

#[async_trait]
impl KernelOps for IpRoute2 {
    async fn link_by_name(&self, ns: &Netns, name: &str) -> Result<LinkInfo> {
        let args = strings(&["-j", "-N", "link", "show", "dev", name]);
        let output = self.run(ns, args, Subject::Link(name)).await?;
        parse::links(&output)?
            .into_iter()
            .next()
            .ok_or_else(|| KernelError::LinkNotFound {
                name: name.to_string(),
            })
    }

    async fn link_set_up(&self, ns: &Netns, name: &str) -> Result<()> {
        let args = strings(&["link", "set", "dev", name, "up"]);
        self.run(ns, args, Subject::Link(name)).await.map(drop)
    }

    async fn link_set_mtu(&self, ns: &Netns, name: &str, mtu: u32) -> Result<()> {
        let args = strings(&["link", "set", "dev", name, "mtu", &mtu.to_string()]);
        self.run(ns, args, Subject::Link(name)).await.map(drop)
    }

    async fn link_rename(&self, ns: &Netns, name: &str, new_name: &str) -> Result<()> {
        let args = strings(&["link", "set", "dev", name, "name", new_name]);
        self.run(ns, args, Subject::Link(name)).await.map(drop)
    }

    async fn link_set_netns(&self, ns: &Netns, name: &str, target: &Netns) -> Result<()> {
        let target_path = target.path().display().to_string();
        let args = strings(&["link", "set", "dev", name, "netns", &target_path]);
        self.run(ns, args, Subject::Link(name)).await.map(drop)
    }

    async fn link_delete(&self, ns: &Netns, name: &str) -> Result<()> {
        let args = strings(&["link", "del", "dev", name]);
        self.run(ns, args, Subject::Link(name)).await.map(drop)
    }

    async fn pci_interface_name(&self, pci_address: &str) -> Result<String> {
        let dir = Path::new(SYSFS_PCI_DEVICES).join(pci_address).join("net");
        let not_found = || KernelError::LinkNotFound {
            name: pci_address.to_string(),
        };
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Err(not_found()),
            Err(e) => {
                return Err(KernelError::Command(CommandError {
                    command: format!("read {}", dir.display()),
                    detail: e.to_string(),
                }));
            }
        };
        match entries.next_entry().await {
            Ok(Some(entry)) => Ok(entry.file_name().to_string_lossy().into_owned()),
            Ok(None) => Err(not_found()),
            Err(e) => Err(KernelError::Command(CommandError {
                command: format!("read {}", dir.display()),
                detail: e.to_string(),
            })),
        }
    }

    async fn addr_list(&self, ns: &Netns, link: &str) -> Result<Vec<AddrInfo>> {
        let args = strings(&["-j", "-N", "addr", "show", "dev", link]);
        let output = self.run(ns, args, Subject::Link(link)).await?;
        parse::addresses(&output)
    }

    async fn addr_replace(&self, ns: &Netns, link: &str, addr: IpNet) -> Result<()> {
        let mut args = strings(&["addr", "replace", &addr.to_string(), "dev", link]);
        if matches!(addr, IpNet::V6(_)) {
            args.push("nodad".into());
        }
        self.run(ns, args, Subject::Link(link)).await.map(drop)
    }

    async fn addr_delete(&self, ns: &Netns, link: &str, addr: IpNet) -> Result<()> {
        let args = strings(&["addr", "del", &addr.to_string(), "dev", link]);
        self.run(ns, args, Subject::Link(link)).await.map(drop)
    }

    async fn route_list(&self, ns: &Netns, table: Option<u32>) -> Result<Vec<RouteSpec>> {
        let table = table.map_or_else(|| "all".to_string(), |t| t.to_string());
        let mut routes = Vec::new();
        for (ipv6, output) in self
            .list_both_families(ns, "route", &["show", "table", &table])
            .await?
        {
            routes.extend(parse::routes(&output, ipv6)?);
        }
        Ok(routes)
    }

    async fn route_replace(&self, ns: &Netns, route: &RouteSpec) -> Result<()> {
        let subject = match &route.link {
            Some(link) => Subject::Link(link),
            None => Subject::Object(format!("route {}", route.dst)),
        };
        self.run(ns, route_args("replace", route), subject)
            .await
            .map(drop)
    }

    async fn route_delete(&self, ns: &Netns, route: &RouteSpec) -> Result<()> {
        let subject = Subject::Object(format!("route {} table {}", route.dst, route.table));
        self.run(ns, route_args("del", route), subject)
            .await
            .map(drop)
    }

    async fn rule_list(&self, ns: &Netns) -> Result<Vec<RuleSpec>> {
        let mut rules = Vec::new();
        for (_, output) in self.list_both_families(ns, "rule", &["show"]).await? {
            rules.extend(parse::rules(&output)?);
        }
        Ok(rules)
    }

    async fn rule_add(&self, ns: &Netns, rule: &RuleSpec) -> Result<()> {
        let subject = Subject::Object(format!("rule lookup {}", rule.table));
        self.run(ns, rule_args("add", rule), subject).await.map(drop)
    }

    async fn rule_delete(&self, ns: &Netns, rule: &RuleSpec) -> Result<()> {
        let subject = Subject::Object(format!("rule lookup {}", rule.table));
        self.run(ns, rule_args("del", rule), subject).await.map(drop)
    }

    async fn neigh_replace(&self, ns: &Netns, link: &str, neigh: &NeighborSpec) -> Result<()> {
        let args = strings(&[
            "neigh",
            "replace",
            &neigh.ip.to_string(),
            "lladdr",
            &neigh.lladdr.to_string(),
            "dev",
            link,
            "nud",
            "reachable",
        ]);
        self.run(ns, args, Subject::Link(link)).await.map(drop)
    }

    async fn sysctl_write(&self, ns: &Netns, key: &str, value: &str) -> Result<()> {
        let path = sysctl_path(key);
        let value = value.to_string();
        let what = key.to_string();
        netns::run_in(ns, move || {
            std::fs::write(&path, value).map_err(|e| match e.kind() {
                io::ErrorKind::NotFound => KernelError::NotFound {
                    what: format!("sysctl {what}"),
                },
                _ => KernelError::Command(CommandError {
                    command: format!("write {}", path.display()),
                    detail: e.to_string(),
                }),
            })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::{PortRange, RouteScope};

    fn command_error(detail: &str) -> KernelError {
        KernelError::Command(CommandError {
            command: "ip link set dev nsm-1 up".into(),
            detail: detail.into(),
        })
    }

    #[test]
    fn classify_missing_link() {
        let err = classify(
            command_error("Cannot find device \"nsm-1\""),
            &Subject::Link("nsm-1"),
        );
        assert!(matches!(err, KernelError::LinkNotFound { ref name } if name == "nsm-1"));
    }

    #[test]
    fn classify_missing_rule_and_route() {
        let err = classify(
            command_error("RTNETLINK answers: No such file or directory"),
            &Subject::Object("rule lookup 1".into()),
        );
        assert!(err.is_gone());
        let err = classify(
            command_error("RTNETLINK answers: No such process"),
            &Subject::Object("route 0.0.0.0/0 table 1".into()),
        );
        assert!(matches!(err, KernelError::NotFound { .. }));
    }

    #[test]
    fn classify_keeps_other_failures() {
        let err = classify(
            command_error("RTNETLINK answers: Operation not permitted"),
            &Subject::Link("nsm-1"),
        );
        assert!(matches!(err, KernelError::Command(_)));
        assert!(!err.is_gone());
    }

    #[test]
    fn rule_arguments() {
        let rule = RuleSpec {
            src: Some("10.0.0.0/24".parse().unwrap()),
            ipproto: Some(6),
            dport: Some(PortRange::single(443)),
            table: 1,
            ..RuleSpec::default()
        };
        assert_eq!(
            rule_args("add", &rule).join(" "),
            "-4 rule add from 10.0.0.0/24 ipproto 6 dport 443 lookup 1"
        );

        let any = RuleSpec {
            sport: Some(PortRange {
                start: 1000,
                end: 2000,
            }),
            priority: Some(100),
            table: 3,
            ..RuleSpec::default()
        };
        assert_eq!(
            rule_args("del", &any).join(" "),
            "-4 rule del priority 100 from all sport 1000-2000 lookup 3"
        );
    }

    #[test]
    fn route_arguments() {
        let route = RouteSpec {
            gateway: Some("172.16.1.2".parse().unwrap()),
            link: Some("nsm-1".into()),
            onlink: true,
            ..RouteSpec::new("0.0.0.0/0".parse().unwrap(), 1)
        };
        assert_eq!(
            route_args("replace", &route).join(" "),
            "-4 route replace 0.0.0.0/0 via 172.16.1.2 dev nsm-1 table 1 scope global onlink"
        );

        let link_route = RouteSpec {
            link: Some("nsm-1".into()),
            scope: RouteScope::Link,
            ..RouteSpec::new("fd00::/64".parse().unwrap(), 254)
        };
        assert_eq!(
            route_args("del", &link_route).join(" "),
            "-6 route del fd00::/64 dev nsm-1 table 254"
        );
    }

    #[test]
    fn sysctl_keys_live_under_proc_sys() {
        assert_eq!(
            sysctl_path("net/ipv6/conf/nsm-1/disable_ipv6"),
            PathBuf::from("/proc/sys/net/ipv6/conf/nsm-1/disable_ipv6")
        );
    }
}
