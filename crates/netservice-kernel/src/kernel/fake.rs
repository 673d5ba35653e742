//! In-memory kernel and namespace registry for unit tests.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use ipnet::IpNet;

use super::{AddrInfo, KernelOps, LinkInfo, NeighborSpec, RouteSpec, RuleSpec};
use crate::command::CommandError;
use crate::error::{KernelError, Result};
use crate::netns::{NamespaceSwitch, Netns, NetnsId};

const HOST_URL: &str = "file:///proc/1/ns/net";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FakeLink {
    pub index: u32,
    pub mtu: u32,
    pub up: bool,
    pub addrs: Vec<IpNet>,
}

#[derive(Debug, Default)]
struct NsState {
    path: PathBuf,
    links: BTreeMap<String, FakeLink>,
    routes: Vec<RouteSpec>,
    rules: Vec<RuleSpec>,
    neighbors: Vec<(String, NeighborSpec)>,
    sysctls: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct State {
    next_ino: u64,
    next_index: u32,
    urls: HashMap<String, NetnsId>,
    namespaces: BTreeMap<NetnsId, NsState>,
    pci: HashMap<String, String>,
    failures: HashSet<&'static str>,
    mutations: usize,
    moves: usize,
}

impl State {
    fn ns(&mut self, ns: &Netns) -> Result<&mut NsState> {
        self.namespaces
            .get_mut(&ns.id())
            .ok_or_else(|| KernelError::NamespaceGone {
                path: ns.path().to_path_buf(),
                source: io::Error::from_raw_os_error(nix::errno::Errno::EBADF as i32),
            })
    }

    fn check(&mut self, op: &'static str, mutating: bool) -> Result<()> {
        if self.failures.contains(op) {
            return Err(KernelError::Command(CommandError {
                command: op.to_string(),
                detail: "injected failure".into(),
            }));
        }
        if mutating {
            self.mutations += 1;
        }
        Ok(())
    }
}

fn link_mut<'a>(ns: &'a mut NsState, name: &str) -> Result<&'a mut FakeLink> {
    ns.links
        .get_mut(name)
        .ok_or_else(|| KernelError::LinkNotFound {
            name: name.to_string(),
        })
}

/// Fake kernel that also resolves namespaces, so one instance can be
/// handed to elements as both [`KernelOps`] and [`NamespaceSwitch`].
#[derive(Debug)]
pub(crate) struct FakeKernel {
    state: Mutex<State>,
}

impl FakeKernel {
    pub fn new() -> Self {
        let kernel = Self {
            state: Mutex::new(State {
                next_ino: 4026531840,
                next_index: 1,
                ..State::default()
            }),
        };
        kernel.register(HOST_URL, "/proc/1/ns/net");
        kernel
    }

    fn register(&self, url: &str, path: &str) -> Netns {
        let mut state = self.state.lock().unwrap();
        let id = NetnsId {
            dev: 4,
            ino: state.next_ino,
        };
        state.next_ino += 1;
        state.urls.insert(url.to_string(), id);
        state.namespaces.insert(id, NsState {
            path: PathBuf::from(path),
            ..NsState::default()
        });
        Netns::new(path, id)
    }

    pub fn host(&self) -> Netns {
        self.from_url(HOST_URL).unwrap()
    }

    /// Create a namespace and return its `file://` locator.
    pub fn add_namespace(&self, name: &str) -> String {
        let path = format!("/var/run/netns/{name}");
        let url = format!("file://{path}");
        self.register(&url, &path);
        url
    }

    pub fn netns(&self, url: &str) -> Netns {
        self.from_url(url).unwrap()
    }

    /// Tear a namespace down underneath its users.
    pub fn remove_namespace(&self, url: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(id) = state.urls.remove(url) {
            state.namespaces.remove(&id);
        }
    }

    pub fn add_link(&self, ns: &Netns, name: &str) {
        let mut state = self.state.lock().unwrap();
        let index = state.next_index;
        state.next_index += 1;
        state.ns(ns).unwrap().links.insert(name.to_string(), FakeLink {
            index,
            mtu: 1500,
            up: false,
            addrs: Vec::new(),
        });
    }

    pub fn add_pci(&self, pci: &str, name: &str) {
        let mut state = self.state.lock().unwrap();
        state.pci.insert(pci.to_string(), name.to_string());
    }

    pub fn add_route(&self, ns: &Netns, route: RouteSpec) {
        let mut state = self.state.lock().unwrap();
        state.ns(ns).unwrap().routes.push(route);
    }

    pub fn add_rule(&self, ns: &Netns, rule: RuleSpec) {
        let mut state = self.state.lock().unwrap();
        state.ns(ns).unwrap().rules.push(rule);
    }

    pub fn link(&self, ns: &Netns, name: &str) -> Option<FakeLink> {
        let mut state = self.state.lock().unwrap();
        state.ns(ns).ok()?.links.get(name).cloned()
    }

    pub fn link_names(&self, ns: &Netns) -> Vec<String> {
        let mut state = self.state.lock().unwrap();
        state.ns(ns).unwrap().links.keys().cloned().collect()
    }

    pub fn routes(&self, ns: &Netns) -> Vec<RouteSpec> {
        let mut state = self.state.lock().unwrap();
        state.ns(ns).unwrap().routes.clone()
    }

    pub fn rules(&self, ns: &Netns) -> Vec<RuleSpec> {
        let mut state = self.state.lock().unwrap();
        state.ns(ns).unwrap().rules.clone()
    }

    pub fn neighbors(&self, ns: &Netns) -> Vec<(String, NeighborSpec)> {
        let mut state = self.state.lock().unwrap();
        state.ns(ns).unwrap().neighbors.clone()
    }

    pub fn sysctl(&self, ns: &Netns, key: &str) -> Option<String> {
        let mut state = self.state.lock().unwrap();
        state.ns(ns).unwrap().sysctls.get(key).cloned()
    }

    pub fn fail_on(&self, op: &'static str) {
        self.state.lock().unwrap().failures.insert(op);
    }

    pub fn clear_failures(&self) {
        self.state.lock().unwrap().failures.clear();
    }

    /// Number of state-changing calls that went through.
    pub fn mutations(&self) -> usize {
        self.state.lock().unwrap().mutations
    }

    /// Number of links moved between namespaces.
    pub fn moves(&self) -> usize {
        self.state.lock().unwrap().moves
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }
}

impl Default for FakeKernel {
    fn default() -> Self {
        Self::new()
    }
}

impl NamespaceSwitch for FakeKernel {
    fn current(&self) -> Result<Netns> {
        Ok(self.host())
    }

    fn from_url(&self, url: &str) -> Result<Netns> {
        let state = self.state.lock().unwrap();
        let id = state
            .urls
            .get(url)
            .copied()
            .ok_or_else(|| KernelError::NamespaceGone {
                path: PathBuf::from(url),
                source: io::Error::from(io::ErrorKind::NotFound),
            })?;
        let path = state
            .namespaces
            .get(&id)
            .map(|ns| ns.path.clone())
            .unwrap_or_default();
        Ok(Netns::new(path, id))
    }

    fn from_inode(&self, ino: u64) -> Result<Netns> {
        let state = self.state.lock().unwrap();
        state
            .namespaces
            .iter()
            .find(|(id, _)| id.ino == ino)
            .map(|(id, ns)| Netns::new(ns.path.clone(), *id))
            .ok_or_else(|| KernelError::NamespaceGone {
                path: PathBuf::from(format!("inode://{ino}")),
                source: io::Error::from(io::ErrorKind::NotFound),
            })
    }
}

#[async_trait]
impl KernelOps for FakeKernel {
    async fn link_by_name(&self, ns: &Netns, name: &str) -> Result<LinkInfo> {
        tokio::task::yield_now().await;
        self.with_state(|state| {
            state.check("link_by_name", false)?;
            let link = link_mut(state.ns(ns)?, name)?;
            Ok(LinkInfo {
                index: link.index,
                name: name.to_string(),
                mtu: link.mtu,
                up: link.up,
            })
        })
    }

    async fn link_set_up(&self, ns: &Netns, name: &str) -> Result<()> {
        tokio::task::yield_now().await;
        self.with_state(|state| {
            state.check("link_set_up", true)?;
            link_mut(state.ns(ns)?, name)?.up = true;
            Ok(())
        })
    }

    async fn link_set_mtu(&self, ns: &Netns, name: &str, mtu: u32) -> Result<()> {
        tokio::task::yield_now().await;
        self.with_state(|state| {
            state.check("link_set_mtu", true)?;
            link_mut(state.ns(ns)?, name)?.mtu = mtu;
            Ok(())
        })
    }

    async fn link_rename(&self, ns: &Netns, name: &str, new_name: &str) -> Result<()> {
        tokio::task::yield_now().await;
        self.with_state(|state| {
            state.check("link_rename", true)?;
            let ns = state.ns(ns)?;
            if ns.links.contains_key(new_name) {
                return Err(KernelError::Exists {
                    what: format!("link {new_name}"),
                });
            }
            let link = ns.links.remove(name).ok_or_else(|| KernelError::LinkNotFound {
                name: name.to_string(),
            })?;
            ns.links.insert(new_name.to_string(), link);
            Ok(())
        })
    }

    async fn link_set_netns(&self, ns: &Netns, name: &str, target: &Netns) -> Result<()> {
        tokio::task::yield_now().await;
        self.with_state(|state| {
            state.check("link_set_netns", true)?;
            if state.ns(target)?.links.contains_key(name) {
                return Err(KernelError::Exists {
                    what: format!("link {name}"),
                });
            }
            let source = state.ns(ns)?;
            let mut link = source.links.remove(name).ok_or_else(|| KernelError::LinkNotFound {
                name: name.to_string(),
            })?;
            // The kernel drops addresses and routes of a link that changes
            // namespace.
            source.routes.retain(|r| r.link.as_deref() != Some(name));
            link.addrs.clear();
            link.up = false;
            state.ns(target)?.links.insert(name.to_string(), link);
            state.moves += 1;
            Ok(())
        })
    }

    async fn link_delete(&self, ns: &Netns, name: &str) -> Result<()> {
        tokio::task::yield_now().await;
        self.with_state(|state| {
            state.check("link_delete", true)?;
            let ns = state.ns(ns)?;
            ns.links.remove(name).ok_or_else(|| KernelError::LinkNotFound {
                name: name.to_string(),
            })?;
            ns.routes.retain(|r| r.link.as_deref() != Some(name));
            Ok(())
        })
    }

    async fn pci_interface_name(&self, pci_address: &str) -> Result<String> {
        self.with_state(|state| {
            state
                .pci
                .get(pci_address)
                .cloned()
                .ok_or_else(|| KernelError::LinkNotFound {
                    name: pci_address.to_string(),
                })
        })
    }

    async fn addr_list(&self, ns: &Netns, link: &str) -> Result<Vec<AddrInfo>> {
        tokio::task::yield_now().await;
        self.with_state(|state| {
            state.check("addr_list", false)?;
            let link = link_mut(state.ns(ns)?, link)?;
            Ok(link
                .addrs
                .iter()
                .map(|net| AddrInfo {
                    net: *net,
                    tentative: false,
                })
                .collect())
        })
    }

    async fn addr_replace(&self, ns: &Netns, link: &str, addr: IpNet) -> Result<()> {
        tokio::task::yield_now().await;
        self.with_state(|state| {
            state.check("addr_replace", true)?;
            let link = link_mut(state.ns(ns)?, link)?;
            if !link.addrs.contains(&addr) {
                link.addrs.push(addr);
            }
            Ok(())
        })
    }

    async fn addr_delete(&self, ns: &Netns, link: &str, addr: IpNet) -> Result<()> {
        tokio::task::yield_now().await;
        self.with_state(|state| {
            state.check("addr_delete", true)?;
            let link = link_mut(state.ns(ns)?, link)?;
            let before = link.addrs.len();
            link.addrs.retain(|a| *a != addr);
            if link.addrs.len() == before {
                return Err(KernelError::NotFound {
                    what: format!("address {addr}"),
                });
            }
            Ok(())
        })
    }

    async fn route_list(&self, ns: &Netns, table: Option<u32>) -> Result<Vec<RouteSpec>> {
        tokio::task::yield_now().await;
        self.with_state(|state| {
            state.check("route_list", false)?;
            Ok(state
                .ns(ns)?
                .routes
                .iter()
                .filter(|r| table.is_none_or(|t| r.table == t))
                .cloned()
                .collect())
        })
    }

    async fn route_replace(&self, ns: &Netns, route: &RouteSpec) -> Result<()> {
        tokio::task::yield_now().await;
        self.with_state(|state| {
            state.check("route_replace", true)?;
            let ns = state.ns(ns)?;
            if let Some(link) = &route.link
                && !ns.links.contains_key(link)
            {
                return Err(KernelError::LinkNotFound { name: link.clone() });
            }
            ns.routes
                .retain(|r| !(r.table == route.table && r.dst == route.dst));
            ns.routes.push(route.clone());
            Ok(())
        })
    }

    async fn route_delete(&self, ns: &Netns, route: &RouteSpec) -> Result<()> {
        tokio::task::yield_now().await;
        self.with_state(|state| {
            state.check("route_delete", true)?;
            let ns = state.ns(ns)?;
            let position = ns.routes.iter().position(|r| {
                r.table == route.table
                    && r.dst == route.dst
                    && (route.link.is_none() || r.link == route.link)
            });
            match position {
                Some(idx) => {
                    ns.routes.remove(idx);
                    Ok(())
                }
                None => Err(KernelError::NotFound {
                    what: format!("route {} table {}", route.dst, route.table),
                }),
            }
        })
    }

    async fn rule_list(&self, ns: &Netns) -> Result<Vec<RuleSpec>> {
        tokio::task::yield_now().await;
        self.with_state(|state| {
            state.check("rule_list", false)?;
            Ok(state.ns(ns)?.rules.clone())
        })
    }

    async fn rule_add(&self, ns: &Netns, rule: &RuleSpec) -> Result<()> {
        tokio::task::yield_now().await;
        self.with_state(|state| {
            state.check("rule_add", true)?;
            let ns = state.ns(ns)?;
            if ns
                .rules
                .iter()
                .any(|r| r.same_selector(rule) && r.table == rule.table)
            {
                return Err(KernelError::Exists {
                    what: format!("rule lookup {}", rule.table),
                });
            }
            ns.rules.push(RuleSpec {
                priority: Some(32765),
                ..rule.clone()
            });
            Ok(())
        })
    }

    async fn rule_delete(&self, ns: &Netns, rule: &RuleSpec) -> Result<()> {
        tokio::task::yield_now().await;
        self.with_state(|state| {
            state.check("rule_delete", true)?;
            let ns = state.ns(ns)?;
            let position = ns.rules.iter().position(|r| {
                r.same_selector(rule)
                    && r.table == rule.table
                    && (rule.priority.is_none() || r.priority == rule.priority)
            });
            match position {
                Some(idx) => {
                    ns.rules.remove(idx);
                    Ok(())
                }
                None => Err(KernelError::NotFound {
                    what: format!("rule lookup {}", rule.table),
                }),
            }
        })
    }

    async fn neigh_replace(&self, ns: &Netns, link: &str, neigh: &NeighborSpec) -> Result<()> {
        tokio::task::yield_now().await;
        self.with_state(|state| {
            state.check("neigh_replace", true)?;
            let ns = state.ns(ns)?;
            link_mut(ns, link)?;
            ns.neighbors.retain(|(l, n)| !(l == link && n.ip == neigh.ip));
            ns.neighbors.push((link.to_string(), neigh.clone()));
            Ok(())
        })
    }

    async fn sysctl_write(&self, ns: &Netns, key: &str, value: &str) -> Result<()> {
        tokio::task::yield_now().await;
        self.with_state(|state| {
            state.check("sysctl_write", true)?;
            state
                .ns(ns)?
                .sysctls
                .insert(key.to_string(), value.to_string());
            Ok(())
        })
    }
}
