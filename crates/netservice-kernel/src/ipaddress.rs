//! Assigning a connection's addresses to its interface.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use netservice::{
    Connection, Error, KernelMechanism, NetworkService, Next, Result, Side, join_close, parse_net,
};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::kernel::KernelOps;
use crate::netns::{NamespaceSwitch, Netns, open_target};

pub const DEFAULT_ADDRESS_TIMEOUT: Duration = Duration::from_secs(5);

const SETTLE_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Chain element that keeps the interface's addresses equal to the ones the
/// connection carries.
///
/// The server side assigns the source addresses (the client's end of the
/// link), the client side the destination ones. Addresses applied by an
/// earlier Request that are no longer wanted are removed.
pub struct IpAddressService {
    kernel: Arc<dyn KernelOps>,
    namespaces: Arc<dyn NamespaceSwitch>,
    side: Side,
    timeout: Duration,
    applied: Mutex<HashMap<String, Vec<IpNet>>>,
}

impl IpAddressService {
    pub fn new(kernel: Arc<dyn KernelOps>, namespaces: Arc<dyn NamespaceSwitch>, side: Side) -> Self {
        Self {
            kernel,
            namespaces,
            side,
            timeout: DEFAULT_ADDRESS_TIMEOUT,
            applied: Mutex::new(HashMap::new()),
        }
    }

    /// Bound on how long a Request waits for duplicate address detection.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn desired(&self, conn: &Connection) -> Result<Vec<IpNet>> {
        let ip_context = conn.ip_context();
        let addrs = match self.side {
            Side::Server => &ip_context.src_ip_addrs,
            Side::Client => &ip_context.dst_ip_addrs,
        };
        let mut nets = Vec::with_capacity(addrs.len());
        for addr in addrs {
            let net = parse_net("interface address", addr)?;
            if !nets.contains(&net) {
                nets.push(net);
            }
        }
        Ok(nets)
    }

    async fn apply(&self, conn: &Connection, mechanism: &KernelMechanism) -> Result<()> {
        let desired = self.desired(conn)?;
        let previous = self
            .applied
            .lock()
            .await
            .get(&conn.id)
            .cloned()
            .unwrap_or_default();
        if desired.is_empty() && previous.is_empty() {
            return Ok(());
        }

        let ns = open_target(self.namespaces.as_ref(), mechanism)?;
        let link = mechanism.interface_name(&conn.id);

        self.kernel
            .link_set_up(&ns, &link)
            .await
            .map_err(|e| e.context(format!("set {link} up")))?;
        let disable_ipv6 = format!("net/ipv6/conf/{link}/disable_ipv6");
        match self.kernel.sysctl_write(&ns, &disable_ipv6, "0").await {
            Ok(()) => {}
            Err(e) if e.is_gone() => debug!(link, "IPv6 not available"),
            Err(e) => return Err(e.context(format!("enable IPv6 on {link}"))),
        }

        for stale in previous.iter().filter(|net| !desired.contains(net)) {
            self.remove_addr(&ns, &link, *stale).await?;
            info!(conn_id = %conn.id, link, addr = %stale, "stale address removed");
        }
        self.applied
            .lock()
            .await
            .insert(conn.id.clone(), desired.clone());

        for addr in &desired {
            self.kernel
                .addr_replace(&ns, &link, *addr)
                .await
                .map_err(|e| e.context(format!("add address {addr} to {link}")))?;
            debug!(conn_id = %conn.id, link, %addr, "address replaced");
        }

        tokio::time::timeout(self.timeout, self.settled(&ns, &link, &desired))
            .await
            .map_err(|_| {
                Error::Timeout(format!(
                    "addresses {desired:?} on {link} still tentative after {:?}",
                    self.timeout
                ))
            })?
    }

    /// Wait until none of `addrs` is still running duplicate address
    /// detection.
    async fn settled(&self, ns: &Netns, link: &str, addrs: &[IpNet]) -> Result<()> {
        loop {
            let current = self
                .kernel
                .addr_list(ns, link)
                .await
                .map_err(|e| e.context(format!("list addresses of {link}")))?;
            let pending = addrs
                .iter()
                .filter(|addr| !current.iter().any(|c| c.net == **addr && !c.tentative))
                .count();
            if pending == 0 {
                return Ok(());
            }
            debug!(link, pending, "waiting for addresses to settle");
            tokio::time::sleep(SETTLE_POLL_INTERVAL).await;
        }
    }

    async fn remove_addr(&self, ns: &Netns, link: &str, addr: IpNet) -> Result<()> {
        match self.kernel.addr_delete(ns, link, addr).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_gone() => {
                debug!(link, %addr, "address already gone");
                Ok(())
            }
            Err(e) => Err(e.context(format!("delete address {addr} from {link}"))),
        }
    }

    async fn remove(&self, conn: &Connection, mechanism: &KernelMechanism) -> Result<()> {
        let Some(applied) = self.applied.lock().await.remove(&conn.id) else {
            return Ok(());
        };
        let ns = match self.namespaces.from_url(&mechanism.netns_url) {
            Ok(ns) => ns,
            Err(e) if e.is_namespace_gone() => return Ok(()),
            Err(e) => return Err(e.context(format!("open namespace {}", mechanism.netns_url))),
        };
        let link = mechanism.interface_name(&conn.id);

        let mut failures = Vec::new();
        for addr in applied {
            if let Err(e) = self.remove_addr(&ns, &link, addr).await {
                failures.push(e.to_string());
            }
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(failures))
        }
    }
}

#[async_trait]
impl NetworkService for IpAddressService {
    async fn request(&self, conn: Connection, next: Next<'_>) -> Result<Connection> {
        let conn = next.request(conn).await?;
        if let Some(mechanism) = conn.untagged_kernel()
            && let Err(err) = self.apply(&conn, mechanism).await
        {
            warn!(conn_id = %conn.id, error = %err, "address assignment failed, closing");
            let close = self.close(&conn, next).await;
            return Err(err.with_close(close));
        }
        Ok(conn)
    }

    async fn close(&self, conn: &Connection, next: Next<'_>) -> Result<()> {
        let own = match conn.untagged_kernel() {
            Some(mechanism) => self.remove(conn, mechanism).await,
            None => Ok(()),
        };
        join_close(own, next.close(conn).await)
    }
}
