//! Per-namespace sysctls written into the connection's namespace.

use std::sync::Arc;

use async_trait::async_trait;
use netservice::{Connection, KernelMechanism, NetworkService, Next, Result};
use tracing::{debug, warn};

use crate::kernel::KernelOps;
use crate::netns::{NamespaceSwitch, open_target};

/// Lets unprivileged ICMP sockets be opened by any group.
pub const PING_GROUP_RANGE: &str = "0 2147483647";

async fn write(
    kernel: &dyn KernelOps,
    namespaces: &dyn NamespaceSwitch,
    conn: &Connection,
    mechanism: &KernelMechanism,
    key: &str,
    value: &str,
) -> Result<()> {
    let ns = open_target(namespaces, mechanism)?;
    kernel
        .sysctl_write(&ns, key, value)
        .await
        .map_err(|e| e.context(format!("set {key} = {value}")))?;
    debug!(conn_id = %conn.id, key, value, netns = %ns, "sysctl written");
    Ok(())
}

/// Enables `route_localnet` on the interface when the mechanism asks for
/// it, so loopback addresses can be routed through it.
pub struct RouteLocalNetService {
    kernel: Arc<dyn KernelOps>,
    namespaces: Arc<dyn NamespaceSwitch>,
}

impl RouteLocalNetService {
    pub fn new(kernel: Arc<dyn KernelOps>, namespaces: Arc<dyn NamespaceSwitch>) -> Self {
        Self { kernel, namespaces }
    }
}

#[async_trait]
impl NetworkService for RouteLocalNetService {
    async fn request(&self, conn: Connection, next: Next<'_>) -> Result<Connection> {
        let conn = next.request(conn).await?;
        let Some(mechanism) = conn.kernel().filter(|m| m.route_localnet) else {
            return Ok(conn);
        };
        let key = format!(
            "net/ipv4/conf/{}/route_localnet",
            mechanism.interface_name(&conn.id)
        );
        let result = write(
            self.kernel.as_ref(),
            self.namespaces.as_ref(),
            &conn,
            mechanism,
            &key,
            "1",
        )
        .await;
        if let Err(err) = result {
            warn!(conn_id = %conn.id, error = %err, "route_localnet failed, closing");
            let close = self.close(&conn, next).await;
            return Err(err.with_close(close));
        }
        Ok(conn)
    }

    async fn close(&self, conn: &Connection, next: Next<'_>) -> Result<()> {
        next.close(conn).await
    }
}

/// Opens `net/ipv4/ping_group_range` in the connection's namespace.
pub struct PingGroupRangeService {
    kernel: Arc<dyn KernelOps>,
    namespaces: Arc<dyn NamespaceSwitch>,
}

impl PingGroupRangeService {
    pub fn new(kernel: Arc<dyn KernelOps>, namespaces: Arc<dyn NamespaceSwitch>) -> Self {
        Self { kernel, namespaces }
    }
}

#[async_trait]
impl NetworkService for PingGroupRangeService {
    async fn request(&self, conn: Connection, next: Next<'_>) -> Result<Connection> {
        let conn = next.request(conn).await?;
        let Some(mechanism) = conn.kernel() else {
            return Ok(conn);
        };
        let result = write(
            self.kernel.as_ref(),
            self.namespaces.as_ref(),
            &conn,
            mechanism,
            "net/ipv4/ping_group_range",
            PING_GROUP_RANGE,
        )
        .await;
        if let Err(err) = result {
            warn!(conn_id = %conn.id, error = %err, "ping_group_range failed, closing");
            let close = self.close(&conn, next).await;
            return Err(err.with_close(close));
        }
        Ok(conn)
    }

    async fn close(&self, conn: &Connection, next: Next<'_>) -> Result<()> {
        next.close(conn).await
    }
}
