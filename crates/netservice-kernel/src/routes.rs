//! Routes through a connection's interface in the main table.

use std::sync::Arc;

use async_trait::async_trait;
use netservice::{Connection, KernelMechanism, NetworkService, Next, Result, Route, Side};
use tracing::{debug, warn};

use crate::kernel::{KernelOps, RouteScope, RouteSpec, TABLE_MAIN};
use crate::netns::{NamespaceSwitch, open_target};

/// Chain element that routes the peer's addresses, and the peer-side
/// routes with an explicit next hop, through the interface.
///
/// Routes disappear with the interface, so Close only forwards.
pub struct RoutesService {
    kernel: Arc<dyn KernelOps>,
    namespaces: Arc<dyn NamespaceSwitch>,
    side: Side,
}

impl RoutesService {
    pub fn new(kernel: Arc<dyn KernelOps>, namespaces: Arc<dyn NamespaceSwitch>, side: Side) -> Self {
        Self {
            kernel,
            namespaces,
            side,
        }
    }

    fn wanted(&self, conn: &Connection) -> Vec<Route> {
        let ip_context = conn.ip_context();
        let (mut routes, via) = match self.side {
            Side::Client => (
                ip_context.src_ip_routes(),
                ip_context.dst_routes_with_explicit_next_hop(),
            ),
            Side::Server => (
                ip_context.dst_ip_routes(),
                ip_context.src_routes_with_explicit_next_hop(),
            ),
        };
        routes.extend(via);
        routes
    }

    async fn apply(&self, conn: &Connection, mechanism: &KernelMechanism) -> Result<()> {
        let link = mechanism.interface_name(&conn.id);
        let routes = self
            .wanted(conn)
            .iter()
            .map(|route| -> Result<RouteSpec> {
                Ok(RouteSpec {
                    gateway: route.next_hop_addr()?,
                    link: Some(link.clone()),
                    scope: RouteScope::Link,
                    ..RouteSpec::new(route.prefix_net()?, TABLE_MAIN)
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if routes.is_empty() {
            return Ok(());
        }

        let ns = open_target(self.namespaces.as_ref(), mechanism)?;
        self.kernel
            .link_set_up(&ns, &link)
            .await
            .map_err(|e| e.context(format!("set {link} up")))?;
        for route in &routes {
            self.kernel
                .route_replace(&ns, route)
                .await
                .map_err(|e| e.context(format!("add route {} via {link}", route.dst)))?;
            debug!(conn_id = %conn.id, link, dst = %route.dst, gateway = ?route.gateway, "route replaced");
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkService for RoutesService {
    async fn request(&self, conn: Connection, next: Next<'_>) -> Result<Connection> {
        let conn = next.request(conn).await?;
        if let Some(mechanism) = conn.kernel()
            && let Err(err) = self.apply(&conn, mechanism).await
        {
            warn!(conn_id = %conn.id, error = %err, "setting routes failed, closing");
            let close = self.close(&conn, next).await;
            return Err(err.with_close(close));
        }
        Ok(conn)
    }

    async fn close(&self, conn: &Connection, next: Next<'_>) -> Result<()> {
        next.close(conn).await
    }
}
