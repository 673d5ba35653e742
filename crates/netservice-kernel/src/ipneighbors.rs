//! Static neighbor entries for a connection's interface.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use netservice::{Connection, Error, KernelMechanism, NetworkService, Next, Result};
use tracing::{debug, warn};

use crate::kernel::{KernelOps, MacAddr, NeighborSpec};
use crate::netns::{NamespaceSwitch, open_target};

/// Chain element that installs the connection's IP neighbors as reachable
/// entries. Entries go away with the interface, so Close only forwards.
pub struct IpNeighborsService {
    kernel: Arc<dyn KernelOps>,
    namespaces: Arc<dyn NamespaceSwitch>,
}

impl IpNeighborsService {
    pub fn new(kernel: Arc<dyn KernelOps>, namespaces: Arc<dyn NamespaceSwitch>) -> Self {
        Self { kernel, namespaces }
    }

    async fn apply(&self, conn: &Connection, mechanism: &KernelMechanism) -> Result<()> {
        let neighbors = conn
            .ip_context()
            .ip_neighbors
            .iter()
            .map(|neighbor| -> Result<NeighborSpec> {
                Ok(NeighborSpec {
                    ip: neighbor
                        .ip
                        .parse::<IpAddr>()
                        .map_err(|e| Error::parse("neighbor address", &neighbor.ip, e))?,
                    lladdr: neighbor.hardware_address.parse::<MacAddr>().map_err(|e| {
                        Error::parse("neighbor MAC address", &neighbor.hardware_address, e)
                    })?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if neighbors.is_empty() {
            return Ok(());
        }

        let ns = open_target(self.namespaces.as_ref(), mechanism)?;
        let link = mechanism.interface_name(&conn.id);
        for neighbor in &neighbors {
            self.kernel
                .neigh_replace(&ns, &link, neighbor)
                .await
                .map_err(|e| e.context(format!("set neighbor {} on {link}", neighbor.ip)))?;
            debug!(conn_id = %conn.id, link, ip = %neighbor.ip, lladdr = %neighbor.lladdr, "neighbor set");
        }
        Ok(())
    }
}

#[async_trait]
impl NetworkService for IpNeighborsService {
    async fn request(&self, conn: Connection, next: Next<'_>) -> Result<Connection> {
        let conn = next.request(conn).await?;
        if let Some(mechanism) = conn.untagged_kernel()
            && let Err(err) = self.apply(&conn, mechanism).await
        {
            warn!(conn_id = %conn.id, error = %err, "setting neighbors failed, closing");
            let close = self.close(&conn, next).await;
            return Err(err.with_close(close));
        }
        Ok(conn)
    }

    async fn close(&self, conn: &Connection, next: Next<'_>) -> Result<()> {
        next.close(conn).await
    }
}

#[cfg(test)]
mod tests {
    use netservice::{Chain, IpNeighbor, Mechanism};

    use super::*;
    use crate::kernel::fake::FakeKernel;

    fn connection(url: &str, neighbors: Vec<IpNeighbor>) -> Connection {
        let mut conn = Connection::new("conn-1");
        conn.mechanism = Some(Mechanism::Kernel(KernelMechanism {
            netns_url: url.to_string(),
            interface_name: "nsm-1".into(),
            ..KernelMechanism::default()
        }));
        conn.context.ip_context.ip_neighbors = neighbors;
        conn
    }

    fn neighbor(ip: &str, mac: &str) -> IpNeighbor {
        IpNeighbor {
            ip: ip.into(),
            hardware_address: mac.into(),
        }
    }

    fn setup() -> (Arc<FakeKernel>, Chain, String) {
        let kernel = Arc::new(FakeKernel::new());
        let url = kernel.add_namespace("pod");
        kernel.add_link(&kernel.netns(&url), "nsm-1");
        let service = IpNeighborsService::new(kernel.clone(), kernel.clone());
        (
            kernel,
            Chain::new(vec![Arc::new(service) as Arc<dyn NetworkService>]),
            url,
        )
    }

    #[tokio::test]
    async fn neighbors_are_installed() {
        let (kernel, chain, url) = setup();
        chain
            .handle_request(connection(&url, vec![
                neighbor("172.16.1.2", "02:fe:00:00:00:02"),
                neighbor("fd00::2", "02:fe:00:00:00:03"),
            ]))
            .await
            .unwrap();

        let neighbors = kernel.neighbors(&kernel.netns(&url));
        assert_eq!(neighbors.len(), 2);
        assert_eq!(neighbors[0].0, "nsm-1");
        assert_eq!(neighbors[0].1.lladdr.to_string(), "02:fe:00:00:00:02");
    }

    #[tokio::test]
    async fn invalid_mac_is_rejected_before_any_change() {
        let (kernel, chain, url) = setup();
        let err = chain
            .handle_request(connection(&url, vec![
                neighbor("172.16.1.2", "02:fe:00:00:00:02"),
                neighbor("172.16.1.3", "not-a-mac"),
            ]))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Parse { .. }), "got: {err}");
        assert_eq!(kernel.mutations(), 0);
    }
}
