use std::sync::Arc;

use async_trait::async_trait;
use netservice::{Connection, KernelMechanism, NetworkService, Next, Result};
use tracing::{debug, warn};

use crate::kernel::KernelOps;
use crate::netns::{NamespaceSwitch, open_target};

/// Chain element that brings the interface up and applies the connection's
/// MTU when one is set.
pub struct MtuService {
    kernel: Arc<dyn KernelOps>,
    namespaces: Arc<dyn NamespaceSwitch>,
}

impl MtuService {
    pub fn new(kernel: Arc<dyn KernelOps>, namespaces: Arc<dyn NamespaceSwitch>) -> Self {
        Self { kernel, namespaces }
    }

    async fn apply(&self, conn: &Connection, mechanism: &KernelMechanism) -> Result<()> {
        let ns = open_target(self.namespaces.as_ref(), mechanism)?;
        let link = mechanism.interface_name(&conn.id);
        self.kernel
            .link_set_up(&ns, &link)
            .await
            .map_err(|e| e.context(format!("set {link} up")))?;

        let mtu = conn.context.mtu;
        if mtu == 0 {
            return Ok(());
        }
        self.kernel
            .link_set_mtu(&ns, &link, mtu)
            .await
            .map_err(|e| e.context(format!("set mtu {mtu} on {link}")))?;
        debug!(conn_id = %conn.id, link, mtu, "mtu set");
        Ok(())
    }
}

#[async_trait]
impl NetworkService for MtuService {
    async fn request(&self, conn: Connection, next: Next<'_>) -> Result<Connection> {
        let conn = next.request(conn).await?;
        if let Some(mechanism) = conn.untagged_kernel()
            && let Err(err) = self.apply(&conn, mechanism).await
        {
            warn!(conn_id = %conn.id, error = %err, "setting mtu failed, closing");
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
    use netservice::{Chain, Mechanism};

    use super::*;
    use crate::kernel::fake::FakeKernel;

    #[tokio::test]
    async fn mtu_is_applied_when_set() {
        let kernel = Arc::new(FakeKernel::new());
        let url = kernel.add_namespace("pod");
        let ns = kernel.netns(&url);
        kernel.add_link(&ns, "nsm-1");
        let chain = Chain::new(vec![
            Arc::new(MtuService::new(kernel.clone(), kernel.clone())) as Arc<dyn NetworkService>,
        ]);

        let mut conn = Connection::new("conn-1");
        conn.mechanism = Some(Mechanism::Kernel(KernelMechanism {
            netns_url: url.clone(),
            interface_name: "nsm-1".into(),
            ..KernelMechanism::default()
        }));
        chain.handle_request(conn.clone()).await.unwrap();
        let link = kernel.link(&ns, "nsm-1").unwrap();
        assert!(link.up);
        assert_eq!(link.mtu, 1500);

        conn.context.mtu = 1446;
        chain.handle_request(conn).await.unwrap();
        assert_eq!(kernel.link(&ns, "nsm-1").unwrap().mtu, 1446);
    }
}
