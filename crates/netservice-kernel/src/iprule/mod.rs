//! Policy routing: per-connection routing tables selected by `ip rule`.
//!
//! Every policy a connection asks for gets its own table in the target
//! namespace, populated with the policy's routes and selected by a rule on
//! the policy's source network, protocol and ports.

mod allocator;
mod policy;
mod tables;

use std::sync::Arc;

use async_trait::async_trait;
use netservice::{Connection, KernelMechanism, NetworkService, Next, Result, join_close};
use tracing::{debug, warn};

pub use allocator::PolicyTableAllocator;
pub use policy::PolicyKey;
pub use tables::{InstalledPolicy, PolicyRecord, PolicyTables, TableReservations};

use crate::kernel::KernelOps;
use crate::netns::{NamespaceSwitch, Netns, open_target};

/// Chain element that installs a connection's policy routes after the rest
/// of the chain has set the interface up.
pub struct IpRuleService {
    allocator: PolicyTableAllocator,
    namespaces: Arc<dyn NamespaceSwitch>,
}

impl IpRuleService {
    pub fn new(
        kernel: Arc<dyn KernelOps>,
        namespaces: Arc<dyn NamespaceSwitch>,
        tables: Arc<PolicyTables>,
        reservations: Arc<TableReservations>,
    ) -> Self {
        Self {
            allocator: PolicyTableAllocator::new(kernel, tables, reservations),
            namespaces,
        }
    }

    async fn apply(&self, conn: &Connection, mechanism: &KernelMechanism) -> Result<()> {
        let policies = &conn.ip_context().policies;
        let ns = open_target(self.namespaces.as_ref(), mechanism)?;
        let link = mechanism.interface_name(&conn.id);

        self.allocator.recover(&conn.id, &ns, &link, policies).await?;
        self.allocator.reconcile(&conn.id, &ns, &link, policies).await
    }

    async fn remove(&self, conn: &Connection, mechanism: &KernelMechanism) -> Result<()> {
        let link = mechanism.interface_name(&conn.id);
        let ns: Option<Netns> = match self.namespaces.from_url(&mechanism.netns_url) {
            Ok(ns) => Some(ns),
            Err(e) if e.is_namespace_gone() => {
                debug!(conn_id = %conn.id, error = %e, "namespace already gone");
                None
            }
            Err(e) => {
                // The tables cannot be reached; keep the record so a later
                // Close can retry.
                return Err(e.context(format!("open namespace {}", mechanism.netns_url)));
            }
        };
        self.allocator.teardown(&conn.id, ns.as_ref(), &link).await
    }
}

#[async_trait]
impl NetworkService for IpRuleService {
    async fn request(&self, conn: Connection, next: Next<'_>) -> Result<Connection> {
        let conn = next.request(conn).await?;
        if let Some(mechanism) = conn.untagged_kernel()
            && let Err(err) = self.apply(&conn, mechanism).await
        {
            warn!(conn_id = %conn.id, error = %err, "policy routing failed, closing");
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
        if let Err(e) = &own {
            warn!(conn_id = %conn.id, error = %e, "failed to remove policy routes");
        }
        join_close(own, next.close(conn).await)
    }
}
