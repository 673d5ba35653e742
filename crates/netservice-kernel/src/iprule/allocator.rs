use std::collections::BTreeSet;
use std::sync::Arc;

use netservice::{Error, PolicyRoute, Result};
use tracing::{debug, info, warn};

use super::policy::{self, PolicyKey};
use super::tables::{InstalledPolicy, PolicyTables, TableReservations};
use crate::error::KernelError;
use crate::kernel::{
    KernelOps, RuleSpec, TABLE_DEFAULT, TABLE_LOCAL, TABLE_MAIN, TABLE_UNSPEC,
};
use crate::netns::{Netns, NetnsId};

/// Tables the kernel reserves for itself.
const SYSTEM_TABLES: [u32; 4] = [TABLE_UNSPEC, TABLE_DEFAULT, TABLE_MAIN, TABLE_LOCAL];

/// Assigns routing tables to a connection's policy routes and keeps the
/// kernel's rules and routes in line with the policies asked for.
#[derive(Clone)]
pub struct PolicyTableAllocator {
    kernel: Arc<dyn KernelOps>,
    tables: Arc<PolicyTables>,
    reservations: Arc<TableReservations>,
}

impl PolicyTableAllocator {
    pub fn new(
        kernel: Arc<dyn KernelOps>,
        tables: Arc<PolicyTables>,
        reservations: Arc<TableReservations>,
    ) -> Self {
        Self {
            kernel,
            tables,
            reservations,
        }
    }

    /// Bring the connection's installed policies in line with `desired`.
    ///
    /// Every policy to add is parsed before the kernel is touched. Each
    /// table is recorded before it is populated, so a Close after a failure
    /// part way through still finds and removes it.
    pub async fn reconcile(
        &self,
        conn_id: &str,
        ns: &Netns,
        link: &str,
        desired: &[PolicyRoute],
    ) -> Result<()> {
        let record = self.tables.get(conn_id).await;
        if record.is_none() && desired.is_empty() {
            return Ok(());
        }

        let installed = record.map(|r| r.tables).unwrap_or_default();
        let (to_add, to_remove) = policy::diff(&installed, desired);
        let to_add = to_add
            .into_iter()
            .map(|p| policy::selector(p).map(|selector| (p, selector)))
            .collect::<Result<Vec<_>>>()?;

        if to_add.is_empty() && to_remove.is_empty() {
            return Ok(());
        }
        self.tables.load_or_create(conn_id, ns.id()).await;

        self.kernel
            .link_by_name(ns, link)
            .await
            .map_err(|e| e.context(format!("look up link {link} in {ns}")))?;

        for (table, installed) in to_remove {
            self.remove_table(ns, link, table, &installed.rule).await?;
            self.tables.remove_entry(conn_id, table).await;
            info!(conn_id, table, policy = ?PolicyKey::from(&installed.policy), "policy removed");
        }

        for (policy, selector) in to_add {
            let table = self.allocate(conn_id, ns.id(), ns).await?;
            let rule = RuleSpec { table, ..selector };
            let routes = match policy::table_routes(policy, &rule, link, table) {
                Ok(routes) => routes,
                Err(e) => {
                    self.reservations.release(ns.id(), table).await;
                    return Err(e);
                }
            };

            self.tables
                .insert(conn_id, table, InstalledPolicy {
                    policy: policy.clone(),
                    rule: rule.clone(),
                })
                .await;

            for route in &routes {
                self.kernel
                    .route_replace(ns, route)
                    .await
                    .map_err(|e| e.context(format!("add route {} to table {table}", route.dst)))?;
                debug!(conn_id, table, dst = %route.dst, gateway = ?route.gateway, link, "route replaced");
            }
            self.kernel
                .rule_add(ns, &rule)
                .await
                .map_err(|e| e.context(format!("add rule for table {table}")))?;
            info!(conn_id, table, policy = ?PolicyKey::from(policy), netns = %ns, "policy installed");
        }
        Ok(())
    }

    /// Remove every table the connection owns, then forget the connection.
    ///
    /// Every table is attempted even when one fails. `ns` is `None` when
    /// the namespace has already been destroyed, which took the tables with
    /// it; only the bookkeeping is dropped then.
    pub async fn teardown(&self, conn_id: &str, ns: Option<&Netns>, link: &str) -> Result<()> {
        let Some(record) = self.tables.take(conn_id).await else {
            return Ok(());
        };

        let Some(ns) = ns else {
            for table in record.tables.keys() {
                self.reservations.release(record.netns, *table).await;
            }
            info!(conn_id, tables = record.tables.len(), "namespace gone, dropped policy tables");
            return Ok(());
        };

        let mut failures = Vec::new();
        for (table, installed) in &record.tables {
            match self.remove_table(ns, link, *table, &installed.rule).await {
                Ok(()) => debug!(conn_id, table, "policy table removed"),
                Err(e) => {
                    warn!(conn_id, table, error = %e, "failed to remove policy table");
                    self.reservations.release(record.netns, *table).await;
                    failures.push(e.to_string());
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(Error::Teardown(failures))
        }
    }

    /// Clear rules left behind for `desired` by an earlier incarnation of
    /// this process.
    ///
    /// Runs only when nothing is known about the connection. Rules pointing
    /// at a table another live connection holds are left alone. A matching
    /// rule that is the only user of its table takes the table's routes
    /// with it; a rule sharing its table with other rules is removed alone.
    pub async fn recover(
        &self,
        conn_id: &str,
        ns: &Netns,
        link: &str,
        desired: &[PolicyRoute],
    ) -> Result<()> {
        if desired.is_empty() || self.tables.contains(conn_id).await {
            return Ok(());
        }

        let selectors = desired
            .iter()
            .map(policy::selector)
            .collect::<Result<Vec<_>>>()?;
        let mut rules = self
            .kernel
            .rule_list(ns)
            .await
            .map_err(|e| e.context(format!("list rules in {ns}")))?;
        let held = self.reservations.held_by_others(ns.id(), conn_id).await;

        for selector in &selectors {
            let Some(position) = rules.iter().position(|r| {
                r.same_selector(selector)
                    && !SYSTEM_TABLES.contains(&r.table)
                    && !held.contains(&r.table)
            }) else {
                continue;
            };
            let stale = rules.remove(position);
            let shared = rules.iter().any(|r| r.table == stale.table);

            delete_rule(self.kernel.as_ref(), ns, &stale).await?;
            if !shared {
                self.flush_table(ns, link, stale.table).await?;
            }
            info!(conn_id, table = stale.table, shared, netns = %ns, "recovered stale policy rule");
        }
        Ok(())
    }

    /// Smallest table ID not in use in the namespace and not claimed by
    /// another connection, claimed for `conn_id`.
    async fn allocate(&self, conn_id: &str, netns: NetnsId, ns: &Netns) -> Result<u32> {
        loop {
            let mut used: BTreeSet<u32> = self
                .kernel
                .route_list(ns, None)
                .await
                .map_err(|e| e.context(format!("list routing tables in {ns}")))?
                .into_iter()
                .map(|route| route.table)
                .collect();
            used.extend(SYSTEM_TABLES);
            used.extend(self.reservations.reserved(netns).await);

            let candidate = first_free(&used).ok_or_else(|| KernelError::TablesExhausted.context(ns))?;
            if self.reservations.claim(netns, candidate, conn_id).await {
                debug!(conn_id, table = candidate, "table claimed");
                return Ok(candidate);
            }
            debug!(conn_id, table = candidate, "table claimed concurrently, retrying");
        }
    }

    async fn remove_table(&self, ns: &Netns, link: &str, table: u32, rule: &RuleSpec) -> Result<()> {
        delete_rule(self.kernel.as_ref(), ns, rule).await?;
        self.flush_table(ns, link, table).await?;
        self.reservations.release(ns.id(), table).await;
        Ok(())
    }

    /// Delete every route of `table` that goes through `link`.
    async fn flush_table(&self, ns: &Netns, link: &str, table: u32) -> Result<()> {
        let routes = self
            .kernel
            .route_list(ns, Some(table))
            .await
            .map_err(|e| e.context(format!("list routes of table {table}")))?;
        for route in routes.iter().filter(|r| r.link.as_deref() == Some(link)) {
            match self.kernel.route_delete(ns, route).await {
                Ok(()) => debug!(table, dst = %route.dst, link, "route deleted"),
                Err(e) if e.is_gone() => debug!(table, dst = %route.dst, "route already gone"),
                Err(e) => {
                    return Err(e.context(format!("delete route {} from table {table}", route.dst)));
                }
            }
        }
        Ok(())
    }
}

async fn delete_rule(kernel: &dyn KernelOps, ns: &Netns, rule: &RuleSpec) -> Result<()> {
    match kernel.rule_delete(ns, rule).await {
        Ok(()) => Ok(()),
        Err(e) if e.is_gone() => {
            debug!(table = rule.table, "rule already gone");
            Ok(())
        }
        Err(e) => Err(e.context(format!("delete rule for table {}", rule.table))),
    }
}

/// Lowest ID missing from `used`.
fn first_free(used: &BTreeSet<u32>) -> Option<u32> {
    let mut candidate = 0u32;
    for id in used {
        if *id == candidate {
            candidate = candidate.checked_add(1)?;
        } else if *id > candidate {
            break;
        }
    }
    Some(candidate)
}
