use std::collections::{BTreeMap, BTreeSet, HashMap};

use netservice::PolicyRoute;
use tokio::sync::Mutex;

use crate::kernel::RuleSpec;
use crate::netns::NetnsId;

/// A policy as installed: what was asked for and the rule that selects
/// its table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledPolicy {
    pub policy: PolicyRoute,
    pub rule: RuleSpec,
}

/// Tables owned by one connection inside one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PolicyRecord {
    pub netns: NetnsId,
    pub tables: BTreeMap<u32, InstalledPolicy>,
}

/// Per-connection allocation records, keyed by connection ID.
///
/// Requests and Closes of one connection are serialized by the caller, so
/// callers may read a record, work on the kernel, and write entries back.
#[derive(Debug, Default)]
pub struct PolicyTables {
    records: Mutex<HashMap<String, PolicyRecord>>,
}

impl PolicyTables {
    pub async fn get(&self, conn_id: &str) -> Option<PolicyRecord> {
        self.records.lock().await.get(conn_id).cloned()
    }

    pub async fn contains(&self, conn_id: &str) -> bool {
        self.records.lock().await.contains_key(conn_id)
    }

    /// Create an empty record unless one exists.
    pub async fn load_or_create(&self, conn_id: &str, netns: NetnsId) {
        self.records
            .lock()
            .await
            .entry(conn_id.to_string())
            .or_insert_with(|| PolicyRecord {
                netns,
                tables: BTreeMap::new(),
            });
    }

    pub async fn insert(&self, conn_id: &str, table: u32, installed: InstalledPolicy) {
        if let Some(record) = self.records.lock().await.get_mut(conn_id) {
            record.tables.insert(table, installed);
        }
    }

    pub async fn remove_entry(&self, conn_id: &str, table: u32) {
        if let Some(record) = self.records.lock().await.get_mut(conn_id) {
            record.tables.remove(&table);
        }
    }

    pub async fn take(&self, conn_id: &str) -> Option<PolicyRecord> {
        self.records.lock().await.remove(conn_id)
    }

    #[cfg(test)]
    pub(crate) async fn connection_count(&self) -> usize {
        self.records.lock().await.len()
    }
}

/// Claims on (namespace, table ID) pairs.
///
/// A claim is taken before a table is populated and released when the
/// table is removed. Claims are what keeps two connections from picking the
/// same table between scanning the kernel and installing their routes.
#[derive(Debug, Default)]
pub struct TableReservations {
    owners: Mutex<HashMap<(NetnsId, u32), String>>,
}

impl TableReservations {
    /// Claim `table` in `netns` for `conn_id` unless somebody else holds
    /// it. Returns whether `conn_id` owns the claim afterwards.
    pub async fn claim(&self, netns: NetnsId, table: u32, conn_id: &str) -> bool {
        let mut owners = self.owners.lock().await;
        let owner = owners
            .entry((netns, table))
            .or_insert_with(|| conn_id.to_string());
        owner.as_str() == conn_id
    }

    pub async fn release(&self, netns: NetnsId, table: u32) {
        self.owners.lock().await.remove(&(netns, table));
    }

    /// Tables claimed in `netns` by anyone.
    pub async fn reserved(&self, netns: NetnsId) -> BTreeSet<u32> {
        self.owners
            .lock()
            .await
            .keys()
            .filter(|(ns, _)| *ns == netns)
            .map(|(_, table)| *table)
            .collect()
    }

    /// Tables claimed in `netns` by connections other than `conn_id`.
    pub async fn held_by_others(&self, netns: NetnsId, conn_id: &str) -> BTreeSet<u32> {
        self.owners
            .lock()
            .await
            .iter()
            .filter(|((ns, _), owner)| *ns == netns && owner.as_str() != conn_id)
            .map(|((_, table), _)| *table)
            .collect()
    }

    #[cfg(test)]
    pub(crate) async fn owner(&self, netns: NetnsId, table: u32) -> Option<String> {
        self.owners.lock().await.get(&(netns, table)).cloned()
    }
}
