use std::collections::HashMap;
use std::fmt;

use netservice::VfConfig;
use tokio::sync::{Mutex, MutexGuard};

/// Identity of a physical device shared by connections.
///
/// PCI addresses and interface names live in different variants so a
/// device named like a PCI address can never alias a real one.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DeviceKey {
    Pci(String),
    Name(String),
}

impl DeviceKey {
    /// PCI address when known, else the VF's host interface name.
    pub fn for_vf(vf: &VfConfig) -> Self {
        match vf.pci_address.as_deref() {
            Some(pci) if !pci.is_empty() => Self::Pci(pci.to_string()),
            _ => Self::Name(vf.vf_interface_name.clone()),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pci(pci) => write!(f, "pci:{pci}"),
            Self::Name(name) => write!(f, "{name}"),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct RefState {
    counts: HashMap<DeviceKey, usize>,
    holders: HashMap<String, DeviceKey>,
}

impl RefState {
    pub fn count(&self, key: &DeviceKey) -> usize {
        self.counts.get(key).copied().unwrap_or(0)
    }

    pub fn holds(&self, conn_id: &str) -> bool {
        self.holders.contains_key(conn_id)
    }

    pub fn acquire(&mut self, conn_id: &str, key: DeviceKey) -> usize {
        let count = self.counts.entry(key.clone()).or_insert(0);
        *count += 1;
        let count = *count;
        self.holders.insert(conn_id.to_string(), key);
        count
    }

    /// Drop `conn_id`'s hold on its device. Returns the device and the
    /// number of holders left, or `None` when the connection held nothing.
    pub fn release(&mut self, conn_id: &str) -> Option<(DeviceKey, usize)> {
        let key = self.holders.remove(conn_id)?;
        let left = match self.counts.get_mut(&key) {
            Some(count) if *count > 1 => {
                *count -= 1;
                *count
            }
            _ => {
                self.counts.remove(&key);
                0
            }
        };
        Some((key, left))
    }
}

/// Reference counts of devices moved into connection namespaces.
///
/// One lock covers reading a count, moving the device and writing the
/// count back, so two connections can never both see a device as unheld.
#[derive(Debug, Default)]
pub struct DeviceRefs {
    state: Mutex<RefState>,
}

impl DeviceRefs {
    pub(crate) async fn lock(&self) -> MutexGuard<'_, RefState> {
        self.state.lock().await
    }

    pub async fn count(&self, key: &DeviceKey) -> usize {
        self.state.lock().await.count(key)
    }
}
