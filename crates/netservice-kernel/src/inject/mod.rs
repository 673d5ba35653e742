//! Moving virtual functions into connection namespaces and back.

mod refs;

use std::sync::Arc;

use async_trait::async_trait;
use netservice::{
    Connection, KernelMechanism, MAX_INTERFACE_NAME_LEN, NetworkService, Next, Result, VfConfig,
    join_close,
};
use tracing::{debug, info, warn};

pub use refs::{DeviceKey, DeviceRefs};

use crate::error::KernelError;
use crate::kernel::KernelOps;
use crate::netns::{NamespaceSwitch, Netns, NetnsId, open_target};

/// Moves a connection's VF into its namespace and back, once per device no
/// matter how many connections share it.
#[derive(Clone)]
pub struct InterfaceMover {
    kernel: Arc<dyn KernelOps>,
    namespaces: Arc<dyn NamespaceSwitch>,
    refs: Arc<DeviceRefs>,
}

impl InterfaceMover {
    pub fn new(
        kernel: Arc<dyn KernelOps>,
        namespaces: Arc<dyn NamespaceSwitch>,
        refs: Arc<DeviceRefs>,
    ) -> Self {
        Self {
            kernel,
            namespaces,
            refs,
        }
    }

    pub async fn move_in(&self, conn: &Connection) -> Result<()> {
        let Some((mechanism, vf)) = vf_mechanism(conn) else {
            return Ok(());
        };
        let key = DeviceKey::for_vf(vf);
        let desired = mechanism.interface_name(&conn.id);

        let mut state = self.refs.lock().await;
        if state.holds(&conn.id) {
            debug!(conn_id = %conn.id, device = %key, "device already held");
            return Ok(());
        }
        if state.count(&key) == 0 {
            let host = self
                .namespaces
                .current()
                .map_err(|e| e.context("open forwarder namespace"))?;
            let target = open_target(self.namespaces.as_ref(), mechanism)?;
            self.move_device_in(&host, &target, vf, &desired).await?;
        }
        let count = state.acquire(&conn.id, key.clone());
        info!(conn_id = %conn.id, device = %key, link = %desired, count, "device held");
        Ok(())
    }

    pub async fn move_out(&self, conn: &Connection) -> Result<()> {
        let Some((mechanism, vf)) = vf_mechanism(conn) else {
            return Ok(());
        };
        let key = DeviceKey::for_vf(vf);
        let desired = mechanism.interface_name(&conn.id);

        let mut state = self.refs.lock().await;
        match state.release(&conn.id) {
            Some((key, left)) if left > 0 => {
                info!(conn_id = %conn.id, device = %key, count = left, "device still held");
                return Ok(());
            }
            Some(_) => {}
            None if state.count(&key) > 0 => {
                debug!(conn_id = %conn.id, device = %key, "connection never held the device");
                return Ok(());
            }
            // Unknown to this process, possibly moved in by a previous one.
            None => {}
        }

        match self.move_device_out(mechanism, vf, &desired).await {
            Err(e) if e.is_gone() => {
                warn!(conn_id = %conn.id, device = %key, error = %e, "device already gone");
                Ok(())
            }
            Err(e) => Err(e.context(format!("move {desired} back to the host"))),
            Ok(()) => {
                info!(conn_id = %conn.id, device = %key, link = %vf.vf_interface_name, "device returned to host");
                Ok(())
            }
        }
    }

    async fn move_device_in(
        &self,
        host: &Netns,
        target: &Netns,
        vf: &VfConfig,
        desired: &str,
    ) -> Result<()> {
        let host_name = self.host_name(vf).await;
        let in_host = present(self.kernel.link_by_name(host, &host_name).await)?;
        let in_target = present(self.kernel.link_by_name(target, desired).await)?;

        match (in_host, in_target) {
            (false, true) => {
                debug!(link = desired, netns = %target, "device already in place");
                return Ok(());
            }
            (true, true) => self.remove_orphan(host, target, desired).await?,
            (false, false) => {
                return Err(KernelError::LinkNotFound { name: host_name }.into());
            }
            (true, false) => {}
        }

        self.kernel
            .link_set_netns(host, &host_name, target)
            .await
            .map_err(|e| e.context(format!("move {host_name} into {target}")))?;
        if host_name != desired {
            self.kernel
                .link_rename(target, &host_name, desired)
                .await
                .map_err(|e| e.context(format!("rename {host_name} to {desired}")))?;
        }
        self.kernel
            .link_set_up(target, desired)
            .await
            .map_err(|e| e.context(format!("set {desired} up")))?;
        info!(device = %host_name, link = desired, netns = %target, "device moved in");
        Ok(())
    }

    async fn move_device_out(
        &self,
        mechanism: &KernelMechanism,
        vf: &VfConfig,
        desired: &str,
    ) -> crate::error::Result<()> {
        let target = self.namespaces.from_url(&mechanism.netns_url)?;
        let host = self.namespaces.current()?;
        self.kernel.link_by_name(&target, desired).await?;

        let original = vf.vf_interface_name.as_str();
        if original != desired {
            self.kernel.link_rename(&target, desired, original).await?;
        }
        self.kernel.link_set_netns(&target, original, &host).await
    }

    /// Host-side name of the VF. A VF no longer visible under its PCI
    /// address is looked up by its configured name.
    async fn host_name(&self, vf: &VfConfig) -> String {
        if let Some(pci) = vf.pci_address.as_deref().filter(|pci| !pci.is_empty()) {
            match self.kernel.pci_interface_name(pci).await {
                Ok(name) => return name,
                Err(e) => debug!(pci, error = %e, "no host interface for PCI address"),
            }
        }
        vf.vf_interface_name.clone()
    }

    /// The target already has a link under the desired name while the host
    /// still has the device: the target copy is left over from an earlier
    /// attempt. Park it under a temporary name, bring it home and delete it.
    async fn remove_orphan(&self, host: &Netns, target: &Netns, desired: &str) -> Result<()> {
        let temp = orphan_name(target.id(), desired);
        warn!(link = desired, temp = %temp, netns = %target, "removing orphaned link");
        self.kernel
            .link_rename(target, desired, &temp)
            .await
            .map_err(|e| e.context(format!("rename orphan {desired}")))?;
        self.kernel
            .link_set_netns(target, &temp, host)
            .await
            .map_err(|e| e.context(format!("move orphan {temp} to the host")))?;
        self.kernel
            .link_delete(host, &temp)
            .await
            .map_err(|e| e.context(format!("delete orphan {temp}")))
    }
}

fn vf_mechanism(conn: &Connection) -> Option<(&KernelMechanism, &VfConfig)> {
    let mechanism = conn.kernel()?;
    Some((mechanism, mechanism.vf.as_ref()?))
}

/// Whether a lookup found the link. Only "not found" means absent.
fn present<T>(lookup: crate::error::Result<T>) -> Result<bool> {
    match lookup {
        Ok(_) => Ok(true),
        Err(e) if e.is_link_not_found() => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Temporary name for an orphaned link: `nsm` and the low 24 bits of the
/// namespace inode, then the tail of the link name.
fn orphan_name(netns: NetnsId, name: &str) -> String {
    let prefix = format!("nsm{:06x}-", netns.ino & 0xff_ffff);
    let room = MAX_INTERFACE_NAME_LEN.saturating_sub(prefix.len());
    let skip = name.chars().count().saturating_sub(room);
    let suffix: String = name.chars().skip(skip).collect();
    netservice::truncate_interface_name(&format!("{prefix}{suffix}"))
}

/// Chain element that moves the VF in before the rest of the chain
/// configures it, and back out after the rest of the chain has closed.
pub struct InjectService {
    mover: InterfaceMover,
}

impl InjectService {
    pub fn new(
        kernel: Arc<dyn KernelOps>,
        namespaces: Arc<dyn NamespaceSwitch>,
        refs: Arc<DeviceRefs>,
    ) -> Self {
        Self {
            mover: InterfaceMover::new(kernel, namespaces, refs),
        }
    }
}

#[async_trait]
impl NetworkService for InjectService {
    async fn request(&self, conn: Connection, next: Next<'_>) -> Result<Connection> {
        self.mover.move_in(&conn).await?;
        match next.request(conn.clone()).await {
            Ok(conn) => Ok(conn),
            Err(err) => {
                let close = self.mover.move_out(&conn).await;
                Err(err.with_close(close))
            }
        }
    }

    async fn close(&self, conn: &Connection, next: Next<'_>) -> Result<()> {
        let downstream = next.close(conn).await;
        join_close(self.mover.move_out(conn).await, downstream)
    }
}
