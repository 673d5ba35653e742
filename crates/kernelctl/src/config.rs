use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use netservice::{Connection, Side};
use serde::{Deserialize, Serialize};

use crate::error::{KernelctlError, KernelctlResult};

pub(crate) const DEFAULT_ADDRESS_TIMEOUT_MS: u64 = 5000;
pub(crate) const DEFAULT_LIVENESS_TIMEOUT_MS: u64 = 200;
pub(crate) const DEFAULT_RECONCILE_INTERVAL_SECS: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SideConfig {
    #[default]
    Server,
    Client,
}

impl From<SideConfig> for Side {
    fn from(side: SideConfig) -> Self {
        match side {
            SideConfig::Server => Side::Server,
            SideConfig::Client => Side::Client,
        }
    }
}

#[derive(Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KernelctlConfig {
    pub side: SideConfig,
    pub ip_binary: PathBuf,
    pub ping_binary: PathBuf,
    pub address_timeout_ms: u64,
    pub liveness_timeout_ms: u64,
    pub reconcile_interval_secs: u64,
    /// Move VFs named by the connections into their namespaces.
    pub host_device_move: bool,
}

impl Default for KernelctlConfig {
    fn default() -> Self {
        Self {
            side: SideConfig::default(),
            ip_binary: PathBuf::from("ip"),
            ping_binary: PathBuf::from("ping"),
            address_timeout_ms: DEFAULT_ADDRESS_TIMEOUT_MS,
            liveness_timeout_ms: DEFAULT_LIVENESS_TIMEOUT_MS,
            reconcile_interval_secs: DEFAULT_RECONCILE_INTERVAL_SECS,
            host_device_move: false,
        }
    }
}

impl KernelctlConfig {
    pub fn address_timeout(&self) -> Duration {
        Duration::from_millis(self.address_timeout_ms)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    /// Resolve relative binary paths against `config_dir`. Bare names are
    /// left for a `PATH` lookup.
    fn resolve_relative_paths(&mut self, config_dir: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() && p.components().count() > 1 {
                *p = config_dir.join(&*p);
            }
        };
        resolve(&mut self.ip_binary);
        resolve(&mut self.ping_binary);
    }

    fn validate(&self) -> KernelctlResult<()> {
        if self.address_timeout_ms == 0 {
            return Err(KernelctlError::Config(
                "address_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.liveness_timeout_ms == 0 {
            return Err(KernelctlError::Config(
                "liveness_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.reconcile_interval_secs == 0 {
            return Err(KernelctlError::Config(
                "reconcile_interval_secs must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Load and validate a kernelctl config from a YAML file.
///
/// Relative paths in the config are resolved against the config file's parent directory.
pub async fn load(path: &Path) -> KernelctlResult<KernelctlConfig> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| KernelctlError::Config(format!("read {}: {e}", path.display())))?;
    let mut config: KernelctlConfig = serde_yaml_ng::from_str(&content)
        .map_err(|e| KernelctlError::Config(format!("parse {}: {e}", path.display())))?;
    if let Some(config_dir) = path.parent() {
        config.resolve_relative_paths(config_dir);
    }
    config.validate()?;
    Ok(config)
}

#[derive(Debug, Default, Deserialize)]
struct ConnectionsFile {
    #[serde(default)]
    connections: Vec<Connection>,
}

/// Load the desired connections. IDs must be unique.
pub async fn load_connections(path: &Path) -> KernelctlResult<Vec<Connection>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| KernelctlError::Config(format!("read {}: {e}", path.display())))?;
    let file: ConnectionsFile = serde_yaml_ng::from_str(&content)
        .map_err(|e| KernelctlError::Config(format!("parse {}: {e}", path.display())))?;

    let mut seen = HashSet::new();
    for conn in &file.connections {
        if conn.id.is_empty() {
            return Err(KernelctlError::Config(format!(
                "{}: connection without id",
                path.display()
            )));
        }
        if !seen.insert(conn.id.as_str()) {
            return Err(KernelctlError::Config(format!(
                "{}: duplicate connection id {}",
                path.display(),
                conn.id
            )));
        }
    }
    Ok(file.connections)
}

#[cfg(test)]
mod tests {
    use netservice::Mechanism;

    use super::*;

    #[tokio::test]
    async fn load_full_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernelctl.yaml");
        tokio::fs::write(
            &path,
            "side: client\n\
             ip_binary: bin/ip\n\
             ping_binary: /usr/bin/ping\n\
             address_timeout_ms: 1000\n\
             liveness_timeout_ms: 300\n\
             reconcile_interval_secs: 5\n\
             host_device_move: true\n",
        )
        .await
        .unwrap();

        let config = load(&path).await.unwrap();
        assert_eq!(config.side, SideConfig::Client);
        assert_eq!(config.ip_binary, dir.path().join("bin/ip"));
        assert_eq!(config.ping_binary, PathBuf::from("/usr/bin/ping"));
        assert_eq!(config.address_timeout(), Duration::from_secs(1));
        assert_eq!(config.liveness_timeout(), Duration::from_millis(300));
        assert_eq!(config.reconcile_interval(), Duration::from_secs(5));
        assert!(config.host_device_move);
    }

    #[tokio::test]
    async fn missing_fields_use_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernelctl.yaml");
        tokio::fs::write(&path, "side: server\n").await.unwrap();

        let config = load(&path).await.unwrap();
        assert_eq!(config, KernelctlConfig::default());
        assert_eq!(config.ip_binary, PathBuf::from("ip"));
    }

    #[tokio::test]
    async fn zero_interval_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernelctl.yaml");
        tokio::fs::write(&path, "reconcile_interval_secs: 0\n")
            .await
            .unwrap();

        let err = load(&path).await.unwrap_err();
        assert!(err.to_string().contains("reconcile_interval_secs"), "{err}");
    }

    #[tokio::test]
    async fn unknown_side_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kernelctl.yaml");
        tokio::fs::write(&path, "side: sideways\n").await.unwrap();
        assert!(matches!(load(&path).await, Err(KernelctlError::Config(_))));
    }

    #[tokio::test]
    async fn load_connections_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.yaml");
        tokio::fs::write(
            &path,
            r#"
connections:
  - id: conn-1
    mechanism:
      type: kernel
      netns_url: file:///var/run/netns/pod
      interface_name: nsm-1
    context:
      mtu: 1446
      ip_context:
        src_ip_addrs: ["172.16.1.1/32"]
        dst_ip_addrs: ["172.16.1.2/32"]
        policies:
          - from: 172.16.1.1/32
            proto: "6"
            dst_port: "443"
  - id: conn-2
"#,
        )
        .await
        .unwrap();

        let connections = load_connections(&path).await.unwrap();
        assert_eq!(connections.len(), 2);
        assert!(matches!(connections[0].mechanism, Some(Mechanism::Kernel(_))));
        assert_eq!(connections[0].context.mtu, 1446);
        assert_eq!(connections[0].ip_context().policies[0].dst_port, "443");
        assert!(connections[1].mechanism.is_none());
    }

    #[tokio::test]
    async fn duplicate_connection_ids_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("connections.yaml");
        tokio::fs::write(&path, "connections:\n  - id: a\n  - id: a\n")
            .await
            .unwrap();
        let err = load_connections(&path).await.unwrap_err();
        assert!(err.to_string().contains("duplicate connection id a"), "{err}");
    }
}
