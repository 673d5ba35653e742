use std::fmt;
use std::io;
use std::path::PathBuf;

use crate::command::CommandError;

/// Errors from the kernel network API and namespace handling.
#[derive(Debug, thiserror::Error)]
pub enum KernelError {
    #[error(transparent)]
    Command(#[from] CommandError),

    #[error("link {name} not found")]
    LinkNotFound { name: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("{what} already exists")]
    Exists { what: String },

    #[error("network namespace {} is gone: {source}", path.display())]
    NamespaceGone { path: PathBuf, source: io::Error },

    #[error("network namespace {}: {source}", path.display())]
    Netns { path: PathBuf, source: io::Error },

    #[error("invalid namespace locator {url:?}: {reason}")]
    BadLocator { url: String, reason: String },

    #[error("failed to parse kernel output: {0}")]
    Parse(String),

    #[error("no free routing table left")]
    TablesExhausted,

    #[error("namespace worker: {0}")]
    Thread(String),

    #[error("{primary}; restoring namespace failed: {restore}")]
    Restore {
        primary: Box<KernelError>,
        restore: Box<KernelError>,
    },
}

impl KernelError {
    /// The object the operation targeted no longer exists: a missing link,
    /// a missing rule or route, or a namespace whose handle went stale.
    pub fn is_gone(&self) -> bool {
        match self {
            Self::LinkNotFound { .. } | Self::NotFound { .. } | Self::NamespaceGone { .. } => true,
            Self::Restore { primary, .. } => primary.is_gone(),
            _ => false,
        }
    }

    pub fn is_link_not_found(&self) -> bool {
        match self {
            Self::LinkNotFound { .. } => true,
            Self::Restore { primary, .. } => primary.is_link_not_found(),
            _ => false,
        }
    }

    pub fn is_namespace_gone(&self) -> bool {
        match self {
            Self::NamespaceGone { .. } => true,
            Self::Restore { primary, .. } => primary.is_namespace_gone(),
            _ => false,
        }
    }

    /// Classify an I/O error from opening or entering a namespace.
    /// `ENOENT` and `EBADF` mean the namespace was torn down underneath us.
    pub fn from_netns_io(path: impl Into<PathBuf>, source: io::Error) -> Self {
        let path = path.into();
        match source.raw_os_error() {
            Some(code) if code == nix::errno::Errno::ENOENT as i32 => {
                Self::NamespaceGone { path, source }
            }
            Some(code) if code == nix::errno::Errno::EBADF as i32 => {
                Self::NamespaceGone { path, source }
            }
            _ => Self::Netns { path, source },
        }
    }

    /// Convert into the chain error, prefixing what was being attempted.
    pub fn context(self, what: impl fmt::Display) -> netservice::Error {
        match self {
            Self::LinkNotFound { name } => netservice::Error::MissingLink(name),
            e @ (Self::NamespaceGone { .. } | Self::Netns { .. } | Self::BadLocator { .. }) => {
                netservice::Error::Namespace(format!("{what}: {e}"))
            }
            e => netservice::Error::Kernel(format!("{what}: {e}")),
        }
    }
}

impl From<KernelError> for netservice::Error {
    fn from(e: KernelError) -> Self {
        match e {
            KernelError::LinkNotFound { name } => Self::MissingLink(name),
            e @ (KernelError::NamespaceGone { .. }
            | KernelError::Netns { .. }
            | KernelError::BadLocator { .. }) => Self::Namespace(e.to_string()),
            e => Self::Kernel(e.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, KernelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enoent_and_ebadf_mean_namespace_gone() {
        let gone = KernelError::from_netns_io(
            "/proc/1/ns/net",
            io::Error::from_raw_os_error(nix::errno::Errno::ENOENT as i32),
        );
        assert!(gone.is_gone());
        assert!(gone.is_namespace_gone());

        let stale = KernelError::from_netns_io(
            "/proc/1/ns/net",
            io::Error::from_raw_os_error(nix::errno::Errno::EBADF as i32),
        );
        assert!(stale.is_namespace_gone());

        let denied = KernelError::from_netns_io(
            "/proc/1/ns/net",
            io::Error::from_raw_os_error(nix::errno::Errno::EACCES as i32),
        );
        assert!(!denied.is_gone());
    }

    #[test]
    fn restore_failure_keeps_primary_classification() {
        let err = KernelError::Restore {
            primary: Box::new(KernelError::LinkNotFound {
                name: "eth0".into(),
            }),
            restore: Box::new(KernelError::Thread("boom".into())),
        };
        assert!(err.is_link_not_found());
        assert!(err.to_string().contains("restoring namespace failed"));
    }

    #[test]
    fn context_maps_missing_link() {
        let err = KernelError::LinkNotFound {
            name: "nsm-1".into(),
        }
        .context("set mtu");
        assert!(matches!(err, netservice::Error::MissingLink(name) if name == "nsm-1"));

        let err = KernelError::Parse("bad json".into()).context("list routes");
        assert_eq!(
            err.to_string(),
            "kernel operation failed: list routes: failed to parse kernel output: bad json"
        );
    }
}
