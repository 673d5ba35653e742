use std::fmt;
use std::fs::File;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};

use nix::sched::{CloneFlags, setns};
use tokio::sync::oneshot;
use tracing::{debug, warn};
use url::Url;

use crate::error::{KernelError, Result};

/// Namespace file of the calling thread. `/proc/self` would name the
/// thread-group leader, which is not the thread being switched.
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

/// Identity of a network namespace: the nsfs device and inode of its
/// namespace file. Stable for the lifetime of the namespace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NetnsId {
    pub dev: u64,
    pub ino: u64,
}

impl fmt::Display for NetnsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "net:[{}]", self.ino)
    }
}

/// A network namespace reachable through a path on this host.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Netns {
    path: PathBuf,
    id: NetnsId,
}

impl Netns {
    /// Resolve the namespace file at `path`.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let meta = std::fs::metadata(&path).map_err(|e| KernelError::from_netns_io(&path, e))?;
        Ok(Self {
            id: NetnsId {
                dev: meta.dev(),
                ino: meta.ino(),
            },
            path,
        })
    }

    pub fn new(path: impl Into<PathBuf>, id: NetnsId) -> Self {
        Self {
            path: path.into(),
            id,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn id(&self) -> NetnsId {
        self.id
    }
}

impl fmt::Display for Netns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.path.display(), self.id)
    }
}

/// Resolves namespace handles.
pub trait NamespaceSwitch: Send + Sync {
    /// The namespace this process (the forwarder) lives in.
    fn current(&self) -> Result<Netns>;

    /// Resolve a `file://` locator, or `inode://<dev>/<ino>`.
    fn from_url(&self, url: &str) -> Result<Netns>;

    /// Find a namespace by inode number among running processes.
    fn from_inode(&self, ino: u64) -> Result<Netns>;
}

/// Namespace resolution through `/proc`.
#[derive(Debug, Clone, Default)]
pub struct ProcNamespaces;

impl NamespaceSwitch for ProcNamespaces {
    fn current(&self) -> Result<Netns> {
        Netns::open(format!("/proc/{}/ns/net", std::process::id()))
    }

    fn from_url(&self, url: &str) -> Result<Netns> {
        match parse_locator(url)? {
            Locator::Path(path) => Netns::open(path),
            Locator::Inode(ino) => self.from_inode(ino),
        }
    }

    fn from_inode(&self, ino: u64) -> Result<Netns> {
        let entries = std::fs::read_dir("/proc").map_err(|e| KernelError::Netns {
            path: PathBuf::from("/proc"),
            source: e,
        })?;

        let mut fallback = None;
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(pid) = name.to_str() else { continue };
            if !pid.bytes().all(|b| b.is_ascii_digit()) {
                continue;
            }
            let path = entry.path().join("ns/net");
            let Ok(meta) = std::fs::metadata(&path) else {
                continue;
            };
            if meta.ino() != ino {
                continue;
            }
            let id = NetnsId {
                dev: meta.dev(),
                ino,
            };
            // Pod sandboxes keep the namespace alive through their pause
            // process, which outlives the workload containers.
            if is_pause_process(&entry.path()) {
                return Ok(Netns::new(path, id));
            }
            if fallback.is_none() {
                fallback = Some(Netns::new(path, id));
            }
        }

        fallback.ok_or_else(|| KernelError::NamespaceGone {
            path: PathBuf::from(format!("inode://{ino}")),
            source: std::io::Error::from(std::io::ErrorKind::NotFound),
        })
    }
}

/// Open the namespace a kernel mechanism points at.
pub(crate) fn open_target(
    namespaces: &dyn NamespaceSwitch,
    mechanism: &netservice::KernelMechanism,
) -> netservice::Result<Netns> {
    namespaces
        .from_url(&mechanism.netns_url)
        .map_err(|e| e.context(format!("open namespace {}", mechanism.netns_url)))
}

fn is_pause_process(proc_dir: &Path) -> bool {
    std::fs::read(proc_dir.join("cmdline"))
        .map(|cmdline| String::from_utf8_lossy(&cmdline).contains("pause"))
        .unwrap_or(false)
}

#[derive(Debug, PartialEq, Eq)]
enum Locator {
    Path(PathBuf),
    Inode(u64),
}

fn parse_locator(raw: &str) -> Result<Locator> {
    let bad = |reason: String| KernelError::BadLocator {
        url: raw.to_string(),
        reason,
    };
    let url = Url::parse(raw).map_err(|e| bad(e.to_string()))?;
    match url.scheme() {
        "file" => url
            .to_file_path()
            .map(Locator::Path)
            .map_err(|()| bad("not an absolute file path".into())),
        "inode" => url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .and_then(|ino| ino.parse().ok())
            .map(Locator::Inode)
            .ok_or_else(|| bad("expected inode://<dev>/<ino>".into())),
        other => Err(bad(format!("unsupported scheme {other:?}"))),
    }
}

/// Run `f` on a dedicated OS thread that has entered `target`.
///
/// The thread switches back to its original namespace before exiting, on
/// success and on failure. A failed switch-back is reported together with
/// the outcome of `f`.
pub async fn run_in<T, F>(target: &Netns, f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    let path = target.path().to_path_buf();
    let (tx, rx) = oneshot::channel();
    std::thread::Builder::new()
        .name("netns".into())
        .spawn(move || {
            let _ = tx.send(enter_and_run(&path, f));
        })
        .map_err(|e| KernelError::Thread(format!("spawn: {e}")))?;

    rx.await
        .map_err(|_| KernelError::Thread("worker exited without a result".into()))?
}

fn enter_and_run<T>(path: &Path, f: impl FnOnce() -> Result<T>) -> Result<T> {
    let original =
        File::open(THREAD_NETNS).map_err(|e| KernelError::from_netns_io(THREAD_NETNS, e))?;
    let target = File::open(path).map_err(|e| KernelError::from_netns_io(path, e))?;
    setns(&target, CloneFlags::CLONE_NEWNET)
        .map_err(|e| KernelError::from_netns_io(path, e.into()))?;

    let guard = NamespaceGuard {
        original: Some(original),
    };
    let result = f();
    match (result, guard.restore()) {
        (result, Ok(())) => result,
        (Ok(_), Err(restore)) => Err(restore),
        (Err(primary), Err(restore)) => Err(KernelError::Restore {
            primary: Box::new(primary),
            restore: Box::new(restore),
        }),
    }
}

/// Switches the thread back to its original namespace on drop, so a
/// panicking closure still leaves the thread where it started.
struct NamespaceGuard {
    original: Option<File>,
}

impl NamespaceGuard {
    fn restore(mut self) -> Result<()> {
        match self.original.take() {
            Some(original) => setns(&original, CloneFlags::CLONE_NEWNET)
                .map_err(|e| KernelError::from_netns_io(THREAD_NETNS, e.into())),
            None => Ok(()),
        }
    }
}

impl Drop for NamespaceGuard {
    fn drop(&mut self) {
        if let Some(original) = self.original.take() {
            match setns(&original, CloneFlags::CLONE_NEWNET) {
                Ok(()) => debug!("namespace restored after unwinding"),
                Err(e) => warn!(error = %e, "failed to restore namespace"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_file_locator() {
        assert_eq!(
            parse_locator("file:///proc/42/ns/net").unwrap(),
            Locator::Path(PathBuf::from("/proc/42/ns/net"))
        );
    }

    #[test]
    fn parse_inode_locator() {
        assert_eq!(
            parse_locator("inode://4/4026532338").unwrap(),
            Locator::Inode(4026532338)
        );
    }

    #[test]
    fn reject_unsupported_locators() {
        for raw in ["http://example.com/ns", "/proc/42/ns/net", "inode://4/abc"] {
            let err = parse_locator(raw).unwrap_err();
            assert!(matches!(err, KernelError::BadLocator { .. }), "{raw}: {err}");
        }
    }

    #[test]
    fn current_namespace_resolves_by_inode() {
        let switch = ProcNamespaces;
        let current = switch.current().unwrap();
        let found = switch.from_inode(current.id().ino).unwrap();
        assert_eq!(found.id(), current.id());
    }

    #[test]
    fn missing_namespace_file_is_gone() {
        let err = ProcNamespaces
            .from_url("file:///nonexistent/ns/net")
            .unwrap_err();
        assert!(err.is_namespace_gone(), "got: {err}");
    }

    #[test]
    fn netns_id_display_matches_proc_link_format() {
        let id = NetnsId {
            dev: 4,
            ino: 4026531840,
        };
        assert_eq!(id.to_string(), "net:[4026531840]");
    }
}
