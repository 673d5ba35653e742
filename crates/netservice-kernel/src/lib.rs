mod command;
mod error;
mod prerequisites;

pub mod chains;
pub mod inject;
pub mod ipaddress;
pub mod ipneighbors;
pub mod iprule;
pub mod kernel;
pub mod liveness;
pub mod mtu;
pub mod netns;
pub mod routes;
pub mod sysctl;

pub use chains::SharedState;
pub use command::CommandError;
pub use error::{KernelError, Result};
pub use kernel::{IpRoute2, KernelOps};
pub use liveness::LivenessChecker;
pub use netns::{NamespaceSwitch, Netns, NetnsId, ProcNamespaces};
pub use prerequisites::check_prerequisites;
