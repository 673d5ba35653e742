mod connection;
mod error;
mod service;

pub use connection::{
    Connection, ConnectionContext, IpContext, IpNeighbor, KernelMechanism,
    MAX_INTERFACE_NAME_LEN, Mechanism, PolicyRoute, Route, VfConfig, VlanMechanism, parse_net,
    truncate_interface_name,
};
pub use error::{Error, Result, join_close};
pub use service::{Chain, NetworkService, Next, Side};
