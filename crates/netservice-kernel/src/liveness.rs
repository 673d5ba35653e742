//! Data-path liveness: does every destination address answer a ping?

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use futures_util::future::join_all;
use netservice::{Connection, parse_net};
use tracing::{debug, error, warn};

use crate::command;

/// Used when the caller gives no deadline.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Debug, Clone)]
pub struct LivenessChecker {
    ping: PathBuf,
}

impl Default for LivenessChecker {
    fn default() -> Self {
        Self::new("ping")
    }
}

impl LivenessChecker {
    pub fn new(ping: impl Into<PathBuf>) -> Self {
        Self { ping: ping.into() }
    }

    /// Ping every destination address of `conn` once, all at the same
    /// time. Alive only if each one replied within `deadline`.
    pub async fn check(&self, conn: &Connection, deadline: Option<Duration>) -> bool {
        if conn.kernel().is_none() {
            error!(conn_id = %conn.id, "liveness check on a connection without a kernel mechanism");
        }
        let Some(targets) = targets(conn) else {
            return false;
        };
        let deadline = deadline.unwrap_or(DEFAULT_LIVENESS_TIMEOUT);

        let replies = join_all(targets.iter().map(|addr| self.ping(*addr, deadline))).await;
        let alive = replies.iter().all(|replied| *replied);
        debug!(conn_id = %conn.id, targets = targets.len(), alive, "liveness checked");
        alive
    }

    async fn ping(&self, addr: IpAddr, deadline: Duration) -> bool {
        // ping's own wait is whole seconds; the timeout below is the real
        // bound and kills ping when it fires.
        let wait = deadline.as_secs().max(1).to_string();
        let args = vec![
            "-n".to_string(),
            "-q".to_string(),
            "-c".to_string(),
            "1".to_string(),
            "-W".to_string(),
            wait,
            addr.to_string(),
        ];
        match tokio::time::timeout(deadline, command::exec(&self.ping, &args)).await {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(%addr, error = %e, "no reply");
                false
            }
            Err(_) => {
                debug!(%addr, ?deadline, "no reply before deadline");
                false
            }
        }
    }
}

/// Destination addresses to ping, or `None` when one does not parse.
fn targets(conn: &Connection) -> Option<Vec<IpAddr>> {
    conn.ip_context()
        .dst_ip_addrs
        .iter()
        .map(|addr| match parse_net("destination address", addr) {
            Ok(net) => Some(net.addr()),
            Err(e) => {
                warn!(conn_id = %conn.id, error = %e, "cannot ping destination");
                None
            }
        })
        .collect()
}
