use std::sync::Arc;

use netservice::{Chain, Connection};
use tokio::task::JoinSet;
use tracing::{error, info};

use super::{ChainArgs, prepare};
use crate::config;
use crate::error::{KernelctlError, KernelctlResult};

/// Request every listed connection once.
pub async fn run_apply(args: ChainArgs) -> KernelctlResult<()> {
    let ctx = prepare(args).await?;
    let connections = config::load_connections(&ctx.connections).await?;
    let total = connections.len();
    let succeeded = request_all(&ctx.chain, connections)
        .await
        .into_iter()
        .filter(|(_, result)| result.is_ok())
        .count();
    finish(total - succeeded, total)
}

/// Close every listed connection once.
pub async fn run_close(args: ChainArgs) -> KernelctlResult<()> {
    let ctx = prepare(args).await?;
    let connections = config::load_connections(&ctx.connections).await?;
    let total = connections.len();
    let failed = close_all(&ctx.chain, connections)
        .await
        .into_iter()
        .filter(|ok| !ok)
        .count();
    finish(failed, total)
}

fn finish(failed: usize, total: usize) -> KernelctlResult<()> {
    if failed == 0 {
        info!(total, "all connections done");
        Ok(())
    } else {
        Err(KernelctlError::Partial { failed, total })
    }
}

/// Request connections concurrently. Returns each connection's ID with the
/// connection as the chain handed it back.
pub(super) async fn request_all(
    chain: &Arc<Chain>,
    connections: Vec<Connection>,
) -> Vec<(String, netservice::Result<Connection>)> {
    let mut tasks = JoinSet::new();
    for conn in connections {
        let chain = chain.clone();
        tasks.spawn(async move {
            let id = conn.id.clone();
            let result = chain.handle_request(conn).await;
            match &result {
                Ok(_) => info!(conn_id = %id, "connection requested"),
                Err(e) => error!(conn_id = %id, error = %e, "request failed"),
            }
            (id, result)
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(result) => results.push(result),
            Err(e) => error!(error = %e, "request task panicked"),
        }
    }
    results
}

/// Close connections concurrently. Returns whether each close succeeded.
pub(super) async fn close_all(chain: &Arc<Chain>, connections: Vec<Connection>) -> Vec<bool> {
    let mut tasks = JoinSet::new();
    for conn in connections {
        let chain = chain.clone();
        tasks.spawn(async move {
            match chain.handle_close(&conn).await {
                Ok(()) => {
                    info!(conn_id = %conn.id, "connection closed");
                    true
                }
                Err(e) => {
                    error!(conn_id = %conn.id, error = %e, "close failed");
                    false
                }
            }
        });
    }

    let mut results = Vec::new();
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(ok) => results.push(ok),
            Err(e) => {
                error!(error = %e, "close task panicked");
                results.push(false);
            }
        }
    }
    results
}
