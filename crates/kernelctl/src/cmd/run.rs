use std::collections::{HashMap, HashSet};

use netservice::Connection;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};

use super::apply::{close_all, request_all};
use super::{ChainArgs, Context, prepare};
use crate::config;
use crate::error::{KernelctlError, KernelctlResult};

/// Keep the kernel in line with the connections file until interrupted,
/// then close everything that is still up.
pub async fn run_reconcile(args: ChainArgs) -> KernelctlResult<()> {
    let ctx = prepare(args).await?;

    let (stop_tx, mut stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let mut sigterm = signal(SignalKind::terminate()).ok();
        let mut sigint = signal(SignalKind::interrupt()).ok();

        tokio::select! {
            _ = recv_signal(&mut sigterm) => {
                info!("received SIGTERM, closing connections");
            }
            _ = recv_signal(&mut sigint) => {
                info!("received SIGINT, closing connections");
            }
        }
        let _ = stop_tx.send(true);
    });

    let mut live: HashMap<String, Connection> = HashMap::new();
    let mut interval = tokio::time::interval(ctx.config.reconcile_interval());
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = stop_rx.changed() => break,
            _ = interval.tick() => {}
        }
        if let Err(e) = reconcile_once(&ctx, &mut live).await {
            // Keep what is up; the next tick reads the file again.
            warn!(error = %e, "reconcile pass failed");
        }
    }

    let total = live.len();
    let failed = close_all(&ctx.chain, live.into_values().collect())
        .await
        .into_iter()
        .filter(|ok| !ok)
        .count();
    if failed > 0 {
        return Err(KernelctlError::Partial { failed, total });
    }
    info!(total, "all connections closed");
    Ok(())
}

async fn reconcile_once(ctx: &Context, live: &mut HashMap<String, Connection>) -> KernelctlResult<()> {
    let desired = config::load_connections(&ctx.connections).await?;

    let wanted: HashSet<&str> = desired.iter().map(|conn| conn.id.as_str()).collect();
    let removed: Vec<String> = live
        .keys()
        .filter(|id| !wanted.contains(id.as_str()))
        .cloned()
        .collect();
    let removed: Vec<Connection> = removed.iter().filter_map(|id| live.remove(id)).collect();
    if !removed.is_empty() {
        info!(count = removed.len(), "closing connections no longer listed");
        close_all(&ctx.chain, removed).await;
    }

    for (id, result) in request_all(&ctx.chain, desired).await {
        match result {
            Ok(conn) => {
                live.insert(id, conn);
            }
            // The chain has already unwound the failed Request.
            Err(_) => {
                live.remove(&id);
            }
        }
    }

    let deadline = Some(ctx.config.liveness_timeout());
    for conn in live.values() {
        if !ctx.liveness.check(conn, deadline).await {
            warn!(conn_id = %conn.id, "liveness check failed");
        }
    }
    Ok(())
}

/// Await a signal if registered, or pend forever if registration failed.
async fn recv_signal(sig: &mut Option<tokio::signal::unix::Signal>) {
    match sig {
        Some(s) => {
            s.recv().await;
        }
        None => std::future::pending().await,
    }
}
