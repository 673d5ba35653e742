mod apply;
mod run;

use std::path::PathBuf;
use std::sync::Arc;

use clap::Args;
use netservice::{Chain, Side};
use netservice_kernel::{
    IpRoute2, LivenessChecker, ProcNamespaces, SharedState, chains, check_prerequisites,
};
use tracing::info;

use crate::config::{self, KernelctlConfig};
use crate::error::KernelctlResult;

pub use apply::{run_apply, run_close};
pub use run::run_reconcile;

#[derive(Args)]
pub struct ChainArgs {
    /// Path to kernelctl.yaml config file
    #[arg(long, short, env = "KERNELCTL_CONFIG")]
    config: PathBuf,
    /// YAML file listing the desired connections
    connections: PathBuf,
}

/// Everything a subcommand needs to drive connections.
struct Context {
    config: KernelctlConfig,
    chain: Arc<Chain>,
    liveness: LivenessChecker,
    connections: PathBuf,
}

async fn prepare(args: ChainArgs) -> KernelctlResult<Context> {
    let config = config::load(&args.config).await?;
    check_prerequisites(&config.ip_binary, &config.ping_binary)?;

    let state = SharedState::new(
        Arc::new(IpRoute2::new(config.ip_binary.clone())),
        Arc::new(ProcNamespaces),
    )
    .with_address_timeout(config.address_timeout());
    let chain = build_chain(&config, &state);
    info!(
        side = ?config.side,
        host_device_move = config.host_device_move,
        elements = chain.len(),
        "chain ready"
    );

    Ok(Context {
        liveness: LivenessChecker::new(config.ping_binary.clone()),
        config,
        chain: Arc::new(chain),
        connections: args.connections,
    })
}

fn build_chain(config: &KernelctlConfig, state: &SharedState) -> Chain {
    match (Side::from(config.side), config.host_device_move) {
        (Side::Server, true) => chains::forwarder_server(state),
        (Side::Server, false) => chains::context_server(state),
        (Side::Client, true) => chains::forwarder_client(state),
        (Side::Client, false) => chains::context_client(state),
    }
}
