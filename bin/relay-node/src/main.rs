mod config;
mod listener;
mod tasks;

use std::sync::Arc;
use std::time::Instant;

use clap::Parser;
use config::{Args, RelayConfig};
use futures::StreamExt;
use relay_net::{AdmitOutcome, OrchestratorHandle, PeerHandle};
use relay_orchestrator::{Orchestrator, TcpUpstreamSource};
use relay_wire::RelayCodec;
use tokio_util::codec::Framed;
use tracing_subscriber::EnvFilter;

/// Argument or bind/listen failure exits with this code, the two's-complement
/// equivalent of the reference server's `exit(-1)`.
const ARGUMENT_OR_BIND_FAILURE: i32 = 255;

fn main() {
    let args = match Args::try_parse() {
        Ok(args) => args,
        Err(e) => {
            eprintln!("{e}");
            std::process::exit(ARGUMENT_OR_BIND_FAILURE);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Arc::new(RelayConfig::from_args(args));

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build the tokio runtime");

    if let Err(e) = runtime.block_on(run(config)) {
        tracing::error!(target: "relay_node", error = %e, "fatal startup error");
        std::process::exit(ARGUMENT_OR_BIND_FAILURE);
    }
}

async fn run(config: Arc<RelayConfig>) -> eyre::Result<()> {
    let listener = listener::bind_dual_stack(config.listen_port)?;
    tracing::info!(target: "relay_node", port = config.listen_port, "listening");

    let (upstream, _upstream_events) =
        TcpUpstreamSource::connect(&config.trusted_host, config.trusted_port).await?;
    let orchestrator =
        Arc::new(Orchestrator::new(config.sponsor.clone(), config.trusted_host.clone(), Arc::new(upstream)));

    tokio::spawn(tasks::run_upstream_loop(config.clone(), orchestrator.clone()));
    tokio::spawn(tasks::run_mempool_loop(config.clone(), orchestrator.clone()));
    tokio::spawn(tasks::run_cull_loop(orchestrator.clone()));

    accept_loop(listener, config, orchestrator).await
}

async fn accept_loop(
    listener: tokio::net::TcpListener,
    config: Arc<RelayConfig>,
    orchestrator: Arc<Orchestrator>,
) -> eyre::Result<()> {
    loop {
        let (stream, addr) = listener.accept().await?;
        let host = addr.ip().to_string();
        let port = addr.port();
        let whitelisted = config.is_whitelisted(&host);

        let (outcome, key) = orchestrator.registry().admit(&host, port, whitelisted, Instant::now());
        match outcome {
            AdmitOutcome::RejectedMonitoringHost => continue,
            AdmitOutcome::RejectedDuplicate { should_log } => {
                if should_log {
                    let epoch_secs = std::time::SystemTime::now()
                        .duration_since(std::time::UNIX_EPOCH)
                        .map(|d| d.as_secs())
                        .unwrap_or(0);
                    tracing::info!(
                        target: "relay::peer",
                        "{epoch_secs}: Got duplicate connection from {host}"
                    );
                }
                continue
            }
            AdmitOutcome::Admitted => {}
        }

        let framed = Framed::new(stream, RelayCodec::new());
        let (sink, stream) = framed.split();
        let peer = Arc::new(PeerHandle::new(key.clone(), sink));
        orchestrator.registry().insert(key.clone(), peer.clone());

        let orchestrator = orchestrator.clone();
        tokio::spawn(async move {
            let handle: Arc<dyn OrchestratorHandle> = orchestrator.clone();
            if let Err(e) = relay_net::run_connection(peer.clone(), stream, handle).await {
                tracing::debug!(target: "relay_node", peer = %key, error = %e, "connection closed");
            }
            peer.mark_disconnect_complete();
        });
    }
}
