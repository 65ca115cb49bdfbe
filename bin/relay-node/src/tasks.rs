use std::sync::Arc;
use std::time::Duration;

use relay_orchestrator::{MempoolClient, Orchestrator, TcpUpstreamSource, UpstreamEvent};

use crate::config::RelayConfig;

/// Backoff between reconnect attempts to either upstream channel.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Interval for the registry cull and mempool keep-alive tick.
const CULL_INTERVAL: Duration = Duration::from_secs(10);

/// Drives the trusted upstream block/transaction channel forever,
/// reconnecting on transport loss. In-flight broadcast-waiting entries live
/// on the orchestrator and survive a reconnect untouched.
pub async fn run_upstream_loop(config: Arc<RelayConfig>, orchestrator: Arc<Orchestrator>) {
    loop {
        match TcpUpstreamSource::connect(&config.trusted_host, config.trusted_port).await {
            Ok((_source, mut events)) => loop {
                match events.next_event().await {
                    Ok(Some(UpstreamEvent::Block(bytes))) => {
                        orchestrator.on_upstream_block(bytes).await;
                    }
                    Ok(Some(UpstreamEvent::Transaction(bytes))) => {
                        orchestrator.on_upstream_transaction(bytes).await;
                    }
                    Ok(None) => {
                        tracing::warn!(target: "relay_node", "upstream connection closed, reconnecting");
                        break
                    }
                    Err(e) => {
                        tracing::warn!(target: "relay_node", error = %e, "upstream connection error, reconnecting");
                        break
                    }
                }
            },
            Err(e) => {
                tracing::warn!(target: "relay_node", error = %e, "failed to connect to trusted upstream, retrying");
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

/// Drives the mempool hint channel forever: every admitted hash asks the
/// orchestrator to request the full transaction from upstream.
pub async fn run_mempool_loop(config: Arc<RelayConfig>, orchestrator: Arc<Orchestrator>) {
    loop {
        match MempoolClient::connect(&config.trusted_host, config.mempool_port).await {
            Ok((client, mut hashes)) => {
                let client = Arc::new(client);
                let keepalive = tokio::spawn(run_mempool_keepalive(client.clone()));
                loop {
                    match hashes.next_hash().await {
                        Ok(Some(hash)) => orchestrator.admit_mempool_hash(hash).await,
                        Ok(None) => {
                            tracing::warn!(target: "relay_node", "mempool channel closed, reconnecting");
                            break
                        }
                        Err(e) => {
                            tracing::warn!(target: "relay_node", error = %e, "mempool channel error, reconnecting");
                            break
                        }
                    }
                }
                keepalive.abort();
            }
            Err(e) => {
                tracing::warn!(target: "relay_node", error = %e, "failed to connect to mempool channel, retrying");
            }
        }
        tokio::time::sleep(RECONNECT_DELAY).await;
    }
}

async fn run_mempool_keepalive(client: Arc<MempoolClient>) {
    let mut ticker = tokio::time::interval(CULL_INTERVAL);
    loop {
        ticker.tick().await;
        if let Err(e) = client.keep_alive_ping().await {
            tracing::debug!(target: "relay_node", error = %e, "mempool keep-alive send failed");
            return
        }
    }
}

/// Removes peers that finished disconnecting, every 10 seconds.
pub async fn run_cull_loop(orchestrator: Arc<Orchestrator>) {
    let mut ticker = tokio::time::interval(CULL_INTERVAL);
    loop {
        ticker.tick().await;
        let removed = orchestrator.registry().cull();
        if removed > 0 {
            tracing::debug!(target: "relay_node", removed, "culled disconnected peers");
        }
    }
}
