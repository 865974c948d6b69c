//! Daemon wiring: store, router, advertisement engine and readiness probe.

use std::collections::HashMap;
use std::sync::Arc;

use libp2p::Multiaddr;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::Config;
use crate::metrics::Metrics;
use crate::oci::{MemoryStore, Store};
use crate::routing::{MemoryRouter, P2pRouter, Router};
use crate::{cleanup, state, Result};

/// Run the mirror daemon until ctrl-c.
pub async fn run_daemon(config: Config) -> Result<()> {
    let token = CancellationToken::new();
    let metrics = Arc::new(Metrics::new());

    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let router: Arc<dyn Router> = if config.bootstrap_peers.is_empty() {
        info!("standalone mode, using in-memory peer index");
        let self_addr = format!("127.0.0.1:{}", config.registry_port)
            .parse()
            .expect("loopback address is valid");
        Arc::new(MemoryRouter::new(HashMap::new(), self_addr))
    } else {
        let bootstrap = config
            .bootstrap_peers
            .iter()
            .map(|addr| addr.parse::<Multiaddr>())
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Arc::new(P2pRouter::new(config.p2p_port, config.registry_port, bootstrap).await?)
    };

    tokio::fs::create_dir_all(&config.data_dir).await?;
    let probe_token = token.clone();
    let probe_addr = config.probe_addr.clone();
    let probe_dir = config.data_dir.clone();
    let probe = tokio::spawn(async move {
        if let Err(err) = cleanup::run(probe_token, &probe_addr, &probe_dir).await {
            error!(%err, "readiness probe failed");
        }
    });

    let engine_token = token.clone();
    let engine = tokio::spawn(state::track(
        engine_token,
        store,
        router,
        metrics,
        config.resolve_latest_tag,
    ));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received ctrl-c, shutting down"),
        Err(err) => error!(%err, "unable to listen for shutdown signal"),
    }
    token.cancel();

    if let Err(err) = engine.await.expect("engine task panicked") {
        error!(%err, "advertisement engine failed");
    }
    let _ = probe.await;

    info!("shutdown complete");
    Ok(())
}
