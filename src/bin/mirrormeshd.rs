//! mirrormesh daemon binary

use clap::Parser;
use mirrormesh::{config::Config, daemon::run_daemon, init_tracing};
use tracing::info;

#[derive(Parser)]
#[command(name = "mirrormeshd")]
#[command(about = "Peer-to-peer pull-through mirror for container images")]
struct Cli {
    /// Port peers serve their registry mirror on (fleet-wide)
    #[arg(long)]
    registry_port: Option<u16>,

    /// P2P/peer index listen port (0 = random port)
    #[arg(short = 'p', long)]
    p2p_port: Option<u16>,

    /// Bootstrap peers for the peer index (comma-separated multiaddrs)
    #[arg(long)]
    bootstrap: Option<String>,

    /// Readiness probe address
    #[arg(long)]
    probe_addr: Option<String>,

    /// Do not advertise or resolve `latest` tags
    #[arg(long)]
    no_resolve_latest_tag: bool,
}

#[tokio::main]
async fn main() -> mirrormesh::Result<()> {
    let cli = Cli::parse();

    init_tracing()?;
    info!("starting mirrormesh daemon v{}", mirrormesh::VERSION);

    let mut config = Config::load()?;
    if let Some(registry_port) = cli.registry_port {
        config.registry_port = registry_port;
    }
    if let Some(p2p_port) = cli.p2p_port {
        config.p2p_port = p2p_port;
    }
    if let Some(bootstrap) = cli.bootstrap {
        config.bootstrap_peers = bootstrap
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if let Some(probe_addr) = cli.probe_addr {
        config.probe_addr = probe_addr;
    }
    if cli.no_resolve_latest_tag {
        config.resolve_latest_tag = false;
    }

    run_daemon(config).await
}
