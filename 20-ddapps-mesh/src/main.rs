use anyhow::Result;
use clap::Parser;
use tracing::{info, warn};

use ddapps_mesh::{cli::Cli, node::NodeBuilder};

fn init_tracing() {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = fmt().with_env_filter(filter).with_target(false).try_init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let cli = Cli::parse();
    let node = NodeBuilder::new(cli.node).bind().await?;
    info!("node listening on {}", node.local_addr()?);
    if let Err(err) = node.run_until_ctrl_c().await {
        warn!("node exited with error: {err:?}");
        return Err(err);
    }

    Ok(())
}
