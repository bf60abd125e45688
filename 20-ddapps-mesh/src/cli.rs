use clap::Parser;

use crate::config::NodeConfig;

#[derive(Parser, Debug)]
#[command(author, version, about = "Run a ddapps cluster node", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub node: NodeConfig,
}
