use std::{net::SocketAddr, time::Duration};

use clap::{Args, ValueEnum};

/// How much of each message the Logger echoes to the console.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ConsoleMessages {
    /// Header only: direction, timing, route and type.
    #[default]
    Off,
    /// Header plus the payload truncated to 180 characters.
    Partial,
    /// Header plus the full payload.
    Full,
}

#[derive(Args, Debug, Clone)]
pub struct NodeConfig {
    /// Socket address the node serves HTTP and WebSocket traffic on.
    #[arg(long, default_value = "0.0.0.0:8080")]
    pub listen: SocketAddr,

    /// Address this node advertises to peers and returns from /discovery.
    #[arg(long, env = "DDAPPS_NODE_IP", default_value = "127.0.0.1")]
    pub node_ip: String,

    /// Ask the cluster seed for an existing member on startup.
    #[arg(long)]
    pub discovery: bool,

    /// Seed host queried for discovery.
    #[arg(long, env = "DDAPPS_CLUSTER_HOSTNAME")]
    pub cluster_hostname: Option<String>,

    /// Port every node of the cluster serves on.
    #[arg(long, default_value_t = 8080)]
    pub peer_port: u16,

    /// Echo filtered traffic through the `ddapps::traffic` tracing target.
    #[arg(long)]
    pub console: bool,

    /// Payload detail in the Logger's console echo.
    #[arg(long, value_enum, default_value_t = ConsoleMessages::Off)]
    pub console_messages: ConsoleMessages,

    /// Echo every internal message, not only client traffic.
    #[arg(long)]
    pub debug: bool,

    /// Message types the Logger never echoes.
    #[arg(long = "exclude", value_delimiter = ',')]
    pub exclude: Vec<String>,

    /// Interval between two ticks of a watch.
    #[arg(long, default_value_t = 1000)]
    pub watch_interval_ms: u64,

    /// Upper bound on a forwarded or fanned-out monitoring call.
    #[arg(long, default_value_t = 5000)]
    pub fanout_timeout_ms: u64,
}

impl NodeConfig {
    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms.max(1))
    }

    pub fn fanout_timeout(&self) -> Duration {
        Duration::from_millis(self.fanout_timeout_ms)
    }

    /// Where discovery should look for an existing member.
    pub fn discovery_target(&self) -> DiscoveryTarget {
        if !self.discovery || self.cluster_hostname.as_deref() == Some(self.node_ip.as_str()) {
            return DiscoveryTarget::Disabled;
        }
        match self.cluster_hostname.as_deref() {
            Some(seed) if !seed.trim().is_empty() => DiscoveryTarget::Seed(seed.trim().to_string()),
            other => DiscoveryTarget::InvalidEndpoint(other.unwrap_or_default().to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryTarget {
    Disabled,
    InvalidEndpoint(String),
    Seed(String),
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([0, 0, 0, 0], 8080)),
            node_ip: "127.0.0.1".to_string(),
            discovery: false,
            cluster_hostname: None,
            peer_port: 8080,
            console: false,
            console_messages: ConsoleMessages::Off,
            debug: false,
            exclude: Vec::new(),
            watch_interval_ms: 1000,
            fanout_timeout_ms: 5000,
        }
    }
}
