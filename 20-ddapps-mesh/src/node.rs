//! Node assembly: wires the built-in roles and any application components to
//! one bus and serves the HTTP surface until shutdown.

use std::{future::Future, net::SocketAddr, sync::Arc};

use anyhow::{Context as _, Result};
use serde_json::Value;
use tokio::{
    net::TcpListener,
    sync::{mpsc, watch},
};
use tracing::{info, warn};

use crate::api::{Api, GatewayExtension};
use crate::bus::Bus;
use crate::component::{Component, ComponentHandle, spawn_component, spawn_with_inbox};
use crate::config::NodeConfig;
use crate::logger::Logger;
use crate::message::{BROADCAST, Body, Message};
use crate::monitor::{Monitor, default_document};
use crate::net::{Net, NetState, router};
use crate::peer::Peer;

type Spawner = Box<dyn FnOnce(&Bus) -> ComponentHandle + Send>;

struct Custom {
    topics: Vec<String>,
    spawn: Spawner,
}

pub struct NodeBuilder {
    config: NodeConfig,
    document: Value,
    extension: Option<Box<dyn GatewayExtension>>,
    custom: Vec<Custom>,
}

impl NodeBuilder {
    pub fn new(config: NodeConfig) -> Self {
        Self {
            config,
            document: default_document(),
            extension: None,
            custom: Vec::new(),
        }
    }

    /// Adds or replaces a writable top-level section of the state document.
    pub fn with_state_section(mut self, name: impl Into<String>, value: Value) -> Self {
        if let Value::Object(document) = &mut self.document {
            document.insert(name.into(), value);
        }
        self
    }

    /// Installs the gateway extension answering additional client operations.
    pub fn with_extension(mut self, extension: impl GatewayExtension) -> Self {
        self.extension = Some(Box::new(extension));
        self
    }

    /// Adds an application component. It is spawned after the built-in roles.
    pub fn with_component<C: Component>(mut self, component: C) -> Self {
        self.custom.push(Custom {
            topics: component.topics(),
            spawn: Box::new(move |bus: &Bus| spawn_component(bus, component)),
        });
        self
    }

    /// Binds the listener and starts every component. Nothing is served and
    /// discovery does not begin until [`Node::run_until`].
    pub async fn bind(self) -> Result<Node> {
        let NodeBuilder {
            config,
            document,
            extension,
            custom,
        } = self;

        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("binding {}", config.listen))?;

        let bus = Bus::new();
        let (ready_tx, ready_rx) = watch::channel(false);
        let (net_tx, net_rx) = mpsc::unbounded_channel();
        let state = Arc::new(NetState::new(
            config.clone(),
            bus.clone(),
            net_tx.clone(),
            ready_rx.clone(),
        ));

        let mut observed: Vec<String> = custom.iter().flat_map(|c| c.topics.clone()).collect();
        if let Some(extension) = &extension {
            observed.push(extension.name().to_string());
        }

        // Logger first so it sees every other component's startup traffic.
        let mut handles = vec![spawn_component(&bus, Logger::new(&config, observed))];
        let api = match extension {
            Some(extension) => Api::with_extension(extension),
            None => Api::new(),
        };
        handles.push(spawn_component(&bus, api));
        handles.push(spawn_with_inbox(&bus, Net::new(Arc::clone(&state)), net_tx, net_rx));
        handles.push(spawn_component(
            &bus,
            Peer::new(config.node_ip.clone(), ready_tx, state.view()),
        ));
        handles.push(spawn_component(
            &bus,
            Monitor::new(&config, document, state.view(), ready_rx.clone()),
        ));
        for component in custom {
            handles.push((component.spawn)(&bus));
        }

        Ok(Node {
            listener,
            bus,
            state,
            ready: ready_rx,
            handles,
        })
    }
}

pub struct Node {
    listener: TcpListener,
    bus: Bus,
    state: Arc<NetState>,
    ready: watch::Receiver<bool>,
    handles: Vec<ComponentHandle>,
}

impl Node {
    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn config(&self) -> &NodeConfig {
        self.state.config()
    }

    /// Readiness flag, flipped once membership bootstrap ends.
    pub fn ready(&self) -> watch::Receiver<bool> {
        self.ready.clone()
    }

    pub fn components(&self) -> Vec<&str> {
        self.handles.iter().map(ComponentHandle::name).collect()
    }

    /// Broadcasts the bootstrap message and serves until `shutdown` resolves.
    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let Node {
            listener,
            bus,
            state,
            handles,
            ..
        } = self;

        bus.publish(Message::new("Node", BROADCAST, Body::InitialMessage), None)
            .context("broadcasting the bootstrap message")?;

        let addr = listener.local_addr()?;
        info!(%addr, node_ip = %state.config().node_ip, "node serving");
        let served = axum::serve(
            listener,
            router(state).into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await;

        info!("node shutting down");
        for handle in &handles {
            handle.shutdown();
        }
        served.context("serving HTTP")
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}
