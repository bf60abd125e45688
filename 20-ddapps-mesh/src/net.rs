//! Net: the only component that touches sockets.
//!
//! HTTP and WebSocket endpoints are served by axum. Each connection runs its
//! own session task that pumps frames between the socket and the bus; the
//! connection's hostname becomes a bus topic Net subscribes to, so anything
//! addressed to a peer or client is written to its socket.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};

use anyhow::{Result, bail};
use axum::{
    Router,
    extract::{
        ConnectInfo, State,
        ws::{self, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{Sink, SinkExt, Stream, StreamExt};
use parking_lot::Mutex;
use serde_json::json;
use tokio::{
    select,
    sync::{
        mpsc::{self, UnboundedReceiver},
        watch,
    },
};
use tokio_tungstenite::{connect_async, tungstenite};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::bus::{Bus, Delivery, Inbox};
use crate::component::{Component, Context, missing};
use crate::config::{DiscoveryTarget, NodeConfig};
use crate::error::HandlerError;
use crate::message::{
    BROADCAST, Body, ClientResponse, ConnectionInfo, DiscoveryResult, InvalidDestination, Message,
    PeerAddress, PeerFailure, Role, now_millis,
};
use crate::registry::{ClientHandle, ClientRegistry, Link, NetView, PeerRegistry, peer_ip};

/// Transport state shared between the Net component and its session tasks.
pub struct NetState {
    config: NodeConfig,
    bus: Bus,
    inbox: Inbox,
    peers: Mutex<PeerRegistry>,
    clients: Mutex<ClientRegistry>,
    discovered: AtomicBool,
    view: watch::Sender<NetView>,
    ready: watch::Receiver<bool>,
    next_id: AtomicU64,
}

impl NetState {
    /// `inbox` is the Net component's inbox; connection topics are bound to it.
    /// `ready` is the membership readiness flag served on `/ready`.
    pub fn new(config: NodeConfig, bus: Bus, inbox: Inbox, ready: watch::Receiver<bool>) -> Self {
        let (view, _) = watch::channel(NetView::capture(
            false,
            &PeerRegistry::default(),
            &ClientRegistry::default(),
        ));
        Self {
            config,
            bus,
            inbox,
            peers: Mutex::new(PeerRegistry::default()),
            clients: Mutex::new(ClientRegistry::default()),
            discovered: AtomicBool::new(false),
            view,
            ready,
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    /// Subscribes to transport snapshots.
    pub fn view(&self) -> watch::Receiver<NetView> {
        self.view.subscribe()
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn refresh_view(&self) {
        let peers = self.peers.lock();
        let clients = self.clients.lock();
        self.view.send_replace(NetView::capture(
            self.discovered.load(Ordering::Acquire),
            &peers,
            &clients,
        ));
    }

    fn mark_discovered(&self) {
        self.discovered.store(true, Ordering::Release);
        self.refresh_view();
    }

    fn publish(&self, source: &str, destination: impl Into<String>, body: Body) {
        let message = Message::new(source, destination, body);
        if let Err(err) = self.bus.publish(message, None) {
            debug!(error = %err, "net publish dropped");
        }
    }

    fn register_client(&self, client: ClientHandle) {
        self.bus.subscribe(client.hostname.clone(), &self.inbox);
        self.clients.lock().insert(client);
        self.refresh_view();
    }

    fn remove_client(&self, hostname: &str) {
        self.bus.unsubscribe(hostname, &self.inbox);
        self.clients.lock().remove(hostname);
        self.refresh_view();
    }

    fn register_peer(&self, hostname: &str, link: Link) {
        self.bus.subscribe(hostname, &self.inbox);
        self.peers.lock().insert(hostname, link);
        self.refresh_view();
    }

    fn remove_peer(&self, hostname: &str, link: &Link) {
        let removed = {
            let mut peers = self.peers.lock();
            let owned = peers
                .get(hostname)
                .is_some_and(|peer| peer.link.same_link(link));
            owned && peers.remove(hostname).is_some()
        };
        if removed {
            self.bus.unsubscribe(hostname, &self.inbox);
            self.refresh_view();
        }
    }

    fn peer_link(&self, hostname: &str) -> Option<Link> {
        self.peers.lock().get(hostname).map(|peer| peer.link.clone())
    }

    fn client_link(&self, hostname: &str) -> Option<Link> {
        self.clients.lock().get(hostname).map(|client| client.link.clone())
    }

    fn invalid_destination(&self, destination: &str) -> InvalidDestination {
        InvalidDestination {
            invalid_message_destination: destination.to_string(),
            available_peers: self.peers.lock().hostnames(),
            available_clients: self.clients.lock().hostnames(),
        }
    }

    /// Republishes a frame read from a connection, stamping the connection
    /// hostname as source.
    fn inbound(&self, hostname: &str, destination: Role, text: &str) {
        match Message::decode(text) {
            Ok(message) => self.publish(hostname, destination, message.body),
            Err(err) => {
                warn!(%hostname, error = %err, "undecodable frame");
                self.publish(
                    Role::Net.as_str(),
                    Role::Logger,
                    Body::log(
                        format!("Net::Decode::Error::{hostname}"),
                        Some(json!({ "message": err.to_string() })),
                    ),
                );
            }
        }
    }
}

/// Builds the HTTP surface: `/discovery`, `/ready`, `/client`, `/peer`.
pub fn router(state: Arc<NetState>) -> Router {
    Router::new()
        .route("/discovery", get(discovery))
        .route("/ready", get(ready))
        .route("/client", get(client_upgrade))
        .route("/peer", get(peer_upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn remote_ip(connect: Option<ConnectInfo<SocketAddr>>) -> String {
    connect
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

async fn discovery(
    State(state): State<Arc<NetState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> String {
    let caller = connect
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_else(|| "unknown".to_string());
    state.publish(
        Role::Net.as_str(),
        Role::Logger,
        Body::DiscoveryEndpointCalled(caller),
    );
    state.config.node_ip.clone()
}

async fn ready(State(state): State<Arc<NetState>>) -> Response {
    if state.is_ready() {
        (StatusCode::OK, "OK").into_response()
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "KO").into_response()
    }
}

async fn client_upgrade(
    upgrade: WebSocketUpgrade,
    State(state): State<Arc<NetState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let ip = remote_ip(connect);
    upgrade.on_upgrade(move |socket| run_client(socket, ip, state))
}

async fn peer_upgrade(
    upgrade: WebSocketUpgrade,
    State(state): State<Arc<NetState>>,
    connect: Option<ConnectInfo<SocketAddr>>,
) -> Response {
    let ip = remote_ip(connect);
    upgrade.on_upgrade(move |socket| run_inbound_peer(socket, ip, state))
}

async fn run_client(socket: WebSocket, ip: String, state: Arc<NetState>) {
    let hostname = format!("{ip}-{}", state.next_id());
    let (tx, outbound) = mpsc::unbounded_channel();
    state.register_client(ClientHandle {
        hostname: hostname.clone(),
        ip: ip.clone(),
        link: Link::new(tx),
    });

    info!(%hostname, "client connected");
    let open = ConnectionInfo {
        hostname: hostname.clone(),
        ip,
    };
    state.publish(Role::Net.as_str(), Role::Api, Body::ClientConnectionOpen(open.clone()));
    state.publish(Role::Net.as_str(), Role::Logger, Body::ClientConnectionOpen(open));

    let session = run_session(socket, outbound, |text| {
        state.inbound(&hostname, Role::Api, &text)
    });
    if let Err(err) = session.await {
        debug!(%hostname, error = %err, "client session ended with error");
    }

    state.remove_client(&hostname);
    info!(%hostname, "client disconnected");
    state.publish(Role::Net.as_str(), Role::Api, Body::ClientConnectionClose(hostname.clone()));
    state.publish(Role::Net.as_str(), Role::Logger, Body::ClientConnectionClose(hostname));
}

async fn run_inbound_peer(socket: WebSocket, ip: String, state: Arc<NetState>) {
    let hostname = format!("{ip}-{}", state.next_id());
    let (tx, outbound) = mpsc::unbounded_channel();
    let link = Link::new(tx);
    state.register_peer(&hostname, link.clone());

    info!(%hostname, "peer connected");
    let open = ConnectionInfo {
        hostname: hostname.clone(),
        ip,
    };
    state.publish(Role::Net.as_str(), Role::Logger, Body::PeerConnectionOpen(open.clone()));
    state.publish(Role::Net.as_str(), Role::Peer, Body::PeerConnectionOpen(open));

    let session = run_session(socket, outbound, |text| {
        state.inbound(&hostname, Role::Peer, &text)
    });
    if let Err(err) = session.await {
        debug!(%hostname, error = %err, "peer session ended with error");
    }

    peer_closed(&state, &hostname, &link);
}

async fn run_outbound_peer<S>(socket: S, peer_ip: String, state: Arc<NetState>)
where
    S: Stream<Item = Result<tungstenite::Message, tungstenite::Error>>
        + Sink<tungstenite::Message, Error = tungstenite::Error>
        + Send,
{
    let (tx, outbound) = mpsc::unbounded_channel();
    let link = Link::new(tx);
    state.register_peer(&peer_ip, link.clone());

    info!(peer = %peer_ip, "connected to peer");
    let success = PeerAddress {
        peer_ip: peer_ip.clone(),
    };
    state.publish(Role::Net.as_str(), Role::Logger, Body::PeerConnectionSuccess(success.clone()));
    state.publish(Role::Net.as_str(), Role::Peer, Body::PeerConnectionSuccess(success));

    let session = run_session(socket, outbound, |text| {
        state.inbound(&peer_ip, Role::Peer, &text)
    });
    if let Err(err) = session.await {
        debug!(peer = %peer_ip, error = %err, "peer session ended with error");
    }

    peer_closed(&state, &peer_ip, &link);
}

fn peer_closed(state: &NetState, hostname: &str, link: &Link) {
    state.remove_peer(hostname, link);
    info!(%hostname, "peer disconnected");
    state.publish(
        Role::Net.as_str(),
        Role::Logger,
        Body::PeerConnectionClose(hostname.to_string()),
    );
    state.publish(
        Role::Net.as_str(),
        Role::Peer,
        Body::PeerConnectionClose(hostname.to_string()),
    );
}

/// What a session cares about in a received WebSocket frame.
enum Incoming {
    Text(String),
    Close,
    Ignored,
}

/// Text frames over both axum's and tungstenite's message types.
trait Frame: Sized {
    fn text(text: String) -> Self;
    fn incoming(self) -> Incoming;
}

impl Frame for ws::Message {
    fn text(text: String) -> Self {
        ws::Message::Text(text)
    }

    fn incoming(self) -> Incoming {
        match self {
            ws::Message::Text(text) => Incoming::Text(text),
            ws::Message::Close(_) => Incoming::Close,
            _ => Incoming::Ignored,
        }
    }
}

impl Frame for tungstenite::Message {
    fn text(text: String) -> Self {
        tungstenite::Message::text(text)
    }

    fn incoming(self) -> Incoming {
        match self {
            tungstenite::Message::Text(text) => Incoming::Text(text.as_str().to_string()),
            tungstenite::Message::Close(_) => Incoming::Close,
            _ => Incoming::Ignored,
        }
    }
}

/// Pumps frames until either side closes: text read from the socket goes to
/// `on_text`, frames queued on `outbound` are written to the socket.
async fn run_session<S, F, E>(
    socket: S,
    mut outbound: UnboundedReceiver<String>,
    mut on_text: impl FnMut(String),
) -> Result<(), E>
where
    S: Stream<Item = Result<F, E>> + Sink<F, Error = E>,
    F: Frame,
{
    let (mut writer, mut reader) = socket.split();

    loop {
        select! {
            incoming = reader.next() => {
                match incoming {
                    Some(Ok(frame)) => match frame.incoming() {
                        Incoming::Text(text) => on_text(text),
                        Incoming::Close => break,
                        Incoming::Ignored => {}
                    },
                    Some(Err(err)) => return Err(err),
                    None => break,
                }
            }
            queued = outbound.recv() => {
                match queued {
                    Some(text) => writer.send(F::text(text)).await?,
                    None => break,
                }
            }
        }
    }

    let _ = writer.close().await;
    Ok(())
}

/// Bus side of the transport.
pub struct Net {
    state: Arc<NetState>,
}

impl Net {
    pub fn new(state: Arc<NetState>) -> Self {
        Self { state }
    }

    fn start_discovery(&self, ctx: &Context) {
        let state = Arc::clone(&self.state);
        let ctx = ctx.clone();
        let target = state.config.discovery_target();
        match target {
            DiscoveryTarget::Disabled => {
                report_discovery(
                    &ctx,
                    false,
                    "Net::Discovery::Result::NotActivated",
                    "discovery_disabled",
                );
                state.mark_discovered();
            }
            DiscoveryTarget::InvalidEndpoint(endpoint) => {
                report_discovery(
                    &ctx,
                    false,
                    &format!("Net::Discovery::Result::InvalidEndpoint::{endpoint}"),
                    "http_fail",
                );
                state.mark_discovered();
            }
            DiscoveryTarget::Seed(seed) => {
                tokio::spawn(async move {
                    match fetch_discovery(&state.config, &seed).await {
                        Ok(ip) => report_discovery(&ctx, true, &ip, "http_success"),
                        Err(err) => {
                            warn!(%seed, error = %err, "discovery call failed");
                            report_discovery(&ctx, false, &err.to_string(), "http_fail");
                        }
                    }
                    state.mark_discovered();
                });
            }
        }
    }

    fn connect_peer(&self, peer_ip: String, ctx: &Context) {
        let state = Arc::clone(&self.state);
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let url = format!("ws://{peer_ip}:{}/peer", state.config.peer_port);
            match connect_async(url.as_str()).await {
                Ok((socket, _)) => run_outbound_peer(socket, peer_ip, state).await,
                Err(err) => {
                    warn!(peer = %peer_ip, error = %err, "peer connection failed");
                    ctx.log(
                        format!("Net::WebSocket::Error::{peer_ip}"),
                        Some(json!({ "message": err.to_string() })),
                    );
                    let failure = PeerFailure {
                        peer_ip,
                        reason: err.to_string(),
                    };
                    if let Err(err) = ctx.send(Role::Peer, Body::PeerConnectionFailure(failure)) {
                        debug!(error = %err, "peer failure not delivered");
                    }
                }
            }
        });
    }

    /// Writes a bus message addressed to a connection onto its socket.
    fn route_outbound(&self, delivery: &Delivery, ctx: &Context) -> Result<(), HandlerError> {
        let message = &delivery.message;
        let destination = message.destination.as_str();

        if let Some(link) = self.state.peer_link(destination) {
            let frame = Message::new(Role::Peer, peer_ip(destination), message.body.clone());
            link.send(frame.encode()?)?;
            return Ok(());
        }

        if message.body.is_client_reply() {
            if let Some(link) = self.state.client_link(destination) {
                let frame = Message::new("Server", destination, restamp(&message.body));
                link.send(frame.encode()?)?;
                return Ok(());
            }
        }

        ctx.send(
            Role::Logger,
            Body::InvalidMessageDestination(self.state.invalid_destination(destination)),
        )?;
        Ok(())
    }
}

fn restamp(body: &Body) -> Body {
    match body {
        Body::ClientResponse(response) => Body::ClientResponse(ClientResponse {
            timestamp: now_millis(),
            ..response.clone()
        }),
        Body::ClientNotification(response) => Body::ClientNotification(ClientResponse {
            timestamp: now_millis(),
            ..response.clone()
        }),
        other => other.clone(),
    }
}

fn report_discovery(ctx: &Context, success: bool, result: &str, source: &str) {
    let result = DiscoveryResult {
        success,
        result: result.to_string(),
        source: source.to_string(),
    };
    if let Err(err) = ctx.send(Role::Peer, Body::DiscoveryResult(result)) {
        debug!(error = %err, "discovery result not delivered");
    }
}

async fn fetch_discovery(config: &NodeConfig, seed: &str) -> Result<String> {
    let client = reqwest::Client::builder()
        .timeout(config.fanout_timeout())
        .build()?;
    let url = format!("http://{seed}:{}/discovery", config.peer_port);
    let ip = client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?;
    let ip = ip.trim().to_string();
    if ip.is_empty() {
        bail!("Net::Discovery::Result::InvalidEndpoint::{seed}");
    }
    Ok(ip)
}

impl Component for Net {
    fn name(&self) -> &str {
        Role::Net.as_str()
    }

    fn handle(&mut self, delivery: &Delivery, ctx: &mut Context) -> Result<(), HandlerError> {
        let own_topic = delivery.topic == Role::Net.as_str() || delivery.topic == BROADCAST;
        if !own_topic {
            return self.route_outbound(delivery, ctx);
        }

        match &delivery.message.body {
            Body::InitialMessage => {
                self.start_discovery(ctx);
                Ok(())
            }
            Body::PeerConnectionRequest(PeerAddress { peer_ip }) => {
                self.connect_peer(peer_ip.clone(), ctx);
                Ok(())
            }
            Body::InvalidMessageDestination(report) => {
                let report = self.state.invalid_destination(&report.invalid_message_destination);
                ctx.send(Role::Logger, Body::InvalidMessageDestination(report))?;
                Ok(())
            }
            _ => Err(missing(delivery)),
        }
    }
}

#[cfg(test)]
mod tests {
    use axum::body::Body as HttpBody;
    use axum::http::Request;
    use tower::ServiceExt;

    use super::*;

    fn net_state(ready: bool) -> (Arc<NetState>, Bus) {
        let bus = Bus::new();
        let (inbox, _rx) = mpsc::unbounded_channel();
        let (_ready_tx, ready_rx) = watch::channel(ready);
        let config = NodeConfig {
            node_ip: "10.0.0.7".into(),
            ..NodeConfig::default()
        };
        (Arc::new(NetState::new(config, bus.clone(), inbox, ready_rx)), bus)
    }

    async fn body_text(response: Response) -> String {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("read body");
        String::from_utf8(bytes.to_vec()).expect("utf8 body")
    }

    #[tokio::test]
    async fn ready_reports_membership_state() {
        let (state, _bus) = net_state(false);
        let response = router(state)
            .oneshot(Request::get("/ready").body(HttpBody::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_text(response).await, "KO");

        let (state, _bus) = net_state(true);
        let response = router(state)
            .oneshot(Request::get("/ready").body(HttpBody::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "OK");
    }

    #[tokio::test]
    async fn discovery_returns_node_ip_and_audits_the_call() {
        let (state, bus) = net_state(true);
        let (logger, mut logged) = mpsc::unbounded_channel();
        bus.subscribe(Role::Logger, &logger);

        let response = router(state)
            .oneshot(Request::get("/discovery").body(HttpBody::empty()).unwrap())
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_text(response).await, "10.0.0.7");
        let delivery = logged.try_recv().expect("audit message");
        assert_eq!(delivery.message.kind(), "DiscoveryEndpointCalled");
    }

    #[test]
    fn restamp_keeps_token_and_operation() {
        let original = ClientResponse {
            token: "t1".into(),
            op: "Pong".into(),
            payload: json!(3),
            timestamp: 0,
        };
        match restamp(&Body::ClientResponse(original)) {
            Body::ClientResponse(response) => {
                assert_eq!(response.token, "t1");
                assert_eq!(response.op, "Pong");
                assert!(response.timestamp > 0);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }
}
