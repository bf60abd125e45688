//! Monitor: the node's key/value surface.
//!
//! Keys resolve by prefix. Local keys are answered from the runtime metrics,
//! the state document or the product descriptor; `/ddapps/node/<ip>/...` keys
//! are forwarded to that peer and `/ddapps/cluster/...` keys are fanned out to
//! every peer. Remote calls go through [`Client`] and are bounded by the
//! configured fan-out timeout.

use std::{collections::HashMap, net::Ipv4Addr, time::Duration};

use futures::future::join_all;
use serde::Serialize;
use serde_json::{Map, Number, Value, json};
use sysinfo::System;
use tokio::{
    sync::watch,
    task::AbortHandle,
    time::{Instant, interval_at},
};
use tracing::{debug, warn};

use crate::bus::Delivery;
use crate::client::Client;
use crate::component::{Component, Context, missing};
use crate::config::NodeConfig;
use crate::error::HandlerError;
use crate::message::{Body, ClientResponse, Message, MonOp, MonOpType, MonWatch, OpType, Role};
use crate::registry::NetView;

/// Pseudo-key streaming the Logger's feed instead of polling a value.
pub const LOGS_KEY: &str = "/ddapps/node/logs";

const STATE_PREFIX: &str = "/ddapps/node/state";
const NODE_PREFIX: &str = "/ddapps/node/";
const CLUSTER_PREFIX: &str = "/ddapps/cluster/";
const VERSION_KEY: &str = "/ddapps/node/version";
const RUNTIME_PREFIXES: [&str; 2] = ["/deno", "/runtime"];

/// Sections of the state document computed from live data.
const DERIVED_SECTIONS: [&str; 3] = ["ready", "net", "mon"];

/// Default writable sections of the state document.
pub fn default_document() -> Value {
    json!({ "testing": { "dummy": "" } })
}

/// Static description of the running product.
pub fn product() -> Value {
    json!({
        "name": "ddapps",
        "ddapps": env!("CARGO_PKG_VERSION"),
        "os": std::env::consts::OS,
        "arch": std::env::consts::ARCH,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Route {
    Runtime(Option<String>),
    State(String),
    Version,
    Remote { ip: String, local_key: String },
    Cluster { local_key: String },
    Unknown,
}

fn route(key: &str) -> Route {
    for prefix in RUNTIME_PREFIXES {
        if key == prefix {
            return Route::Runtime(None);
        }
        if let Some(metric) = key.strip_prefix(prefix).and_then(|rest| rest.strip_prefix('/')) {
            let metric = metric.trim_end_matches('/');
            return Route::Runtime((!metric.is_empty()).then(|| metric.to_string()));
        }
    }
    if let Some(rest) = key.strip_prefix(CLUSTER_PREFIX) {
        return Route::Cluster {
            local_key: format!("{NODE_PREFIX}{rest}"),
        };
    }
    if let Some((ip, rest)) = key.strip_prefix(NODE_PREFIX).and_then(|rest| rest.split_once('/')) {
        if ip.parse::<Ipv4Addr>().is_ok() {
            return Route::Remote {
                ip: ip.to_string(),
                local_key: format!("{NODE_PREFIX}{rest}"),
            };
        }
    }
    if key == STATE_PREFIX {
        return Route::State(String::new());
    }
    if let Some(path) = key.strip_prefix(STATE_PREFIX).and_then(|rest| rest.strip_prefix('/')) {
        return Route::State(path.to_string());
    }
    if key.starts_with(VERSION_KEY) {
        return Route::Version;
    }
    Route::Unknown
}

/// `"true"`/`"false"` become booleans and numeric strings become numbers;
/// anything else is stored as given.
pub fn coerce(value: Value) -> Value {
    let Value::String(text) = &value else {
        return value;
    };
    match text.as_str() {
        "true" => return Value::Bool(true),
        "false" => return Value::Bool(false),
        _ => {}
    }
    let trimmed = text.trim();
    if let Ok(integer) = trimmed.parse::<i64>() {
        return Value::Number(integer.into());
    }
    match trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        Some(number) if !trimmed.is_empty() => Value::Number(number),
        _ => value,
    }
}

fn segments(path: &str) -> Vec<&str> {
    path.split('/').filter(|segment| !segment.is_empty()).collect()
}

fn no_such_key(key: &str) -> Value {
    Value::String(format!("NoSuchKey::{key}"))
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct MonitorStats {
    pub gets: u64,
    pub sets: u64,
    pub watches: u64,
    pub forwards: u64,
}

struct Watcher {
    key: String,
    expire: i64,
    task: AbortHandle,
}

pub struct Monitor {
    node_ip: String,
    peer_port: u16,
    watch_interval: Duration,
    fanout_timeout: Duration,
    document: Value,
    view: watch::Receiver<NetView>,
    ready: watch::Receiver<bool>,
    watchers: HashMap<String, Watcher>,
    stats: MonitorStats,
    system: System,
}

impl Monitor {
    pub fn new(
        config: &NodeConfig,
        document: Value,
        view: watch::Receiver<NetView>,
        ready: watch::Receiver<bool>,
    ) -> Self {
        Self {
            node_ip: config.node_ip.clone(),
            peer_port: config.peer_port,
            watch_interval: config.watch_interval(),
            fanout_timeout: config.fanout_timeout(),
            document,
            view,
            ready,
            watchers: HashMap::new(),
            stats: MonitorStats::default(),
            system: System::new(),
        }
    }

    /// Live view of the state document, derived sections included.
    pub fn state_document(&self) -> Value {
        let mut document = self.document.clone();
        let view = self.view.borrow().clone();
        let mut watchers: Vec<&String> = self.watchers.keys().collect();
        watchers.sort();

        if let Value::Object(sections) = &mut document {
            sections.insert("ready".into(), json!(*self.ready.borrow()));
            sections.insert(
                "net".into(),
                json!({
                    "ready": view.ready,
                    "peers": view.peers,
                    "peer_ips": view.peer_ips,
                    "clients": view.clients,
                    "quorum": view.quorum,
                }),
            );
            sections.insert(
                "mon".into(),
                json!({ "watchers": watchers, "stats": self.stats }),
            );
        }
        document
    }

    fn runtime_snapshot(&mut self) -> Value {
        self.system.refresh_memory();
        let load = System::load_average();

        let mut process = Value::Null;
        if let Ok(pid) = sysinfo::get_current_pid() {
            if self.system.refresh_process(pid) {
                if let Some(current) = self.system.process(pid) {
                    process = json!({
                        "pid": pid.as_u32(),
                        "memory": current.memory(),
                        "virtualMemory": current.virtual_memory(),
                        "cpuUsage": current.cpu_usage(),
                        "runTime": current.run_time(),
                    });
                }
            }
        }

        json!({
            "hostname": System::host_name().unwrap_or_default(),
            "loadavg": [load.one, load.five, load.fifteen],
            "uptime": System::uptime(),
            "memory": {
                "total": self.system.total_memory(),
                "free": self.system.free_memory(),
                "available": self.system.available_memory(),
                "used": self.system.used_memory(),
                "swapTotal": self.system.total_swap(),
                "swapFree": self.system.free_swap(),
            },
            "process": process,
        })
    }

    /// Resolves a key on this node only.
    pub fn get(&mut self, key: &str) -> Value {
        match route(key) {
            Route::Runtime(None) => self.runtime_snapshot(),
            Route::Runtime(Some(metric)) => {
                let mut snapshot = self.runtime_snapshot();
                match snapshot.get_mut(&metric) {
                    Some(value) => value.take(),
                    None => Value::String(format!("NoSuchMetric::{metric}")),
                }
            }
            Route::State(path) => {
                let mut cursor = self.state_document();
                for segment in segments(&path) {
                    let next = match &mut cursor {
                        Value::Object(map) => map.remove(segment),
                        Value::Array(items) => segment
                            .parse::<usize>()
                            .ok()
                            .filter(|index| *index < items.len())
                            .map(|index| items.swap_remove(index)),
                        _ => None,
                    };
                    match next {
                        Some(value) => cursor = value,
                        None => return no_such_key(segment),
                    }
                }
                cursor
            }
            Route::Version => product(),
            Route::Remote { .. } | Route::Cluster { .. } | Route::Unknown => no_such_key(key),
        }
    }

    /// Stores a value on this node only and returns what was stored.
    pub fn set(&mut self, key: &str, value: Value) -> Value {
        match route(key) {
            Route::Runtime(_) | Route::Version => Value::String(format!("ReadOnlyKey::{key}")),
            Route::State(path) => self.set_state(key, &path, coerce(value)),
            Route::Remote { .. } | Route::Cluster { .. } | Route::Unknown => no_such_key(key),
        }
    }

    fn set_state(&mut self, key: &str, path: &str, value: Value) -> Value {
        let segments = segments(path);
        let Some((last, parents)) = segments.split_last() else {
            return Value::String(format!("ReadOnlyKey::{key}"));
        };
        if DERIVED_SECTIONS.contains(&segments[0]) {
            return Value::String(format!("ReadOnlyKey::{key}"));
        }

        let mut cursor = &mut self.document;
        for segment in parents {
            match cursor.get_mut(*segment) {
                Some(next) if next.is_object() => cursor = next,
                _ => return no_such_key(segment),
            }
        }
        match cursor.as_object_mut() {
            Some(section) => {
                section.insert(last.to_string(), value.clone());
                value
            }
            None => no_such_key(last),
        }
    }

    fn answer(ctx: &Context, op: &MonOp, value: Value) -> Result<(), HandlerError> {
        ctx.respond(OpType::MonOp.as_str(), serde_json::to_value(op.with_value(value))?)?;
        Ok(())
    }

    fn on_op(&mut self, op: &MonOp, ctx: &Context) -> Result<(), HandlerError> {
        let key = op.metric.key.as_str();
        match route(key) {
            Route::Remote { ip, local_key } => self.on_remote(op, ip, local_key, ctx),
            Route::Cluster { local_key } => self.on_cluster(op, local_key, ctx),
            _ => match op.op {
                MonOpType::Get => {
                    self.stats.gets += 1;
                    let value = self.get(key);
                    Self::answer(ctx, op, value)
                }
                MonOpType::Set => {
                    self.stats.sets += 1;
                    let value = match op.metric.value.clone().filter(|value| !value.is_null()) {
                        Some(value) => self.set(key, value),
                        None => Value::String(format!(
                            "Monitor::MonSetRequest::MissingValueForKey::{key}"
                        )),
                    };
                    Self::answer(ctx, op, value)
                }
            },
        }
    }

    fn on_remote(
        &mut self,
        op: &MonOp,
        ip: String,
        local_key: String,
        ctx: &Context,
    ) -> Result<(), HandlerError> {
        let mut local = op.clone();
        local.metric.key = local_key;

        if ip == self.node_ip {
            let body = match op.op {
                MonOpType::Get => Body::MonGetRequest(local),
                MonOpType::Set => Body::MonSetRequest(local),
            };
            ctx.send(Role::Monitor, body)?;
            return Ok(());
        }

        let known = self.view.borrow().peer_ips.clone();
        if !known.contains(&ip) {
            let value = match op.op {
                MonOpType::Get => format!(
                    "Monitor::MonGetRequest::Error::InvalidPeer::{ip}::Available::{}",
                    known.join(":")
                ),
                MonOpType::Set => format!("Monitor::MonSetRequest::NoSuchPeer::{ip}"),
            };
            return Self::answer(ctx, op, Value::String(value));
        }

        self.stats.forwards += 1;
        let port = self.peer_port;
        let limit = self.fanout_timeout;
        let op = op.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let value = forward(ip, port, local, limit).await;
            if let Err(err) = Self::answer(&ctx, &op, value) {
                debug!(error = %err, "forwarded answer dropped");
            }
        });
        Ok(())
    }

    /// Resolves locally and on every peer, answering once all have replied
    /// or timed out.
    fn on_cluster(
        &mut self,
        op: &MonOp,
        local_key: String,
        ctx: &Context,
    ) -> Result<(), HandlerError> {
        let local_value = match op.op {
            MonOpType::Get => self.get(&local_key),
            MonOpType::Set => match op.metric.value.clone().filter(|value| !value.is_null()) {
                Some(value) => self.set(&local_key, value),
                None => {
                    let missing = format!(
                        "Monitor::MonSetRequest::MissingValueForKey::{}",
                        op.metric.key
                    );
                    return Self::answer(ctx, op, Value::String(missing));
                }
            },
        };

        let peers = self.view.borrow().peer_ips.clone();
        self.stats.forwards += peers.len() as u64;
        let node_ip = self.node_ip.clone();
        let port = self.peer_port;
        let limit = self.fanout_timeout;
        let op = op.clone();
        let ctx = ctx.clone();

        tokio::spawn(async move {
            let mut remote = op.clone();
            remote.metric.key = local_key;
            let calls = peers.iter().map(|ip| {
                let remote = remote.clone();
                async move { (ip.clone(), forward(ip.clone(), port, remote, limit).await) }
            });

            let mut values = Map::new();
            values.insert(node_ip, local_value);
            for (ip, value) in join_all(calls).await {
                values.insert(ip, value);
            }
            if let Err(err) = Self::answer(&ctx, &op, Value::Object(values)) {
                debug!(error = %err, "cluster answer dropped");
            }
        });
        Ok(())
    }

    fn on_watch(&mut self, watch: &MonWatch, ctx: &Context) -> Result<(), HandlerError> {
        let Some(token) = ctx.trace().map(|trace| trace.token.clone()) else {
            ctx.log(
                format!("Monitor::MonWatchRequest::Error::MissingToken::{}", watch.key),
                None,
            );
            return Ok(());
        };

        if watch.key.starts_with(LOGS_KEY) {
            ctx.send(Role::Logger, Body::LogWatchRequest(token))?;
            return Ok(());
        }

        self.stats.watches += 1;
        let task = spawn_ticker(ctx, token.clone(), self.watch_interval);
        if let Some(previous) = self.watchers.insert(
            token,
            Watcher {
                key: watch.key.clone(),
                expire: watch.expire,
                task,
            },
        ) {
            previous.task.abort();
        }
        Ok(())
    }

    fn on_tick(&mut self, token: &str, ctx: &Context) -> Result<(), HandlerError> {
        let Some(watcher) = self.watchers.get_mut(token) else {
            return Ok(());
        };
        let key = watcher.key.clone();
        let last = watcher.expire == 1;
        if watcher.expire > 1 {
            watcher.expire -= 1;
        }
        if last {
            if let Some(watcher) = self.watchers.remove(token) {
                watcher.task.abort();
            }
        }

        let value = self.get(&key);
        let payload = json!({ "key": key, "value": value });
        let reply = ClientResponse::new(token, OpType::MonWatch.as_str(), payload);
        let body = if last {
            Body::ClientResponse(reply)
        } else {
            Body::ClientNotification(reply)
        };
        ctx.send(Role::Api, body)?;
        Ok(())
    }

    fn release(&mut self, tokens: &[String]) {
        for token in tokens {
            if let Some(watcher) = self.watchers.remove(token) {
                watcher.task.abort();
                debug!(%token, key = %watcher.key, "watch cancelled");
            }
        }
    }
}

/// Posts a tick for `token` into the Monitor's own inbox every `period`.
fn spawn_ticker(ctx: &Context, token: String, period: Duration) -> AbortHandle {
    let inbox = ctx.inbox().clone();
    let name = ctx.name().to_string();
    let task = tokio::spawn(async move {
        let mut ticker = interval_at(Instant::now() + period, period);
        loop {
            ticker.tick().await;
            let tick = Delivery {
                topic: name.clone(),
                message: Message::new(
                    name.clone(),
                    name.clone(),
                    Body::MonWatchTick(token.clone()),
                ),
                trace: None,
            };
            if inbox.send(tick).is_err() {
                break;
            }
        }
    });
    task.abort_handle()
}

/// Runs `op` on the peer at `ip`; failures and timeouts become sentinel values.
async fn forward(ip: String, port: u16, op: MonOp, limit: Duration) -> Value {
    let call = async {
        let client = Client::connect(&ip, port).await?;
        let answer = client.monop(op).await;
        client.close().await;
        answer
    };
    match tokio::time::timeout(limit, call).await {
        Ok(Ok(answer)) => answer.metric.value.unwrap_or(Value::Null),
        Ok(Err(err)) => {
            warn!(peer = %ip, error = %err, "forwarded monitoring call failed");
            Value::String(format!("Monitor::Forward::Error::{ip}::{err}"))
        }
        Err(_) => Value::String(format!("Monitor::Cluster::Timeout::{ip}")),
    }
}

impl Component for Monitor {
    fn name(&self) -> &str {
        Role::Monitor.as_str()
    }

    fn handle(&mut self, delivery: &Delivery, ctx: &mut Context) -> Result<(), HandlerError> {
        match &delivery.message.body {
            Body::InitialMessage => Ok(()),
            Body::MonGetRequest(op) | Body::MonSetRequest(op) => self.on_op(op, ctx),
            Body::MonWatchRequest(watch) => self.on_watch(watch, ctx),
            Body::MonWatchTick(token) => self.on_tick(token, ctx),
            Body::ClientRequestsReleased(tokens) => {
                self.release(tokens);
                Ok(())
            }
            _ => Err(missing(delivery)),
        }
    }
}
