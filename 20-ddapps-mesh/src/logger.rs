//! Logger: observability sink.
//!
//! The Logger listens on every role topic and on every connection hostname it
//! learns about, so it sees all traffic. Messages that pass its filters are
//! echoed through `tracing` and streamed to clients watching the log feed.

use std::{collections::HashSet, net::Ipv4Addr, time::Instant};

use serde_json::json;
use tracing::info;

use crate::bus::Delivery;
use crate::component::{Component, Context};
use crate::config::{ConsoleMessages, NodeConfig};
use crate::error::HandlerError;
use crate::message::{Body, ClientResponse, Message, OpType, Role};
use crate::registry::peer_ip;

/// Key carried by log feed notifications.
pub const LOG_FEED_KEY: &str = "/ddapps/logs";

const PARTIAL_PAYLOAD_CHARS: usize = 180;
const MAX_ELAPSED_MS: u128 = 9999;

pub struct Logger {
    console: bool,
    console_messages: ConsoleMessages,
    debug: bool,
    exclude: HashSet<String>,
    extra_topics: Vec<String>,
    registrations: HashSet<String>,
    clients: HashSet<String>,
    /// Tokens of clients watching the log feed.
    feeds: Vec<String>,
    last: Instant,
}

impl Logger {
    /// `extra_topics` are application component names to observe besides the
    /// built-in roles.
    pub fn new(config: &NodeConfig, extra_topics: Vec<String>) -> Self {
        Self {
            console: config.console,
            console_messages: config.console_messages,
            debug: config.debug,
            exclude: config.exclude.iter().cloned().collect(),
            extra_topics,
            registrations: HashSet::new(),
            clients: HashSet::new(),
            feeds: Vec::new(),
            last: Instant::now(),
        }
    }

    #[cfg(test)]
    fn feed_count(&self) -> usize {
        self.feeds.len()
    }

    fn register(&mut self, ctx: &Context, topic: &str) {
        if self.registrations.insert(topic.to_string()) {
            ctx.subscribe(topic);
        }
    }

    fn unregister(&mut self, ctx: &Context, topic: &str) {
        if self.registrations.remove(topic) {
            ctx.unsubscribe(topic);
        }
    }

    fn bookkeep(&mut self, body: &Body, ctx: &Context) {
        match body {
            Body::ClientConnectionOpen(open) => {
                self.clients.insert(open.hostname.clone());
                self.register(ctx, &open.hostname);
            }
            Body::ClientConnectionClose(hostname) => {
                self.clients.remove(hostname);
                self.unregister(ctx, hostname);
            }
            Body::PeerConnectionOpen(open) => self.register(ctx, &open.hostname),
            Body::PeerConnectionSuccess(success) => self.register(ctx, &success.peer_ip),
            Body::PeerConnectionClose(hostname) => self.unregister(ctx, hostname),
            Body::LogWatchRequest(token) => {
                if !self.feeds.contains(token) {
                    self.feeds.push(token.clone());
                }
            }
            Body::ClientRequestsReleased(tokens) => {
                self.feeds.retain(|feed| !tokens.contains(feed))
            }
            _ => {}
        }
    }

    fn passes(&self, message: &Message) -> bool {
        if self.exclude.contains(message.kind()) {
            return false;
        }
        self.clients.contains(&message.source)
            || self.clients.contains(&message.destination)
            || message.destination == Role::Logger.as_str()
            || self.debug
    }

    fn echo(&mut self, message: &Message) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last).as_millis().min(MAX_ELAPSED_MS);
        self.last = now;
        if self.console {
            let line = format_line(message, elapsed, self.console_messages);
            info!(target: "ddapps::traffic", "{line}");
        }
    }

    fn feed(&self, message: &Message, ctx: &Context) {
        if self.feeds.is_empty() {
            return;
        }
        let carried = message.body.token().unwrap_or_default();
        if self.feeds.iter().any(|feed| feed == carried) {
            return;
        }
        let Ok(value) = message.to_value() else {
            return;
        };
        for token in &self.feeds {
            let notification = ClientResponse::new(
                token,
                OpType::MonWatch.as_str(),
                json!({ "key": LOG_FEED_KEY, "value": value }),
            );
            let _ = ctx.send(Role::Api, Body::ClientNotification(notification));
        }
    }
}

fn is_connection(name: &str) -> bool {
    peer_ip(name).parse::<Ipv4Addr>().is_ok()
}

/// One console line: direction icon, elapsed ms, route, type and payload.
pub fn format_line(message: &Message, elapsed: u128, mode: ConsoleMessages) -> String {
    let icon = if is_connection(&message.destination) {
        "🟢"
    } else if is_connection(&message.source) {
        "🔵"
    } else {
        "🔄"
    };

    let payload = match mode {
        ConsoleMessages::Off => String::new(),
        ConsoleMessages::Partial | ConsoleMessages::Full => {
            let payload = message
                .to_value()
                .map(|mut value| value["payload"].take().to_string())
                .unwrap_or_default();
            if mode == ConsoleMessages::Partial {
                payload.chars().take(PARTIAL_PAYLOAD_CHARS).collect()
            } else {
                payload
            }
        }
    };

    format!(
        "{icon} {elapsed:<5}{:<20}{:<20}{:<25}{payload}",
        message.source,
        message.destination,
        message.kind()
    )
}

impl Component for Logger {
    fn name(&self) -> &str {
        Role::Logger.as_str()
    }

    fn topics(&self) -> Vec<String> {
        Role::ALL
            .iter()
            .map(|role| role.as_str().to_string())
            .chain(self.extra_topics.iter().cloned())
            .collect()
    }

    fn traced(&self) -> bool {
        false
    }

    fn handle(&mut self, delivery: &Delivery, ctx: &mut Context) -> Result<(), HandlerError> {
        let message = &delivery.message;
        if delivery.topic == Role::Logger.as_str() {
            self.bookkeep(&message.body, ctx);
        }
        if self.passes(message) {
            self.echo(message);
            self.feed(message, ctx);
        }
        Ok(())
    }
}
