//! Peer: cluster membership.
//!
//! A joining node asks the seed for one member, connects to it, and then
//! follows the member's list of known peers until every one of them is
//! connected. The node is ready once that walk ends, whatever the outcome.

use std::collections::HashSet;

use serde_json::{Value, json};
use tokio::sync::watch;
use tracing::info;

use crate::bus::Delivery;
use crate::component::{Component, Context, missing};
use crate::error::HandlerError;
use crate::message::{Body, ConnectionInfo, KnownPeers, OpType, PeerAddress, Role};
use crate::registry::{NetView, peer_ip};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Discovering,
    AwaitingAcceptance,
    Ready,
}

pub struct Peer {
    node_ip: String,
    phase: PeerPhase,
    ready: watch::Sender<bool>,
    view: watch::Receiver<NetView>,
    /// Outbound connection attempts not yet confirmed or failed.
    pending: HashSet<String>,
}

impl Peer {
    pub fn new(
        node_ip: impl Into<String>,
        ready: watch::Sender<bool>,
        view: watch::Receiver<NetView>,
    ) -> Self {
        Self {
            node_ip: node_ip.into(),
            phase: PeerPhase::Discovering,
            ready,
            view,
            pending: HashSet::new(),
        }
    }

    pub fn phase(&self) -> PeerPhase {
        self.phase
    }

    fn become_ready(&mut self, ctx: &Context, after: &str, detail: Value) {
        if self.phase == PeerPhase::Ready {
            return;
        }
        self.phase = PeerPhase::Ready;
        self.ready.send_replace(true);
        info!(after, "node ready");
        ctx.log(format!("Peer::ReadyAfter::{after}"), Some(detail));
    }

    fn request_connection(&mut self, ctx: &Context, peer_ip: &str) -> Result<(), HandlerError> {
        self.pending.insert(peer_ip.to_string());
        ctx.send(
            Role::Net,
            Body::PeerConnectionRequest(PeerAddress {
                peer_ip: peer_ip.to_string(),
            }),
        )?;
        Ok(())
    }

    fn on_accepted(&mut self, ctx: &Context, accepted: &KnownPeers) -> Result<(), HandlerError> {
        let unknown: Vec<String> = {
            let view = self.view.borrow();
            accepted
                .known_peers
                .iter()
                .filter(|ip| **ip != self.node_ip)
                .filter(|ip| !view.knows_peer(ip))
                .filter(|ip| !self.pending.contains(*ip))
                .cloned()
                .collect()
        };

        if unknown.is_empty() {
            self.become_ready(
                ctx,
                "PeerConnectionAccepted",
                json!({ "knownPeers": accepted.known_peers }),
            );
            return Ok(());
        }

        for ip in &unknown {
            self.request_connection(ctx, ip)?;
        }
        Ok(())
    }

    /// Gossip step: tell a newly connected peer who else we know.
    fn on_open(&self, ctx: &Context, open: &ConnectionInfo) -> Result<(), HandlerError> {
        let joining = peer_ip(&open.hostname);
        let known_peers = self
            .view
            .borrow()
            .peer_ips
            .iter()
            .filter(|ip| ip.as_str() != joining)
            .cloned()
            .collect();
        ctx.send(
            open.hostname.clone(),
            Body::PeerConnectionAccepted(KnownPeers { known_peers }),
        )?;
        Ok(())
    }

    /// Demo passthrough: answers with the request's own type and payload.
    fn on_any(&self, ctx: &Context, request: &Value) -> Result<(), HandlerError> {
        ctx.log(
            "Messages of type Any are for demo purpose and should be avoided",
            Some(request.clone()),
        );
        let op = request
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or(OpType::Any.as_str())
            .to_string();
        let payload = request.get("payload").cloned().unwrap_or(Value::Null);
        ctx.respond(op, payload)?;
        Ok(())
    }
}

impl Component for Peer {
    fn name(&self) -> &str {
        Role::Peer.as_str()
    }

    fn handle(&mut self, delivery: &Delivery, ctx: &mut Context) -> Result<(), HandlerError> {
        let message = &delivery.message;
        match &message.body {
            Body::InitialMessage | Body::PeerConnectionClose(_) => Ok(()),
            Body::DiscoveryResult(result) => {
                if result.success {
                    self.phase = PeerPhase::AwaitingAcceptance;
                    self.request_connection(ctx, &result.result)
                } else {
                    let after = format!("DiscoveryResult::{}", result.source);
                    self.become_ready(ctx, &after, json!({ "result": result.result }));
                    Ok(())
                }
            }
            Body::PeerConnectionAccepted(accepted) => self.on_accepted(ctx, accepted),
            Body::PeerConnectionOpen(open) => self.on_open(ctx, open),
            Body::PeerConnectionSuccess(PeerAddress { peer_ip }) => {
                self.pending.remove(peer_ip);
                Ok(())
            }
            Body::PeerConnectionFailure(failure) => {
                self.pending.remove(&failure.peer_ip);
                if self.phase == PeerPhase::AwaitingAcceptance && self.pending.is_empty() {
                    self.become_ready(
                        ctx,
                        "PeerConnectionFailure",
                        json!({ "peerIp": failure.peer_ip, "reason": failure.reason }),
                    );
                }
                Ok(())
            }
            Body::ClientRequest(_) => {
                ctx.send_as(message.source.clone(), Role::Api, message.body.clone())?;
                Ok(())
            }
            Body::ClientResponse(_) => {
                ctx.send(Role::Api, message.body.clone())?;
                Ok(())
            }
            Body::Any(request) => self.on_any(ctx, request),
            _ => Err(missing(delivery)),
        }
    }
}
