//! Live connection registries owned by Net.
//!
//! A peer is registered under its hostname: the bare IP for outbound links,
//! `ip-id` for inbound ones, so two links to the same node can coexist.

use std::collections::HashMap;

use serde::Serialize;
use tokio::sync::mpsc::UnboundedSender;

use crate::error::TransportError;
use crate::message::MAX_FRAME_BYTES;

/// Writer half of a registered connection: frames queued here are written to
/// the socket by the connection's session task.
#[derive(Debug, Clone)]
pub struct Link {
    tx: UnboundedSender<String>,
}

impl Link {
    pub fn new(tx: UnboundedSender<String>) -> Self {
        Self { tx }
    }

    pub fn send(&self, frame: String) -> Result<(), TransportError> {
        if frame.len() > MAX_FRAME_BYTES {
            return Err(TransportError::ContentTooLong(frame.len()));
        }
        self.tx.send(frame).map_err(|_| TransportError::NotConnected)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Both handles write to the same connection.
    pub fn same_link(&self, other: &Link) -> bool {
        self.tx.same_channel(&other.tx)
    }
}

#[derive(Debug, Clone)]
pub struct RemotePeer {
    pub hostname: String,
    pub link: Link,
}

impl RemotePeer {
    /// The hostname without its connection discriminator.
    pub fn ip(&self) -> &str {
        peer_ip(&self.hostname)
    }
}

/// Strips the `-id` suffix Net adds to inbound peer hostnames.
pub fn peer_ip(hostname: &str) -> &str {
    hostname.split('-').next().unwrap_or(hostname)
}

#[derive(Debug, Default)]
pub struct PeerRegistry {
    peers: HashMap<String, RemotePeer>,
    order: Vec<String>,
}

impl PeerRegistry {
    pub fn insert(&mut self, hostname: impl Into<String>, link: Link) {
        let hostname = hostname.into();
        if !self.peers.contains_key(&hostname) {
            self.order.push(hostname.clone());
        }
        self.peers.insert(
            hostname.clone(),
            RemotePeer { hostname, link },
        );
    }

    pub fn remove(&mut self, hostname: &str) -> Option<RemotePeer> {
        self.order.retain(|existing| existing != hostname);
        self.peers.remove(hostname)
    }

    pub fn get(&self, hostname: &str) -> Option<&RemotePeer> {
        self.peers.get(hostname)
    }

    pub fn all(&self) -> impl Iterator<Item = &RemotePeer> {
        self.order.iter().filter_map(|hostname| self.peers.get(hostname))
    }

    pub fn hostnames(&self) -> Vec<String> {
        self.order.clone()
    }

    /// Unique member IPs in registration order.
    pub fn ips(&self) -> Vec<String> {
        let mut ips: Vec<String> = Vec::new();
        for peer in self.all() {
            if !ips.iter().any(|ip| ip == peer.ip()) {
                ips.push(peer.ip().to_string());
            }
        }
        ips
    }

    #[cfg(test)]
    pub fn count(&self) -> usize {
        self.peers.len()
    }

    pub fn quorum(&self) -> usize {
        quorum(self.ips().len())
    }
}

/// Membership-size heuristic over `members` remote IPs.
pub fn quorum(members: usize) -> usize {
    (members + 1) / 2 + 1
}

#[derive(Debug, Clone)]
pub struct ClientHandle {
    pub hostname: String,
    pub ip: String,
    pub link: Link,
}

#[derive(Debug, Default)]
pub struct ClientRegistry {
    clients: HashMap<String, ClientHandle>,
}

impl ClientRegistry {
    pub fn insert(&mut self, client: ClientHandle) {
        self.clients.insert(client.hostname.clone(), client);
    }

    pub fn remove(&mut self, hostname: &str) -> Option<ClientHandle> {
        self.clients.remove(hostname)
    }

    pub fn get(&self, hostname: &str) -> Option<&ClientHandle> {
        self.clients.get(hostname)
    }

    pub fn hostnames(&self) -> Vec<String> {
        let mut hostnames: Vec<String> = self.clients.keys().cloned().collect();
        hostnames.sort();
        hostnames
    }
}

/// Read-only snapshot of the transport state, published by Net.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetView {
    /// Discovery finished, whatever its outcome.
    pub ready: bool,
    /// Connected peer hostnames.
    pub peers: Vec<String>,
    /// Unique connected peer IPs.
    pub peer_ips: Vec<String>,
    pub clients: Vec<String>,
    pub quorum: usize,
}

impl NetView {
    pub fn capture(ready: bool, peers: &PeerRegistry, clients: &ClientRegistry) -> Self {
        Self {
            ready,
            peers: peers.hostnames(),
            peer_ips: peers.ips(),
            clients: clients.hostnames(),
            quorum: peers.quorum(),
        }
    }

    pub fn knows_peer(&self, ip: &str) -> bool {
        self.peer_ips.iter().any(|known| known == ip)
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    fn link() -> Link {
        let (tx, rx) = mpsc::unbounded_channel();
        std::mem::forget(rx);
        Link::new(tx)
    }

    fn registry(hostnames: &[&str]) -> PeerRegistry {
        let mut registry = PeerRegistry::default();
        for hostname in hostnames {
            registry.insert(*hostname, link());
        }
        registry
    }

    #[test]
    fn quorum_follows_member_count() {
        assert_eq!(registry(&[]).quorum(), 1);
        assert_eq!(registry(&["10.0.0.2"]).quorum(), 2);
        assert_eq!(registry(&["10.0.0.2", "10.0.0.3", "10.0.0.4"]).quorum(), 3);
        assert_eq!(
            registry(&["10.0.0.2", "10.0.0.3", "10.0.0.4", "10.0.0.5"]).quorum(),
            3
        );
    }

    #[test]
    fn ips_collapse_connection_suffixes() {
        let registry = registry(&["10.0.0.2", "10.0.0.2-7", "10.0.0.3-8"]);

        assert_eq!(registry.count(), 3);
        assert_eq!(registry.ips(), vec!["10.0.0.2", "10.0.0.3"]);
        assert_eq!(registry.quorum(), quorum(2));
    }

    #[test]
    fn oversized_frames_are_refused() {
        let result = link().send("x".repeat(MAX_FRAME_BYTES + 1));
        assert_eq!(result, Err(TransportError::ContentTooLong(MAX_FRAME_BYTES + 1)));
    }

    #[test]
    fn closed_links_report_not_connected() {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        assert_eq!(Link::new(tx).send("{}".into()), Err(TransportError::NotConnected));
    }
}
