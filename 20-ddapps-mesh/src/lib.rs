//! Framework for clustered nodes that talk over a typed message bus.
//!
//! A node is a set of components wired to one in-process [`bus::Bus`]. Each
//! module covers one responsibility:
//!
//! - [`message`] defines the wire envelope, payloads and operation types.
//! - [`bus`] and [`component`] provide the actor substrate: topic routing,
//!   per-component inbox tasks and trace context propagation.
//! - [`registry`] keeps the live peer and client connections.
//! - [`net`] serves `/discovery`, `/ready`, `/client` and `/peer` and bridges
//!   sockets to the bus.
//! - [`peer`] runs the gossip membership walk that makes a node ready.
//! - [`api`] is the client gateway: token correlation and tracing.
//! - [`monitor`] is the distributed key/value surface with get, set and watch.
//! - [`logger`] observes all traffic and streams it to log watchers.
//! - [`client`] is the RPC client for a node's `/client` endpoint.
//! - [`node`] assembles everything and runs the HTTP server.
//! - [`testing`] has helpers for asserting on bus traffic.

pub mod api;
pub mod bus;
pub mod cli;
pub mod client;
pub mod component;
pub mod config;
pub mod error;
pub mod logger;
pub mod message;
pub mod monitor;
pub mod net;
pub mod node;
pub mod peer;
pub mod registry;
pub mod testing;
