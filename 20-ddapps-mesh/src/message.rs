//! Message envelope, typed payloads and the JSON wire codec.
//!
//! Every message on the bus and on the wire is `{type, source, destination,
//! payload}`. Internally the `type`/`payload` pair is the [`Body`] enum; the
//! wire form is produced by [`Message::encode`] and read back by
//! [`Message::decode`].

use std::fmt;
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Well-known component roles. Destinations are either one of these names,
/// a custom component name, or a connection identifier (`ip` / `ip-id`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    Logger,
    Net,
    Api,
    Peer,
    Monitor,
}

impl Role {
    pub const ALL: [Role; 5] = [Role::Logger, Role::Net, Role::Api, Role::Peer, Role::Monitor];

    pub const fn as_str(self) -> &'static str {
        match self {
            Role::Logger => "Logger",
            Role::Net => "Net",
            Role::Api => "Api",
            Role::Peer => "Peer",
            Role::Monitor => "Monitor",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<Role> for String {
    fn from(role: Role) -> Self {
        role.as_str().to_string()
    }
}

/// Topic every component listens on for node-wide broadcasts.
pub const BROADCAST: &str = "All";

/// Largest frame a connection will write.
pub const MAX_FRAME_BYTES: usize = 1 << 24;

/// Operations a client can request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpType {
    Any,
    Ping,
    Pong,
    MonOp,
    MonWatch,
    Crash,
    Trace,
}

impl OpType {
    pub const fn as_str(self) -> &'static str {
        match self {
            OpType::Any => "Any",
            OpType::Ping => "Ping",
            OpType::Pong => "Pong",
            OpType::MonOp => "MonOp",
            OpType::MonWatch => "MonWatch",
            OpType::Crash => "Crash",
            OpType::Trace => "Trace",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Any" => Ok(OpType::Any),
            "Ping" => Ok(OpType::Ping),
            "Pong" => Ok(OpType::Pong),
            "MonOp" => Ok(OpType::MonOp),
            "MonWatch" => Ok(OpType::MonWatch),
            "Crash" => Ok(OpType::Crash),
            "Trace" => Ok(OpType::Trace),
            other => Err(other.to_string()),
        }
    }
}

/// Milliseconds since the Unix epoch, the timestamp unit used on the wire.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as i64)
        .unwrap_or_default()
}

/// Request sent by a client: `{token, type, trace, payload, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientRequest {
    pub token: String,
    #[serde(rename = "type")]
    pub op: String,
    #[serde(default)]
    pub trace: bool,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: i64,
}

/// Response or notification for a client: `{token, type, payload, timestamp}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientResponse {
    pub token: String,
    #[serde(rename = "type")]
    pub op: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub timestamp: i64,
}

impl ClientResponse {
    pub fn new(token: impl Into<String>, op: impl Into<String>, payload: Value) -> Self {
        Self {
            token: token.into(),
            op: op.into(),
            payload,
            timestamp: now_millis(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum MonOpType {
    Get,
    Set,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Metric {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
}

/// Monitoring get/set operation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonOp {
    pub op: MonOpType,
    pub metric: Metric,
}

impl MonOp {
    pub fn get(key: impl Into<String>) -> Self {
        Self {
            op: MonOpType::Get,
            metric: Metric {
                key: key.into(),
                value: None,
            },
        }
    }

    pub fn set(key: impl Into<String>, value: Value) -> Self {
        Self {
            op: MonOpType::Set,
            metric: Metric {
                key: key.into(),
                value: Some(value),
            },
        }
    }

    pub fn with_value(&self, value: Value) -> Self {
        Self {
            op: self.op,
            metric: Metric {
                key: self.metric.key.clone(),
                value: Some(value),
            },
        }
    }
}

/// Standing subscription to a key. `expire == -1` never expires.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonWatch {
    pub key: String,
    #[serde(default = "MonWatch::forever")]
    pub expire: i64,
}

impl MonWatch {
    fn forever() -> i64 {
        -1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogEntry {
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoveryResult {
    pub success: bool,
    pub result: String,
    pub source: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub hostname: String,
    pub ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerAddress {
    pub peer_ip: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PeerFailure {
    pub peer_ip: String,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct KnownPeers {
    pub known_peers: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InvalidDestination {
    pub invalid_message_destination: String,
    pub available_peers: Vec<String>,
    pub available_clients: Vec<String>,
}

/// Application-defined message type the core does not know about.
#[derive(Debug, Clone, PartialEq)]
pub struct CustomMessage {
    pub kind: String,
    pub payload: Value,
}

/// Message `type` plus its payload.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload")]
pub enum Body {
    Any(Value),
    LogMessage(LogEntry),
    InitialMessage,
    DiscoveryResult(DiscoveryResult),
    DiscoveryEndpointCalled(String),
    ClientRequest(ClientRequest),
    ClientResponse(ClientResponse),
    ClientNotification(ClientResponse),
    ClientConnectionOpen(ConnectionInfo),
    ClientConnectionClose(String),
    ClientRequestsReleased(Vec<String>),
    PeerConnectionRequest(PeerAddress),
    PeerConnectionAccepted(KnownPeers),
    PeerConnectionOpen(ConnectionInfo),
    PeerConnectionSuccess(PeerAddress),
    PeerConnectionFailure(PeerFailure),
    PeerConnectionClose(String),
    MonGetRequest(MonOp),
    MonGetResponse(MonOp),
    MonSetRequest(MonOp),
    MonSetResponse(MonOp),
    MonWatchRequest(MonWatch),
    MonWatchTick(String),
    LogWatchRequest(String),
    InvalidMessageDestination(InvalidDestination),
    InvalidClientRequestType(ClientRequest),
    #[serde(skip)]
    Custom(CustomMessage),
}

impl Body {
    const KINDS: [&'static str; 26] = [
        "Any",
        "LogMessage",
        "InitialMessage",
        "DiscoveryResult",
        "DiscoveryEndpointCalled",
        "ClientRequest",
        "ClientResponse",
        "ClientNotification",
        "ClientConnectionOpen",
        "ClientConnectionClose",
        "ClientRequestsReleased",
        "PeerConnectionRequest",
        "PeerConnectionAccepted",
        "PeerConnectionOpen",
        "PeerConnectionSuccess",
        "PeerConnectionFailure",
        "PeerConnectionClose",
        "MonGetRequest",
        "MonGetResponse",
        "MonSetRequest",
        "MonSetResponse",
        "MonWatchRequest",
        "MonWatchTick",
        "LogWatchRequest",
        "InvalidMessageDestination",
        "InvalidClientRequestType",
    ];

    pub fn custom(kind: impl Into<String>, payload: Value) -> Self {
        Body::Custom(CustomMessage {
            kind: kind.into(),
            payload,
        })
    }

    pub fn log(message: impl Into<String>, detail: Option<Value>) -> Self {
        Body::LogMessage(LogEntry {
            message: message.into(),
            detail,
        })
    }

    /// The wire `type` of this body.
    pub fn kind(&self) -> &str {
        match self {
            Body::Any(_) => "Any",
            Body::LogMessage(_) => "LogMessage",
            Body::InitialMessage => "InitialMessage",
            Body::DiscoveryResult(_) => "DiscoveryResult",
            Body::DiscoveryEndpointCalled(_) => "DiscoveryEndpointCalled",
            Body::ClientRequest(_) => "ClientRequest",
            Body::ClientResponse(_) => "ClientResponse",
            Body::ClientNotification(_) => "ClientNotification",
            Body::ClientConnectionOpen(_) => "ClientConnectionOpen",
            Body::ClientConnectionClose(_) => "ClientConnectionClose",
            Body::ClientRequestsReleased(_) => "ClientRequestsReleased",
            Body::PeerConnectionRequest(_) => "PeerConnectionRequest",
            Body::PeerConnectionAccepted(_) => "PeerConnectionAccepted",
            Body::PeerConnectionOpen(_) => "PeerConnectionOpen",
            Body::PeerConnectionSuccess(_) => "PeerConnectionSuccess",
            Body::PeerConnectionFailure(_) => "PeerConnectionFailure",
            Body::PeerConnectionClose(_) => "PeerConnectionClose",
            Body::MonGetRequest(_) => "MonGetRequest",
            Body::MonGetResponse(_) => "MonGetResponse",
            Body::MonSetRequest(_) => "MonSetRequest",
            Body::MonSetResponse(_) => "MonSetResponse",
            Body::MonWatchRequest(_) => "MonWatchRequest",
            Body::MonWatchTick(_) => "MonWatchTick",
            Body::LogWatchRequest(_) => "LogWatchRequest",
            Body::InvalidMessageDestination(_) => "InvalidMessageDestination",
            Body::InvalidClientRequestType(_) => "InvalidClientRequestType",
            Body::Custom(custom) => &custom.kind,
        }
    }

    /// Token carried by client traffic, if any.
    pub fn token(&self) -> Option<&str> {
        match self {
            Body::ClientRequest(request) | Body::InvalidClientRequestType(request) => {
                Some(&request.token)
            }
            Body::ClientResponse(response) | Body::ClientNotification(response) => {
                Some(&response.token)
            }
            _ => None,
        }
    }

    /// Traffic that terminates or streams back to a client.
    pub fn is_client_reply(&self) -> bool {
        matches!(
            self,
            Body::ClientResponse(_)
                | Body::ClientNotification(_)
                | Body::InvalidClientRequestType(_)
        )
    }

    /// Splits the body into its wire `type` and `payload`.
    pub fn into_parts(self) -> Result<(String, Value), serde_json::Error> {
        if let Body::Custom(custom) = self {
            return Ok((custom.kind, custom.payload));
        }
        let kind = self.kind().to_string();
        let payload = match serde_json::to_value(&self)? {
            Value::Object(mut map) => map.remove("payload").unwrap_or(Value::Null),
            _ => Value::Null,
        };
        Ok((kind, payload))
    }

    /// Rebuilds a body from a wire `type` and `payload`. Unknown types become
    /// [`Body::Custom`].
    pub fn from_parts(kind: &str, payload: Value) -> Result<Self, serde_json::Error> {
        if !Self::KINDS.contains(&kind) {
            return Ok(Body::custom(kind, payload));
        }
        let mut tagged = serde_json::Map::new();
        tagged.insert("type".to_string(), Value::String(kind.to_string()));
        if kind != "InitialMessage" {
            tagged.insert("payload".to_string(), payload);
        }
        serde_json::from_value(Value::Object(tagged))
    }
}

/// On-the-wire envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct WireMessage {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    source: String,
    #[serde(default)]
    destination: String,
    #[serde(default)]
    payload: Value,
}

/// Immutable envelope routed by the bus.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub source: String,
    pub destination: String,
    pub body: Body,
}

impl Message {
    pub fn new(source: impl Into<String>, destination: impl Into<String>, body: Body) -> Self {
        Self {
            source: source.into(),
            destination: destination.into(),
            body,
        }
    }

    pub fn kind(&self) -> &str {
        self.body.kind()
    }

    /// JSON value of the wire envelope.
    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        let (kind, payload) = self.body.clone().into_parts()?;
        serde_json::to_value(WireMessage {
            kind,
            source: self.source.clone(),
            destination: self.destination.clone(),
            payload,
        })
    }

    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(&self.to_value()?)
    }

    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        let wire: WireMessage = serde_json::from_str(text)?;
        Ok(Self {
            source: wire.source,
            destination: wire.destination,
            body: Body::from_parts(&wire.kind, wire.payload)?,
        })
    }

    /// Deterministic sha256 digest of the wire form, hex encoded.
    ///
    /// Two structurally identical messages share a digest, so this is only a
    /// fingerprint for the bus trace log; request correlation uses trace
    /// contexts.
    pub fn digest(&self) -> String {
        let content = self.encode().unwrap_or_default();
        Sha256::digest(content.as_bytes())
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn client_request_uses_wire_field_names() {
        let text = r#"{"type":"ClientRequest","source":"Client","destination":"127.0.0.1",
            "payload":{"token":"abc","type":"Ping","trace":true,"payload":null,"timestamp":42}}"#;
        let message = Message::decode(text).expect("decode client request");

        assert_eq!(message.source, "Client");
        match message.body {
            Body::ClientRequest(request) => {
                assert_eq!(request.token, "abc");
                assert_eq!(request.op, "Ping");
                assert!(request.trace);
                assert_eq!(request.timestamp, 42);
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn peer_payloads_are_camel_case() {
        let message = Message::new(
            "Peer",
            "10.0.0.2",
            Body::PeerConnectionAccepted(KnownPeers {
                known_peers: vec!["10.0.0.3".into()],
            }),
        );
        let value = message.to_value().expect("encode");

        assert_eq!(value["type"], "PeerConnectionAccepted");
        assert_eq!(value["payload"]["knownPeers"], json!(["10.0.0.3"]));
    }

    #[test]
    fn unknown_types_decode_as_custom() {
        let text =
            r#"{"type":"SetSecret","source":"10.0.0.2","destination":"Peer","payload":"s3cr3t"}"#;
        let message = Message::decode(text).expect("decode custom");

        assert_eq!(message.kind(), "SetSecret");
        assert_eq!(message.body, Body::custom("SetSecret", json!("s3cr3t")));
        assert_eq!(Message::decode(&message.encode().unwrap()).unwrap(), message);
    }

    #[test]
    fn initial_message_has_no_payload() {
        let message = Message::new("Node", BROADCAST, Body::InitialMessage);
        let value = message.to_value().expect("encode");
        assert_eq!(value["payload"], Value::Null);
        assert_eq!(Message::decode(&message.encode().unwrap()).unwrap().body, Body::InitialMessage);
    }

    #[test]
    fn digest_is_deterministic() {
        let version = MonOp::get("/ddapps/node/version");
        let first = Message::new("Api", "Monitor", Body::MonGetRequest(version));
        let second = first.clone();
        let other = Message::new("Api", "Monitor", Body::MonGetRequest(MonOp::get("/deno/")));

        assert_eq!(first.digest(), second.digest());
        assert_ne!(first.digest(), other.digest());
        assert_eq!(first.digest().len(), 64);
    }

    #[test]
    fn mon_watch_defaults_to_forever() {
        let watch: MonWatch =
            serde_json::from_value(json!({"key": "/ddapps/node/version"})).unwrap();
        assert_eq!(watch.expire, -1);
    }
}
