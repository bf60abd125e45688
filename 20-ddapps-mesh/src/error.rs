use thiserror::Error;

/// Publishing failed before any component saw the message.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BusError {
    #[error("no subscriber for topic '{0}'")]
    NoSubscriber(String),
}

/// A component handler could not process a delivery.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The component has no handler for this message type on this topic.
    #[error("missing handler for {0}")]
    MissingHandler(String),
    #[error(transparent)]
    Bus(#[from] BusError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Codec(#[from] serde_json::Error),
    #[error("{0}")]
    Other(String),
}

impl HandlerError {
    pub fn other(message: impl Into<String>) -> Self {
        HandlerError::Other(message.into())
    }
}

/// Failures sending a frame over a registered connection.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("ContentTooLong::{0}")]
    ContentTooLong(usize),
    #[error("NotConnected")]
    NotConnected,
}

/// Failures surfaced by the RPC client.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
    #[error("connection closed")]
    Closed,
    #[error("timed out waiting for a response")]
    Timeout,
    #[error("request rejected by the node: {0}")]
    Rejected(String),
}
