//! RPC client for a node's `/client` endpoint.
//!
//! One WebSocket carries any number of concurrent requests; replies are
//! matched to their request by token.

use std::{collections::HashMap, sync::Arc, time::Duration};

use futures::{SinkExt, StreamExt};
use nanoid::nanoid;
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite};
use tracing::debug;

use crate::error::ClientError;
use crate::message::{
    Body, ClientRequest, ClientResponse, Message, MonOp, MonWatch, OpType, now_millis,
};

#[derive(Debug, Clone, PartialEq)]
enum Reply {
    Notification(ClientResponse),
    Response(ClientResponse),
    Rejected(ClientRequest),
}

type Pending = Arc<Mutex<HashMap<String, UnboundedSender<Reply>>>>;

pub struct Client {
    server: String,
    outbound: UnboundedSender<String>,
    pending: Pending,
    timeout: Option<Duration>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

/// A terminal response together with the components that reported handling
/// the request, in the order they reported.
#[derive(Debug, Clone, PartialEq)]
pub struct Traced {
    pub response: ClientResponse,
    pub trace: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchEvent {
    /// Periodic value; more will follow.
    Update(Value),
    /// Last value of an expiring watch.
    Final(Value),
}

/// Stream of values for one `MonWatch` request.
pub struct Watch {
    token: String,
    replies: UnboundedReceiver<Reply>,
}

impl Watch {
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Next value, or `None` once the watch ended or the connection closed.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.replies.recv().await? {
                Reply::Notification(notification) => {
                    if notification.op == OpType::MonWatch.as_str() {
                        return Some(WatchEvent::Update(watched_value(notification.payload)));
                    }
                }
                Reply::Response(response) => {
                    self.replies.close();
                    return Some(WatchEvent::Final(watched_value(response.payload)));
                }
                Reply::Rejected(_) => return None,
            }
        }
    }
}

fn watched_value(payload: Value) -> Value {
    match payload {
        Value::Object(mut map) => map.remove("value").unwrap_or(Value::Null),
        other => other,
    }
}

impl Client {
    /// Connects to `ws://{addr}:{port}/client`.
    pub async fn connect(addr: &str, port: u16) -> Result<Self, ClientError> {
        let url = format!("ws://{addr}:{port}/client");
        let (socket, _) = connect_async(url.as_str()).await?;
        let (mut sink, mut stream) = socket.split();

        let (outbound, mut frames) = mpsc::unbounded_channel::<String>();
        let writer = tokio::spawn(async move {
            while let Some(text) = frames.recv().await {
                if let Err(err) = sink.send(tungstenite::Message::text(text)).await {
                    debug!(error = %err, "client write failed");
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let replies = Arc::clone(&pending);
        let reader = tokio::spawn(async move {
            while let Some(frame) = stream.next().await {
                match frame {
                    Ok(tungstenite::Message::Text(text)) => {
                        dispatch_reply(&replies, text.as_str())
                    }
                    Ok(tungstenite::Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        debug!(error = %err, "client read failed");
                        break;
                    }
                }
            }
            replies.lock().clear();
        });

        Ok(Self {
            server: addr.to_string(),
            outbound,
            pending,
            timeout: None,
            writer,
            reader,
        })
    }

    /// Bounds how long [`Client::call`] and friends wait for an answer.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn submit(
        &self,
        op: &str,
        payload: Value,
        trace: bool,
    ) -> Result<(String, UnboundedReceiver<Reply>), ClientError> {
        let token = nanoid!();
        let (tx, rx) = mpsc::unbounded_channel();
        self.pending.lock().insert(token.clone(), tx);

        let request = ClientRequest {
            token: token.clone(),
            op: op.to_string(),
            trace,
            payload,
            timestamp: now_millis(),
        };
        let frame =
            Message::new("Client", self.server.clone(), Body::ClientRequest(request)).encode()?;
        if self.outbound.send(frame).is_err() {
            self.pending.lock().remove(&token);
            return Err(ClientError::Closed);
        }
        Ok((token, rx))
    }

    /// Waits for the terminal reply to `token`. A request that times out is
    /// forgotten, so a late reply is dropped by the reader.
    async fn settle(
        &self,
        op: &str,
        token: String,
        mut replies: UnboundedReceiver<Reply>,
    ) -> Result<Traced, ClientError> {
        let mut trace = Vec::new();
        let wait = async {
            loop {
                match replies.recv().await {
                    Some(Reply::Notification(notification)) => {
                        if notification.op == OpType::Trace.as_str() {
                            if let Some(component) = notification.payload.as_str() {
                                trace.push(component.to_string());
                            }
                        }
                    }
                    Some(Reply::Response(response)) => return Ok(response),
                    Some(Reply::Rejected(request)) => {
                        return Err(ClientError::Rejected(request.op));
                    }
                    None => return Err(ClientError::Closed),
                }
            }
        };

        let response = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, wait).await {
                Ok(settled) => settled?,
                Err(_) => {
                    self.pending.lock().remove(&token);
                    debug!(op, %token, "request timed out");
                    return Err(ClientError::Timeout);
                }
            },
            None => wait.await?,
        };
        debug!(op, token = %response.token, "request settled");
        Ok(Traced { response, trace })
    }

    /// Sends `op` and waits for its terminal response.
    pub async fn call(&self, op: &str, payload: Value) -> Result<ClientResponse, ClientError> {
        let (token, replies) = self.submit(op, payload, false)?;
        Ok(self.settle(op, token, replies).await?.response)
    }

    /// Like [`Client::call`], asking every component on the way to report.
    pub async fn call_traced(&self, op: &str, payload: Value) -> Result<Traced, ClientError> {
        let (token, replies) = self.submit(op, payload, true)?;
        self.settle(op, token, replies).await
    }

    /// Round-trip latency in milliseconds as measured by the node.
    pub async fn ping(&self) -> Result<i64, ClientError> {
        let response = self.call(OpType::Ping.as_str(), Value::Null).await?;
        Ok(response.payload.as_i64().unwrap_or_default())
    }

    pub async fn monop(&self, op: MonOp) -> Result<MonOp, ClientError> {
        let response = self
            .call(OpType::MonOp.as_str(), serde_json::to_value(op)?)
            .await?;
        Ok(serde_json::from_value(response.payload)?)
    }

    /// Value stored under `key`.
    pub async fn monget(&self, key: &str) -> Result<Value, ClientError> {
        let op = self.monop(MonOp::get(key)).await?;
        Ok(op.metric.value.unwrap_or(Value::Null))
    }

    /// Stores `value` under `key` and returns what the node stored.
    pub async fn monset(&self, key: &str, value: Value) -> Result<Value, ClientError> {
        let op = self.monop(MonOp::set(key, value)).await?;
        Ok(op.metric.value.unwrap_or(Value::Null))
    }

    /// Watches `key`; `expire == -1` never ends on its own.
    pub fn monwatch(&self, key: &str, expire: i64) -> Result<Watch, ClientError> {
        let watch = MonWatch {
            key: key.to_string(),
            expire,
        };
        let payload = serde_json::to_value(watch)?;
        let (token, replies) = self.submit(OpType::MonWatch.as_str(), payload, false)?;
        Ok(Watch { token, replies })
    }

    /// Demo passthrough answered by the Peer role.
    pub async fn any(&self, op: &str, payload: Value) -> Result<ClientResponse, ClientError> {
        self.call(OpType::Any.as_str(), json!({ "type": op, "payload": payload }))
            .await
    }

    /// Asks the node to exit. No answer is expected.
    pub fn crash(&self) -> Result<(), ClientError> {
        self.submit(OpType::Crash.as_str(), Value::Null, false)?;
        Ok(())
    }

    pub async fn close(self) {
        let Client { outbound, writer, reader, .. } = self;
        drop(outbound);
        let _ = writer.await;
        reader.abort();
    }
}

fn dispatch_reply(pending: &Pending, text: &str) {
    let message = match Message::decode(text) {
        Ok(message) => message,
        Err(err) => {
            debug!(error = %err, "undecodable reply");
            return;
        }
    };

    let mut pending = pending.lock();
    match message.body {
        Body::ClientNotification(notification) => {
            if let Some(tx) = pending.get(&notification.token) {
                let _ = tx.send(Reply::Notification(notification));
            }
        }
        Body::ClientResponse(response) => {
            if let Some(tx) = pending.remove(&response.token) {
                let _ = tx.send(Reply::Response(response));
            }
        }
        Body::InvalidClientRequestType(request) => {
            if let Some(tx) = pending.remove(&request.token) {
                let _ = tx.send(Reply::Rejected(request));
            }
        }
        other => debug!(kind = other.kind(), "unexpected reply"),
    }
}
