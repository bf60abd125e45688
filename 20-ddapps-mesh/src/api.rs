//! Api: the client gateway.
//!
//! Every client request enters the node here. The gateway remembers which
//! connection sent each token, opens the trace context the rest of the chain
//! inherits, and routes terminal responses and notifications back by token.

use std::collections::HashMap;

use serde_json::json;
use tracing::{debug, info, warn};

use crate::bus::{ContextId, Delivery, TraceContext};
use crate::component::{Component, Context, missing};
use crate::error::HandlerError;
use crate::message::{
    Body, ClientRequest, ClientResponse, MonOp, MonOpType, MonWatch, OpType, Role, now_millis,
};

/// Application hook answering operation types the gateway does not know.
///
/// Built-in operations are always dispatched first; the extension only sees
/// what the gateway would otherwise reject.
pub trait GatewayExtension: Send + 'static {
    /// Role name the gateway answers to in addition to `Api`.
    fn name(&self) -> &str;

    /// Returns `Ok(true)` when the request was handled.
    fn handle_request(
        &mut self,
        request: &ClientRequest,
        source: &str,
        ctx: &Context,
    ) -> Result<bool, HandlerError>;

    /// Any other message addressed to the gateway. Returns `Ok(true)` when
    /// handled.
    fn handle_message(
        &mut self,
        _delivery: &Delivery,
        _ctx: &Context,
    ) -> Result<bool, HandlerError> {
        Ok(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct TraceEntry {
    token: String,
    notify: bool,
}

#[derive(Default)]
pub struct Api {
    /// token -> connection the request came from
    requests: HashMap<String, String>,
    traces: HashMap<ContextId, TraceEntry>,
    extension: Option<Box<dyn GatewayExtension>>,
}

impl Api {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_extension(extension: Box<dyn GatewayExtension>) -> Self {
        Self {
            extension: Some(extension),
            ..Self::default()
        }
    }

    /// Source recorded for a pending token.
    pub fn pending(&self, token: &str) -> Option<&str> {
        self.requests.get(token).map(String::as_str)
    }

    #[cfg(test)]
    fn pending_count(&self) -> usize {
        self.requests.len()
    }

    #[cfg(test)]
    fn trace_count(&self) -> usize {
        self.traces.len()
    }

    /// Whether a participation report for `token` belongs to an open trace
    /// whose client asked to follow it.
    fn follows(&self, trace: Option<&TraceContext>, token: &str) -> bool {
        trace
            .and_then(|trace| self.traces.get(&trace.id))
            .is_some_and(|entry| entry.notify && entry.token == token)
    }

    fn release(&mut self, token: &str) {
        self.requests.remove(token);
        self.traces.retain(|_, entry| entry.token != token);
    }

    fn on_request(
        &mut self,
        request: &ClientRequest,
        source: &str,
        ctx: &mut Context,
    ) -> Result<(), HandlerError> {
        self.requests.insert(request.token.clone(), source.to_string());
        let trace = ctx.begin_trace(request.token.clone(), request.trace);
        self.traces.insert(
            trace.id,
            TraceEntry {
                token: request.token.clone(),
                notify: request.trace,
            },
        );

        if self.follows(Some(&trace), &request.token) {
            let notification =
                ClientResponse::new(&request.token, OpType::Trace.as_str(), json!(self.name()));
            ctx.send(source, Body::ClientNotification(notification))?;
        }

        match request.op.parse::<OpType>() {
            Ok(OpType::Ping) => {
                let latency = now_millis().saturating_sub(request.timestamp).max(0);
                ctx.respond(OpType::Pong.as_str(), json!(latency))?;
            }
            Ok(OpType::MonOp) => match serde_json::from_value::<MonOp>(request.payload.clone()) {
                Ok(op) => {
                    let body = match op.op {
                        MonOpType::Get => Body::MonGetRequest(op),
                        MonOpType::Set => Body::MonSetRequest(op),
                    };
                    ctx.send(Role::Monitor, body)?;
                }
                Err(err) => {
                    ctx.log(
                        format!("{}::ClientRequest::MonOp::InvalidType::{err}", self.name()),
                        Some(request.payload.clone()),
                    );
                    self.invalid(request, source, ctx)?;
                }
            },
            Ok(OpType::MonWatch) => {
                match serde_json::from_value::<MonWatch>(request.payload.clone()) {
                    Ok(watch) => ctx.send(Role::Monitor, Body::MonWatchRequest(watch))?,
                    Err(_) => self.invalid(request, source, ctx)?,
                }
            }
            Ok(OpType::Any) => {
                ctx.send(Role::Peer, Body::Any(serde_json::to_value(request)?))?;
            }
            Ok(OpType::Crash) => {
                warn!(%source, "crash requested by client");
                std::process::exit(1);
            }
            _ => {
                let handled = match self.extension.as_mut() {
                    Some(extension) => extension.handle_request(request, source, ctx)?,
                    None => false,
                };
                if !handled {
                    self.invalid(request, source, ctx)?;
                }
            }
        }
        Ok(())
    }

    /// Rejects a request whose operation nobody handles.
    fn invalid(
        &mut self,
        request: &ClientRequest,
        source: &str,
        ctx: &Context,
    ) -> Result<(), HandlerError> {
        ctx.send(source, Body::InvalidClientRequestType(request.clone()))?;
        ctx.log(
            format!(
                "{}::ClientRequest::InvalidClientRequestType::{}",
                self.name(),
                request.op
            ),
            Some(json!({ "source": source, "token": request.token })),
        );
        self.release(&request.token);
        Ok(())
    }

    fn on_response(
        &mut self,
        response: &ClientResponse,
        ctx: &Context,
    ) -> Result<(), HandlerError> {
        let Some(source) = self.pending(&response.token).map(str::to_string) else {
            ctx.log(
                format!("Api::ClientResponse::InvalidRequestToken::{}", response.token),
                Some(json!({ "type": response.op })),
            );
            return Ok(());
        };
        debug!(token = %response.token, "response routed");
        self.release(&response.token);
        ctx.send(source, Body::ClientResponse(response.clone()))?;
        Ok(())
    }

    fn on_notification(
        &self,
        notification: &ClientResponse,
        trace: Option<&TraceContext>,
        ctx: &Context,
    ) -> Result<(), HandlerError> {
        if notification.op == OpType::Trace.as_str() && !self.follows(trace, &notification.token) {
            debug!(token = %notification.token, "trace report outside an open trace dropped");
            return Ok(());
        }
        match self.pending(&notification.token) {
            Some(source) => {
                ctx.send(source, Body::ClientNotification(notification.clone()))?;
            }
            None => ctx.log(
                format!(
                    "Api::ClientNotification::InvalidRequestToken::{}",
                    notification.token
                ),
                None,
            ),
        }
        Ok(())
    }

    /// Drops everything owned by a closed connection and tells the owners of
    /// watchers and log feeds which tokens are gone.
    fn on_close(&mut self, hostname: &str, ctx: &Context) -> Result<(), HandlerError> {
        let released: Vec<String> = self
            .requests
            .iter()
            .filter(|(_, source)| source.as_str() == hostname)
            .map(|(token, _)| token.clone())
            .collect();
        if released.is_empty() {
            return Ok(());
        }

        for token in &released {
            self.release(token);
        }
        info!(%hostname, released = released.len(), "released pending requests");
        ctx.send(Role::Monitor, Body::ClientRequestsReleased(released.clone()))?;
        ctx.send(Role::Logger, Body::ClientRequestsReleased(released))?;
        Ok(())
    }
}

impl Component for Api {
    fn name(&self) -> &str {
        self.extension
            .as_ref()
            .map(|extension| extension.name())
            .unwrap_or(Role::Api.as_str())
    }

    fn roles(&self) -> Vec<String> {
        match &self.extension {
            Some(extension) => vec![extension.name().to_string(), Role::Api.into()],
            None => vec![Role::Api.into()],
        }
    }

    fn handle(&mut self, delivery: &Delivery, ctx: &mut Context) -> Result<(), HandlerError> {
        let message = &delivery.message;
        match &message.body {
            Body::InitialMessage | Body::ClientConnectionOpen(_) => Ok(()),
            Body::ClientRequest(request) => self.on_request(request, &message.source, ctx),
            Body::ClientResponse(response) => self.on_response(response, ctx),
            Body::ClientNotification(notification) => {
                self.on_notification(notification, delivery.trace.as_ref(), ctx)
            }
            Body::ClientConnectionClose(hostname) => self.on_close(hostname, ctx),
            _ => {
                let handled = match self.extension.as_mut() {
                    Some(extension) => extension.handle_message(delivery, ctx)?,
                    None => false,
                };
                if handled { Ok(()) } else { Err(missing(delivery)) }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Value;
    use tokio::sync::mpsc;

    use super::*;
    use crate::bus::Bus;
    use crate::message::Message;

    struct Harness {
        api: Api,
        ctx: Context,
        bus: Bus,
    }

    fn harness() -> Harness {
        let bus = Bus::new();
        let (inbox, _) = mpsc::unbounded_channel();
        Harness {
            api: Api::new(),
            ctx: Context::new(bus.clone(), "Api", inbox),
            bus,
        }
    }

    fn listen(bus: &Bus, topic: &str) -> mpsc::UnboundedReceiver<Delivery> {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.subscribe(topic, &tx);
        rx
    }

    fn request(token: &str, op: &str, payload: Value) -> ClientRequest {
        ClientRequest {
            token: token.into(),
            op: op.into(),
            trace: false,
            payload,
            timestamp: now_millis(),
        }
    }

    fn deliver(harness: &mut Harness, source: &str, body: Body) {
        deliver_traced(harness, source, body, None);
    }

    fn deliver_traced(
        harness: &mut Harness,
        source: &str,
        body: Body,
        trace: Option<TraceContext>,
    ) {
        let delivery = Delivery {
            topic: "Api".into(),
            message: Message::new(source, "Api", body),
            trace,
        };
        harness
            .api
            .handle(&delivery, &mut harness.ctx)
            .expect("handler should succeed");
    }

    #[test]
    fn closing_a_connection_releases_only_its_tokens() {
        let mut harness = harness();
        let mut monitor = listen(&harness.bus, "Monitor");
        let _logger = listen(&harness.bus, "Logger");
        let watch = json!({ "key": "/ddapps/node/version", "expire": -1 });

        deliver(&mut harness, "A", Body::ClientRequest(request("t1", "MonWatch", watch.clone())));
        deliver(&mut harness, "A", Body::ClientRequest(request("t2", "MonWatch", watch.clone())));
        deliver(&mut harness, "B", Body::ClientRequest(request("t3", "MonWatch", watch)));
        assert_eq!(harness.api.pending_count(), 3);
        assert_eq!(harness.api.trace_count(), 3);

        deliver(&mut harness, "Net", Body::ClientConnectionClose("A".into()));

        assert_eq!(harness.api.pending("t1"), None);
        assert_eq!(harness.api.pending("t2"), None);
        assert_eq!(harness.api.pending("t3"), Some("B"));
        assert_eq!(harness.api.trace_count(), 1);

        let mut released = None;
        while let Ok(delivery) = monitor.try_recv() {
            if let Body::ClientRequestsReleased(tokens) = delivery.message.body {
                released = Some(tokens);
            }
        }
        let mut released = released.expect("released tokens sent to monitor");
        released.sort();
        assert_eq!(released, vec!["t1".to_string(), "t2".to_string()]);
    }

    #[test]
    fn unknown_operation_is_echoed_back() {
        let mut harness = harness();
        let mut client = listen(&harness.bus, "A");
        let _logger = listen(&harness.bus, "Logger");

        deliver(&mut harness, "A", Body::ClientRequest(request("t1", "Teleport", Value::Null)));

        let rejection = client.try_recv().expect("rejection");
        match rejection.message.body {
            Body::InvalidClientRequestType(echo) => {
                assert_eq!(echo.op, "Teleport");
                assert_eq!(echo.token, "t1");
            }
            other => panic!("unexpected body: {other:?}"),
        }
        assert_eq!(harness.api.pending_count(), 0);
    }

    #[test]
    fn response_is_routed_to_recorded_source_once() {
        let mut harness = harness();
        let mut client = listen(&harness.bus, "A");
        let mut logger = listen(&harness.bus, "Logger");
        let _monitor = listen(&harness.bus, "Monitor");

        let get = request("t1", "MonOp", json!({"op": "Get", "metric": {"key": "/x"}}));
        deliver(&mut harness, "A", Body::ClientRequest(get));
        let response = ClientResponse::new("t1", "MonOp", json!({"key": "/x", "value": 1}));
        deliver(&mut harness, "Monitor", Body::ClientResponse(response.clone()));
        deliver(&mut harness, "Monitor", Body::ClientResponse(response));

        let forwarded = client.try_recv().expect("forwarded response");
        assert_eq!(forwarded.message.kind(), "ClientResponse");
        assert!(client.try_recv().is_err());

        let log = logger.try_recv().expect("invalid token log");
        match log.message.body {
            Body::LogMessage(entry) => {
                assert_eq!(entry.message, "Api::ClientResponse::InvalidRequestToken::t1")
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn ping_with_a_timestamp_far_in_the_past_still_answers() {
        let mut harness = harness();
        let mut api = listen(&harness.bus, "Api");
        let mut ping = request("p1", "Ping", Value::Null);
        ping.timestamp = i64::MIN;

        deliver(&mut harness, "A", Body::ClientRequest(ping));

        match api.try_recv().expect("pong").message.body {
            Body::ClientResponse(pong) => {
                assert_eq!(pong.op, "Pong");
                assert_eq!(pong.payload, json!(i64::MAX));
            }
            other => panic!("unexpected body: {other:?}"),
        }
    }

    #[test]
    fn trace_reports_are_forwarded_only_while_their_trace_is_open() {
        let mut harness = harness();
        let mut client = listen(&harness.bus, "A");
        let mut logger = listen(&harness.bus, "Logger");
        let _monitor = listen(&harness.bus, "Monitor");

        let mut get = request("t1", "MonOp", json!({"op": "Get", "metric": {"key": "/x"}}));
        get.trace = true;
        deliver(&mut harness, "A", Body::ClientRequest(get));
        let trace = harness.ctx.trace().cloned().expect("trace opened");
        let own = client.try_recv().expect("Api reports itself");
        assert_eq!(own.message.kind(), "ClientNotification");

        let report = ClientResponse::new("t1", "Trace", json!("Monitor"));
        deliver_traced(
            &mut harness,
            "Monitor",
            Body::ClientNotification(report.clone()),
            Some(trace.clone()),
        );
        let forwarded = client.try_recv().expect("report forwarded");
        assert_eq!(forwarded.message.kind(), "ClientNotification");

        let response = ClientResponse::new("t1", "MonOp", json!({"key": "/x", "value": 1}));
        deliver(&mut harness, "Monitor", Body::ClientResponse(response));
        assert_eq!(client.try_recv().expect("response").message.kind(), "ClientResponse");
        assert_eq!(harness.api.trace_count(), 0);

        deliver_traced(&mut harness, "Monitor", Body::ClientNotification(report), Some(trace));
        assert!(client.try_recv().is_err());
        assert!(logger.try_recv().is_err(), "late reports are not invalid tokens");
    }

    #[test]
    fn trace_reports_for_untraced_requests_are_dropped() {
        let mut harness = harness();
        let mut client = listen(&harness.bus, "A");
        let _monitor = listen(&harness.bus, "Monitor");

        let get = request("t1", "MonOp", json!({"op": "Get", "metric": {"key": "/x"}}));
        deliver(&mut harness, "A", Body::ClientRequest(get));
        let trace = harness.ctx.trace().cloned();

        let report = ClientResponse::new("t1", "Trace", json!("Monitor"));
        deliver_traced(&mut harness, "Monitor", Body::ClientNotification(report), trace);
        assert!(client.try_recv().is_err());
        assert_eq!(harness.api.pending("t1"), Some("A"));
    }

    struct Echo;

    impl GatewayExtension for Echo {
        fn name(&self) -> &str {
            "EchoApi"
        }

        fn handle_request(
            &mut self,
            request: &ClientRequest,
            _source: &str,
            ctx: &Context,
        ) -> Result<bool, HandlerError> {
            if request.op != "Echo" {
                return Ok(false);
            }
            ctx.respond("Echo", request.payload.clone())?;
            Ok(true)
        }
    }

    #[test]
    fn extension_answers_to_both_roles() {
        let api = Api::with_extension(Box::new(Echo));
        assert_eq!(api.name(), "EchoApi");
        assert_eq!(api.roles(), vec!["EchoApi".to_string(), "Api".to_string()]);
    }
}
