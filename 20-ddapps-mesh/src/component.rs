//! Component runtime.
//!
//! A component is an actor: it owns its state, declares the role names it
//! answers to, and receives deliveries one at a time from its own inbox task.
//! Handlers are synchronous; anything that has to wait (sockets, timers,
//! forwarded RPCs) is spawned with a clone of the [`Context`], which keeps the
//! trace context of the delivery that started it.

use std::panic::{AssertUnwindSafe, catch_unwind};

use serde_json::Value;
use tokio::{
    sync::mpsc::{self, UnboundedReceiver},
    task::JoinHandle,
};
use tracing::{debug, warn};

use crate::bus::{Bus, Delivery, Inbox, TraceContext};
use crate::error::{BusError, HandlerError};
use crate::message::{
    BROADCAST, Body, ClientResponse, InvalidDestination, Message, OpType, Role,
};

pub trait Component: Send + 'static {
    /// Name used as message source and in log lines.
    fn name(&self) -> &str;

    /// Role names this component answers to. The first entry is usually the
    /// concrete name, followed by any generic role it specializes.
    fn roles(&self) -> Vec<String> {
        vec![self.name().to_string()]
    }

    /// Topics subscribed at spawn time, in addition to [`BROADCAST`].
    fn topics(&self) -> Vec<String> {
        self.roles()
    }

    /// Whether this component reports its participation in traced requests.
    fn traced(&self) -> bool {
        true
    }

    fn handle(&mut self, delivery: &Delivery, ctx: &mut Context) -> Result<(), HandlerError>;
}

/// Handle given to a component while it processes a delivery.
#[derive(Clone)]
pub struct Context {
    bus: Bus,
    name: String,
    inbox: Inbox,
    trace: Option<TraceContext>,
}

impl Context {
    pub fn new(bus: Bus, name: impl Into<String>, inbox: Inbox) -> Self {
        Self {
            bus,
            name: name.into(),
            inbox,
            trace: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn trace(&self) -> Option<&TraceContext> {
        self.trace.as_ref()
    }

    pub fn set_trace(&mut self, trace: Option<TraceContext>) {
        self.trace = trace;
    }

    /// Opens a new trace context for a client request and makes it current.
    pub fn begin_trace(&mut self, token: impl Into<String>, notify: bool) -> TraceContext {
        let trace = TraceContext {
            id: self.bus.next_context(),
            token: token.into(),
            notify,
        };
        self.trace = Some(trace.clone());
        trace
    }

    pub fn send(&self, destination: impl Into<String>, body: Body) -> Result<(), BusError> {
        self.send_as(self.name.clone(), destination, body)
    }

    /// Sends with an explicit source, used when relaying on behalf of a
    /// connection. A destination nobody listens to is reported as an
    /// `InvalidMessageDestination` before the error is returned.
    pub fn send_as(
        &self,
        source: impl Into<String>,
        destination: impl Into<String>,
        body: Body,
    ) -> Result<(), BusError> {
        let result = self
            .bus
            .publish(Message::new(source, destination, body), self.trace.clone());
        if let Err(BusError::NoSubscriber(destination)) = &result {
            self.report_invalid_destination(destination);
        }
        result
    }

    /// Net completes the report with the known hostnames. Without a Net the
    /// bare report goes straight to the Logger.
    fn report_invalid_destination(&self, destination: &str) {
        if destination == Role::Logger.as_str() || destination == Role::Net.as_str() {
            return;
        }
        let report = Body::InvalidMessageDestination(InvalidDestination {
            invalid_message_destination: destination.to_string(),
            available_peers: Vec::new(),
            available_clients: Vec::new(),
        });
        let to_net = Message::new(self.name.clone(), Role::Net, report.clone());
        if self.bus.publish(to_net, self.trace.clone()).is_ok() {
            return;
        }
        let to_logger = Message::new(self.name.clone(), Role::Logger, report);
        if let Err(err) = self.bus.publish(to_logger, self.trace.clone()) {
            debug!(
                component = %self.name,
                %destination,
                error = %err,
                "invalid destination unreported"
            );
        }
    }

    fn current_token(&self) -> String {
        self.trace
            .as_ref()
            .map(|trace| trace.token.clone())
            .unwrap_or_else(|| "Unknown".to_string())
    }

    /// Terminal answer for the client request of the current trace.
    pub fn respond(&self, op: impl Into<String>, payload: Value) -> Result<(), BusError> {
        let response = ClientResponse::new(self.current_token(), op, payload);
        self.send(Role::Api, Body::ClientResponse(response))
    }

    /// Non-terminal answer for the client request of the current trace.
    pub fn notify(&self, op: impl Into<String>, payload: Value) -> Result<(), BusError> {
        let notification = ClientResponse::new(self.current_token(), op, payload);
        self.send(Role::Api, Body::ClientNotification(notification))
    }

    /// Sends a `LogMessage` to the Logger. Logging never fails the caller.
    pub fn log(&self, message: impl Into<String>, detail: Option<Value>) {
        let message = message.into();
        if let Err(err) = self.send(Role::Logger, Body::log(message.clone(), detail)) {
            debug!(component = %self.name, %message, error = %err, "log line dropped");
        }
    }

    pub fn subscribe(&self, topic: impl Into<String>) {
        self.bus.subscribe(topic, &self.inbox);
    }

    pub fn unsubscribe(&self, topic: &str) {
        self.bus.unsubscribe(topic, &self.inbox);
    }

    pub fn inbox(&self) -> &Inbox {
        &self.inbox
    }
}

pub struct ComponentHandle {
    name: String,
    task: JoinHandle<()>,
}

impl ComponentHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    pub fn shutdown(&self) {
        self.task.abort();
    }
}

/// Subscribes `component` to its topics and starts its inbox task.
pub fn spawn_component<C: Component>(bus: &Bus, component: C) -> ComponentHandle {
    let (tx, rx) = mpsc::unbounded_channel();
    spawn_with_inbox(bus, component, tx, rx)
}

/// Same as [`spawn_component`] with a pre-created inbox, for components whose
/// inbox sender must be shared before they start (Net hands it to sockets).
pub fn spawn_with_inbox<C: Component>(
    bus: &Bus,
    component: C,
    tx: Inbox,
    rx: UnboundedReceiver<Delivery>,
) -> ComponentHandle {
    for topic in component.topics() {
        bus.subscribe(topic, &tx);
    }
    bus.subscribe(BROADCAST, &tx);

    let name = component.name().to_string();
    let ctx = Context::new(bus.clone(), name.clone(), tx);
    let task = tokio::spawn(run_component(component, ctx, rx));
    ComponentHandle { name, task }
}

async fn run_component<C: Component>(
    mut component: C,
    mut ctx: Context,
    mut inbox: UnboundedReceiver<Delivery>,
) {
    while let Some(delivery) = inbox.recv().await {
        dispatch(&mut component, &mut ctx, &delivery);
    }
    debug!(component = component.name(), "inbox closed");
}

fn dispatch<C: Component>(component: &mut C, ctx: &mut Context, delivery: &Delivery) {
    ctx.set_trace(delivery.trace.clone());
    report_participation(component, ctx, delivery);

    let kind = delivery.message.kind().to_string();
    let outcome = catch_unwind(AssertUnwindSafe(|| component.handle(delivery, ctx)));
    match outcome {
        Ok(Ok(())) => {}
        Ok(Err(HandlerError::MissingHandler(kind))) => {
            if component.name() != Role::Logger.as_str() {
                ctx.log(format!("{}::MissingHandlerFor::{kind}", component.name()), None);
            }
        }
        Ok(Err(err)) => {
            warn!(component = component.name(), kind = %kind, error = %err, "handler failed");
            ctx.log(format!("{}::{kind}::Error::{err}", component.name()), None);
        }
        Err(panic) => {
            let reason = panic_message(panic.as_ref());
            warn!(component = component.name(), kind = %kind, %reason, "handler panicked");
            ctx.log(format!("{}::{kind}::Error::{reason}", component.name()), None);
        }
    }
    ctx.set_trace(None);
}

fn report_participation<C: Component>(component: &C, ctx: &Context, delivery: &Delivery) {
    let notify = delivery.trace.as_ref().is_some_and(|trace| trace.notify);
    if notify && component.traced() && !delivery.message.body.is_client_reply() {
        let _ = ctx.notify(
            OpType::Trace.as_str(),
            Value::String(component.name().to_string()),
        );
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(text) = panic.downcast_ref::<&str>() {
        text.to_string()
    } else if let Some(text) = panic.downcast_ref::<String>() {
        text.clone()
    } else {
        "panic".to_string()
    }
}

/// Convenience for handlers: the typed "no handler" error for a delivery.
pub fn missing(delivery: &Delivery) -> HandlerError {
    HandlerError::MissingHandler(delivery.message.kind().to_string())
}
