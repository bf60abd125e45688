use std::time::Duration;

use ddapps_mesh::{
    api::{Api, GatewayExtension},
    bus::{Bus, Delivery},
    component::{ComponentHandle, Context, spawn_component},
    config::NodeConfig,
    error::HandlerError,
    message::{Body, ClientRequest, ClientResponse, Message, MonOp, Role, now_millis},
    monitor::{Monitor, default_document, product},
    registry::NetView,
    testing::Recorder,
};
use serde_json::{Value, json};
use tokio::sync::watch;

const WAIT: Duration = Duration::from_secs(2);
const CLIENT_A: &str = "10.0.0.1-1";
const CLIENT_B: &str = "10.0.0.2-2";

struct Gateway {
    bus: Bus,
    _handles: Vec<ComponentHandle>,
    _view: watch::Sender<NetView>,
    _ready: watch::Sender<bool>,
}

fn gateway_with(api: Api) -> Gateway {
    let bus = Bus::new();
    let (view_tx, view) = watch::channel(NetView::default());
    let (ready_tx, ready) = watch::channel(true);
    let config = NodeConfig {
        node_ip: "10.0.0.9".into(),
        watch_interval_ms: 30,
        ..NodeConfig::default()
    };
    let handles = vec![
        spawn_component(&bus, api),
        spawn_component(&bus, Monitor::new(&config, default_document(), view, ready)),
    ];
    Gateway {
        bus,
        _handles: handles,
        _view: view_tx,
        _ready: ready_tx,
    }
}

fn gateway() -> Gateway {
    gateway_with(Api::new())
}

fn request(bus: &Bus, source: &str, token: &str, op: &str, payload: Value, trace: bool) {
    let request = ClientRequest {
        token: token.into(),
        op: op.into(),
        trace,
        payload,
        timestamp: now_millis(),
    };
    bus.publish(Message::new(source, Role::Api, Body::ClientRequest(request)), None)
        .expect("Api is subscribed");
}

fn reply(delivery: Delivery) -> (&'static str, ClientResponse) {
    match delivery.message.body {
        Body::ClientNotification(notification) => ("notification", notification),
        Body::ClientResponse(response) => ("response", response),
        other => panic!("unexpected body: {other:?}"),
    }
}

#[tokio::test]
async fn ping_answers_pong_with_non_negative_latency() {
    let gateway = gateway();
    let mut client = Recorder::new(&gateway.bus, [CLIENT_A]);

    request(&gateway.bus, CLIENT_A, "p1", "Ping", Value::Null, false);

    let (kind, pong) = reply(client.next(WAIT).await.expect("pong"));
    assert_eq!(kind, "response");
    assert_eq!(pong.token, "p1");
    assert_eq!(pong.op, "Pong");
    assert!(pong.payload.as_i64().expect("latency") >= 0);
}

#[tokio::test]
async fn unknown_operations_are_rejected_with_their_type_echoed() {
    let gateway = gateway();
    let mut client = Recorder::new(&gateway.bus, [CLIENT_A]);
    let mut logger = Recorder::new(&gateway.bus, [Role::Logger]);

    request(&gateway.bus, CLIENT_A, "u1", "Teleport", json!({ "to": "mars" }), false);

    let rejected = client.next(WAIT).await.expect("rejection");
    match rejected.message.body {
        Body::InvalidClientRequestType(request) => {
            assert_eq!(request.op, "Teleport");
            assert_eq!(request.token, "u1");
        }
        other => panic!("unexpected body: {other:?}"),
    }

    let logged = logger.expect("LogMessage", WAIT).await.expect("log line");
    match logged.message.body {
        Body::LogMessage(entry) => {
            assert_eq!(entry.message, "Api::ClientRequest::InvalidClientRequestType::Teleport")
        }
        other => panic!("unexpected body: {other:?}"),
    }
}

#[tokio::test]
async fn set_then_get_returns_the_stored_value() {
    let gateway = gateway();
    let mut client = Recorder::new(&gateway.bus, [CLIENT_A]);
    let key = "/ddapps/node/state/testing/dummy";

    let set = serde_json::to_value(MonOp::set(key, json!("dummy-value"))).unwrap();
    request(&gateway.bus, CLIENT_A, "s1", "MonOp", set, false);
    let (_, stored) = reply(client.next(WAIT).await.expect("set response"));
    assert_eq!(stored.payload["metric"]["value"], json!("dummy-value"));

    let get = serde_json::to_value(MonOp::get(key)).unwrap();
    request(&gateway.bus, CLIENT_A, "g1", "MonOp", get, false);
    let (_, read) = reply(client.next(WAIT).await.expect("get response"));
    assert_eq!(read.token, "g1");
    assert_eq!(read.payload["metric"]["value"], json!("dummy-value"));
}

#[tokio::test]
async fn traced_requests_report_every_component_on_the_way() {
    let gateway = gateway();
    let mut client = Recorder::new(&gateway.bus, [CLIENT_A]);

    let get = serde_json::to_value(MonOp::get("/ddapps/node/version")).unwrap();
    request(&gateway.bus, CLIENT_A, "tr1", "MonOp", get, true);

    let mut trace = Vec::new();
    loop {
        let (kind, reply) = reply(client.next(WAIT).await.expect("traced reply"));
        assert_eq!(reply.token, "tr1");
        if kind == "response" {
            assert_eq!(reply.payload["metric"]["value"], product());
            break;
        }
        assert_eq!(reply.op, "Trace");
        trace.push(reply.payload.as_str().unwrap_or_default().to_string());
    }
    assert_eq!(trace, vec!["Api", "Monitor"]);
}

#[tokio::test]
async fn expiring_watch_sends_one_notification_then_a_final_response() {
    let gateway = gateway();
    let mut client = Recorder::new(&gateway.bus, [CLIENT_A]);

    request(
        &gateway.bus,
        CLIENT_A,
        "w1",
        "MonWatch",
        json!({ "key": "/ddapps/node/version", "expire": 2 }),
        false,
    );

    let (first, update) = reply(client.next(WAIT).await.expect("first tick"));
    assert_eq!(first, "notification");
    assert_eq!(update.payload["value"], product());

    let (second, last) = reply(client.next(WAIT).await.expect("second tick"));
    assert_eq!(second, "response");
    assert_eq!(last.token, "w1");

    assert!(client.next(Duration::from_millis(200)).await.is_none());
}

#[tokio::test]
async fn closing_a_connection_releases_only_its_requests() {
    let gateway = gateway();
    let mut a = Recorder::new(&gateway.bus, [CLIENT_A]);
    let mut b = Recorder::new(&gateway.bus, [CLIENT_B]);
    let mut logger = Recorder::new(&gateway.bus, [Role::Logger]);
    let watch = json!({ "key": "/ddapps/node/version", "expire": -1 });

    request(&gateway.bus, CLIENT_A, "t1", "MonWatch", watch.clone(), false);
    request(&gateway.bus, CLIENT_A, "t2", "MonWatch", watch.clone(), false);
    request(&gateway.bus, CLIENT_B, "t3", "MonWatch", watch, false);
    assert!(a.next(WAIT).await.is_some());
    assert!(b.next(WAIT).await.is_some());

    gateway
        .bus
        .publish(
            Message::new("Net", Role::Api, Body::ClientConnectionClose(CLIENT_A.into())),
            None,
        )
        .expect("Api is subscribed");

    let released = logger
        .expect("ClientRequestsReleased", WAIT)
        .await
        .expect("release notice");
    match released.message.body {
        Body::ClientRequestsReleased(mut tokens) => {
            tokens.sort();
            assert_eq!(tokens, vec!["t1".to_string(), "t2".to_string()]);
        }
        other => panic!("unexpected body: {other:?}"),
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    a.drain();
    b.drain();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(a.drain().is_empty(), "cancelled watchers must stop ticking");

    let (_, still_watching) = reply(b.next(WAIT).await.expect("t3 keeps ticking"));
    assert_eq!(still_watching.token, "t3");
}

/// Answers `Echo` with its payload.
struct EchoOps;

impl GatewayExtension for EchoOps {
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

#[tokio::test]
async fn extensions_answer_their_operations_and_fall_back_to_rejection() {
    let gateway = gateway_with(Api::with_extension(Box::new(EchoOps)));
    let mut client = Recorder::new(&gateway.bus, [CLIENT_A]);

    request(&gateway.bus, CLIENT_A, "e1", "Echo", json!("hi"), false);
    let (_, echoed) = reply(client.next(WAIT).await.expect("echo"));
    assert_eq!(echoed.payload, json!("hi"));

    request(&gateway.bus, CLIENT_A, "e2", "Ping", Value::Null, false);
    let (_, pong) = reply(client.next(WAIT).await.expect("builtin still served"));
    assert_eq!(pong.op, "Pong");

    request(&gateway.bus, CLIENT_A, "e3", "Teleport", Value::Null, false);
    let rejected = client.next(WAIT).await.expect("rejection");
    assert!(matches!(
        rejected.message.body,
        Body::InvalidClientRequestType(_)
    ));
}
