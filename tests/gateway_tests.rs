//! Gateway REST and WebSocket endpoints against a live broker.

mod test_harness;

use std::time::Duration;

use axum::body::Body;
use axum::http::{header, Request, StatusCode};
use futures_util::{SinkExt, StreamExt};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;

use judgehub::config::GatewayConfig;
use judgehub::gateway::{self, GatewayState};
use judgehub::model::JudgeUpdate;
use test_harness::{ScriptedSandbox, TestBroker};

fn gateway_config(broker: &TestBroker) -> GatewayConfig {
    GatewayConfig {
        broker_addr: broker.addr.clone(),
        auth_token: broker.token.clone(),
        reconnect_interval: Duration::from_millis(100),
        ..Default::default()
    }
}

fn submit_body(cases: Value) -> String {
    json!({
        "language": {
            "name": "c",
            "sourceFileName": "a.c",
            "compileCmd": "gcc -o a a.c",
            "runCmd": "./a",
            "executables": "a"
        },
        "source": "int main(){}",
        "cases": cases
    })
    .to_string()
}

async fn json_body(response: axum::response::Response) -> Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

/// Serve the gateway on an ephemeral port; returns its `host:port`.
async fn start_gateway(broker: &TestBroker, shutdown: CancellationToken) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    let config = gateway_config(broker);
    tokio::spawn(gateway::serve_with_listener(config, listener, shutdown));
    addr
}

#[tokio::test]
async fn rest_submit_and_list() {
    let sandbox = ScriptedSandbox::new();
    let broker = TestBroker::start(sandbox.clone()).await;
    broker.spawn_worker(sandbox);
    let state = GatewayState::new(gateway_config(&broker)).unwrap();

    let response = gateway::router(state.clone())
        .oneshot(
            Request::post("/api/submit")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(submit_body(json!([{"input": "4 5", "answer": "9"}]))))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let id = json_body(response).await["id"].as_str().unwrap().to_string();

    broker.wait_finished(&id, Duration::from_secs(10)).await;

    let response = gateway::router(state)
        .oneshot(Request::get("/api/submission").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = json_body(response).await;
    let submissions = body["submissions"].as_array().unwrap();
    assert_eq!(submissions.len(), 1);
    assert_eq!(submissions[0]["id"], id.as_str());
    assert_eq!(submissions[0]["status"], "Accepted");
    assert_eq!(submissions[0]["language"]["executables"], json!(["a"]));
    assert_eq!(submissions[0]["results"][1]["stdout"], "9\n");

    broker.shutdown().await;
}

#[tokio::test]
async fn broker_validation_errors_become_bad_request() {
    let broker = TestBroker::start(ScriptedSandbox::new()).await;
    let state = GatewayState::new(gateway_config(&broker)).unwrap();

    let body = json!({
        "language": {
            "name": "c",
            "sourceFileName": "a.c",
            "compileCmd": "gcc -o a a.c",
            "runCmd": "./a"
        },
        "source": ""
    });
    let response = gateway::router(state.clone())
        .oneshot(
            Request::post("/api/submit")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert!(json_body(response).await["error"].is_string());

    let response = gateway::router(state)
        .oneshot(
            Request::get("/api/submission?id=bogus")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    broker.shutdown().await;
}

#[tokio::test]
async fn websocket_observers_receive_updates() {
    let sandbox = ScriptedSandbox::new();
    let broker = TestBroker::start(sandbox.clone()).await;
    let shutdown = CancellationToken::new();
    let addr = start_gateway(&broker, shutdown.clone()).await;

    // The gateway's own subscription to the broker.
    broker.wait_observers(1).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/api/ws/judge", addr))
        .await
        .unwrap();
    // Give the upgrade handler time to register with the gateway hub.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut client = broker.client().await;
    let id = client
        .submit(test_harness::submit_request("int main(){}", &[("1 1", "2")]))
        .await
        .unwrap()
        .into_inner()
        .id;
    broker.spawn_worker(sandbox);

    let mut statuses = Vec::new();
    loop {
        let message = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("update within timeout")
            .expect("socket open")
            .unwrap();
        let Message::Text(text) = message else {
            continue;
        };
        let update: Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(update["id"], id.as_str());
        statuses.push(update["status"].as_str().unwrap().to_string());
        if update["kind"] == "finished" {
            break;
        }
    }
    assert_eq!(statuses.first().map(String::as_str), Some("Queued"));
    assert_eq!(statuses.last().map(String::as_str), Some("Accepted"));

    shutdown.cancel();
    broker.shutdown().await;
}

#[tokio::test]
async fn websocket_shell_session() {
    let broker = TestBroker::start(ScriptedSandbox::new()).await;
    let shutdown = CancellationToken::new();
    let addr = start_gateway(&broker, shutdown.clone()).await;

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/api/ws/shell", addr))
        .await
        .unwrap();

    ws.send(Message::Text("pwd\n".into())).await.unwrap();
    ws.send(Message::Text(r#"{"rows": 30, "cols": 100}"#.into()))
        .await
        .unwrap();
    ws.send(Message::Text("exit\n".into())).await.unwrap();

    let mut output = Vec::new();
    let close = loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("shell output within timeout")
            .expect("socket open")
            .unwrap();
        match message {
            Message::Binary(bytes) => output.extend_from_slice(&bytes),
            Message::Close(frame) => break frame,
            _ => {}
        }
    };
    assert_eq!(output, b"pwd\n[30x100]");
    assert_eq!(close.unwrap().reason.as_str(), "Accepted");

    shutdown.cancel();
    broker.shutdown().await;
}

#[tokio::test]
async fn slow_websocket_observer_is_closed() {
    let broker = TestBroker::start(ScriptedSandbox::new()).await;
    let config = GatewayConfig {
        observer_mailbox: 2,
        ..gateway_config(&broker)
    };
    let state = GatewayState::new(config).unwrap();
    let hub = state.hub.clone();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move { axum::serve(listener, gateway::router(state)).await });

    let (mut ws, _) = tokio_tungstenite::connect_async(format!("ws://{}/api/ws/judge", addr))
        .await
        .unwrap();
    test_harness::assert_eventually(
        || {
            let hub = hub.clone();
            async move { hub.observer_count().await.map(|n| n == 1).unwrap_or(false) }
        },
        Duration::from_secs(5),
        "socket should subscribe",
    )
    .await;

    // Enough to fill the socket buffers while the client is not reading.
    let padding = "x".repeat(256 << 10);
    for _ in 0..200 {
        hub.publish(JudgeUpdate::progress("0000000000000001", padding.clone()))
            .await
            .unwrap();
    }
    test_harness::assert_eventually(
        || {
            let hub = hub.clone();
            async move { hub.observer_count().await.map(|n| n == 0).unwrap_or(false) }
        },
        Duration::from_secs(5),
        "slow socket should be evicted",
    )
    .await;

    let close = loop {
        let message = tokio::time::timeout(Duration::from_secs(10), ws.next())
            .await
            .expect("socket keeps moving")
            .expect("socket open")
            .unwrap();
        if let Message::Close(frame) = message {
            break frame.expect("close frame carries a reason");
        }
    };
    assert_eq!(close.code, CloseCode::Policy);
    assert_eq!(close.reason.as_str(), "too slow");

    broker.shutdown().await;
}
