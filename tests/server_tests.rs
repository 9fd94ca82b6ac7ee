//! Integration tests for the relay server

use serde_json::json;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use unity_relay::config::ServerConfig;
use unity_relay::protocol::{
    frame_message, read_frame, write_frame, InstanceStatus, ListInstancesMessage, Message, Params,
    PingMessage, RegisterMessage, RequestMessage, ResponseMessage, StatusMessage, RELAY_VERSION,
};
use unity_relay::server::RelayServer;

struct TestServer {
    addr: SocketAddr,
    shutdown_tx: mpsc::Sender<()>,
    handle: JoinHandle<anyhow::Result<()>>,
}

impl TestServer {
    async fn start(disconnect_grace_ms: u64) -> Self {
        let config = ServerConfig {
            host: "127.0.0.1".into(),
            port: 0,
            request_timeout_ms: 5_000,
            disconnect_grace_ms,
        };
        let server = RelayServer::bind(config).await.unwrap();
        let addr = server.local_addr().unwrap();
        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        let handle = tokio::spawn(server.run(shutdown_rx));
        Self {
            addr,
            shutdown_tx,
            handle,
        }
    }

    async fn stop(self) {
        let _ = self.shutdown_tx.send(()).await;
        let _ = timeout(Duration::from_secs(2), self.handle).await;
    }
}

/// Helper to read one frame, failing the test on timeout or EOF
async fn recv(stream: &mut TcpStream) -> Message {
    timeout(Duration::from_secs(3), read_frame(stream))
        .await
        .expect("Timed out waiting for frame")
        .expect("Failed to read frame")
        .expect("Stream closed")
}

/// Plays the Unity side of the protocol
struct FakeInstance {
    stream: TcpStream,
    ref_id: u32,
}

impl FakeInstance {
    async fn register(addr: SocketAddr, instance_id: &str, project_name: &str) -> Self {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let register = RegisterMessage {
            instance_id: instance_id.into(),
            project_name: project_name.into(),
            application_version: "2022.3.20f1".into(),
            bridge_version: "3.5.1".into(),
        };
        write_frame(&mut stream, &Message::Register(register))
            .await
            .unwrap();

        match recv(&mut stream).await {
            Message::Registered(registered) => {
                assert!(registered.success, "Registration failed: {:?}", registered);
                assert_eq!(registered.relay_version, RELAY_VERSION);
                Self {
                    stream,
                    ref_id: registered.ref_id.unwrap(),
                }
            }
            other => panic!("Expected Registered, got {:?}", other),
        }
    }

    async fn next_request(&mut self) -> RequestMessage {
        match recv(&mut self.stream).await {
            Message::Request(request) => request,
            other => panic!("Expected Request, got {:?}", other),
        }
    }

    async fn reply(&mut self, response: ResponseMessage) {
        write_frame(&mut self.stream, &Message::Response(response))
            .await
            .unwrap();
    }

    /// Answer the next request with `data`, returning what was asked
    async fn serve_one(&mut self, data: Params) -> RequestMessage {
        let request = self.next_request().await;
        self.reply(ResponseMessage::ok(request.id.clone(), data)).await;
        request
    }

    async fn set_status(&mut self, status: InstanceStatus, detail: Option<&str>) {
        let msg = Message::Status(StatusMessage {
            status,
            detail: detail.map(str::to_string),
        });
        write_frame(&mut self.stream, &msg).await.unwrap();
    }
}

async fn client(addr: SocketAddr) -> TcpStream {
    TcpStream::connect(addr).await.unwrap()
}

async fn request(stream: &mut TcpStream, request: RequestMessage) -> ResponseMessage {
    write_frame(stream, &Message::Request(request)).await.unwrap();
    match recv(stream).await {
        Message::Response(response) => response,
        other => panic!("Expected Response, got {:?}", other),
    }
}

fn data(value: serde_json::Value) -> Params {
    match value {
        serde_json::Value::Object(map) => map,
        other => panic!("Expected object, got {:?}", other),
    }
}

#[tokio::test]
async fn test_request_round_trip() {
    let server = TestServer::start(0).await;
    let mut instance = FakeInstance::register(server.addr, "/Users/dev/MyGame", "MyGame").await;
    assert_eq!(instance.ref_id, 1);

    let mut conn = client(server.addr).await;
    write_frame(
        &mut conn,
        &Message::Request(RequestMessage::new("c-1", "state", Params::new())),
    )
    .await
    .unwrap();

    let forwarded = instance
        .serve_one(data(json!({"is_playing": false, "scene": "Main"})))
        .await;
    assert_eq!(forwarded.command, "state");
    assert_ne!(forwarded.id, "c-1");
    assert_eq!(forwarded.timeout_ms, Some(5_000));

    match recv(&mut conn).await {
        Message::Response(response) => {
            assert_eq!(response.id, "c-1");
            assert!(response.success);
            assert_eq!(response.data.unwrap()["scene"], json!("Main"));
            assert_eq!(response.relay_version, RELAY_VERSION);
            assert_eq!(response.bridge_version, "3.5.1");
        }
        other => panic!("Expected Response, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_versions_only_on_first_response() {
    let server = TestServer::start(0).await;
    let mut instance = FakeInstance::register(server.addr, "/p/Game", "Game").await;
    let mut conn = client(server.addr).await;

    let serve = tokio::spawn(async move {
        instance.serve_one(Params::new()).await;
        instance.serve_one(Params::new()).await;
        instance
    });

    let first = request(&mut conn, RequestMessage::new("1", "state", Params::new())).await;
    let second = request(&mut conn, RequestMessage::new("2", "state", Params::new())).await;
    assert_eq!(first.relay_version, RELAY_VERSION);
    assert_eq!(second.relay_version, "");
    assert_eq!(second.bridge_version, "");

    let _ = serve.await;
    server.stop().await;
}

#[tokio::test]
async fn test_no_instance_is_not_found() {
    let server = TestServer::start(0).await;
    let mut conn = client(server.addr).await;

    let response = request(&mut conn, RequestMessage::new("1", "state", Params::new())).await;
    assert!(!response.success);
    assert_eq!(response.error.unwrap().code, "INSTANCE_NOT_FOUND");

    server.stop().await;
}

#[tokio::test]
async fn test_ambiguous_then_selected_by_name_and_ref() {
    let server = TestServer::start(0).await;
    let mut one = FakeInstance::register(server.addr, "/work/ProjectA", "Alpha").await;
    let mut two = FakeInstance::register(server.addr, "/work/ProjectB", "Beta").await;
    assert_eq!((one.ref_id, two.ref_id), (1, 2));

    let mut conn = client(server.addr).await;

    let response = request(&mut conn, RequestMessage::new("1", "state", Params::new())).await;
    assert_eq!(response.error.unwrap().code, "AMBIGUOUS_INSTANCE");

    let by_name = RequestMessage::new("2", "state", Params::new()).with_instance(Some("Beta".into()));
    write_frame(&mut conn, &Message::Request(by_name)).await.unwrap();
    two.serve_one(data(json!({"who": "B"}))).await;
    match recv(&mut conn).await {
        Message::Response(response) => assert_eq!(response.data.unwrap()["who"], json!("B")),
        other => panic!("Expected Response, got {:?}", other),
    }

    let by_ref = RequestMessage::new("3", "state", Params::new()).with_instance(Some("1".into()));
    write_frame(&mut conn, &Message::Request(by_ref)).await.unwrap();
    one.serve_one(data(json!({"who": "A"}))).await;
    match recv(&mut conn).await {
        Message::Response(response) => assert_eq!(response.data.unwrap()["who"], json!("A")),
        other => panic!("Expected Response, got {:?}", other),
    }

    let by_suffix =
        RequestMessage::new("4", "state", Params::new()).with_instance(Some("ProjectB/".into()));
    write_frame(&mut conn, &Message::Request(by_suffix)).await.unwrap();
    two.serve_one(data(json!({"who": "B"}))).await;
    match recv(&mut conn).await {
        Message::Response(response) => assert_eq!(response.data.unwrap()["who"], json!("B")),
        other => panic!("Expected Response, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_same_project_name_needs_full_path() {
    let server = TestServer::start(0).await;
    let _live = FakeInstance::register(server.addr, "/x/ProjectA", "ProjectA").await;
    let mut archived = FakeInstance::register(server.addr, "/x/Archive/ProjectA", "ProjectA").await;
    let mut conn = client(server.addr).await;

    let by_name =
        RequestMessage::new("1", "state", Params::new()).with_instance(Some("ProjectA".into()));
    let response = request(&mut conn, by_name).await;
    let error = response.error.unwrap();
    assert_eq!(error.code, "AMBIGUOUS_INSTANCE");

    let by_path = RequestMessage::new("2", "state", Params::new())
        .with_instance(Some("/x/Archive/ProjectA".into()));
    write_frame(&mut conn, &Message::Request(by_path)).await.unwrap();
    archived.serve_one(data(json!({"who": "archive"}))).await;
    match recv(&mut conn).await {
        Message::Response(response) => {
            assert!(response.success);
            assert_eq!(response.data.unwrap()["who"], json!("archive"));
        }
        other => panic!("Expected Response, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_timeout_then_late_response_dropped() {
    let server = TestServer::start(0).await;
    let mut instance = FakeInstance::register(server.addr, "/p/Slow", "Slow").await;
    let mut conn = client(server.addr).await;

    let slow = RequestMessage::new("1", "refresh", Params::new()).with_timeout_ms(Some(200));
    write_frame(&mut conn, &Message::Request(slow)).await.unwrap();
    let forwarded = instance.next_request().await;

    match recv(&mut conn).await {
        Message::Response(response) => {
            assert_eq!(response.id, "1");
            assert_eq!(response.error.unwrap().code, "TIMEOUT");
        }
        other => panic!("Expected Response, got {:?}", other),
    }

    // The late answer must not reach the client; the next request still works
    instance
        .reply(ResponseMessage::ok(forwarded.id, data(json!({"late": true}))))
        .await;
    write_frame(
        &mut conn,
        &Message::Request(RequestMessage::new("2", "state", Params::new())),
    )
    .await
    .unwrap();
    instance.serve_one(data(json!({"late": false}))).await;
    match recv(&mut conn).await {
        Message::Response(response) => {
            assert_eq!(response.id, "2");
            assert_eq!(response.data.unwrap()["late"], json!(false));
        }
        other => panic!("Expected Response, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_instance_drop_mid_request_is_reloading() {
    let server = TestServer::start(5_000).await;
    let mut instance = FakeInstance::register(server.addr, "/p/Game", "Game").await;
    let mut conn = client(server.addr).await;

    write_frame(
        &mut conn,
        &Message::Request(RequestMessage::new("1", "refresh", Params::new())),
    )
    .await
    .unwrap();
    instance.next_request().await;
    drop(instance);

    match recv(&mut conn).await {
        Message::Response(response) => {
            assert!(!response.success);
            assert_eq!(response.error.unwrap().code, "INSTANCE_RELOADING");
        }
        other => panic!("Expected Response, got {:?}", other),
    }

    // Still listed during the grace period, so new requests are told to retry
    let response = request(&mut conn, RequestMessage::new("2", "state", Params::new())).await;
    assert_eq!(response.error.unwrap().code, "INSTANCE_RELOADING");

    server.stop().await;
}

#[tokio::test]
async fn test_busy_status_rejects_requests() {
    let server = TestServer::start(0).await;
    let mut instance = FakeInstance::register(server.addr, "/p/Game", "Game").await;
    instance
        .set_status(InstanceStatus::Busy, Some("running_tests"))
        .await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut conn = client(server.addr).await;
    let response = request(&mut conn, RequestMessage::new("1", "state", Params::new())).await;
    let error = response.error.unwrap();
    assert_eq!(error.code, "INSTANCE_BUSY");
    assert!(error.message.contains("running_tests"));

    instance.set_status(InstanceStatus::Ready, None).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    write_frame(
        &mut conn,
        &Message::Request(RequestMessage::new("2", "state", Params::new())),
    )
    .await
    .unwrap();
    instance.serve_one(Params::new()).await;
    match recv(&mut conn).await {
        Message::Response(response) => assert!(response.success),
        other => panic!("Expected Response, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_reregistration_replaces_connection() {
    let server = TestServer::start(5_000).await;
    let mut old = FakeInstance::register(server.addr, "/p/Game", "Game").await;
    let mut new = FakeInstance::register(server.addr, "/p/Game", "Game").await;
    assert_eq!(old.ref_id, new.ref_id);

    // The relay closes the superseded socket
    let closed = timeout(Duration::from_secs(2), read_frame(&mut old.stream))
        .await
        .expect("Old connection should be closed");
    assert!(matches!(closed, Ok(None) | Err(_)));

    let mut conn = client(server.addr).await;
    write_frame(
        &mut conn,
        &Message::Request(RequestMessage::new("1", "state", Params::new())),
    )
    .await
    .unwrap();
    new.serve_one(data(json!({"fresh": true}))).await;
    match recv(&mut conn).await {
        Message::Response(response) => assert_eq!(response.data.unwrap()["fresh"], json!(true)),
        other => panic!("Expected Response, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_malformed_frame_only_closes_that_connection() {
    let server = TestServer::start(0).await;
    let mut instance = FakeInstance::register(server.addr, "/p/Game", "Game").await;

    let mut bad = client(server.addr).await;
    bad.write_all(&frame_message(b"{not json")).await.unwrap();
    bad.flush().await.unwrap();
    let closed = timeout(Duration::from_secs(2), read_frame(&mut bad))
        .await
        .expect("Bad connection should be closed");
    assert!(matches!(closed, Ok(None) | Err(_)));

    let mut good = client(server.addr).await;
    write_frame(
        &mut good,
        &Message::Request(RequestMessage::new("1", "state", Params::new())),
    )
    .await
    .unwrap();
    instance.serve_one(Params::new()).await;
    match recv(&mut good).await {
        Message::Response(response) => assert!(response.success),
        other => panic!("Expected Response, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_list_instances_and_ping() {
    let server = TestServer::start(0).await;
    let _a = FakeInstance::register(server.addr, "/work/A", "A").await;
    let mut b = FakeInstance::register(server.addr, "/work/B", "B").await;
    b.set_status(InstanceStatus::Busy, Some("compiling")).await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let mut conn = client(server.addr).await;
    write_frame(
        &mut conn,
        &Message::ListInstances(ListInstancesMessage { id: "q".into() }),
    )
    .await
    .unwrap();
    match recv(&mut conn).await {
        Message::Instances(reply) => {
            assert_eq!(reply.id, "q");
            let ids: Vec<&str> = reply.instances.iter().map(|i| i.instance_id.as_str()).collect();
            assert_eq!(ids, vec!["/work/A", "/work/B"]);
            assert_eq!(reply.instances[1].status, InstanceStatus::Busy);
            assert_eq!(reply.instances[1].detail.as_deref(), Some("compiling"));
        }
        other => panic!("Expected Instances, got {:?}", other),
    }

    write_frame(&mut conn, &Message::Ping(PingMessage { ts: 1234 }))
        .await
        .unwrap();
    match recv(&mut conn).await {
        Message::Pong(pong) => assert_eq!(pong.ts, 1234),
        other => panic!("Expected Pong, got {:?}", other),
    }

    server.stop().await;
}

#[tokio::test]
async fn test_concurrent_clients_get_their_own_responses() {
    let server = TestServer::start(0).await;
    let mut instance = FakeInstance::register(server.addr, "/p/Game", "Game").await;

    let mut first = client(server.addr).await;
    let mut second = client(server.addr).await;
    for conn in [&mut first, &mut second] {
        write_frame(
            conn,
            &Message::Request(RequestMessage::new("same-id", "echo", Params::new())),
        )
        .await
        .unwrap();
    }

    // Answer in reverse order of arrival
    let a = instance.next_request().await;
    let b = instance.next_request().await;
    assert_ne!(a.id, b.id);
    instance
        .reply(ResponseMessage::ok(b.id.clone(), data(json!({"relay_id": b.id}))))
        .await;
    instance
        .reply(ResponseMessage::ok(a.id.clone(), data(json!({"relay_id": a.id}))))
        .await;

    let mut seen = Vec::new();
    for conn in [&mut first, &mut second] {
        match recv(conn).await {
            Message::Response(response) => {
                assert_eq!(response.id, "same-id");
                seen.push(response.data.unwrap()["relay_id"].clone());
            }
            other => panic!("Expected Response, got {:?}", other),
        }
    }
    seen.sort_by_key(|v| v.to_string());
    let mut expected = vec![json!(a.id), json!(b.id)];
    expected.sort_by_key(|v| v.to_string());
    assert_eq!(seen, expected);

    server.stop().await;
}
