// ABOUTME: Integration tests for the HTTP API.
// ABOUTME: Drives the gateway handler directly and over a real socket with a hyper client.

mod support;

use std::sync::Arc;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use imagegw::api::{self, Gateway, HELP_TEXT, MISSING};
use serde_json::Value;
use support::{CREDENTIAL, FakeDispatcher, orchestrator};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;

const AUTH_HEADER: &str = "authentication";

fn gateway(dispatcher: Arc<FakeDispatcher>) -> Gateway {
    Gateway::new(Arc::new(orchestrator(dispatcher)), AUTH_HEADER).unwrap()
}

fn request(method: Method, path: &str, credential: Option<&str>, body: &str) -> Request<Full<Bytes>> {
    let mut builder = Request::builder().method(method).uri(path);
    if let Some(credential) = credential {
        builder = builder.header(AUTH_HEADER, credential);
    }
    builder
        .body(Full::new(Bytes::from(body.to_string())))
        .unwrap()
}

async fn call(
    gateway: &Gateway,
    method: Method,
    path: &str,
    credential: Option<&str>,
) -> (StatusCode, Value) {
    call_with_body(gateway, method, path, credential, "").await
}

async fn call_with_body(
    gateway: &Gateway,
    method: Method,
    path: &str,
    credential: Option<&str>,
    body: &str,
) -> (StatusCode, Value) {
    let response = gateway
        .handle(request(method, path, credential, body))
        .await;
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, value)
}

#[tokio::test]
async fn pull_lookup_expire_flow() {
    let dispatcher = FakeDispatcher::new();
    let gateway = gateway(Arc::clone(&dispatcher));

    let (status, pulled) = call(
        &gateway,
        Method::POST,
        "/api/pull/edison/docker/ubuntu:15.04/",
        Some(CREDENTIAL),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pulled["status"], "ENQUEUED");
    assert_eq!(pulled["tag"], "ubuntu:15.04");
    assert_eq!(pulled["ENV"], MISSING);
    assert_eq!(dispatcher.queues(), vec!["edison".to_string()]);

    dispatcher.succeed_last();

    let (status, looked_up) = call(
        &gateway,
        Method::GET,
        "/api/lookup/edison/docker/ubuntu:15.04/",
        Some(CREDENTIAL),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(looked_up["status"], "READY");
    assert_eq!(looked_up["id"], pulled["id"]);
    assert_eq!(looked_up["ENV"][0], "PATH=/usr/bin:/bin");
    assert_eq!(looked_up["ENTRY"], "/bin/bash");
    assert!(looked_up["last_pull"].is_string());

    let id = pulled["id"].as_str().unwrap();
    let (status, ack) = call(
        &gateway,
        Method::GET,
        &format!("/api/expire/edison/docker/ubuntu:15.04/{}/", id),
        Some(CREDENTIAL),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["removed"], true);
    assert_eq!(ack["id"], id);

    let (status, body) = call(
        &gateway,
        Method::GET,
        "/api/lookup/edison/docker/ubuntu:15.04/",
        Some(CREDENTIAL),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], 404);
    assert_eq!(body["error"], "not_found");
}

#[tokio::test]
async fn list_wraps_records() {
    let dispatcher = FakeDispatcher::new();
    let gateway = gateway(Arc::clone(&dispatcher));

    for tag in ["ubuntu:15.04", "library/centos:7"] {
        let (status, _) = call(
            &gateway,
            Method::POST,
            &format!("/api/pull/edison/docker/{}/", tag),
            Some(CREDENTIAL),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = call(&gateway, Method::GET, "/api/list/edison/", Some(CREDENTIAL)).await;
    assert_eq!(status, StatusCode::OK);
    let list = body["list"].as_array().unwrap();
    assert_eq!(list.len(), 2);
    assert_eq!(list[0]["tag"], "library/centos:7");

    let (status, body) = call(&gateway, Method::GET, "/api/list/cori/", Some(CREDENTIAL)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["list"], serde_json::json!([]));
}

#[tokio::test]
async fn pull_body_sets_options() {
    let dispatcher = FakeDispatcher::new();
    let gateway = gateway(Arc::clone(&dispatcher));

    let (status, body) = call_with_body(
        &gateway,
        Method::POST,
        "/api/pull/edison/docker/ubuntu/",
        Some(CREDENTIAL),
        r#"{"format": "squashfs", "userAcl": ["alice"]}"#,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["userAcl"][0], "alice");
    assert_eq!(dispatcher.jobs()[0].format, "squashfs");
}

#[tokio::test]
async fn malformed_pull_body_is_bad_request() {
    let dispatcher = FakeDispatcher::new();
    let gateway = gateway(Arc::clone(&dispatcher));

    let (status, body) = call_with_body(
        &gateway,
        Method::POST,
        "/api/pull/edison/docker/ubuntu/",
        Some(CREDENTIAL),
        r#"{"colour": "blue"}"#,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");
    assert_eq!(dispatcher.submissions(), 0);
}

#[tokio::test]
async fn error_kinds_map_to_status_codes() {
    let dispatcher = FakeDispatcher::new();
    let gateway = gateway(Arc::clone(&dispatcher));

    let (status, body) = call(&gateway, Method::GET, "/api/list/edison/", None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "auth_failure");

    let (status, _) = call(&gateway, Method::GET, "/api/list/edison/", Some("alice:wrong")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = call(&gateway, Method::GET, "/api/list/hopper/", Some(CREDENTIAL)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["error"], "unknown_system");

    let (status, body) = call(
        &gateway,
        Method::GET,
        "/api/lookup/edison/dock%20er/ubuntu/",
        Some(CREDENTIAL),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "validation_error");

    dispatcher.reject_submissions(true);
    let (status, body) = call(
        &gateway,
        Method::POST,
        "/api/pull/edison/docker/ubuntu/",
        Some(CREDENTIAL),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body["error"], "dispatch_failure");
}

#[tokio::test]
async fn unknown_routes_and_methods() {
    let gateway = gateway(FakeDispatcher::new());

    let (status, body) = call(&gateway, Method::GET, "/api/nothing/here/", Some(CREDENTIAL)).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body["status"], 404);

    let (status, _) = call(
        &gateway,
        Method::GET,
        "/api/pull/edison/docker/ubuntu/",
        Some(CREDENTIAL),
    )
    .await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
}

#[tokio::test]
async fn expire_of_absent_image_succeeds() {
    let gateway = gateway(FakeDispatcher::new());

    let (status, ack) = call(
        &gateway,
        Method::GET,
        "/api/expire/edison/docker/ubuntu/deadbeef/",
        Some(CREDENTIAL),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["removed"], false);
    assert!(ack.get("id").is_none());
}

#[tokio::test]
async fn expire_with_stale_id_keeps_newer_record() {
    let dispatcher = FakeDispatcher::new();
    let gateway = gateway(Arc::clone(&dispatcher));
    let pull_path = "/api/pull/edison/docker/ubuntu/";

    let (_, first) = call(&gateway, Method::POST, pull_path, Some(CREDENTIAL)).await;
    let first_id = first["id"].as_str().unwrap().to_string();
    let expire_first = format!("/api/expire/edison/docker/ubuntu/{}/", first_id);
    let (_, ack) = call(&gateway, Method::GET, &expire_first, Some(CREDENTIAL)).await;
    assert_eq!(ack["removed"], true);

    let (_, second) = call(&gateway, Method::POST, pull_path, Some(CREDENTIAL)).await;
    assert_ne!(second["id"], first["id"]);

    let (status, ack) = call(&gateway, Method::GET, &expire_first, Some(CREDENTIAL)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(ack["removed"], false);

    let (status, current) = call(
        &gateway,
        Method::GET,
        "/api/lookup/edison/docker/ubuntu/",
        Some(CREDENTIAL),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(current["id"], second["id"]);
}

#[tokio::test]
async fn custom_auth_header_is_honoured() {
    let orchestrator = Arc::new(orchestrator(FakeDispatcher::new()));
    let gateway = Gateway::new(orchestrator, "X-Imagegw-Auth").unwrap();

    let request = Request::builder()
        .method(Method::GET)
        .uri("/api/list/edison/")
        .header("x-imagegw-auth", CREDENTIAL)
        .body(Full::new(Bytes::new()))
        .unwrap();
    assert_eq!(gateway.handle(request).await.status(), StatusCode::OK);

    let (status, _) = call(&gateway, Method::GET, "/api/list/edison/", Some(CREDENTIAL)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn serves_over_tcp_until_shutdown() {
    let dispatcher = FakeDispatcher::new();
    let gateway = Arc::new(gateway(Arc::clone(&dispatcher)));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let server = tokio::spawn(api::serve(listener, gateway, shutdown_rx));

    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .unwrap();
    tokio::spawn(conn);

    let help = Request::builder()
        .uri("/")
        .header("host", addr.to_string())
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = sender.send_request(help).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(body, Bytes::from_static(HELP_TEXT.as_bytes()));

    let pull = Request::builder()
        .method(Method::POST)
        .uri("/api/pull/cori/docker/alpine:3.4/")
        .header("host", addr.to_string())
        .header(AUTH_HEADER, CREDENTIAL)
        .body(Full::new(Bytes::new()))
        .unwrap();
    let response = sender.send_request(pull).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = response.into_body().collect().await.unwrap().to_bytes();
    let record: Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(record["system"], "cori");
    assert_eq!(dispatcher.queues(), vec!["cori".to_string()]);

    shutdown_tx.send(true).unwrap();
    server.await.unwrap().unwrap();
}
