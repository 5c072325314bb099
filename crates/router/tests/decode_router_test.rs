//! End-to-end tests for the decode router over HTTP

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json,
};
use handoff_common::TieBreak;
use handoff_router::{create_router, DecodeClient, DecodeRouter, WorkerRegistry};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Mock decode worker that counts calls and optionally fails
#[derive(Clone)]
struct MockWorker {
    calls: Arc<AtomicUsize>,
    fail: bool,
}

async fn mock_generate(State(worker): State<MockWorker>, Json(body): Json<Value>) -> Response {
    worker.calls.fetch_add(1, Ordering::SeqCst);
    if worker.fail {
        return (StatusCode::SERVICE_UNAVAILABLE, "out of KV cache").into_response();
    }

    // Non-JSON content type proves the router relays the body untouched
    let text = body["text"].as_str().unwrap_or_default();
    (
        [(header::CONTENT_TYPE, "application/x-decode")],
        format!("decoded:{}", text),
    )
        .into_response()
}

async fn spawn_mock_worker(fail: bool) -> (String, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let app = axum::Router::new()
        .route("/generate", post(mock_generate))
        .with_state(MockWorker {
            calls: calls.clone(),
            fail,
        });

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), calls)
}

async fn spawn_router(workers: Vec<String>) -> (String, Arc<DecodeRouter>) {
    let registry = WorkerRegistry::new(workers, TieBreak::FirstRegistered).unwrap();
    let client = DecodeClient::new(Duration::from_secs(5), Duration::from_secs(1)).unwrap();
    let router = Arc::new(DecodeRouter::new(registry, client, Duration::from_secs(60)).unwrap());

    let app = create_router(router.clone(), true);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), router)
}

async fn reserve(client: &reqwest::Client, router_url: &str, text: &str) -> Value {
    let response = client
        .post(format!("{}/prefill_finish", router_url))
        .json(&json!({ "text": text }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    response.json().await.unwrap()
}

async fn loads(client: &reqwest::Client, router_url: &str) -> Vec<u64> {
    let workers: Value = client
        .get(format!("{}/workers", router_url))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    workers
        .as_array()
        .unwrap()
        .iter()
        .map(|w| w["load"].as_u64().unwrap())
        .collect()
}

#[tokio::test]
async fn test_example_scenario_over_http() {
    let (a, a_calls) = spawn_mock_worker(false).await;
    let (b, _) = spawn_mock_worker(false).await;
    let (c, _) = spawn_mock_worker(false).await;
    let (router_url, _router) = spawn_router(vec![a.clone(), b.clone(), c.clone()]).await;
    let client = reqwest::Client::new();

    let first = reserve(&client, &router_url, "abcde").await;
    assert_eq!(first["decode_worker_id"], a.as_str());
    assert_eq!(loads(&client, &router_url).await, vec![5, 0, 0]);

    let second = reserve(&client, &router_url, "xyz").await;
    assert_eq!(second["decode_worker_id"], b.as_str());
    assert_eq!(loads(&client, &router_url).await, vec![5, 3, 0]);

    let response = client
        .post(format!("{}/generate_decode", router_url))
        .json(&json!({
            "decode_worker_id": a,
            "text": "abcde",
            "sampling_params": {"temperature": 0},
            "reservation_id": first["reservation_id"],
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "application/x-decode"
    );
    assert_eq!(response.text().await.unwrap(), "decoded:abcde");
    assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    assert_eq!(loads(&client, &router_url).await, vec![0, 3, 0]);

    let third = reserve(&client, &router_url, "q").await;
    assert_eq!(third["decode_worker_id"], a.as_str());
    assert_eq!(loads(&client, &router_url).await, vec![1, 3, 0]);
}

#[tokio::test]
async fn test_legacy_dispatch_by_worker_url_releases_load() {
    let (a, _) = spawn_mock_worker(false).await;
    let (router_url, router) = spawn_router(vec![a.clone()]).await;
    let client = reqwest::Client::new();

    // Older prefill workers read `decode_worker_url` and echo it back without a token
    let reservation = reserve(&client, &router_url, "hello world").await;
    assert_eq!(reservation["decode_worker_url"], a.as_str());
    assert_eq!(loads(&client, &router_url).await, vec![11]);

    let response = client
        .post(format!("{}/generate_decode", router_url))
        .json(&json!({
            "decode_worker_url": reservation["decode_worker_url"],
            "text": "hello world",
            "sampling_params": {"max_new_tokens": 32},
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::OK);
    assert_eq!(loads(&client, &router_url).await, vec![0]);
    assert!(router.leases().is_empty());
}

#[tokio::test]
async fn test_upstream_failure_is_500_and_releases_load() {
    let (a, a_calls) = spawn_mock_worker(true).await;
    let (router_url, router) = spawn_router(vec![a.clone()]).await;
    let client = reqwest::Client::new();

    let reservation = reserve(&client, &router_url, "hello").await;

    let response = client
        .post(format!("{}/generate_decode", router_url))
        .json(&json!({
            "decode_worker_id": a,
            "text": "hello",
            "sampling_params": {},
            "reservation_id": reservation["reservation_id"],
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::INTERNAL_SERVER_ERROR);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["upstream_status"], 503);
    assert!(body["detail"].as_str().unwrap().contains("out of KV cache"));

    assert_eq!(a_calls.load(Ordering::SeqCst), 1);
    assert_eq!(loads(&client, &router_url).await, vec![0]);
    assert_eq!(router.metrics().dispatch_failed.get(), 1);
}

#[tokio::test]
async fn test_unknown_worker_is_404_without_forwarding() {
    let (a, a_calls) = spawn_mock_worker(false).await;
    let (router_url, _router) = spawn_router(vec![a.clone()]).await;
    let client = reqwest::Client::new();

    reserve(&client, &router_url, "hello").await;

    let response = client
        .post(format!("{}/generate_decode", router_url))
        .json(&json!({
            "decode_worker_id": "http://10.0.0.1:1",
            "text": "hello",
            "sampling_params": {},
        }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    assert_eq!(a_calls.load(Ordering::SeqCst), 0);
    assert_eq!(loads(&client, &router_url).await, vec![5]);
}

#[tokio::test]
async fn test_malformed_dispatch_body_gets_json_detail() {
    let (a, a_calls) = spawn_mock_worker(false).await;
    let (router_url, _router) = spawn_router(vec![a]).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/generate_decode", router_url))
        .json(&json!({ "text": "hello", "sampling_params": {"stop": "\n"} }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::UNPROCESSABLE_ENTITY);
    let body: Value = response.json().await.unwrap();
    assert!(body["detail"].is_string());
    assert_eq!(a_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_http_reservations_have_no_lost_updates() {
    let (a, _) = spawn_mock_worker(false).await;
    let (router_url, _router) = spawn_router(vec![a]).await;
    let client = reqwest::Client::new();

    let requests = 100;
    let text = "0123456789";
    let handles: Vec<_> = (0..requests)
        .map(|_| {
            let client = client.clone();
            let router_url = router_url.clone();
            tokio::spawn(async move { reserve(&client, &router_url, text).await })
        })
        .collect();
    for handle in handles {
        handle.await.unwrap();
    }

    assert_eq!(loads(&client, &router_url).await, vec![requests * 10]);
}

#[tokio::test]
async fn test_paired_reserve_dispatch_conserves_load() {
    let (a, _) = spawn_mock_worker(false).await;
    let (b, _) = spawn_mock_worker(false).await;
    let (router_url, _router) = spawn_router(vec![a, b]).await;
    let client = reqwest::Client::new();

    let prompts = [
        "The ancient ruins",
        "Deep in the quantum lab",
        "Climate",
        "Marine biologists",
    ];
    let mut reservations = Vec::new();
    for prompt in prompts {
        reservations.push((prompt, reserve(&client, &router_url, prompt).await));
    }

    for (prompt, reservation) in reservations {
        let response = client
            .post(format!("{}/generate_decode", router_url))
            .json(&json!({
                "decode_worker_id": reservation["decode_worker_id"],
                "text": prompt,
                "sampling_params": {"temperature": 0},
                "reservation_id": reservation["reservation_id"],
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::OK);
    }

    assert_eq!(loads(&client, &router_url).await, vec![0, 0]);
}
