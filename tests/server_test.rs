//! End-to-end tests of the HTTP surface against a mock ChatGLM backend

use glm_relay::cli::AppConfig;
use glm_relay::server::{app, AppState};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;

const HELLO_STREAM: &str = concat!(
    "data: {\"conversation_id\":\"c1\",\"status\":\"processing\",\"parts\":[{\"content\":[{\"type\":\"text\",\"status\":\"init\",\"text\":\"Hel\"}]}]}\n\n",
    "data: {\"conversation_id\":\"c1\",\"status\":\"processing\",\"parts\":[{\"content\":[{\"type\":\"text\",\"status\":\"finish\",\"text\":\"Hello\"}]}]}\n\n",
    "data: {\"conversation_id\":\"c1\",\"status\":\"finish\"}\n\n",
);

/// Start the relay against the mock backend, returning its base URL
async fn spawn_relay(server: &mockito::ServerGuard) -> String {
    let mut config = AppConfig::default();
    config.upstream.base_url = server.url();
    config.retry.delay_ms = 0;

    let state = Arc::new(AppState::from_config(&config).unwrap());
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

async fn mock_backend(server: &mut mockito::ServerGuard) -> Vec<mockito::Mock> {
    vec![
        server
            .mock("POST", "/chatglm/user-api/user/refresh")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"code":0,"result":{"access_token":"at"}}"#)
            .create_async()
            .await,
        server
            .mock("POST", "/chatglm/backend-api/assistant/stream")
            .with_status(200)
            .with_header("content-type", "text/event-stream")
            .with_body(HELLO_STREAM)
            .create_async()
            .await,
        server
            .mock("POST", "/chatglm/backend-api/assistant/conversation/delete")
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"code":0,"result":null}"#)
            .create_async()
            .await,
    ]
}

#[tokio::test]
async fn health_and_models() {
    let server = mockito::Server::new_async().await;
    let base = spawn_relay(&server).await;
    let client = reqwest::Client::new();

    let health: Value = client.get(format!("{}/health", base)).send().await.unwrap().json().await.unwrap();
    assert_eq!(health["status"], "ok");
    assert_eq!(health["service"], "glm-relay");

    let models: Value = client.get(format!("{}/v1/models", base)).send().await.unwrap().json().await.unwrap();
    assert_eq!(models["object"], "list");
    assert!(models["data"].as_array().unwrap().iter().any(|m| m["id"] == "glm-4"));
}

#[tokio::test]
async fn missing_token_and_bad_body_are_rejected() {
    let server = mockito::Server::new_async().await;
    let base = spawn_relay(&server).await;
    let client = reqwest::Client::new();

    let response = client
        .post(format!("{}/v1/chat/completions", base))
        .json(&json!({"model": "glm-4", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 401);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"]["type"], "authentication_error");

    let response = client
        .post(format!("{}/v1/chat/completions", base))
        .bearer_auth("rt")
        .header("content-type", "application/json")
        .body("{not json")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn buffered_completion() {
    let mut server = mockito::Server::new_async().await;
    let _mocks = mock_backend(&mut server).await;
    let base = spawn_relay(&server).await;

    let completion: Value = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", base))
        .bearer_auth("rt1,rt1")
        .json(&json!({"model": "glm-4", "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(completion["id"], "c1");
    assert_eq!(completion["object"], "chat.completion");
    assert_eq!(completion["choices"][0]["message"]["role"], "assistant");
    assert_eq!(completion["choices"][0]["message"]["content"], "Hello");
    assert_eq!(completion["choices"][0]["finish_reason"], "stop");
    assert!(completion["usage"]["total_tokens"].as_u64().unwrap() > 0);
}

#[tokio::test]
async fn streamed_completion() {
    let mut server = mockito::Server::new_async().await;
    let _mocks = mock_backend(&mut server).await;
    let base = spawn_relay(&server).await;

    let response = reqwest::Client::new()
        .post(format!("{}/v1/chat/completions", base))
        .bearer_auth("rt")
        .json(&json!({"model": "glm-4", "stream": true, "messages": [{"role": "user", "content": "hi"}]}))
        .send()
        .await
        .unwrap();
    assert!(response.headers()["content-type"].to_str().unwrap().starts_with("text/event-stream"));

    let body = response.text().await.unwrap();
    assert!(body.ends_with("data: [DONE]\n\n"));

    let text: String = body
        .split("\n\n")
        .filter_map(|frame| frame.strip_prefix("data: "))
        .filter(|data| *data != "[DONE]")
        .filter_map(|data| {
            let chunk: Value = serde_json::from_str(data).unwrap();
            chunk["choices"][0]["delta"]["content"].as_str().map(|s| s.to_string())
        })
        .collect();
    assert_eq!(text, "Hello");
}

#[tokio::test]
async fn token_check() {
    let mut server = mockito::Server::new_async().await;
    let _mocks = mock_backend(&mut server).await;
    let base = spawn_relay(&server).await;

    let body: Value = reqwest::Client::new()
        .post(format!("{}/token/check", base))
        .json(&json!({"token": "rt"}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["live"], true);
}
