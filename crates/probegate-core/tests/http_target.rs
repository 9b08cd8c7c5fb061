//! Integration tests for the HTTP / tool-call target adapter.
//!
//! Uses wiremock for HTTP mocking. Covers request shape, bearer auth,
//! response text extraction, status mapping and JSON-RPC error mapping.

use std::time::Duration;

use probegate_core::model::ProtocolMode;
use probegate_core::{
    CallError, HttpConnector, TargetAdapter, TargetConnector, TargetDescriptor, TargetRequest,
};
use serde_json::json;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn http_target(server: &MockServer, token: Option<&str>) -> std::sync::Arc<dyn TargetAdapter> {
    let mut descriptor = TargetDescriptor::http(format!("{}/answer", server.uri()));
    descriptor.auth_token = token.map(str::to_string);
    HttpConnector::new()
        .expect("client")
        .connect(&descriptor)
        .expect("valid descriptor")
}

fn tool_target(server: &MockServer) -> std::sync::Arc<dyn TargetAdapter> {
    let mut descriptor = TargetDescriptor::http(format!("{}/rpc", server.uri()));
    descriptor.protocol = ProtocolMode::ToolCall;
    descriptor.tool_name = Some("answer".into());
    HttpConnector::new()
        .expect("client")
        .connect(&descriptor)
        .expect("valid descriptor")
}

fn request(input: &str) -> TargetRequest {
    TargetRequest {
        case_id: "c1".into(),
        input: input.into(),
    }
}

#[tokio::test]
async fn test_http_posts_input_with_bearer_auth() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/answer"))
        .and(header("authorization", "Bearer secret"))
        .and(body_partial_json(json!({ "input": "capital of France?" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "output": "Paris" })))
        .expect(1)
        .mount(&server)
        .await;

    let response = http_target(&server, Some("secret"))
        .invoke(&request("capital of France?"))
        .await
        .expect("call succeeds");
    assert_eq!(response.text, "Paris");
    assert_eq!(response.status, Some(200));
}

#[tokio::test]
async fn test_http_plain_body_is_the_answer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/answer"))
        .respond_with(ResponseTemplate::new(200).set_body_string("just text"))
        .mount(&server)
        .await;

    let response = http_target(&server, None)
        .invoke(&request("q"))
        .await
        .expect("call succeeds");
    assert_eq!(response.text, "just text");
}

#[tokio::test]
async fn test_status_mapping() {
    let cases = [
        (400, "bad_request", false),
        (401, "unauthorized", false),
        (403, "unauthorized", false),
        (404, "not_found", false),
        (422, "bad_request", false),
        (408, "target_timeout", true),
        (500, "target_server", true),
        (503, "target_server", true),
    ];
    for (status, code, transient) in cases {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(status).set_body_string("nope"))
            .mount(&server)
            .await;

        let err = http_target(&server, None)
            .invoke(&request("q"))
            .await
            .expect_err("non-2xx must fail");
        assert_eq!(err.code(), code, "status {status}");
        assert_eq!(err.is_transient(), transient, "status {status}");
        assert_eq!(err.status(), Some(status));
    }
}

#[tokio::test]
async fn test_rate_limited_carries_retry_after() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(429).insert_header("retry-after", "7"))
        .mount(&server)
        .await;

    match http_target(&server, None).invoke(&request("q")).await {
        Err(CallError::Transient { retry_after, .. }) => {
            assert_eq!(retry_after, Some(Duration::from_secs(7)))
        }
        other => panic!("expected transient rate limit, got {other:?}"),
    }
}

#[tokio::test]
async fn test_connection_refused_is_transient() {
    let descriptor = TargetDescriptor::http("http://127.0.0.1:9/answer");
    let target = HttpConnector::new().unwrap().connect(&descriptor).unwrap();
    let err = target.invoke(&request("q")).await.unwrap_err();
    assert!(err.is_transient(), "{err:?}");
}

#[tokio::test]
async fn test_tool_call_joins_text_content() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rpc"))
        .and(body_partial_json(json!({
            "jsonrpc": "2.0",
            "method": "tools/call",
            "params": { "name": "answer", "arguments": { "input": "hi" } }
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "jsonrpc": "2.0",
            "id": 1,
            "result": {
                "content": [
                    { "type": "text", "text": "line one" },
                    { "type": "image", "data": "..." },
                    { "type": "text", "text": "line two" }
                ]
            }
        })))
        .mount(&server)
        .await;

    let response = tool_target(&server)
        .invoke(&request("hi"))
        .await
        .expect("call succeeds");
    assert_eq!(response.text, "line one\nline two");
    assert_eq!(response.meta["is_error"], json!(false));
}

#[tokio::test]
async fn test_tool_call_rpc_errors() {
    for (code, transient) in [(-32603, true), (-32050, true), (-32602, false)] {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "jsonrpc": "2.0",
                "id": 1,
                "error": { "code": code, "message": "failed" }
            })))
            .mount(&server)
            .await;

        let err = tool_target(&server)
            .invoke(&request("hi"))
            .await
            .expect_err("rpc error must fail");
        assert_eq!(err.is_transient(), transient, "code {code}");
    }
}

#[tokio::test]
async fn test_tool_call_garbage_is_a_protocol_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>"))
        .mount(&server)
        .await;

    let err = tool_target(&server).invoke(&request("hi")).await.unwrap_err();
    assert_eq!(err.code(), "protocol");
}
