//! HTTP and tool-call (JSON-RPC 2.0) target adapter.
//!
//! Status codes are never interpreted here; non-2xx responses go through
//! [`CallError::from_status`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::RETRY_AFTER;
use serde_json::{json, Value};
use tracing::debug;
use url::Url;

use super::{TargetAdapter, TargetConnector, TargetRequest, TargetResponse};
use crate::error::{CallError, GateError, GateResult, RejectKind, TransientKind};
use crate::model::{ProtocolMode, TargetDescriptor};

pub const USER_AGENT: &str = concat!("probegate/", env!("CARGO_PKG_VERSION"));

/// Response bodies quoted in error messages are cut to this many chars.
const MAX_ERROR_BODY: usize = 512;

/// Fields probed, in order, for the answer text of an HTTP target.
const TEXT_FIELDS: &[&str] = &["output", "text", "content", "response"];

#[derive(Debug, Clone)]
pub struct HttpConnector {
    client: reqwest::Client,
}

impl HttpConnector {
    pub fn new() -> GateResult<Self> {
        let client = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| GateError::config(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { client })
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl TargetConnector for HttpConnector {
    fn connect(&self, target: &TargetDescriptor) -> GateResult<Arc<dyn TargetAdapter>> {
        let url = Url::parse(&target.endpoint).map_err(|e| GateError::InvalidTarget {
            message: format!("endpoint '{}': {e}", target.endpoint),
        })?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(GateError::InvalidTarget {
                message: format!("endpoint '{}': unsupported scheme", target.endpoint),
            });
        }
        let tool_name = match (target.protocol, target.tool_name.as_deref()) {
            (ProtocolMode::ToolCall, None) | (ProtocolMode::ToolCall, Some("")) => {
                return Err(GateError::InvalidTarget {
                    message: "tool_call targets require tool_name".into(),
                })
            }
            (_, name) => name.map(str::to_string),
        };
        Ok(Arc::new(HttpTarget {
            client: self.client.clone(),
            url,
            endpoint: target.endpoint.clone(),
            token: target.auth_token.clone(),
            mode: target.protocol,
            tool_name,
            next_id: AtomicU64::new(1),
        }))
    }
}

#[derive(Debug)]
pub struct HttpTarget {
    client: reqwest::Client,
    url: Url,
    endpoint: String,
    token: Option<String>,
    mode: ProtocolMode,
    tool_name: Option<String>,
    next_id: AtomicU64,
}

impl HttpTarget {
    async fn post(&self, body: &Value) -> Result<reqwest::Response, CallError> {
        let mut request = self.client.post(self.url.clone()).json(body);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);
        let body = response.text().await.unwrap_or_default();
        Err(CallError::from_status(
            status.as_u16(),
            truncate(&body),
            retry_after,
        ))
    }

    async fn invoke_http(&self, request: &TargetRequest) -> Result<TargetResponse, CallError> {
        let body = json!({
            "input": request.input,
            "case_id": request.case_id,
        });
        let response = self.post(&body).await?;
        let status = response.status().as_u16();
        let raw = response.text().await?;
        Ok(TargetResponse {
            text: extract_text(&raw),
            status: Some(status),
            meta: Value::Null,
        })
    }

    async fn invoke_tool(&self, request: &TargetRequest) -> Result<TargetResponse, CallError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": {
                "name": self.tool_name.as_deref().unwrap_or_default(),
                "arguments": { "input": request.input },
            },
        });
        let response = self.post(&body).await?;
        let status = response.status().as_u16();
        let envelope: Value = response.json().await?;

        if let Some(err) = envelope.get("error") {
            let code = err.get("code").and_then(Value::as_i64).unwrap_or(0);
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("unknown JSON-RPC error");
            return Err(map_rpc_error(code, message));
        }

        let result = envelope.get("result").ok_or_else(|| {
            CallError::rejected(RejectKind::Protocol, "JSON-RPC response has no result")
        })?;
        let text = result
            .get("content")
            .and_then(Value::as_array)
            .map(|items| {
                items
                    .iter()
                    .filter_map(|item| item.get("text").and_then(Value::as_str))
                    .collect::<Vec<_>>()
                    .join("\n")
            })
            .unwrap_or_default();
        let is_error = result
            .get("isError")
            .and_then(Value::as_bool)
            .unwrap_or(false);

        Ok(TargetResponse {
            text,
            status: Some(status),
            meta: json!({ "rpc_id": id, "is_error": is_error }),
        })
    }
}

#[async_trait]
impl TargetAdapter for HttpTarget {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn provider_id(&self) -> String {
        match (self.mode, self.tool_name.as_deref()) {
            (ProtocolMode::ToolCall, Some(tool)) => format!("{}|tool_call:{tool}", self.endpoint),
            _ => format!("{}|http", self.endpoint),
        }
    }

    async fn invoke(&self, request: &TargetRequest) -> Result<TargetResponse, CallError> {
        debug!(endpoint = %self.endpoint, case = %request.case_id, "invoking target");
        match self.mode {
            ProtocolMode::Http => self.invoke_http(request).await,
            ProtocolMode::ToolCall => self.invoke_tool(request).await,
        }
    }
}

/// JSON bodies: first string field among [`TEXT_FIELDS`]; anything else: raw body.
fn extract_text(raw: &str) -> String {
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(raw) {
        for field in TEXT_FIELDS {
            if let Some(Value::String(s)) = map.get(*field) {
                return s.clone();
            }
        }
    }
    raw.to_string()
}

/// Internal and implementation-defined server errors are the target's fault;
/// everything else is a malformed call.
fn map_rpc_error(code: i64, message: &str) -> CallError {
    let message = format!("JSON-RPC {code}: {message}");
    match code {
        -32603 | -32099..=-32000 => CallError::transient(TransientKind::Server, message),
        -32600 | -32602 => CallError::rejected(RejectKind::BadRequest, message),
        -32601 => CallError::rejected(RejectKind::NotFound, message),
        _ => CallError::rejected(RejectKind::Protocol, message),
    }
}

fn truncate(body: &str) -> String {
    if body.chars().count() <= MAX_ERROR_BODY {
        body.to_string()
    } else {
        let cut: String = body.chars().take(MAX_ERROR_BODY).collect();
        format!("{cut}...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint;

    #[test]
    fn extract_text_prefers_known_fields() {
        assert_eq!(extract_text(r#"{"output":"hi","text":"no"}"#), "hi");
        assert_eq!(extract_text(r#"{"content":"c"}"#), "c");
        assert_eq!(extract_text(r#"{"other":1}"#), r#"{"other":1}"#);
        assert_eq!(extract_text("plain answer"), "plain answer");
    }

    #[test]
    fn rpc_errors_split_by_fault() {
        assert!(map_rpc_error(-32603, "boom").is_transient());
        assert!(map_rpc_error(-32001, "busy").is_transient());
        assert_eq!(map_rpc_error(-32602, "bad").code(), "bad_request");
        assert_eq!(map_rpc_error(-32601, "nope").code(), "not_found");
        assert_eq!(map_rpc_error(7, "?").code(), "protocol");
    }

    #[test]
    fn connector_validates_descriptors() {
        let connector = HttpConnector::new().unwrap();
        assert!(connector
            .connect(&TargetDescriptor::http("not a url"))
            .is_err());
        assert!(connector
            .connect(&TargetDescriptor::http("ftp://example.com"))
            .is_err());

        let mut tool = TargetDescriptor::http("http://localhost:1/rpc");
        tool.protocol = ProtocolMode::ToolCall;
        assert!(matches!(
            connector.connect(&tool),
            Err(GateError::InvalidTarget { .. })
        ));
        tool.tool_name = Some("answer".into());
        let adapter = connector.connect(&tool).unwrap();
        assert_eq!(adapter.endpoint(), "http://localhost:1/rpc");
    }

    #[test]
    fn provider_id_separates_protocol_and_tool_on_one_url() {
        let connector = HttpConnector::new().unwrap();
        let url = "http://localhost:1/rpc";
        let tool = |name: &str| {
            let mut d = TargetDescriptor::http(url);
            d.protocol = ProtocolMode::ToolCall;
            d.tool_name = Some(name.into());
            connector.connect(&d).unwrap().provider_id()
        };
        let plain = connector
            .connect(&TargetDescriptor::http(url))
            .unwrap()
            .provider_id();

        let ids = [plain, tool("answer"), tool("search")];
        for (i, a) in ids.iter().enumerate() {
            for b in &ids[i + 1..] {
                assert_ne!(a, b);
                assert_ne!(
                    fingerprint::compute(&fingerprint::provider_id(a, "contains"), "q", Some("x")),
                    fingerprint::compute(&fingerprint::provider_id(b, "contains"), "q", Some("x")),
                );
            }
        }
        assert_eq!(tool("answer"), tool("answer"));
    }

    #[test]
    fn long_error_bodies_are_truncated() {
        let body = "x".repeat(MAX_ERROR_BODY + 10);
        assert_eq!(truncate(&body).len(), MAX_ERROR_BODY + 3);
        assert_eq!(truncate("short"), "short");
    }
}
