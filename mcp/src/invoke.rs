//! Tool invocation: argument envelope -> outbound backend HTTP request.
//!
//! Upstream failures (non-2xx, connect/timeout) are returned as
//! error-flagged tool results so the protocol session stays alive; only
//! signing and argument errors are hard failures for the call.

use std::{sync::Arc, time::Duration};

use http::Method;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, CONTENT_TYPE};
use rmcp::model::{CallToolResult, Content};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};

use crate::{
    audit::{CallAuditLog, CallOutcome, CallRecord},
    error::{McpError, McpResult},
    scope::RequestScope,
    tool::{ArgumentEnvelope, ServerIdentity, ToolConfig},
};

/// Header carrying the delegated-trust JSON envelope to the backend.
const DELEGATED_AUTH_HEADER: &str = "x-bkapi-authorization";
const REQUEST_ID_HEADER: &str = "x-request-id";
const SERVER_ID_HEADER: &str = "x-bkapi-mcp-server-id";
const SERVER_NAME_HEADER: &str = "x-bkapi-mcp-server-name";

/// Outbound HTTP client settings.
#[derive(Debug, Clone)]
pub struct OutboundConfig {
    /// Lifetime of each freshly signed inner JWT.
    pub inner_jwt_ttl: Duration,
    pub connect_timeout: Duration,
    /// Escape hatch for backends with broken certificates. Off by default.
    pub danger_accept_invalid_certs: bool,
}

impl Default for OutboundConfig {
    fn default() -> Self {
        Self {
            inner_jwt_ttl: Duration::from_secs(300),
            connect_timeout: Duration::from_secs(10),
            danger_accept_invalid_certs: false,
        }
    }
}

/// Successful call payload, serialized as the tool result's text content.
#[derive(Debug, Serialize, Deserialize)]
pub struct ToolCallResponse {
    pub status_code: u16,
    pub request_id: String,
    pub response_body: String,
}

pub struct ToolInvoker {
    http: reqwest::Client,
    inner_jwt_ttl: Duration,
    audit: Arc<CallAuditLog>,
}

impl ToolInvoker {
    pub fn new(config: OutboundConfig, audit: Arc<CallAuditLog>) -> McpResult<Self> {
        if config.danger_accept_invalid_certs {
            warn!("outbound TLS certificate verification is disabled");
        }
        let http = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .danger_accept_invalid_certs(config.danger_accept_invalid_certs)
            .build()?;
        Ok(Self {
            http,
            inner_jwt_ttl: config.inner_jwt_ttl,
            audit,
        })
    }

    pub fn audit_log(&self) -> Arc<CallAuditLog> {
        Arc::clone(&self.audit)
    }

    /// Execute one tool call against its backend.
    ///
    /// `Err` is returned only for failures of this proxy (signing, bad
    /// arguments); backend failures come back as `Ok` with the error flag
    /// set on the result.
    pub async fn invoke(
        &self,
        server: &ServerIdentity,
        tool: &ToolConfig,
        args: ArgumentEnvelope,
        scope: &RequestScope,
    ) -> McpResult<CallToolResult> {
        let app_code = scope
            .identity
            .claims()
            .map(|claims| claims.app_code.clone())
            .unwrap_or_default();
        let arguments = serde_json::to_value(&args).unwrap_or(Value::Null);

        let record = |headers: &HeaderMap, outcome: CallOutcome| {
            self.audit.record(CallRecord::new(
                scope.request_id.clone(),
                app_code.clone(),
                server.id,
                server.name.clone(),
                tool.name.clone(),
                arguments.clone(),
                masked_headers(headers),
                outcome,
            ));
        };

        // Lazy egress signing: the delegated credential exists only once a
        // backend call is actually happening.
        let credential = match scope.identity.sign(server.id, self.inner_jwt_ttl) {
            Ok(credential) => credential,
            Err(err) => {
                record(
                    &HeaderMap::new(),
                    CallOutcome::SigningError {
                        detail: err.to_string(),
                    },
                );
                return Err(McpError::Signing(err));
            }
        };

        let headers = match self.build_headers(server, scope, &args, credential.token()) {
            Ok(headers) => headers,
            Err(err) => {
                record(
                    &HeaderMap::new(),
                    CallOutcome::InvalidArguments {
                        detail: err.to_string(),
                    },
                );
                return Err(err);
            }
        };

        let request = match self.build_request(tool, &args, scope, headers.clone()) {
            Ok(request) => request,
            Err(err) => {
                record(
                    &headers,
                    CallOutcome::InvalidArguments {
                        detail: err.to_string(),
                    },
                );
                return Err(err);
            }
        };

        debug!(
            server = %server.name,
            tool = %tool.name,
            method = %tool.method,
            request_id = %scope.request_id,
            "forwarding tool call to backend"
        );

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                let detail = format!("request to backend failed: {}", err);
                record(&headers, CallOutcome::TransportError { detail: detail.clone() });
                return Ok(error_result(json!({
                    "error": detail,
                    "request_id": scope.request_id,
                })));
            }
        };

        let status = response.status();
        let body = match response.text().await {
            Ok(body) => body,
            Err(err) => {
                let detail = format!("reading backend response failed: {}", err);
                record(&headers, CallOutcome::TransportError { detail: detail.clone() });
                return Ok(error_result(json!({
                    "error": detail,
                    "request_id": scope.request_id,
                })));
            }
        };

        if !status.is_success() {
            record(
                &headers,
                CallOutcome::UpstreamError {
                    status: status.as_u16(),
                    body: body.clone(),
                },
            );
            return Ok(error_result(json!({
                "error": "backend returned a non-2xx response",
                "status_code": status.as_u16(),
                "request_id": scope.request_id,
                "response_body": body,
            })));
        }

        record(
            &headers,
            CallOutcome::Success {
                status: status.as_u16(),
            },
        );
        let payload = ToolCallResponse {
            status_code: status.as_u16(),
            request_id: scope.request_id.clone(),
            response_body: body,
        };
        let text = serde_json::to_string(&payload)
            .unwrap_or_else(|e| json!({"error": e.to_string()}).to_string());
        Ok(CallToolResult::success(vec![Content::text(text)]))
    }

    /// Assemble outbound headers. Pass-through and identity headers go in
    /// first so caller-specified `header_param` values win.
    fn build_headers(
        &self,
        server: &ServerIdentity,
        scope: &RequestScope,
        args: &ArgumentEnvelope,
        inner_jwt: &str,
    ) -> McpResult<HeaderMap> {
        let mut headers = HeaderMap::new();

        let envelope = json!({ "inner_jwt": inner_jwt }).to_string();
        headers.insert(
            HeaderName::from_static(DELEGATED_AUTH_HEADER),
            HeaderValue::from_str(&envelope)
                .map_err(|e| McpError::Transport(format!("delegated auth header: {}", e)))?,
        );

        if !scope.request_id.is_empty() {
            if let Ok(value) = HeaderValue::from_str(&scope.request_id) {
                headers.insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
            }
        }

        for (name, value) in &scope.passthrough_headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(header = %name, "skipping unrepresentable pass-through header"),
            }
        }

        if let Ok(value) = HeaderValue::from_str(&server.id.to_string()) {
            headers.insert(HeaderName::from_static(SERVER_ID_HEADER), value);
        }
        if let Ok(value) = HeaderValue::from_str(&server.name) {
            headers.insert(HeaderName::from_static(SERVER_NAME_HEADER), value);
        }

        if let Some(caller_headers) = &args.header_param {
            for (name, value) in caller_headers {
                let header_name = HeaderName::from_bytes(name.as_bytes())
                    .map_err(|e| McpError::InvalidArguments(format!("header {}: {}", name, e)))?;
                let header_value = HeaderValue::from_str(&value_to_string(value))
                    .map_err(|e| McpError::InvalidArguments(format!("header {}: {}", name, e)))?;
                headers.insert(header_name, header_value);
            }
        }

        if !headers.contains_key(CONTENT_TYPE) {
            headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }

        Ok(headers)
    }

    fn build_request(
        &self,
        tool: &ToolConfig,
        args: &ArgumentEnvelope,
        scope: &RequestScope,
        headers: HeaderMap,
    ) -> McpResult<reqwest::RequestBuilder> {
        let method = Method::from_bytes(tool.method.as_bytes())
            .map_err(|_| McpError::InvalidDocument(format!("unsupported method {}", tool.method)))?;
        let path = render_path(&tool.url, args.path_param.as_ref())?;
        let url = format!("{}://{}{}{}", tool.scheme, tool.host, tool.base_path, path);

        let mut request = self
            .http
            .request(method, url)
            .headers(headers)
            .timeout(scope.call_timeout);

        if let Some(query) = &args.query_param {
            let pairs: Vec<(String, String)> = query
                .iter()
                .map(|(name, value)| (name.clone(), value_to_string(value)))
                .collect();
            request = request.query(&pairs);
        }

        if let Some(body) = &args.body_param {
            let bytes = serde_json::to_vec(body)
                .map_err(|e| McpError::InvalidArguments(format!("body: {}", e)))?;
            request = request.body(bytes);
        }

        Ok(request)
    }
}

fn error_result(payload: Value) -> CallToolResult {
    CallToolResult::error(vec![Content::text(payload.to_string())])
}

fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Substitute `{name}` placeholders in the path template.
fn render_path(template: &str, params: Option<&Map<String, Value>>) -> McpResult<String> {
    let mut path = template.to_string();
    if let Some(params) = params {
        for (name, value) in params {
            path = path.replace(&format!("{{{}}}", name), &value_to_string(value));
        }
    }
    if path.contains('{') {
        return Err(McpError::InvalidArguments(format!(
            "unresolved path parameters in {}",
            path
        )));
    }
    Ok(path)
}

fn masked_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .map(|(name, value)| {
            let shown = if name.as_str() == DELEGATED_AUTH_HEADER
                || *name == http::header::AUTHORIZATION
            {
                "****".to_string()
            } else {
                value.to_str().unwrap_or("<binary>").to_string()
            };
            (name.as_str().to_string(), shown)
        })
        .collect()
}
