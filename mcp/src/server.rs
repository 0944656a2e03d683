//! Tool servers: one registry entry per proxied backend.
//!
//! A [`ToolServer`] owns its registered tool/prompt name sets and an opaque
//! transport handler behind [`ServerTransport`], the narrow seam that keeps
//! SSE and Streamable-HTTP interchangeable without touching registry or
//! reconciliation logic. The production transport is rmcp-backed.

use std::{
    collections::HashSet,
    net::SocketAddr,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use axum::{
    body::Body,
    extract::Request,
    http::StatusCode,
    response::Response,
    Router,
};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use rmcp::{
    model::{
        CallToolRequestParam, CallToolResult, GetPromptRequestParam, GetPromptResult,
        Implementation, ListPromptsResult, ListToolsResult, PaginatedRequestParam, Prompt,
        PromptMessage, PromptMessageContent, PromptMessageRole, ServerCapabilities, ServerInfo,
        Tool,
    },
    service::RequestContext,
    transport::{
        sse_server::{SseServer, SseServerConfig},
        streamable_http_server::session::never::NeverSessionManager,
        StreamableHttpServerConfig, StreamableHttpService,
    },
    ErrorData, RoleServer, ServerHandler,
};
use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use tracing::{debug, warn};

use crate::{
    error::{error_response, McpError},
    invoke::ToolInvoker,
    scope::{current_scope, RequestScope},
    tool::{ArgumentEnvelope, PromptConfig, ServerIdentity, ToolConfig},
};

/// The narrow transport interface a tool server drives.
///
/// Implementations own the protocol plumbing; registry and reconciliation
/// code never see anything below this trait.
#[async_trait]
pub trait ServerTransport: Send + Sync {
    fn register_tool(&self, tool: ToolConfig);
    fn unregister_tool(&self, name: &str);
    fn register_prompt(&self, prompt: PromptConfig);
    fn unregister_prompt(&self, name: &str);
    /// Forward one inbound HTTP request into the protocol layer.
    async fn serve(&self, request: Request) -> Response;
    /// Start the underlying protocol loop. Called at most once.
    fn start(&self);
    fn shutdown(&self);
}

/// Builds transports for newly declared servers.
pub trait TransportFactory: Send + Sync {
    fn build(&self, identity: &ServerIdentity) -> Arc<dyn ServerTransport>;
}

/// One registry entry: name, resource version, registered name sets, and
/// the transport handler.
pub struct ToolServer {
    identity: ServerIdentity,
    resource_version: AtomicI64,
    tools: RwLock<HashSet<String>>,
    prompts: RwLock<HashSet<String>>,
    transport: Arc<dyn ServerTransport>,
}

impl ToolServer {
    pub fn new(
        identity: ServerIdentity,
        resource_version: i64,
        transport: Arc<dyn ServerTransport>,
    ) -> Self {
        Self {
            identity,
            resource_version: AtomicI64::new(resource_version),
            tools: RwLock::new(HashSet::new()),
            prompts: RwLock::new(HashSet::new()),
            transport,
        }
    }

    pub fn name(&self) -> &str {
        &self.identity.name
    }

    pub fn identity(&self) -> &ServerIdentity {
        &self.identity
    }

    pub fn resource_version(&self) -> i64 {
        self.resource_version.load(Ordering::Acquire)
    }

    /// Record the version a tool set was built from. Only meaningful
    /// together with [`ToolServer::replace_tools`]; pruning alone never
    /// changes the version.
    pub fn set_resource_version(&self, version: i64) {
        self.resource_version.store(version, Ordering::Release);
    }

    pub fn tool_names(&self) -> HashSet<String> {
        self.tools.read().clone()
    }

    pub fn prompt_names(&self) -> HashSet<String> {
        self.prompts.read().clone()
    }

    /// Replace the registered tool set wholesale.
    pub fn replace_tools(&self, tools: Vec<ToolConfig>) {
        let mut registered = self.tools.write();
        let next: HashSet<String> = tools.iter().map(|t| t.name.clone()).collect();
        for stale in registered.difference(&next) {
            self.transport.unregister_tool(stale);
        }
        for tool in tools {
            self.transport.register_tool(tool);
        }
        *registered = next;
    }

    /// Deregister every tool whose name is not in `keep`.
    pub fn prune_tools(&self, keep: &HashSet<String>) {
        let mut registered = self.tools.write();
        let stale: Vec<String> = registered.difference(keep).cloned().collect();
        for name in stale {
            debug!(server = %self.identity.name, tool = %name, "pruning undeclared tool");
            self.transport.unregister_tool(&name);
            registered.remove(&name);
        }
    }

    /// Set-diff the registered prompts against `desired`. Idempotent.
    pub fn update_prompts(&self, desired: Vec<PromptConfig>) {
        let mut registered = self.prompts.write();
        let next: HashSet<String> = desired.iter().map(|p| p.name.clone()).collect();
        for stale in registered.difference(&next) {
            self.transport.unregister_prompt(stale);
        }
        for prompt in desired {
            self.transport.register_prompt(prompt);
        }
        *registered = next;
    }

    pub fn start(&self) {
        self.transport.start();
    }

    pub fn shutdown(&self) {
        self.transport.shutdown();
    }

    pub async fn serve(&self, request: Request) -> Response {
        self.transport.serve(request).await
    }
}

/// rmcp server handler exposing one server's tools and prompts.
#[derive(Clone)]
pub struct GatewayMcpHandler {
    identity: Arc<ServerIdentity>,
    tools: Arc<DashMap<String, Arc<ToolConfig>>>,
    prompts: Arc<DashMap<String, PromptConfig>>,
    invoker: Arc<ToolInvoker>,
}

impl GatewayMcpHandler {
    pub fn new(identity: ServerIdentity, invoker: Arc<ToolInvoker>) -> Self {
        Self {
            identity: Arc::new(identity),
            tools: Arc::new(DashMap::new()),
            prompts: Arc::new(DashMap::new()),
            invoker,
        }
    }

    fn insert_tool(&self, tool: ToolConfig) {
        self.tools.insert(tool.name.clone(), Arc::new(tool));
    }

    fn remove_tool(&self, name: &str) {
        self.tools.remove(name);
    }

    fn insert_prompt(&self, prompt: PromptConfig) {
        self.prompts.insert(prompt.name.clone(), prompt);
    }

    fn remove_prompt(&self, name: &str) {
        self.prompts.remove(name);
    }

    /// The request scope travels with the forwarded HTTP request: the SDK
    /// surfaces the request parts through the handler context, and the
    /// dispatch path additionally installs a task-local for transports
    /// that execute within the request's own task.
    fn resolve_scope(context: &RequestContext<RoleServer>) -> Option<RequestScope> {
        if let Some(parts) = context.extensions.get::<http::request::Parts>() {
            if let Some(scope) = parts.extensions.get::<RequestScope>() {
                return Some(scope.clone());
            }
        }
        current_scope()
    }
}

impl ServerHandler for GatewayMcpHandler {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: Default::default(),
            capabilities: ServerCapabilities::builder()
                .enable_tools()
                .enable_prompts()
                .build(),
            server_info: Implementation {
                name: self.identity.name.clone(),
                version: env!("CARGO_PKG_VERSION").to_string(),
                ..Default::default()
            },
            instructions: None,
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, ErrorData> {
        let tools = self
            .tools
            .iter()
            .map(|entry| {
                let config = entry.value();
                let input_schema = match &config.param_schema {
                    Value::Object(map) => map.clone(),
                    _ => Map::new(),
                };
                let mut tool = Tool::new(
                    config.name.clone(),
                    config.description.clone(),
                    Arc::new(input_schema),
                );
                if let Value::Object(output) = &config.output_schema {
                    if !output.is_empty() {
                        tool.output_schema = Some(Arc::new(output.clone()));
                    }
                }
                tool
            })
            .collect();
        Ok(ListToolsResult {
            tools,
            ..Default::default()
        })
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, ErrorData> {
        let name: &str = request.name.as_ref();
        let Some(config) = self.tools.get(name).map(|entry| Arc::clone(entry.value())) else {
            return Err(ErrorData::invalid_params(
                format!("tool {} is not registered", name),
                None,
            ));
        };

        let Some(scope) = Self::resolve_scope(&context) else {
            return Err(ErrorData::internal_error(
                "request scope unavailable for tool call",
                None,
            ));
        };

        let args = ArgumentEnvelope::from_arguments(request.arguments)
            .map_err(|e| ErrorData::invalid_params(e.to_string(), None))?;

        match self.invoker.invoke(&self.identity, &config, args, &scope).await {
            Ok(result) => Ok(result),
            Err(McpError::InvalidArguments(message)) => {
                Err(ErrorData::invalid_params(message, None))
            }
            Err(err) => Err(ErrorData::internal_error(err.to_string(), None)),
        }
    }

    async fn list_prompts(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListPromptsResult, ErrorData> {
        let prompts = self
            .prompts
            .iter()
            .map(|entry| {
                let prompt = entry.value();
                let description = if prompt.description.is_empty() {
                    None
                } else {
                    Some(prompt.description.clone())
                };
                Prompt::new(prompt.name.clone(), description, None)
            })
            .collect();
        Ok(ListPromptsResult {
            prompts,
            ..Default::default()
        })
    }

    async fn get_prompt(
        &self,
        request: GetPromptRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<GetPromptResult, ErrorData> {
        let name: &str = request.name.as_ref();
        let Some(prompt) = self.prompts.get(name).map(|entry| entry.value().clone()) else {
            return Err(ErrorData::invalid_params(
                format!("prompt {} is not registered", name),
                None,
            ));
        };

        let description = if prompt.description.is_empty() {
            None
        } else {
            Some(prompt.description.clone())
        };
        Ok(GetPromptResult {
            description,
            messages: vec![PromptMessage {
                role: PromptMessageRole::User,
                content: PromptMessageContent::Text {
                    text: prompt.content.clone(),
                },
            }],
        })
    }
}

/// Production transport: Streamable-HTTP at `{name}/mcp` (stateless) and
/// SSE at `{name}/sse` + `{name}/messages`, both driving the same handler.
pub struct McpTransport {
    handler: GatewayMcpHandler,
    streamable: StreamableHttpService<GatewayMcpHandler, NeverSessionManager>,
    sse_router: Router,
    sse_server: Mutex<Option<SseServer>>,
    ct: CancellationToken,
}

impl McpTransport {
    pub fn new(
        identity: ServerIdentity,
        invoker: Arc<ToolInvoker>,
        sse_keep_alive: Duration,
        parent_ct: &CancellationToken,
    ) -> Self {
        let handler = GatewayMcpHandler::new(identity.clone(), invoker);
        let ct = parent_ct.child_token();

        let streamable_handler = handler.clone();
        let streamable = StreamableHttpService::new(
            move || Ok(streamable_handler.clone()),
            Arc::new(NeverSessionManager::default()),
            StreamableHttpServerConfig {
                sse_keep_alive: Some(sse_keep_alive),
                stateful_mode: false,
            },
        );

        // The bind address is never used: the SSE router is mounted into
        // the gateway's own listener through `serve`.
        let (sse_server, sse_router) = SseServer::new(SseServerConfig {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            sse_path: format!("/{}/sse", identity.name),
            post_path: format!("/{}/messages", identity.name),
            ct: ct.clone(),
            sse_keep_alive: Some(sse_keep_alive),
        });

        Self {
            handler,
            streamable,
            sse_router,
            sse_server: Mutex::new(Some(sse_server)),
            ct,
        }
    }
}

#[async_trait]
impl ServerTransport for McpTransport {
    fn register_tool(&self, tool: ToolConfig) {
        self.handler.insert_tool(tool);
    }

    fn unregister_tool(&self, name: &str) {
        self.handler.remove_tool(name);
    }

    fn register_prompt(&self, prompt: PromptConfig) {
        self.handler.insert_prompt(prompt);
    }

    fn unregister_prompt(&self, name: &str) {
        self.handler.remove_prompt(name);
    }

    async fn serve(&self, request: Request) -> Response {
        if self.ct.is_cancelled() {
            return error_response(
                StatusCode::SERVICE_UNAVAILABLE,
                "server_shutting_down",
                "mcp server is shutting down",
            );
        }

        if request.uri().path().ends_with("/mcp") {
            match self.streamable.clone().oneshot(request).await {
                Ok(response) => response.map(Body::new),
                Err(err) => {
                    warn!(error = %err, "streamable transport failed");
                    error_response(
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "transport_failure",
                        "streamable transport failed",
                    )
                }
            }
        } else {
            match self.sse_router.clone().oneshot(request).await {
                Ok(response) => response,
                Err(err) => match err {},
            }
        }
    }

    fn start(&self) {
        if let Some(sse_server) = self.sse_server.lock().take() {
            let handler = self.handler.clone();
            let _loop_ct = sse_server.with_service(move || handler.clone());
        }
    }

    fn shutdown(&self) {
        self.ct.cancel();
    }
}

/// Builds the production rmcp transport for each declared server.
pub struct McpTransportFactory {
    invoker: Arc<ToolInvoker>,
    sse_keep_alive: Duration,
    shutdown: CancellationToken,
}

impl McpTransportFactory {
    pub fn new(
        invoker: Arc<ToolInvoker>,
        sse_keep_alive: Duration,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            invoker,
            sse_keep_alive,
            shutdown,
        }
    }
}

impl TransportFactory for McpTransportFactory {
    fn build(&self, identity: &ServerIdentity) -> Arc<dyn ServerTransport> {
        Arc::new(McpTransport::new(
            identity.clone(),
            Arc::clone(&self.invoker),
            self.sse_keep_alive,
            &self.shutdown,
        ))
    }
}
