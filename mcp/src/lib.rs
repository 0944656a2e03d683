//! MCP gateway core.
//!
//! ## Modules
//!
//! - [`proxy`]: concurrency-safe registry of name -> tool server, dispatch
//! - [`server`]: one registry entry (rmcp handler + SSE/streamable transports)
//! - [`convert`]: pure OpenAPI document -> tool descriptor conversion
//! - [`invoke`]: argument envelope -> outbound backend HTTP call
//! - [`audit`]: bounded in-memory record of every tool call
//! - [`scope`]: request-scoped values (verified identity, timeout, headers)

pub mod audit;
pub mod convert;
pub mod error;
pub mod invoke;
pub mod proxy;
pub mod scope;
pub mod server;
pub mod tool;

pub use audit::{CallAuditLog, CallOutcome, CallRecord};
pub use convert::{convert, OpenApiDocument};
pub use error::{error_response, McpError, McpResult};
pub use invoke::{OutboundConfig, ToolInvoker};
pub use proxy::McpProxy;
pub use scope::{with_scope, RequestScope};
pub use server::{
    McpTransport, McpTransportFactory, ServerTransport, ToolServer, TransportFactory,
};
pub use tool::{ArgumentEnvelope, PromptConfig, ServerIdentity, ToolConfig};
