//! Static tool and prompt descriptors plus the runtime argument envelope.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{McpError, McpResult};

/// Static description of one backend operation exposed as a callable tool.
///
/// Built by the converter, immutable afterwards; a reconversion replaces
/// the whole descriptor rather than patching it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Tool name, unique within one server.
    pub name: String,
    pub description: String,
    /// HTTP method of the backend operation, upper-case.
    pub method: String,
    /// URL scheme of the backend endpoint (`http`/`https`).
    pub scheme: String,
    /// Backend host, including a non-default port when declared.
    pub host: String,
    /// Path prefix from the declared server URL, no trailing slash.
    pub base_path: String,
    /// Path template relative to `base_path`, `{name}` placeholders intact.
    pub url: String,
    /// Generated JSON-Schema for the argument envelope.
    pub param_schema: Value,
    /// The operation's raw Responses block, carried through opaquely.
    pub output_schema: Value,
}

/// Static description of one prompt served by a tool server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PromptConfig {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Static text served as a single user-role message.
    #[serde(default)]
    pub content: String,
}

/// Identity of one proxied server, used for delegated-trust scoping and
/// audit keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerIdentity {
    pub id: i64,
    pub name: String,
}

/// The generic argument envelope every converted tool accepts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ArgumentEnvelope {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_param: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_param: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path_param: Option<Map<String, Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body_param: Option<Value>,
}

impl ArgumentEnvelope {
    /// Parse the raw MCP tool-call arguments. Absent arguments mean an
    /// empty envelope, not an error.
    pub fn from_arguments(arguments: Option<Map<String, Value>>) -> McpResult<Self> {
        match arguments {
            None => Ok(Self::default()),
            Some(map) => serde_json::from_value(Value::Object(map))
                .map_err(|e| McpError::InvalidArguments(e.to_string())),
        }
    }
}
