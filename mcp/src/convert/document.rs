//! Minimal serde view of an OpenAPI document.
//!
//! Only the pieces the converter consumes are modeled; everything else in
//! the document is ignored. Schema fragments and the Responses block stay
//! opaque `serde_json::Value`s.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;

use crate::error::{McpError, McpResult};

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OpenApiDocument {
    #[serde(default)]
    pub openapi: String,
    #[serde(default)]
    pub servers: Vec<ServerObject>,
    #[serde(default)]
    pub paths: BTreeMap<String, PathItem>,
}

impl OpenApiDocument {
    /// Parse a document from its stored text form, JSON or YAML.
    pub fn parse(text: &str) -> McpResult<Self> {
        match serde_json::from_str(text) {
            Ok(doc) => Ok(doc),
            Err(json_err) => serde_yaml::from_str(text).map_err(|yaml_err| {
                McpError::InvalidDocument(format!(
                    "not JSON ({}) nor YAML ({})",
                    json_err, yaml_err
                ))
            }),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerObject {
    #[serde(default)]
    pub url: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathItem {
    pub get: Option<Operation>,
    pub put: Option<Operation>,
    pub post: Option<Operation>,
    pub delete: Option<Operation>,
    pub options: Option<Operation>,
    pub head: Option<Operation>,
    pub patch: Option<Operation>,
    pub trace: Option<Operation>,
}

impl PathItem {
    /// Declared operations in a fixed method order.
    pub fn operations(&self) -> impl Iterator<Item = (&'static str, &Operation)> {
        [
            ("GET", self.get.as_ref()),
            ("PUT", self.put.as_ref()),
            ("POST", self.post.as_ref()),
            ("DELETE", self.delete.as_ref()),
            ("OPTIONS", self.options.as_ref()),
            ("HEAD", self.head.as_ref()),
            ("PATCH", self.patch.as_ref()),
            ("TRACE", self.trace.as_ref()),
        ]
        .into_iter()
        .filter_map(|(method, op)| op.map(|op| (method, op)))
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Operation {
    #[serde(default, rename = "operationId")]
    pub operation_id: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub parameters: Vec<Parameter>,
    #[serde(default, rename = "requestBody")]
    pub request_body: Option<RequestBody>,
    #[serde(default)]
    pub responses: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Parameter {
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "in")]
    pub location: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub schema: Option<Value>,
    #[serde(default)]
    pub example: Option<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestBody {
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub content: BTreeMap<String, MediaType>,
}

impl RequestBody {
    /// The first `application/json` media type entry, charset suffixes
    /// included.
    pub fn json_media_type(&self) -> Option<&MediaType> {
        self.content
            .iter()
            .find(|(key, _)| {
                key.as_str() == "application/json" || key.starts_with("application/json;")
            })
            .map(|(_, media)| media)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaType {
    #[serde(default)]
    pub schema: Option<Value>,
}
