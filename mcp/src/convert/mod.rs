//! OpenAPI document -> tool descriptor conversion.
//!
//! Pure: the converter reads a parsed document plus an operation allow-set
//! and a name-override map, and produces [`ToolConfig`]s. It performs no
//! I/O and touches no shared state.

mod document;

use std::collections::{HashMap, HashSet};

use serde_json::{json, Map, Value};
use tracing::warn;
use url::Url;

pub use document::{
    MediaType, OpenApiDocument, Operation, Parameter, PathItem, RequestBody, ServerObject,
};

use crate::tool::ToolConfig;

/// Backend endpoint parsed from a declared server URL.
struct Endpoint {
    scheme: String,
    host: String,
    base_path: String,
}

fn parse_endpoint(raw: &str) -> Option<Endpoint> {
    let url = Url::parse(raw).ok()?;
    let host = url.host_str()?;
    let host = match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    };
    let base_path = url.path().trim_end_matches('/').to_string();
    Some(Endpoint {
        scheme: url.scheme().to_string(),
        host,
        base_path,
    })
}

/// Convert every allowed operation of `document` into a tool descriptor.
///
/// - Operations without an `operationId` are skipped.
/// - A non-empty `allowed_operation_ids` acts as an allow-set.
/// - `name_overrides` maps operationId -> exposed tool name; empty override
///   values fall back to the operationId.
/// - When the document's first server URL does not parse, every operation
///   is skipped and the result is empty.
pub fn convert(
    document: &OpenApiDocument,
    allowed_operation_ids: &HashSet<String>,
    name_overrides: &HashMap<String, String>,
) -> Vec<ToolConfig> {
    let endpoint = match document.servers.first().and_then(|s| parse_endpoint(&s.url)) {
        Some(endpoint) => endpoint,
        None => {
            warn!(
                url = document.servers.first().map(|s| s.url.as_str()).unwrap_or(""),
                "openapi document has no parsable server url, skipping all operations"
            );
            return Vec::new();
        }
    };

    let mut tools = Vec::new();
    for (path, item) in &document.paths {
        for (method, operation) in item.operations() {
            if operation.operation_id.is_empty() {
                continue;
            }
            if !allowed_operation_ids.is_empty()
                && !allowed_operation_ids.contains(&operation.operation_id)
            {
                continue;
            }

            let name = name_overrides
                .get(&operation.operation_id)
                .filter(|name| !name.is_empty())
                .cloned()
                .unwrap_or_else(|| operation.operation_id.clone());

            let description = if operation.description.is_empty() {
                operation.summary.clone()
            } else {
                operation.description.clone()
            };

            tools.push(ToolConfig {
                name,
                description,
                method: method.to_string(),
                scheme: endpoint.scheme.clone(),
                host: endpoint.host.clone(),
                base_path: endpoint.base_path.clone(),
                url: path.clone(),
                param_schema: build_param_schema(operation),
                output_schema: operation.responses.clone(),
            });
        }
    }
    tools
}

/// One property per parameter, carrying the parameter's own schema plus its
/// description and example when present.
fn group_schema(params: &[&Parameter], required: Vec<String>) -> Value {
    let mut properties = Map::new();
    for param in params {
        let mut schema = match &param.schema {
            Some(Value::Object(obj)) => obj.clone(),
            Some(other) => {
                // Non-object schemas are rare but legal; carry them as-is
                // under a wrapper the agent can still read.
                let mut obj = Map::new();
                obj.insert("schema".to_string(), other.clone());
                obj
            }
            None => Map::new(),
        };
        if !param.description.is_empty() {
            schema
                .entry("description".to_string())
                .or_insert_with(|| Value::String(param.description.clone()));
        }
        if let Some(example) = &param.example {
            schema
                .entry("example".to_string())
                .or_insert_with(|| example.clone());
        }
        properties.insert(param.name.clone(), Value::Object(schema));
    }

    let mut object = Map::new();
    object.insert("type".to_string(), json!("object"));
    object.insert("properties".to_string(), Value::Object(properties));
    if !required.is_empty() {
        object.insert("required".to_string(), json!(required));
    }
    Value::Object(object)
}

fn build_param_schema(operation: &Operation) -> Value {
    let mut properties = Map::new();
    let mut required = Vec::new();

    // header_param / query_param only exist when at least one member is
    // required, and then the whole group is required.
    for (location, key) in [("header", "header_param"), ("query", "query_param")] {
        let params: Vec<&Parameter> = operation
            .parameters
            .iter()
            .filter(|p| p.location == location)
            .collect();
        let required_names: Vec<String> = params
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name.clone())
            .collect();
        if required_names.is_empty() {
            continue;
        }
        properties.insert(key.to_string(), group_schema(&params, required_names));
        required.push(key.to_string());
    }

    // Path parameters are required whenever any exist.
    let path_params: Vec<&Parameter> = operation
        .parameters
        .iter()
        .filter(|p| p.location == "path")
        .collect();
    if !path_params.is_empty() {
        let names = path_params.iter().map(|p| p.name.clone()).collect();
        properties.insert("path_param".to_string(), group_schema(&path_params, names));
        required.push("path_param".to_string());
    }

    if let Some(schema) = operation
        .request_body
        .as_ref()
        .and_then(|body| body.json_media_type())
        .and_then(|media| media.schema.clone())
    {
        properties.insert("body_param".to_string(), schema);
    }

    let mut object = Map::new();
    object.insert("type".to_string(), json!("object"));
    object.insert("properties".to_string(), Value::Object(properties));
    if !required.is_empty() {
        object.insert("required".to_string(), json!(required));
    }
    Value::Object(object)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(json_text: &str) -> OpenApiDocument {
        OpenApiDocument::parse(json_text).expect("test document")
    }

    fn no_filter() -> (HashSet<String>, HashMap<String, String>) {
        (HashSet::new(), HashMap::new())
    }

    #[test]
    fn test_single_get_operation() {
        let document = doc(r#"{
            "servers": [{"url": "https://api.example.com"}],
            "paths": {
                "/users": {
                    "get": {"operationId": "getUsers", "responses": {"200": {"description": "ok"}}}
                }
            }
        }"#);
        let (allowed, overrides) = no_filter();

        let tools = convert(&document, &allowed, &overrides);
        assert_eq!(tools.len(), 1);
        let tool = &tools[0];
        assert_eq!(tool.name, "getUsers");
        assert_eq!(tool.method, "GET");
        assert_eq!(tool.url, "/users");
        assert_eq!(tool.scheme, "https");
        assert_eq!(tool.host, "api.example.com");
        assert_eq!(tool.base_path, "");
        assert_eq!(tool.output_schema["200"]["description"], "ok");
        // No parameters: envelope schema is an empty object.
        assert_eq!(tool.param_schema["type"], "object");
        assert!(tool.param_schema["properties"]
            .as_object()
            .unwrap()
            .is_empty());
    }

    #[test]
    fn test_name_override_wins_unless_empty() {
        let document = doc(r#"{
            "servers": [{"url": "http://b.example"}],
            "paths": {
                "/a": {"get": {"operationId": "opA"}},
                "/b": {"get": {"operationId": "opB"}}
            }
        }"#);
        let allowed = HashSet::new();
        let overrides = HashMap::from([
            ("opA".to_string(), "renamed_a".to_string()),
            ("opB".to_string(), String::new()),
        ]);

        let tools = convert(&document, &allowed, &overrides);
        let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
        assert!(names.contains(&"renamed_a"));
        assert!(names.contains(&"opB"));
    }

    #[test]
    fn test_allow_set_filters_operations() {
        let document = doc(r#"{
            "servers": [{"url": "http://b.example"}],
            "paths": {
                "/a": {"get": {"operationId": "opA"}},
                "/b": {"get": {"operationId": "opB"}},
                "/c": {"get": {}}
            }
        }"#);
        let allowed = HashSet::from(["opB".to_string()]);
        let overrides = HashMap::new();

        let tools = convert(&document, &allowed, &overrides);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "opB");
    }

    #[test]
    fn test_unparsable_server_url_yields_nothing() {
        let document = doc(r#"{
            "servers": [{"url": "not a url"}],
            "paths": {"/a": {"get": {"operationId": "opA"}}}
        }"#);
        let (allowed, overrides) = no_filter();
        assert!(convert(&document, &allowed, &overrides).is_empty());

        let document = doc(r#"{"paths": {"/a": {"get": {"operationId": "opA"}}}}"#);
        assert!(convert(&document, &allowed, &overrides).is_empty());
    }

    #[test]
    fn test_server_url_with_port_and_base_path() {
        let document = doc(r#"{
            "servers": [{"url": "http://backend.local:8080/api/v2/"}],
            "paths": {"/users/{id}": {"delete": {"operationId": "deleteUser"}}}
        }"#);
        let (allowed, overrides) = no_filter();

        let tools = convert(&document, &allowed, &overrides);
        assert_eq!(tools[0].host, "backend.local:8080");
        assert_eq!(tools[0].base_path, "/api/v2");
        assert_eq!(tools[0].method, "DELETE");
        assert_eq!(tools[0].url, "/users/{id}");
    }

    #[test]
    fn test_description_falls_back_to_summary() {
        let document = doc(r#"{
            "servers": [{"url": "http://b.example"}],
            "paths": {
                "/a": {"get": {"operationId": "opA", "summary": "short", "description": "long"}},
                "/b": {"get": {"operationId": "opB", "summary": "short"}}
            }
        }"#);
        let (allowed, overrides) = no_filter();

        let tools = convert(&document, &allowed, &overrides);
        let by_name: HashMap<&str, &ToolConfig> =
            tools.iter().map(|t| (t.name.as_str(), t)).collect();
        assert_eq!(by_name["opA"].description, "long");
        assert_eq!(by_name["opB"].description, "short");
    }

    #[test]
    fn test_path_params_always_required() {
        let document = doc(r#"{
            "servers": [{"url": "http://b.example"}],
            "paths": {
                "/users/{id}": {
                    "get": {
                        "operationId": "getUser",
                        "parameters": [
                            {"name": "id", "in": "path", "required": true,
                             "schema": {"type": "string"}, "description": "user id"}
                        ]
                    }
                }
            }
        }"#);
        let (allowed, overrides) = no_filter();

        let schema = &convert(&document, &allowed, &overrides)[0].param_schema;
        assert_eq!(schema["required"], json!(["path_param"]));
        assert_eq!(schema["properties"]["path_param"]["required"], json!(["id"]));
        assert_eq!(
            schema["properties"]["path_param"]["properties"]["id"]["description"],
            "user id"
        );
    }

    #[test]
    fn test_optional_only_query_group_not_attached() {
        let document = doc(r#"{
            "servers": [{"url": "http://b.example"}],
            "paths": {
                "/search": {
                    "get": {
                        "operationId": "search",
                        "parameters": [
                            {"name": "page", "in": "query", "schema": {"type": "integer"}}
                        ]
                    }
                }
            }
        }"#);
        let (allowed, overrides) = no_filter();

        let schema = &convert(&document, &allowed, &overrides)[0].param_schema;
        assert!(schema["properties"].get("query_param").is_none());
        assert!(schema.get("required").is_none());
    }

    #[test]
    fn test_required_query_attaches_whole_group() {
        let document = doc(r#"{
            "servers": [{"url": "http://b.example"}],
            "paths": {
                "/search": {
                    "get": {
                        "operationId": "search",
                        "parameters": [
                            {"name": "q", "in": "query", "required": true,
                             "schema": {"type": "string"}, "example": "rust"},
                            {"name": "page", "in": "query", "schema": {"type": "integer"}},
                            {"name": "X-Trace", "in": "header", "required": true,
                             "schema": {"type": "string"}}
                        ]
                    }
                }
            }
        }"#);
        let (allowed, overrides) = no_filter();

        let schema = &convert(&document, &allowed, &overrides)[0].param_schema;
        let query = &schema["properties"]["query_param"];
        // Both members are present, only the required one is listed.
        assert!(query["properties"].get("q").is_some());
        assert!(query["properties"].get("page").is_some());
        assert_eq!(query["required"], json!(["q"]));
        assert_eq!(query["properties"]["q"]["example"], "rust");

        let header = &schema["properties"]["header_param"];
        assert_eq!(header["required"], json!(["X-Trace"]));

        let required = schema["required"].as_array().unwrap();
        assert!(required.contains(&json!("header_param")));
        assert!(required.contains(&json!("query_param")));
    }

    #[test]
    fn test_json_body_nested_under_body_param() {
        let document = doc(r#"{
            "servers": [{"url": "http://b.example"}],
            "paths": {
                "/users": {
                    "post": {
                        "operationId": "createUser",
                        "requestBody": {
                            "content": {
                                "application/json": {
                                    "schema": {"type": "object",
                                               "properties": {"name": {"type": "string"}}}
                                },
                                "text/plain": {"schema": {"type": "string"}}
                            }
                        }
                    }
                }
            }
        }"#);
        let (allowed, overrides) = no_filter();

        let schema = &convert(&document, &allowed, &overrides)[0].param_schema;
        assert_eq!(
            schema["properties"]["body_param"]["properties"]["name"]["type"],
            "string"
        );
    }

    #[test]
    fn test_non_json_body_ignored() {
        let document = doc(r#"{
            "servers": [{"url": "http://b.example"}],
            "paths": {
                "/upload": {
                    "post": {
                        "operationId": "upload",
                        "requestBody": {
                            "content": {"application/octet-stream": {"schema": {"type": "string"}}}
                        }
                    }
                }
            }
        }"#);
        let (allowed, overrides) = no_filter();

        let schema = &convert(&document, &allowed, &overrides)[0].param_schema;
        assert!(schema["properties"].get("body_param").is_none());
    }
}
