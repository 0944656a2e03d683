//! Gateway configuration, loaded from YAML with serde defaults.

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Listen address for the ingress HTTP server.
    #[serde(default = "default_listen")]
    pub listen: String,

    /// Well-known gateway name; resolves the JWT key pair and stamps the
    /// inner-JWT key id.
    pub gateway_name: String,

    /// Reconciliation interval in seconds.
    #[serde(default = "default_reconcile_interval")]
    pub reconcile_interval: u64,

    /// Lifetime of each signed inner JWT, in seconds.
    #[serde(default = "default_inner_jwt_expire")]
    pub inner_jwt_expire: u64,

    /// Outbound call timeout in seconds, applied per tool call.
    #[serde(default = "default_call_timeout")]
    pub call_timeout: u64,

    /// Rendered with `{gateway_name}`/`{stage_name}` when an OpenAPI
    /// document declares no server URL.
    #[serde(default)]
    pub server_url_template: Option<String>,

    /// Inbound header names copied onto backend requests.
    #[serde(default)]
    pub passthrough_headers: Vec<String>,

    /// SSE keep-alive interval in seconds.
    #[serde(default = "default_sse_keep_alive")]
    pub sse_keep_alive: u64,

    #[serde(default)]
    pub outbound: OutboundTlsConfig,

    /// YAML file backing the collaborator store.
    pub store_file: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct OutboundTlsConfig {
    /// Accept invalid backend certificates. Off by default; turning it on
    /// is logged loudly at startup.
    #[serde(default)]
    pub danger_accept_invalid_certs: bool,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_reconcile_interval() -> u64 {
    30
}

fn default_inner_jwt_expire() -> u64 {
    300
}

fn default_call_timeout() -> u64 {
    300
}

fn default_sse_keep_alive() -> u64 {
    15
}

impl GatewayConfig {
    /// Load configuration from a YAML file.
    pub async fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let config: Self = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Normalized lowercase pass-through header names.
    pub fn normalized_passthrough_headers(&self) -> Vec<String> {
        self.passthrough_headers
            .iter()
            .map(|name| name.to_ascii_lowercase())
            .collect()
    }
}
