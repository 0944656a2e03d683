//! Collaborator interfaces consumed by the gateway core.
//!
//! The relational storage layer and its caching decorators live behind
//! [`ConfigStore`]; the core tolerates eventually-consistent reads and
//! never sees where the data comes from. [`MemoryStore`] backs tests and
//! file-driven local runs.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateway_auth::JwtKeyPair;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use thiserror::Error;

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("backend error: {0}")]
    Backend(String),

    #[error("decode error: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
    #[default]
    Active,
    Inactive,
}

/// One backend-declared MCP server definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActiveServer {
    pub id: i64,
    pub name: String,
    pub gateway_id: i64,
    pub stage_id: i64,
    #[serde(default)]
    pub status: ServerStatus,
    /// Operation ids this server exposes as tools.
    #[serde(default)]
    pub resource_names: Vec<String>,
    /// Optional operationId -> exposed tool name overrides.
    #[serde(default)]
    pub tool_name_overrides: HashMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Release {
    pub resource_version_id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayRecord {
    pub id: i64,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageRecord {
    pub id: i64,
    pub name: String,
}

/// App permission for one proxied server. `expires_at == None` never
/// expires.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Permission {
    pub expires_at: Option<DateTime<Utc>>,
}

impl Permission {
    pub fn is_expired(&self) -> bool {
        self.expires_at.map(|t| t <= Utc::now()).unwrap_or(false)
    }
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn list_active_servers(&self) -> StoreResult<Vec<ActiveServer>>;
    async fn get_release(&self, gateway_id: i64, stage_id: i64) -> StoreResult<Release>;
    async fn get_openapi_spec(
        &self,
        gateway_id: i64,
        resource_version_id: i64,
    ) -> StoreResult<String>;
    async fn get_gateway(&self, gateway_id: i64) -> StoreResult<GatewayRecord>;
    async fn get_stage(&self, stage_id: i64) -> StoreResult<StageRecord>;
    async fn jwt_keys_by_gateway_name(&self, name: &str) -> StoreResult<JwtKeyPair>;
    async fn get_permission(
        &self,
        app_code: &str,
        server_id: i64,
    ) -> StoreResult<Option<Permission>>;
    /// Raw prompt-extension content for a server, a JSON list of prompts.
    async fn get_prompt_extension(&self, server_id: i64) -> StoreResult<Option<String>>;
}

#[derive(Default)]
struct MemoryState {
    servers: Vec<ActiveServer>,
    releases: HashMap<(i64, i64), i64>,
    specs: HashMap<(i64, i64), String>,
    gateways: HashMap<i64, String>,
    stages: HashMap<i64, String>,
    jwt_keys: HashMap<String, JwtKeyPair>,
    permissions: HashMap<(String, i64), Permission>,
    prompt_extensions: HashMap<i64, String>,
}

/// In-memory [`ConfigStore`], mutable between reconciliation cycles.
///
/// Lookup counters make caching-sensitive properties observable in tests
/// (e.g. "no OpenAPI re-fetch when the resource version is unchanged").
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<MemoryState>,
    openapi_fetches: AtomicUsize,
    key_lookups: AtomicUsize,
    permission_lookups: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load from a YAML file in [`StaticStoreFile`] form.
    pub async fn from_file(path: &str) -> StoreResult<Self> {
        let content = tokio::fs::read_to_string(path).await?;
        let file: StaticStoreFile =
            serde_yaml::from_str(&content).map_err(|e| StoreError::Decode(e.to_string()))?;
        Ok(file.into_store())
    }

    pub fn set_active_servers(&self, servers: Vec<ActiveServer>) {
        self.state.write().servers = servers;
    }

    pub fn set_release(&self, gateway_id: i64, stage_id: i64, resource_version_id: i64) {
        self.state
            .write()
            .releases
            .insert((gateway_id, stage_id), resource_version_id);
    }

    pub fn remove_release(&self, gateway_id: i64, stage_id: i64) {
        self.state.write().releases.remove(&(gateway_id, stage_id));
    }

    pub fn set_openapi_spec(&self, gateway_id: i64, resource_version_id: i64, schema: String) {
        self.state
            .write()
            .specs
            .insert((gateway_id, resource_version_id), schema);
    }

    pub fn set_gateway(&self, id: i64, name: &str) {
        self.state.write().gateways.insert(id, name.to_string());
    }

    pub fn set_stage(&self, id: i64, name: &str) {
        self.state.write().stages.insert(id, name.to_string());
    }

    pub fn set_jwt_keys(&self, gateway_name: &str, keys: JwtKeyPair) {
        self.state
            .write()
            .jwt_keys
            .insert(gateway_name.to_string(), keys);
    }

    pub fn set_permission(&self, app_code: &str, server_id: i64, permission: Permission) {
        self.state
            .write()
            .permissions
            .insert((app_code.to_string(), server_id), permission);
    }

    pub fn set_prompt_extension(&self, server_id: i64, content: String) {
        self.state
            .write()
            .prompt_extensions
            .insert(server_id, content);
    }

    pub fn openapi_fetches(&self) -> usize {
        self.openapi_fetches.load(Ordering::SeqCst)
    }

    pub fn key_lookups(&self) -> usize {
        self.key_lookups.load(Ordering::SeqCst)
    }

    pub fn permission_lookups(&self) -> usize {
        self.permission_lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn list_active_servers(&self) -> StoreResult<Vec<ActiveServer>> {
        Ok(self.state.read().servers.clone())
    }

    async fn get_release(&self, gateway_id: i64, stage_id: i64) -> StoreResult<Release> {
        self.state
            .read()
            .releases
            .get(&(gateway_id, stage_id))
            .map(|&resource_version_id| Release {
                resource_version_id,
            })
            .ok_or_else(|| {
                StoreError::NotFound(format!("release for gateway {} stage {}", gateway_id, stage_id))
            })
    }

    async fn get_openapi_spec(
        &self,
        gateway_id: i64,
        resource_version_id: i64,
    ) -> StoreResult<String> {
        self.openapi_fetches.fetch_add(1, Ordering::SeqCst);
        self.state
            .read()
            .specs
            .get(&(gateway_id, resource_version_id))
            .cloned()
            .ok_or_else(|| {
                StoreError::NotFound(format!(
                    "openapi spec for gateway {} version {}",
                    gateway_id, resource_version_id
                ))
            })
    }

    async fn get_gateway(&self, gateway_id: i64) -> StoreResult<GatewayRecord> {
        self.state
            .read()
            .gateways
            .get(&gateway_id)
            .map(|name| GatewayRecord {
                id: gateway_id,
                name: name.clone(),
            })
            .ok_or_else(|| StoreError::NotFound(format!("gateway {}", gateway_id)))
    }

    async fn get_stage(&self, stage_id: i64) -> StoreResult<StageRecord> {
        self.state
            .read()
            .stages
            .get(&stage_id)
            .map(|name| StageRecord {
                id: stage_id,
                name: name.clone(),
            })
            .ok_or_else(|| StoreError::NotFound(format!("stage {}", stage_id)))
    }

    async fn jwt_keys_by_gateway_name(&self, name: &str) -> StoreResult<JwtKeyPair> {
        self.key_lookups.fetch_add(1, Ordering::SeqCst);
        self.state
            .read()
            .jwt_keys
            .get(name)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("jwt keys for gateway {}", name)))
    }

    async fn get_permission(
        &self,
        app_code: &str,
        server_id: i64,
    ) -> StoreResult<Option<Permission>> {
        self.permission_lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .state
            .read()
            .permissions
            .get(&(app_code.to_string(), server_id))
            .cloned())
    }

    async fn get_prompt_extension(&self, server_id: i64) -> StoreResult<Option<String>> {
        Ok(self
            .state
            .read()
            .prompt_extensions
            .get(&server_id)
            .cloned())
    }
}

/// Serde form of a file-backed store for local runs.
#[derive(Debug, Default, Deserialize)]
pub struct StaticStoreFile {
    #[serde(default)]
    pub servers: Vec<ActiveServer>,
    #[serde(default)]
    pub releases: Vec<ReleaseEntry>,
    #[serde(default)]
    pub specs: Vec<SpecEntry>,
    #[serde(default)]
    pub gateways: Vec<GatewayRecord>,
    #[serde(default)]
    pub stages: Vec<StageRecord>,
    #[serde(default)]
    pub jwt_keys: Vec<JwtKeyEntry>,
    #[serde(default)]
    pub permissions: Vec<PermissionEntry>,
    #[serde(default)]
    pub prompt_extensions: Vec<PromptExtensionEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ReleaseEntry {
    pub gateway_id: i64,
    pub stage_id: i64,
    pub resource_version_id: i64,
}

#[derive(Debug, Deserialize)]
pub struct SpecEntry {
    pub gateway_id: i64,
    pub resource_version_id: i64,
    pub schema: String,
}

#[derive(Debug, Deserialize)]
pub struct JwtKeyEntry {
    pub gateway_name: String,
    pub public_key: String,
    #[serde(default)]
    pub private_key: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct PermissionEntry {
    pub app_code: String,
    pub server_id: i64,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Deserialize)]
pub struct PromptExtensionEntry {
    pub server_id: i64,
    pub content: String,
}

impl StaticStoreFile {
    fn into_store(self) -> MemoryStore {
        let store = MemoryStore::new();
        store.set_active_servers(self.servers);
        for release in self.releases {
            store.set_release(
                release.gateway_id,
                release.stage_id,
                release.resource_version_id,
            );
        }
        for spec in self.specs {
            store.set_openapi_spec(spec.gateway_id, spec.resource_version_id, spec.schema);
        }
        for gateway in self.gateways {
            store.set_gateway(gateway.id, &gateway.name);
        }
        for stage in self.stages {
            store.set_stage(stage.id, &stage.name);
        }
        for entry in self.jwt_keys {
            store.set_jwt_keys(
                &entry.gateway_name,
                JwtKeyPair {
                    public_key: entry.public_key,
                    private_key: entry.private_key,
                },
            );
        }
        for entry in self.permissions {
            store.set_permission(
                &entry.app_code,
                entry.server_id,
                Permission {
                    expires_at: entry.expires_at,
                },
            );
        }
        for entry in self.prompt_extensions {
            store.set_prompt_extension(entry.server_id, entry.content);
        }
        store
    }
}
