//! The reconciliation loop.
//!
//! One background worker keeps the proxy registry consistent with the
//! backend-declared server set on a fixed-interval timer. All registry
//! mutation is serialized on this worker; inbound requests only read.
//! Failures are isolated per server definition and never abort a cycle.

use std::{
    collections::HashSet,
    sync::Arc,
    time::Duration,
};

use gateway_mcp::{
    convert::{convert, OpenApiDocument, ServerObject},
    McpError, McpProxy, PromptConfig, ServerIdentity, ToolConfig, ToolServer, TransportFactory,
};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::storage::{ActiveServer, ConfigStore, ServerStatus, StoreError};

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] McpError),
}

pub struct Reconciler {
    store: Arc<dyn ConfigStore>,
    proxy: Arc<McpProxy>,
    transports: Arc<dyn TransportFactory>,
    /// Rendered into a server URL when an OpenAPI document declares none.
    server_url_template: Option<String>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        store: Arc<dyn ConfigStore>,
        proxy: Arc<McpProxy>,
        transports: Arc<dyn TransportFactory>,
        server_url_template: Option<String>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            proxy,
            transports,
            server_url_template,
            interval,
        }
    }

    /// Run until `shutdown` is cancelled. The first cycle runs immediately.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval = ?self.interval, "reconciliation loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("reconciliation loop stopping");
                    break;
                }
                _ = ticker.tick() => {
                    self.reconcile_once().await;
                }
            }
        }
    }

    /// One full cycle: add/update/prune per declared definition, then
    /// remove stale registry entries, then start new transports.
    pub async fn reconcile_once(&self) {
        let definitions = match self.store.list_active_servers().await {
            Ok(definitions) => definitions,
            Err(err) => {
                warn!(error = %err, "listing active servers failed, skipping cycle");
                return;
            }
        };

        let mut seen = HashSet::new();
        for definition in definitions
            .iter()
            .filter(|d| d.status == ServerStatus::Active)
        {
            seen.insert(definition.name.clone());
            if let Err(err) = self.reconcile_server(definition).await {
                warn!(
                    server = %definition.name,
                    error = %err,
                    "reconciling server failed, leaving its state untouched this cycle"
                );
            }
        }

        // A server can never be updated and deleted in the same pass:
        // stale removal only runs after every declared name was processed.
        for name in self.proxy.active_names() {
            if !seen.contains(&name) {
                info!(server = %name, "removing server no longer declared active");
                self.proxy.delete_server(&name);
            }
        }

        self.proxy.run();
    }

    async fn reconcile_server(&self, definition: &ActiveServer) -> Result<(), ReconcileError> {
        let release = self
            .store
            .get_release(definition.gateway_id, definition.stage_id)
            .await?;
        let version = release.resource_version_id;
        let declared: HashSet<String> = definition.resource_names.iter().cloned().collect();

        match self.proxy.get_server(&definition.name) {
            None => {
                let tools = self.load_tools(definition, version).await?;
                let identity = ServerIdentity {
                    id: definition.id,
                    name: definition.name.clone(),
                };
                let server = Arc::new(ToolServer::new(
                    identity.clone(),
                    version,
                    self.transports.build(&identity),
                ));
                server.replace_tools(tools);
                self.apply_prompts(&server, definition).await;
                self.proxy.add_server(server);
            }
            Some(server) => {
                if server.resource_version() != version {
                    debug!(
                        server = %definition.name,
                        from = server.resource_version(),
                        to = version,
                        "resource version changed, reconverting"
                    );
                    let tools = self.load_tools(definition, version).await?;
                    server.set_resource_version(version);
                    server.replace_tools(tools);
                }
                // Unconditional: pruning is independent of version changes.
                server.prune_tools(&declared);
                self.apply_prompts(&server, definition).await;
            }
        }
        Ok(())
    }

    async fn load_tools(
        &self,
        definition: &ActiveServer,
        version: i64,
    ) -> Result<Vec<ToolConfig>, ReconcileError> {
        let text = self
            .store
            .get_openapi_spec(definition.gateway_id, version)
            .await?;
        let mut document = OpenApiDocument::parse(&text)?;

        if document.servers.is_empty() {
            if let Some(template) = &self.server_url_template {
                let gateway = self.store.get_gateway(definition.gateway_id).await?;
                let stage = self.store.get_stage(definition.stage_id).await?;
                let url = template
                    .replace("{gateway_name}", &gateway.name)
                    .replace("{stage_name}", &stage.name);
                document.servers.push(ServerObject { url });
            }
        }

        let allowed: HashSet<String> = definition.resource_names.iter().cloned().collect();
        Ok(convert(&document, &allowed, &definition.tool_name_overrides))
    }

    /// Prompt sync is best-effort per cycle; a bad extension never blocks
    /// tool reconciliation for its server.
    async fn apply_prompts(&self, server: &ToolServer, definition: &ActiveServer) {
        match self.store.get_prompt_extension(definition.id).await {
            Ok(Some(content)) => match serde_json::from_str::<Vec<PromptConfig>>(&content) {
                Ok(prompts) => server.update_prompts(prompts),
                Err(err) => {
                    warn!(server = %definition.name, error = %err, "invalid prompt extension content");
                }
            },
            Ok(None) => server.update_prompts(Vec::new()),
            Err(err) => {
                warn!(server = %definition.name, error = %err, "prompt extension lookup failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::{body::Body, extract::Request, response::Response};
    use gateway_mcp::ServerTransport;
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::storage::MemoryStore;

    #[derive(Default)]
    struct NullTransport {
        starts: AtomicUsize,
        shutdowns: AtomicUsize,
        prompts: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ServerTransport for NullTransport {
        fn register_tool(&self, _tool: ToolConfig) {}
        fn unregister_tool(&self, _name: &str) {}

        fn register_prompt(&self, prompt: PromptConfig) {
            self.prompts.lock().push(prompt.name);
        }

        fn unregister_prompt(&self, _name: &str) {}

        async fn serve(&self, _request: Request) -> Response {
            Response::new(Body::empty())
        }

        fn start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct NullTransportFactory {
        built: Mutex<Vec<Arc<NullTransport>>>,
    }

    impl TransportFactory for NullTransportFactory {
        fn build(&self, _identity: &ServerIdentity) -> Arc<dyn ServerTransport> {
            let transport = Arc::new(NullTransport::default());
            self.built.lock().push(transport.clone());
            transport
        }
    }

    fn spec_with(ops: &[&str]) -> String {
        let mut paths = serde_json::Map::new();
        for op in ops {
            paths.insert(
                format!("/{}", op),
                json!({"get": {"operationId": op, "responses": {"200": {}}}}),
            );
        }
        json!({
            "openapi": "3.0.0",
            "servers": [{"url": "http://backend.local/api"}],
            "paths": paths,
        })
        .to_string()
    }

    fn definition(name: &str, resources: &[&str]) -> ActiveServer {
        ActiveServer {
            id: 1,
            name: name.to_string(),
            gateway_id: 10,
            stage_id: 20,
            status: ServerStatus::Active,
            resource_names: resources.iter().map(|s| s.to_string()).collect(),
            tool_name_overrides: Default::default(),
        }
    }

    fn reconciler(store: Arc<MemoryStore>) -> (Reconciler, Arc<McpProxy>, Arc<NullTransportFactory>) {
        let proxy = Arc::new(McpProxy::new());
        let factory = Arc::new(NullTransportFactory::default());
        let reconciler = Reconciler::new(
            store,
            proxy.clone(),
            factory.clone(),
            None,
            Duration::from_secs(30),
        );
        (reconciler, proxy, factory)
    }

    #[tokio::test]
    async fn test_new_server_is_registered_and_started() {
        let store = Arc::new(MemoryStore::new());
        store.set_active_servers(vec![definition("s1", &["getUsers"])]);
        store.set_release(10, 20, 1);
        store.set_openapi_spec(10, 1, spec_with(&["getUsers"]));
        let (reconciler, proxy, factory) = reconciler(store);

        reconciler.reconcile_once().await;

        let server = proxy.get_server("s1").expect("registered");
        assert_eq!(server.resource_version(), 1);
        assert_eq!(
            server.tool_names(),
            HashSet::from(["getUsers".to_string()])
        );
        assert_eq!(factory.built.lock()[0].starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_version_bump_reloads_tool_set() {
        let store = Arc::new(MemoryStore::new());
        store.set_active_servers(vec![definition("s1", &["getUsers"])]);
        store.set_release(10, 20, 1);
        store.set_openapi_spec(10, 1, spec_with(&["getUsers"]));
        let (reconciler, proxy, _factory) = reconciler(store.clone());

        reconciler.reconcile_once().await;

        // Next cycle reports version 2 with an added operation.
        store.set_active_servers(vec![definition("s1", &["getUsers", "createUser"])]);
        store.set_release(10, 20, 2);
        store.set_openapi_spec(10, 2, spec_with(&["getUsers", "createUser"]));
        reconciler.reconcile_once().await;

        let server = proxy.get_server("s1").unwrap();
        assert_eq!(server.resource_version(), 2);
        assert_eq!(
            server.tool_names(),
            HashSet::from(["getUsers".to_string(), "createUser".to_string()])
        );
    }

    #[tokio::test]
    async fn test_unchanged_version_skips_refetch() {
        let store = Arc::new(MemoryStore::new());
        store.set_active_servers(vec![definition("s1", &["getUsers"])]);
        store.set_release(10, 20, 1);
        store.set_openapi_spec(10, 1, spec_with(&["getUsers"]));
        let (reconciler, proxy, _factory) = reconciler(store.clone());

        reconciler.reconcile_once().await;
        assert_eq!(store.openapi_fetches(), 1);

        reconciler.reconcile_once().await;
        reconciler.reconcile_once().await;

        // Idempotent: no re-fetch, no state change.
        assert_eq!(store.openapi_fetches(), 1);
        let server = proxy.get_server("s1").unwrap();
        assert_eq!(server.resource_version(), 1);
        assert_eq!(server.tool_names(), HashSet::from(["getUsers".to_string()]));
    }

    #[tokio::test]
    async fn test_undeclared_tool_pruned_without_version_bump() {
        let store = Arc::new(MemoryStore::new());
        store.set_active_servers(vec![definition("s1", &["getUsers", "createUser"])]);
        store.set_release(10, 20, 1);
        store.set_openapi_spec(10, 1, spec_with(&["getUsers", "createUser"]));
        let (reconciler, proxy, _factory) = reconciler(store.clone());

        reconciler.reconcile_once().await;

        // Same version, shrunken declared resource list.
        store.set_active_servers(vec![definition("s1", &["getUsers"])]);
        reconciler.reconcile_once().await;

        let server = proxy.get_server("s1").unwrap();
        assert_eq!(server.resource_version(), 1);
        assert_eq!(server.tool_names(), HashSet::from(["getUsers".to_string()]));
        // Pruning never re-fetched the document.
        assert_eq!(store.openapi_fetches(), 1);
    }

    #[tokio::test]
    async fn test_stale_server_deleted_and_shut_down_once() {
        let store = Arc::new(MemoryStore::new());
        store.set_active_servers(vec![definition("s1", &["getUsers"])]);
        store.set_release(10, 20, 1);
        store.set_openapi_spec(10, 1, spec_with(&["getUsers"]));
        let (reconciler, proxy, factory) = reconciler(store.clone());

        reconciler.reconcile_once().await;
        assert!(proxy.exists("s1"));

        store.set_active_servers(vec![]);
        reconciler.reconcile_once().await;
        reconciler.reconcile_once().await;

        assert!(!proxy.exists("s1"));
        assert_eq!(factory.built.lock()[0].shutdowns.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_release_lookup_skips_definition_only() {
        let store = Arc::new(MemoryStore::new());
        let mut broken = definition("broken", &["x"]);
        broken.gateway_id = 99;
        broken.stage_id = 99;
        store.set_active_servers(vec![broken, definition("s1", &["getUsers"])]);
        store.set_release(10, 20, 1);
        store.set_openapi_spec(10, 1, spec_with(&["getUsers"]));
        let (reconciler, proxy, _factory) = reconciler(store);

        reconciler.reconcile_once().await;

        // The healthy definition still converged; the broken one left no
        // partial state behind.
        assert!(proxy.exists("s1"));
        assert!(!proxy.exists("broken"));
    }

    #[tokio::test]
    async fn test_inactive_definitions_are_treated_as_undeclared() {
        let store = Arc::new(MemoryStore::new());
        store.set_active_servers(vec![definition("s1", &["getUsers"])]);
        store.set_release(10, 20, 1);
        store.set_openapi_spec(10, 1, spec_with(&["getUsers"]));
        let (reconciler, proxy, _factory) = reconciler(store.clone());

        reconciler.reconcile_once().await;
        assert!(proxy.exists("s1"));

        let mut inactive = definition("s1", &["getUsers"]);
        inactive.status = ServerStatus::Inactive;
        store.set_active_servers(vec![inactive]);
        reconciler.reconcile_once().await;

        assert!(!proxy.exists("s1"));
    }

    #[tokio::test]
    async fn test_prompt_extension_synced_per_cycle() {
        let store = Arc::new(MemoryStore::new());
        store.set_active_servers(vec![definition("s1", &["getUsers"])]);
        store.set_release(10, 20, 1);
        store.set_openapi_spec(10, 1, spec_with(&["getUsers"]));
        store.set_prompt_extension(
            1,
            json!([{"name": "intro", "description": "", "content": "hello"}]).to_string(),
        );
        let (reconciler, proxy, _factory) = reconciler(store.clone());

        reconciler.reconcile_once().await;
        let server = proxy.get_server("s1").unwrap();
        assert_eq!(server.prompt_names(), HashSet::from(["intro".to_string()]));

        store.set_prompt_extension(1, json!([]).to_string());
        reconciler.reconcile_once().await;
        assert!(proxy.get_server("s1").unwrap().prompt_names().is_empty());
    }

    #[tokio::test]
    async fn test_server_url_template_fills_missing_servers() {
        let store = Arc::new(MemoryStore::new());
        store.set_active_servers(vec![definition("s1", &["getUsers"])]);
        store.set_release(10, 20, 1);
        store.set_openapi_spec(
            10,
            1,
            json!({
                "openapi": "3.0.0",
                "paths": {"/users": {"get": {"operationId": "getUsers"}}}
            })
            .to_string(),
        );
        store.set_gateway(10, "demo-gw");
        store.set_stage(20, "prod");

        let proxy = Arc::new(McpProxy::new());
        let factory = Arc::new(NullTransportFactory::default());
        let reconciler = Reconciler::new(
            store,
            proxy.clone(),
            factory,
            Some("http://apigw.internal/api/{gateway_name}/{stage_name}".to_string()),
            Duration::from_secs(30),
        );

        reconciler.reconcile_once().await;

        let server = proxy.get_server("s1").unwrap();
        assert_eq!(server.tool_names(), HashSet::from(["getUsers".to_string()]));
    }
}
