//! The proxy registry: a concurrency-safe map of name -> tool server.
//!
//! Two maps (server-by-name, started-name-set) live behind one
//! reader-writer lock. The lock is only held to look up or mutate map
//! membership; server lifecycle calls happen after it is released, so the
//! registry lock never nests with a per-server lock.

use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use axum::{extract::Request, http::StatusCode, response::Response};
use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::{error::error_response, server::ToolServer};

#[derive(Default)]
struct ProxyState {
    servers: HashMap<String, Arc<ToolServer>>,
    started: HashSet<String>,
}

#[derive(Default)]
pub struct McpProxy {
    inner: RwLock<ProxyState>,
}

impl McpProxy {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a server, overwriting any entry with the same name. A
    /// displaced entry is shut down and will be started again by the next
    /// [`McpProxy::run`].
    pub fn add_server(&self, server: Arc<ToolServer>) {
        let name = server.name().to_string();
        let displaced = {
            let mut state = self.inner.write();
            state.started.remove(&name);
            state.servers.insert(name.clone(), server)
        };
        if let Some(old) = displaced {
            debug!(server = %name, "replacing registered server");
            old.shutdown();
        }
        info!(server = %name, "registered mcp server");
    }

    pub fn get_server(&self, name: &str) -> Option<Arc<ToolServer>> {
        self.inner.read().servers.get(name).cloned()
    }

    pub fn exists(&self, name: &str) -> bool {
        self.inner.read().servers.contains_key(name)
    }

    /// Remove a server and shut its transport down. No-op when absent.
    pub fn delete_server(&self, name: &str) {
        let removed = {
            let mut state = self.inner.write();
            state.started.remove(name);
            state.servers.remove(name)
        };
        if let Some(server) = removed {
            info!(server = %name, "deleting mcp server");
            server.shutdown();
        }
    }

    /// Names of every registered server.
    pub fn active_names(&self) -> Vec<String> {
        self.inner.read().servers.keys().cloned().collect()
    }

    /// Start the protocol loop of every server not already started, exactly
    /// once per server per process lifetime.
    pub fn run(&self) {
        let to_start: Vec<Arc<ToolServer>> = {
            let mut state = self.inner.write();
            let pending: Vec<String> = state
                .servers
                .keys()
                .filter(|name| !state.started.contains(*name))
                .cloned()
                .collect();
            pending
                .into_iter()
                .filter_map(|name| {
                    let server = state.servers.get(&name).cloned();
                    state.started.insert(name);
                    server
                })
                .collect()
        };
        for server in to_start {
            debug!(server = %server.name(), "starting mcp server transport");
            server.start();
        }
    }

    /// Forward `request` to the named server, or answer 400 directly. An
    /// unknown name never touches backend state.
    pub async fn dispatch(&self, name: &str, request: Request) -> Response {
        match self.get_server(name) {
            Some(server) => server.serve(request).await,
            None => {
                warn!(server = %name, "dispatch to unknown mcp server");
                error_response(
                    StatusCode::BAD_REQUEST,
                    "server_not_found",
                    &format!("mcp server {} does not exist", name),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use axum::body::Body;

    use super::*;
    use crate::{
        server::ServerTransport,
        tool::{PromptConfig, ServerIdentity, ToolConfig},
    };

    #[derive(Default)]
    struct CountingTransport {
        starts: AtomicUsize,
        shutdowns: AtomicUsize,
    }

    #[async_trait]
    impl ServerTransport for CountingTransport {
        fn register_tool(&self, _tool: ToolConfig) {}
        fn unregister_tool(&self, _name: &str) {}
        fn register_prompt(&self, _prompt: PromptConfig) {}
        fn unregister_prompt(&self, _name: &str) {}

        async fn serve(&self, _request: Request) -> Response {
            Response::new(Body::from("served"))
        }

        fn start(&self) {
            self.starts.fetch_add(1, Ordering::SeqCst);
        }

        fn shutdown(&self) {
            self.shutdowns.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn server(name: &str) -> (Arc<ToolServer>, Arc<CountingTransport>) {
        let transport = Arc::new(CountingTransport::default());
        let server = Arc::new(ToolServer::new(
            ServerIdentity {
                id: 1,
                name: name.to_string(),
            },
            1,
            transport.clone(),
        ));
        (server, transport)
    }

    #[test]
    fn test_add_get_exists_delete() {
        let proxy = McpProxy::new();
        let (s1, t1) = server("s1");

        assert!(!proxy.exists("s1"));
        proxy.add_server(s1);
        assert!(proxy.exists("s1"));
        assert!(proxy.get_server("s1").is_some());
        assert_eq!(proxy.active_names(), vec!["s1".to_string()]);

        proxy.delete_server("s1");
        assert!(!proxy.exists("s1"));
        assert_eq!(t1.shutdowns.load(Ordering::SeqCst), 1);

        // Deleting an absent server is a no-op.
        proxy.delete_server("s1");
        assert_eq!(t1.shutdowns.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_overwrite_shuts_down_displaced_server() {
        let proxy = McpProxy::new();
        let (old, old_transport) = server("s1");
        let (new, _new_transport) = server("s1");

        proxy.add_server(old);
        proxy.run();
        proxy.add_server(new);

        assert_eq!(old_transport.shutdowns.load(Ordering::SeqCst), 1);
        // The replacement has not started yet; the next run() starts it.
        proxy.run();
        let replacement = proxy.get_server("s1").unwrap();
        assert_eq!(replacement.name(), "s1");
    }

    #[test]
    fn test_run_starts_each_server_once() {
        let proxy = McpProxy::new();
        let (s1, t1) = server("s1");
        let (s2, t2) = server("s2");

        proxy.add_server(s1);
        proxy.run();
        proxy.add_server(s2);
        proxy.run();
        proxy.run();

        assert_eq!(t1.starts.load(Ordering::SeqCst), 1);
        assert_eq!(t2.starts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_dispatch_unknown_server_is_400() {
        let proxy = McpProxy::new();
        let request = Request::builder()
            .uri("/ghost/mcp")
            .body(Body::empty())
            .unwrap();

        let response = proxy.dispatch("ghost", request).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_dispatch_forwards_to_transport() {
        let proxy = McpProxy::new();
        let (s1, _t1) = server("s1");
        proxy.add_server(s1);

        let request = Request::builder()
            .uri("/s1/mcp")
            .body(Body::empty())
            .unwrap();
        let response = proxy.dispatch("s1", request).await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[test]
    fn test_concurrent_add_get_delete() {
        let proxy = Arc::new(McpProxy::new());

        std::thread::scope(|scope| {
            for worker in 0..8 {
                let proxy = Arc::clone(&proxy);
                scope.spawn(move || {
                    for round in 0..200 {
                        let name = format!("s{}", (worker + round) % 5);
                        let (entry, _) = server(&name);
                        proxy.add_server(entry);
                        let _ = proxy.get_server(&name);
                        let _ = proxy.exists(&name);
                        if round % 3 == 0 {
                            proxy.delete_server(&name);
                        }
                        proxy.run();
                    }
                });
            }
        });

        // Consistent final state: every remaining name resolves.
        for name in proxy.active_names() {
            assert!(proxy.get_server(&name).is_some());
        }
    }
}
