//! Process-level plumbing for the MCP gateway binary.
//!
//! The core lives in the `gateway-mcp` and `gateway-auth` crates; this
//! crate wires them to configuration, the collaborator store, the
//! reconciliation worker, and the axum ingress.

pub mod config;
pub mod http;
pub mod reconcile;
pub mod storage;

pub use config::GatewayConfig;
pub use http::AppContext;
pub use reconcile::Reconciler;
pub use storage::{ConfigStore, MemoryStore};
