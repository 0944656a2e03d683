use std::{sync::Arc, time::Duration};

use anyhow::Context;
use clap::Parser;
use gateway_mcp::{CallAuditLog, McpProxy, McpTransportFactory, OutboundConfig, ToolInvoker};
use mcpgw::{config::GatewayConfig, http, reconcile::Reconciler, storage::MemoryStore};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "mcp-gateway", about = "Expose OpenAPI backends as MCP tool servers")]
struct Cli {
    /// Path to the gateway configuration file.
    #[arg(long, env = "MCP_GATEWAY_CONFIG", default_value = "config.yaml")]
    config: String,

    /// Override the configured listen address.
    #[arg(long)]
    listen: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = GatewayConfig::from_file(&cli.config)
        .await
        .with_context(|| format!("loading config from {}", cli.config))?;
    let listen = cli.listen.unwrap_or_else(|| config.listen.clone());

    let store = Arc::new(
        MemoryStore::from_file(&config.store_file)
            .await
            .with_context(|| format!("loading store from {}", config.store_file))?,
    );

    let shutdown = CancellationToken::new();
    let audit = Arc::new(CallAuditLog::new());
    let invoker = Arc::new(ToolInvoker::new(
        OutboundConfig {
            inner_jwt_ttl: Duration::from_secs(config.inner_jwt_expire),
            danger_accept_invalid_certs: config.outbound.danger_accept_invalid_certs,
            ..OutboundConfig::default()
        },
        audit,
    )?);

    let proxy = Arc::new(McpProxy::new());
    let transports = Arc::new(McpTransportFactory::new(
        invoker,
        Duration::from_secs(config.sse_keep_alive),
        shutdown.clone(),
    ));

    let reconciler = Reconciler::new(
        store.clone(),
        proxy.clone(),
        transports,
        config.server_url_template.clone(),
        Duration::from_secs(config.reconcile_interval),
    );
    tokio::spawn(reconciler.run(shutdown.clone()));

    let context = Arc::new(http::AppContext {
        proxy,
        store,
        gateway_name: config.gateway_name.clone(),
        call_timeout: Duration::from_secs(config.call_timeout),
        passthrough_headers: config.normalized_passthrough_headers(),
    });
    let app = http::router(context);

    let listener = tokio::net::TcpListener::bind(&listen)
        .await
        .with_context(|| format!("binding {}", listen))?;
    info!(listen = %listen, gateway = %config.gateway_name, "mcp gateway listening");

    let signal_ct = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            signal_ct.cancel();
        }
    });

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}
