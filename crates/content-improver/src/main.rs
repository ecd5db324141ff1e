mod backup;
mod config;
mod content;
mod error;
mod field_path;
mod improvements;
mod model;
mod parser;
mod prompts;
mod server;
mod state;
mod workflow;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpService,
};
use rmcp::{ServiceExt, transport::stdio};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use improver_common::assistant::{AssistantClient, AssistantTransport};
use improver_common::redis::RedisCache;
use improver_common::run::TokioSleeper;

use config::Config;
use server::ContentImproverServer;
use workflow::Workflow;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    info!("starting content-improver MCP server");

    let config = Config::from_env();
    let missing = config.missing_settings();
    if !missing.is_empty() {
        warn!(
            missing = %missing.join(", "),
            "content workflow not fully configured, tools will report not_available"
        );
    }
    info!(
        base_url = %config.assistant.base_url,
        data_dir = %config.data_dir.display(),
        workflow_id = %config.workflow_id,
        poll_interval_ms = config.poll_interval.as_millis(),
        max_poll_attempts = config.max_poll_attempts,
        "assistant client configured"
    );
    let transport: Arc<dyn AssistantTransport> =
        Arc::new(AssistantClient::new(config.assistant.clone())?);

    let redis_cache = RedisCache::new(config.redis_url.as_deref());
    if redis_cache.is_available().await {
        info!("redis connected");
    } else {
        info!("redis unavailable, workflow state kept on disk only");
    }

    let http_bind = config.http_bind.clone();
    let workflow = Arc::new(Workflow::new(
        config,
        transport,
        Arc::new(TokioSleeper),
        redis_cache,
    ));
    let server = ContentImproverServer::new(workflow);

    match http_bind {
        Some(bind) => serve_http(server, &bind).await,
        None => {
            info!("MCP server ready, serving on stdio");
            let service = server.serve(stdio()).await.inspect_err(|e| {
                tracing::error!(error = %e, "MCP server error");
            })?;

            service.waiting().await?;
            info!("MCP server shut down");
            Ok(())
        }
    }
}

async fn serve_http(server: ContentImproverServer, bind: &str) -> anyhow::Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid HTTP_BIND address {bind}"))?;

    let service = StreamableHttpService::new(
        move || Ok(server.clone()),
        LocalSessionManager::default().into(),
        Default::default(),
    );
    let app = axum::Router::new().nest_service("/mcp", service);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!(%addr, "MCP server ready, serving streamable HTTP on /mcp");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await
        .context("server shutdown")?;
    info!("MCP server shut down");
    Ok(())
}
