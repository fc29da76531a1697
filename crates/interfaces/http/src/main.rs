use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use drift_config::{AppConfig, GatewayConfig, ModelRoleConfig};
use drift_gateway::{CompletionOptions, GatewayRole, HttpGateway, ModelGateway, RoleEndpoint, StubGateway};
use drift_http::build_router;
use drift_memory::EmbeddingCache;
use drift_reviewer::Reviewer;
use drift_runtime::{SharedContext, Supervisor};

/// Binds the Control API (§6) to a socket. The router itself lives in the
/// library crate so it can be exercised in-process by tests; this binary
/// only wires configuration and serves it.
#[derive(Debug, Parser)]
#[command(name = "drift-http", version, about = "Control API server for the reward-drift experiment engine")]
struct Cli {
    #[arg(long, default_value = "config/default.toml")]
    config: PathBuf,
    #[arg(long, default_value = "0.0.0.0:8080")]
    listen: String,
    /// Use the deterministic in-memory stub gateway instead of the
    /// configured HTTP model endpoint. Useful for demos and CI.
    #[arg(long)]
    stub: bool,
}

fn role_endpoint(role: &ModelRoleConfig) -> RoleEndpoint {
    RoleEndpoint { base_url: role.base_url.clone(), api_key: role.api_key.clone(), model: role.model.clone() }
}

fn build_gateway(gateway_config: &GatewayConfig, use_stub: bool) -> Arc<dyn ModelGateway> {
    if use_stub {
        return Arc::new(StubGateway::default());
    }
    let mut http = HttpGateway::new(
        role_endpoint(&gateway_config.agent),
        role_endpoint(&gateway_config.judge),
        gateway_config.embedding_model.clone(),
    );
    http.retry_attempts = gateway_config.retry_attempts;
    http.retry_initial_backoff = Duration::from_millis(gateway_config.retry_initial_backoff_ms);
    http.retry_backoff_factor = gateway_config.retry_backoff_factor;
    Arc::new(http)
}

fn judge_completion_options(gateway_config: &GatewayConfig) -> CompletionOptions {
    CompletionOptions {
        role: GatewayRole::Judge,
        temperature: gateway_config.judge.temperature,
        max_tokens: gateway_config.judge.max_tokens,
        timeout: Duration::from_secs(gateway_config.judge.timeout_secs),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = match AppConfig::load_from(&cli.config) {
        Ok(config) => config,
        Err(err) => {
            error!(?err, path = %cli.config.display(), "failed to load configuration");
            return ExitCode::from(1);
        }
    };

    let use_stub = cli.stub || config.gateway.agent.api_key.is_empty();
    let gateway = build_gateway(&config.gateway, use_stub);
    if !use_stub {
        let reachable = !gateway.embed("healthcheck").await.unwrap_or_default().is_empty();
        if !reachable {
            error!("model gateway unreachable at {}", config.gateway.agent.base_url);
            return ExitCode::from(2);
        }
    }

    let reviewer = Arc::new(Reviewer::new(gateway.clone(), config.reviewer.clone(), judge_completion_options(&config.gateway)));
    let embedding_cache =
        Arc::new(AsyncMutex::new(EmbeddingCache::new(config.memory.embedding_cache_capacity, config.memory.embedding_cache_enabled)));

    let shared = Arc::new(SharedContext {
        gateway,
        embedding_cache,
        reviewer,
        memory_config: config.memory.clone(),
        snapshot_log: None,
    });
    let supervisor = Arc::new(Supervisor::new(shared));
    let router = build_router(supervisor.clone());

    let listener = match tokio::net::TcpListener::bind(&cli.listen).await {
        Ok(listener) => listener,
        Err(err) => {
            error!(?err, listen = %cli.listen, "failed to bind control API listener");
            return ExitCode::from(3);
        }
    };
    info!(listen = %cli.listen, "control API listening");

    if let Err(err) = axum::serve(listener, router).await {
        error!(?err, "control API server exited with an error");
        supervisor.shutdown().await;
        return ExitCode::from(3);
    }

    supervisor.shutdown().await;
    ExitCode::SUCCESS
}
