use std::path::PathBuf;

use api_router::gateway::{GatewayConfig, GatewayHttpState, GatewayRuntime, http_router, otel};
use clap::Parser;

#[derive(Debug, Parser)]
#[command(name = "api-router", about = "Admission and routing gateway for inference backends")]
struct Cli {
    /// JSON, TOML or YAML config file. Defaults apply when omitted.
    config: Option<PathBuf>,

    /// Overrides `listen` from the config file.
    #[arg(long)]
    listen: Option<String>,

    /// Guards `/v1/admin/routing`.
    #[arg(long, env = "API_ROUTER_ADMIN_TOKEN")]
    admin_token: Option<String>,

    #[arg(long)]
    json_logs: bool,

    /// OTLP/HTTP collector; only used when built with `otel`.
    #[arg(long, env = "OTEL_EXPORTER_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let _tracing = otel::init_tracing("api-router", cli.otlp_endpoint.as_deref(), cli.json_logs)?;

    let mut config = match &cli.config {
        Some(path) => GatewayConfig::load(path)?,
        None => GatewayConfig::default(),
    };
    config.apply_env_overrides()?;
    if let Some(listen) = cli.listen {
        config.listen = listen;
    }
    if let Some(token) = cli.admin_token {
        config.admin_token = Some(token);
    }

    let listen = config.listen.clone();
    let admin_token = config.admin_token.clone();

    let mut runtime = GatewayRuntime::from_config(config).await?;
    runtime.start_background_tasks();

    let mut state = GatewayHttpState::new(runtime.gateway().clone());
    if let Some(token) = admin_token {
        state = state.with_admin_token(token);
    }

    let app = http_router(state);
    let listener = tokio::net::TcpListener::bind(&listen).await?;
    tracing::info!(%listen, "api-router listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("api-router stopped");
    drop(runtime);
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}
