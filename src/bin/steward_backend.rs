use anyhow::{Context, Result};
use steward::config::AssistantConfig;
use steward::runtime::BackendRuntime;
use steward::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,steward=debug")),
        )
        .init();

    let config = AssistantConfig::load();
    if std::env::args().any(|arg| arg == "--write-config") {
        return config.save();
    }

    tracing::info!(
        "Starting steward backend (set STEWARD_BACKEND_TOKEN + optional STEWARD_BACKEND_BIND; auth mode via STEWARD_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(async {
        let runtime =
            BackendRuntime::bootstrap(config).context("failed to bootstrap backend runtime")?;
        serve_backend(runtime).await
    })
}
