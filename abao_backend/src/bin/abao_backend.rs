use anyhow::{Context, Result};
use abao_backend::config::BackendConfig;
use abao_backend::server::serve_backend;
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,abao_backend=debug")),
        )
        .init();

    let config = BackendConfig::load();

    tracing::info!(
        bind = %config.bind_addr,
        provider = %config.llm_provider,
        model = %config.llm_model,
        "Starting A宝 backend (set ABAO_BACKEND_TOKEN; auth mode via ABAO_BACKEND_AUTH_MODE)"
    );

    let server_rt = tokio::runtime::Runtime::new().context("failed to start server runtime")?;
    server_rt.block_on(serve_backend(config))
}
