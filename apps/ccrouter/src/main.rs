use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use ccrouter_core::config::{RouterConfig, config_path};
use ccrouter_core::handler;
use ccrouter_core::pipeline::Pipeline;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let path = config_path();
    let config = Arc::new(RouterConfig::load(&path)?);
    info!(
        event = "config_loaded",
        path = %path.display(),
        providers = config.providers.len()
    );

    let pipeline = Arc::new(Pipeline::new(config.clone()));
    let app = handler::router(pipeline);

    let bind = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(event = "listening", bind = %bind);
    axum::serve(listener, app).await?;
    Ok(())
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| {
            tracing_subscriber::EnvFilter::new("ccrouter=info,ccrouter_core=info,ccrouter_transform=info")
        });
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
