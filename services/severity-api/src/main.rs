use anyhow::Result;
use severity_api::config::ApiConfig;
use severity_core::init_tracing;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing("severity-api")?;
    let cfg = ApiConfig::load().await?;
    info!(?cfg, "config loaded");
    severity_api::run(cfg).await
}
