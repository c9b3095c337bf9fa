//! HTTP prediction service with lazily resolved, hot-reloadable models.

pub mod config;
pub mod loader;
pub mod resolver;
pub mod routes;
pub mod telemetry;

use anyhow::Result;
use config::ApiConfig;
use loader::{LocalArtifactLoader, RegistryLoader};
use resolver::ModelResolver;
use routes::{router, AppState};
use severity_core::{MlflowRegistry, ModelRegistry, RegistryError};
use std::sync::Arc;
use tracing::{info, warn};

pub fn build_resolver(cfg: &ApiConfig) -> Arc<ModelResolver> {
    let registry: Option<Arc<dyn ModelRegistry>> = match MlflowRegistry::from_settings(&cfg.registry) {
        Ok(r) => Some(Arc::new(r)),
        Err(RegistryError::NotConfigured) => None,
        Err(e) => {
            warn!(error = %e, "registry client unavailable");
            None
        }
    };
    let local = LocalArtifactLoader::new(&cfg.model.path, cfg.model.sha256.clone());
    let remote = RegistryLoader::new(registry, &cfg.registry.model_name, &cfg.registry.model_stage, cfg.registry.timeout());
    Arc::new(ModelResolver::new(cfg.default_source, Arc::new(local), Arc::new(remote)))
}

pub async fn run(cfg: ApiConfig) -> Result<()> {
    let resolver = build_resolver(&cfg);
    if cfg.warm_on_start {
        let h = resolver.health(cfg.default_source).await;
        info!(source = %cfg.default_source, loaded = h.loaded, "startup warm-up");
    }
    let app = router(AppState { resolver });
    let listener = tokio::net::TcpListener::bind(&cfg.bind_addr).await?;
    info!(addr = %cfg.bind_addr, "severity-api listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutdown");
        })
        .await?;
    Ok(())
}
