//! Core shared utilities for the bug-severity services.
//!
//! Tracing bootstrap, layered configuration, artifact hashing, plus the
//! pieces every service touches: metric snapshots, the dataset loader, the
//! text classifier and the model registry client.

use anyhow::Result;
use config::{builder::DefaultState, ConfigBuilder, ConfigError};
use once_cell::sync::OnceCell;
use serde::de::DeserializeOwned;
use sha2::{Digest, Sha256};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

pub mod dataset;
pub mod model;
pub mod registry;
pub mod snapshot;
pub mod tracking;

pub use dataset::{report_text, DatasetError, LabeledText, ScoringTable};
pub use model::{ModelError, Predictor, SeverityModel, TrainConfig};
pub use registry::{MlflowRegistry, ModelRegistry, PublishedVersion, RegistryError, RegistryModel, RegistrySettings};
pub use snapshot::{MetricSnapshot, SnapshotError, INVALID_ACCURACY};
pub use tracking::{LoggedRun, RunLog};

static TRACING_INIT: OnceCell<()> = OnceCell::new();

/// Install the global subscriber once per process. Output goes to stderr so
/// CLI tools keep stdout for their own reports.
pub fn init_tracing(service: &str) -> Result<()> {
    TRACING_INIT.get_or_try_init(|| -> Result<()> {
        let json = std::env::var("SEVERITY_JSON_LOG").ok().map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false);
        let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
        let registry = tracing_subscriber::registry().with(env_filter);
        if json {
            registry
                .with(tracing_subscriber::fmt::layer()
                    .json()
                    .flatten_event(true)
                    .with_current_span(true)
                    .with_span_list(false)
                    .with_writer(std::io::stderr))
                .try_init()?;
        } else {
            registry
                .with(tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(false)
                    .with_line_number(true)
                    .with_writer(std::io::stderr))
                .try_init()?;
        }
        Ok(())
    })?;
    info!(service, "tracing initialized");
    Ok(())
}

/// Layered config: `defaults` < `SEVERITY_CONFIG_FILE` < YAML at
/// `SEVERITY_CONFIG_HTTP` < `SEVERITY__SECTION__KEY` environment variables.
pub async fn load_config<T, F>(service: &str, defaults: F) -> Result<T>
where
    T: DeserializeOwned,
    F: FnOnce(ConfigBuilder<DefaultState>) -> Result<ConfigBuilder<DefaultState>, ConfigError>,
{
    let base = config::Config::builder()
        .set_default("service_name", service)?
        .set_default("log_level", "info")?;
    let mut builder = defaults(base)?;

    if let Ok(file) = std::env::var("SEVERITY_CONFIG_FILE") {
        builder = builder.add_source(config::File::with_name(&file).required(false));
    }
    if let Ok(http_url) = std::env::var("SEVERITY_CONFIG_HTTP") {
        match fetch_remote_config(&http_url).await {
            Ok(text) => builder = builder.add_source(config::File::from_str(&text, config::FileFormat::Yaml)),
            Err(e) => warn!(url = %http_url, error = %e, "remote config unavailable, using local layers"),
        }
    }
    builder = builder.add_source(config::Environment::with_prefix("SEVERITY").separator("__"));
    let cfg = builder.build()?;
    Ok(cfg.try_deserialize()?)
}

async fn fetch_remote_config(url: &str) -> Result<String> {
    let resp = reqwest::get(url).await?.error_for_status()?;
    Ok(resp.text().await?)
}

/// Lowercase hex SHA-256 of an artifact blob.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut h = Sha256::new();
    h.update(bytes);
    hex::encode(h.finalize())
}
