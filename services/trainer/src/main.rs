use anyhow::{Context, Result};
use clap::Parser;
use severity_core::{init_tracing, MlflowRegistry, RegistryError, RegistrySettings, TrainConfig};
use severity_resilience::{retry_async_when, RetryPolicy};
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use trainer::{run_log, train, TrainOptions};

#[derive(Parser, Debug)]
#[command(name = "train", version, about = "Train the bug severity classifier and save artifacts")]
struct Cli {
    #[arg(long, default_value = "data/bugs.csv", help = "CSV with title, description, severity")]
    data: PathBuf,
    #[arg(long, default_value = "models", help = "Output directory for model and metrics")]
    outdir: PathBuf,
    #[arg(long, default_value_t = 20_000)]
    max_features: usize,
    #[arg(long, default_value_t = 0.25)]
    test_size: f64,
    #[arg(long, default_value_t = 42)]
    seed: u64,
    #[arg(long, default_value_t = 20)]
    epochs: usize,
    #[arg(long, help = "Register the trained model and move it into --stage")]
    publish: bool,
    #[arg(long, env = "MLFLOW_MODEL_NAME", default_value = "bug-severity-clf")]
    model_name: String,
    #[arg(long, env = "MLFLOW_MODEL_STAGE", default_value = "Production")]
    stage: String,
    #[arg(long, env = "MLFLOW_TRACKING_URI")]
    tracking_uri: Option<String>,
    #[arg(long, default_value_t = 3, help = "Publish attempts on transient registry errors")]
    retries: usize,
    #[arg(long, help = "Log params, metrics and artifacts as an MLflow run")]
    mlflow: bool,
    #[arg(long, default_value = "bug-severity", help = "MLflow experiment name")]
    experiment: String,
    #[arg(long, help = "MLflow run name")]
    run_name: Option<String>,
}

impl Cli {
    fn registry(&self, flag: &str) -> Result<MlflowRegistry> {
        let settings = RegistrySettings { tracking_uri: self.tracking_uri.clone(), ..RegistrySettings::default() };
        MlflowRegistry::from_settings(&settings).with_context(|| format!("{flag} needs --tracking-uri or MLFLOW_TRACKING_URI"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing("trainer")?;

    let opts = TrainOptions {
        data: cli.data.clone(),
        outdir: cli.outdir.clone(),
        test_size: cli.test_size,
        config: TrainConfig { max_features: cli.max_features, epochs: cli.epochs, seed: cli.seed, ..TrainConfig::default() },
    };
    let report = {
        let opts = opts.clone();
        tokio::task::spawn_blocking(move || train(&opts)).await??
    };

    println!("== Training complete ==");
    println!("{}", serde_json::to_string_pretty(&report.metrics)?);

    if cli.mlflow {
        let registry = cli.registry("--mlflow")?;
        let log = run_log(&opts, &report)?;
        let run = registry.log_run(&cli.experiment, cli.run_name.as_deref(), &log).await?;
        println!("[mlflow] logged run: {}", run.run_id);
    }

    if cli.publish {
        let registry = cli.registry("--publish")?;
        let policy = RetryPolicy { attempts: cli.retries, delay: Duration::from_millis(500) };
        let published = retry_async_when(
            policy,
            || registry.publish(&cli.model_name, &cli.stage, &report.model_bytes),
            RegistryError::is_transient,
        )
        .await?;
        info!(name = %published.name, version = %published.version, stage = %published.stage, "model published");
        println!("[registry] {} version {} -> {} ({})", published.name, published.version, published.stage, published.source);
    }
    Ok(())
}
