use anyhow::Result;
use batch_score::{load_model, score, ModelSource};
use clap::Parser;
use severity_core::{init_tracing, RegistrySettings, ScoringTable};
use severity_resilience::RetryPolicy;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(name = "batch-score", version, about = "Score a CSV of bug reports with the registry model")]
struct Cli {
    #[arg(long, help = "Input CSV with columns: title, description")]
    input: PathBuf,
    #[arg(long, help = "Output CSV path")]
    output: PathBuf,
    #[arg(long, env = "MLFLOW_MODEL_NAME", default_value = "bug-severity-clf")]
    name: String,
    #[arg(long, env = "MLFLOW_MODEL_STAGE", default_value = "Production")]
    stage: String,
    #[arg(long, env = "MLFLOW_TRACKING_URI")]
    tracking_uri: Option<String>,
    #[arg(long, help = "Score with a local model.json instead of the registry")]
    local: Option<PathBuf>,
    #[arg(long, default_value_t = 3, help = "Registry fetch attempts on transient errors")]
    retries: usize,
    #[arg(long, default_value_t = 10_000)]
    timeout_ms: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing("batch-score")?;

    let source = match &cli.local {
        Some(path) => ModelSource::Local(path.clone()),
        None => ModelSource::Registry(RegistrySettings {
            tracking_uri: cli.tracking_uri.clone(),
            model_name: cli.name.clone(),
            model_stage: cli.stage.clone(),
            timeout_ms: cli.timeout_ms,
        }),
    };
    let policy = RetryPolicy { attempts: cli.retries, delay: Duration::from_millis(500) };
    let loaded = load_model(&source, policy).await?;

    let table = ScoringTable::load(&cli.input)?;
    let predictions = score(&table, &loaded.model)?;
    table.write_scored(&cli.output, &predictions)?;

    println!("[batch_score] Saved predictions to {}", cli.output.display());
    println!("[batch_score] Model: {}", loaded.provenance);
    Ok(())
}
