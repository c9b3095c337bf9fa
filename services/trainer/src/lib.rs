//! Training pipeline: CSV in, model + metric artifacts out.

pub mod evaluate;
pub mod split;

use anyhow::{Context, Result};
use evaluate::{accuracy, f1_macro, ConfusionMatrix};
use severity_core::dataset::load_labeled;
use severity_core::{MetricSnapshot, Predictor, RunLog, SeverityModel, TrainConfig};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const MODEL_FILE: &str = "model.json";
pub const METRICS_FILE: &str = "metrics.json";
pub const CONFUSION_FILE: &str = "confusion_matrix.json";
/// Run-relative directory holding the model in the experiment tracker.
pub const MODEL_ARTIFACT_DIR: &str = "bug-severity-model";

#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub data: PathBuf,
    pub outdir: PathBuf,
    pub test_size: f64,
    pub config: TrainConfig,
}

#[derive(Debug)]
pub struct TrainReport {
    pub metrics: MetricSnapshot,
    pub confusion: ConfusionMatrix,
    /// Exactly the bytes written to `model.json`, for publishing.
    pub model_bytes: Vec<u8>,
    pub model_path: PathBuf,
    pub metrics_path: PathBuf,
    pub confusion_path: PathBuf,
}

fn pick(xs: &[String], idx: &[usize]) -> Vec<String> { idx.iter().map(|&i| xs[i].clone()).collect() }

pub fn train(opts: &TrainOptions) -> Result<TrainReport> {
    let rows = load_labeled(&opts.data)?;
    let blank = rows.iter().filter(|r| r.text.is_empty()).count();
    if blank > 0 { warn!(blank, "rows with empty title and description kept"); }
    let (texts, labels): (Vec<String>, Vec<String>) = rows.into_iter().map(|r| (r.text, r.label)).unzip();

    let label_list: Vec<String> = labels.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect();
    let split = split::train_test_split(&labels, opts.test_size, opts.config.seed)?;
    info!(rows = texts.len(), n_train = split.train.len(), n_test = split.test.len(), stratified = split.stratified, labels = ?label_list, "dataset split");

    let (x_train, y_train) = (pick(&texts, &split.train), pick(&labels, &split.train));
    let (x_test, y_test) = (pick(&texts, &split.test), pick(&labels, &split.test));
    let model = SeverityModel::fit(&x_train, &y_train, &opts.config)?;
    let y_hat = model.predict(&x_test)?;

    let mut metrics = MetricSnapshot::new(accuracy(&y_test, &y_hat), label_list.iter().cloned());
    metrics.f1_macro = Some(f1_macro(&y_test, &y_hat));
    metrics.n_train = Some(x_train.len());
    metrics.n_test = Some(x_test.len());
    let confusion = ConfusionMatrix::build(&label_list, &y_test, &y_hat);

    std::fs::create_dir_all(&opts.outdir).with_context(|| format!("create {}", opts.outdir.display()))?;
    let model_bytes = model.to_json_vec()?;
    let model_path = opts.outdir.join(MODEL_FILE);
    let metrics_path = opts.outdir.join(METRICS_FILE);
    let confusion_path = opts.outdir.join(CONFUSION_FILE);
    std::fs::write(&model_path, &model_bytes).with_context(|| format!("write {}", model_path.display()))?;
    metrics.write(&metrics_path)?;
    write_json(&confusion_path, &confusion)?;
    info!(accuracy = metrics.accuracy, f1_macro = ?metrics.f1_macro, model = %model_path.display(), "artifacts written");

    Ok(TrainReport { metrics, confusion, model_bytes, model_path, metrics_path, confusion_path })
}

/// What one training run records in the experiment tracker: the settings it
/// ran with, the held-out metrics and the three artifacts.
pub fn run_log(opts: &TrainOptions, report: &TrainReport) -> Result<RunLog> {
    let cfg = &opts.config;
    let params = [
        ("model", "tfidf-linear-svm".to_string()),
        ("tfidf_max_features", cfg.max_features.to_string()),
        ("test_size", opts.test_size.to_string()),
        ("random_state", cfg.seed.to_string()),
        ("epochs", cfg.epochs.to_string()),
        ("lambda", cfg.lambda.to_string()),
    ];
    let m = &report.metrics;
    let mut metrics = vec![("accuracy".to_string(), m.accuracy)];
    metrics.extend(m.f1_macro.map(|f| ("f1_macro".to_string(), f)));
    metrics.extend(m.n_train.map(|n| ("n_train".to_string(), n as f64)));
    metrics.extend(m.n_test.map(|n| ("n_test".to_string(), n as f64)));

    let read = |path: &Path| std::fs::read(path).with_context(|| format!("read {}", path.display()));
    let artifacts = vec![
        (format!("artifacts/{METRICS_FILE}"), read(&report.metrics_path)?),
        (format!("artifacts/{CONFUSION_FILE}"), read(&report.confusion_path)?),
        (format!("{MODEL_ARTIFACT_DIR}/{MODEL_FILE}"), report.model_bytes.clone()),
    ];
    Ok(RunLog { params: params.into_iter().map(|(k, v)| (k.to_string(), v)).collect(), metrics, artifacts })
}

fn write_json(path: &Path, value: &impl serde::Serialize) -> Result<()> {
    let body = serde_json::to_string_pretty(value)?;
    std::fs::write(path, body).with_context(|| format!("write {}", path.display()))
}
