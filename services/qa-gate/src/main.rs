use clap::Parser;
use qa_gate::{evaluate, GateOutcome, DEFAULT_TOLERANCE, EXIT_INVALID_INPUT};
use severity_core::{init_tracing, MetricSnapshot};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "qa-gate", version, about = "Fail the pipeline when a candidate model regresses against the baseline")]
struct Cli {
    #[arg(long, default_value = "qa/baseline_metrics.json", help = "Metrics of the currently accepted model")]
    baseline: PathBuf,
    #[arg(long, default_value = "models/metrics.json", help = "Metrics of the newly trained model")]
    candidate: PathBuf,
    #[arg(long, default_value_t = DEFAULT_TOLERANCE, allow_negative_numbers = true, help = "Allowed accuracy drop (0.01 = one point)")]
    tolerance: f64,
    #[arg(long, help = "Print the verdict as JSON on stdout")]
    json: bool,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    // The verdict and exit code do not depend on logging.
    if let Err(e) = init_tracing("qa-gate") { eprintln!("[qa_gate] logging disabled: {e:#}"); }
    ExitCode::from(run(&cli))
}

fn run(cli: &Cli) -> u8 {
    let read = |path: &PathBuf| MetricSnapshot::read(path).map_err(|e| eprintln!("[qa_gate] {e}"));
    let Ok(baseline) = read(&cli.baseline) else { return EXIT_INVALID_INPUT };
    let Ok(candidate) = read(&cli.candidate) else { return EXIT_INVALID_INPUT };

    if !cli.json {
        println!("[qa_gate] Baseline accuracy: {:.4}", baseline.accuracy);
        println!("[qa_gate] New accuracy     : {:.4}", candidate.accuracy);
        println!("[qa_gate] Allowed drop     : {:.4}", cli.tolerance);
    }

    let verdict = evaluate(&baseline, &candidate, cli.tolerance);
    info!(outcome = ?verdict.outcome, baseline = %cli.baseline.display(), candidate = %cli.candidate.display(), "gate evaluated");

    if cli.json {
        match serde_json::to_string_pretty(&verdict) {
            Ok(body) => println!("{body}"),
            Err(e) => eprintln!("[qa_gate] cannot encode verdict: {e}"),
        }
    }
    match verdict.outcome {
        GateOutcome::Pass => { if !cli.json { println!("[qa_gate] PASS: {}", verdict.reason); } }
        GateOutcome::InvalidInput => eprintln!("[qa_gate] Invalid metrics.json contents: {}", verdict.reason),
        GateOutcome::LabelCoverage => eprintln!("[qa_gate] ERROR: {}", verdict.reason),
        GateOutcome::Regression => eprintln!("[qa_gate] FAIL: {}", verdict.reason),
    }
    verdict.exit_code()
}
