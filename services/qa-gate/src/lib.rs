//! Promotion gate: decides whether a candidate model may replace the baseline.

use serde::Serialize;
use severity_core::MetricSnapshot;
use std::collections::BTreeSet;

pub const DEFAULT_TOLERANCE: f64 = 0.01;
/// Absorbs float noise right at the tolerance edge.
pub const EPSILON: f64 = 1e-12;

pub const EXIT_PASS: u8 = 0;
pub const EXIT_REGRESSION: u8 = 1;
pub const EXIT_INVALID_INPUT: u8 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GateOutcome { Pass, LabelCoverage, Regression, InvalidInput }

impl GateOutcome {
    pub fn exit_code(self) -> u8 {
        match self {
            Self::Pass => EXIT_PASS,
            Self::LabelCoverage | Self::Regression => EXIT_REGRESSION,
            Self::InvalidInput => EXIT_INVALID_INPUT,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateVerdict {
    pub outcome: GateOutcome,
    pub passed: bool,
    pub reason: String,
}

impl GateVerdict {
    fn new(outcome: GateOutcome, reason: impl Into<String>) -> Self {
        Self { outcome, passed: outcome == GateOutcome::Pass, reason: reason.into() }
    }

    pub fn exit_code(&self) -> u8 { self.outcome.exit_code() }
}

fn fmt_labels<'a>(labels: impl IntoIterator<Item = &'a String>) -> String {
    labels.into_iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

/// First matching rule wins: invalid input, label coverage, accuracy drop, pass.
pub fn evaluate(baseline: &MetricSnapshot, candidate: &MetricSnapshot, tolerance: f64) -> GateVerdict {
    if !baseline.has_valid_accuracy() || !candidate.has_valid_accuracy() {
        return GateVerdict::new(
            GateOutcome::InvalidInput,
            format!("invalid accuracy (baseline {}, candidate {})", baseline.accuracy, candidate.accuracy),
        );
    }
    if !(tolerance.is_finite() && tolerance >= 0.0) {
        return GateVerdict::new(GateOutcome::InvalidInput, format!("tolerance must be a non-negative number, got {tolerance}"));
    }

    if !baseline.labels.is_subset(&candidate.labels) {
        let dropped: BTreeSet<&String> = baseline.labels.difference(&candidate.labels).collect();
        return GateVerdict::new(
            GateOutcome::LabelCoverage,
            format!(
                "new labels set {{{}}} does not cover baseline {{{}}} (missing: {})",
                fmt_labels(&candidate.labels),
                fmt_labels(&baseline.labels),
                fmt_labels(dropped),
            ),
        );
    }

    if candidate.accuracy + EPSILON < baseline.accuracy - tolerance {
        return GateVerdict::new(
            GateOutcome::Regression,
            format!("accuracy dropped beyond tolerance ({:.4} -> {:.4}, allowed drop {:.4})", baseline.accuracy, candidate.accuracy, tolerance),
        );
    }

    let added: Vec<&String> = candidate.labels.difference(&baseline.labels).collect();
    let mut reason = format!("within tolerance ({:.4} -> {:.4}, allowed drop {:.4})", baseline.accuracy, candidate.accuracy, tolerance);
    if !added.is_empty() {
        reason.push_str(&format!("; candidate adds label(s): {}", fmt_labels(added)));
    }
    GateVerdict::new(GateOutcome::Pass, reason)
}
