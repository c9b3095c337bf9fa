//! Metric snapshots written by the trainer and compared by the gate.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Stand-in for an absent `accuracy` key.
pub const INVALID_ACCURACY: f64 = -1.0;

fn invalid_accuracy() -> f64 { INVALID_ACCURACY }

/// Accepts `0.8` and `"0.8"`; any other string is malformed.
fn lenient_f64<'de, D: Deserializer<'de>>(de: D) -> Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumOrText { Num(f64), Text(String) }

    match NumOrText::deserialize(de)? {
        NumOrText::Num(n) => Ok(n),
        NumOrText::Text(s) => s.trim().parse().map_err(|_| serde::de::Error::custom(format!("accuracy is not a number: {s:?}"))),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSnapshot {
    #[serde(default = "invalid_accuracy", deserialize_with = "lenient_f64")]
    pub accuracy: f64,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub f1_macro: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_train: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n_test: Option<usize>,
    /// Keys this crate does not interpret; kept so a rewrite is lossless.
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("missing file: {path}")]
    Missing { path: PathBuf },
    #[error("cannot read {path}: {source}")]
    Io { path: PathBuf, #[source] source: std::io::Error },
    #[error("malformed metrics in {path}: {source}")]
    Malformed { path: PathBuf, #[source] source: serde_json::Error },
}

impl MetricSnapshot {
    pub fn new(accuracy: f64, labels: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self { accuracy, labels: labels.into_iter().map(Into::into).collect(), f1_macro: None, n_train: None, n_test: None, extra: BTreeMap::new() }
    }

    /// False for the sentinel, any negative value and NaN.
    pub fn has_valid_accuracy(&self) -> bool { self.accuracy >= 0.0 }

    pub fn read(path: &Path) -> Result<Self, SnapshotError> {
        let text = match std::fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Err(SnapshotError::Missing { path: path.to_path_buf() }),
            Err(e) => return Err(SnapshotError::Io { path: path.to_path_buf(), source: e }),
        };
        serde_json::from_str(&text).map_err(|e| SnapshotError::Malformed { path: path.to_path_buf(), source: e })
    }

    pub fn write(&self, path: &Path) -> Result<(), SnapshotError> {
        let body = serde_json::to_string_pretty(self).map_err(|e| SnapshotError::Malformed { path: path.to_path_buf(), source: e })?;
        std::fs::write(path, body).map_err(|e| SnapshotError::Io { path: path.to_path_buf(), source: e })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_accuracy_decodes_to_sentinel() {
        let snap: MetricSnapshot = serde_json::from_str(r#"{"labels":["a","b"]}"#).unwrap();
        assert_eq!(snap.accuracy, INVALID_ACCURACY);
        assert!(!snap.has_valid_accuracy());
        assert_eq!(snap.labels.len(), 2);
    }

    #[test]
    fn unknown_keys_survive_rewrite() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.json");
        std::fs::write(&path, r#"{"accuracy":0.8,"labels":["a"],"f1_macro":0.7,"run":"r1"}"#).unwrap();
        let snap = MetricSnapshot::read(&path).unwrap();
        assert_eq!(snap.f1_macro, Some(0.7));
        assert_eq!(snap.extra.get("run").and_then(|v| v.as_str()), Some("r1"));
        snap.write(&path).unwrap();
        assert_eq!(MetricSnapshot::read(&path).unwrap(), snap);
    }

    #[test]
    fn read_distinguishes_missing_from_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.json");
        assert!(matches!(MetricSnapshot::read(&missing), Err(SnapshotError::Missing { .. })));
        let bad = dir.path().join("bad.json");
        std::fs::write(&bad, "{not json").unwrap();
        assert!(matches!(MetricSnapshot::read(&bad), Err(SnapshotError::Malformed { .. })));
    }

    #[test]
    fn numeric_string_accuracy_is_read_as_a_number() {
        let snap: MetricSnapshot = serde_json::from_str(r#"{"accuracy":" 0.8 ","labels":["a"]}"#).unwrap();
        assert_eq!(snap.accuracy, 0.8);
        assert!(snap.extra.is_empty());
        let err = serde_json::from_str::<MetricSnapshot>(r#"{"accuracy":"high","labels":["a"]}"#).unwrap_err();
        assert!(err.to_string().contains("not a number"), "{err}");
        // Written back as a plain number.
        assert_eq!(serde_json::to_value(&snap).unwrap()["accuracy"], serde_json::json!(0.8));
    }

    #[test]
    fn nan_accuracy_is_invalid() {
        let snap = MetricSnapshot::new(f64::NAN, ["a"]);
        assert!(!snap.has_valid_accuracy());
    }
}
