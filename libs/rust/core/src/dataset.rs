//! CSV loading for training and batch scoring.

use serde::Deserialize;
use std::path::{Path, PathBuf};
use thiserror::Error;

pub const TRAINING_COLUMNS: [&str; 3] = ["title", "description", "severity"];
pub const SCORING_COLUMNS: [&str; 2] = ["title", "description"];
pub const PREDICTION_COLUMN: &str = "predicted_severity";

#[derive(Debug, Error)]
pub enum DatasetError {
    #[error("cannot read {path}: {source}")]
    Csv { path: PathBuf, #[source] source: csv::Error },
    #[error("missing column(s) in {path}: {missing:?}")]
    MissingColumns { path: PathBuf, missing: Vec<String> },
    #[error("no rows to train on after cleaning {path}")]
    Empty { path: PathBuf },
    #[error("{rows} rows but {predictions} predictions")]
    LengthMismatch { rows: usize, predictions: usize },
}

#[derive(Debug, Clone, PartialEq)]
pub struct LabeledText { pub text: String, pub label: String }

#[derive(Debug, Deserialize)]
struct TrainingRow { title: Option<String>, description: Option<String>, severity: Option<String> }

/// The single text field the classifier sees.
pub fn report_text(title: &str, description: &str) -> String {
    format!("{title} {description}").trim().to_string()
}

fn csv_err(path: &Path) -> impl FnOnce(csv::Error) -> DatasetError + '_ {
    move |source| DatasetError::Csv { path: path.to_path_buf(), source }
}

fn check_columns(path: &Path, headers: &csv::StringRecord, required: &[&str]) -> Result<(), DatasetError> {
    let mut missing: Vec<String> = required.iter().filter(|c| !headers.iter().any(|h| h == **c)).map(|c| c.to_string()).collect();
    if missing.is_empty() { return Ok(()); }
    missing.sort();
    Err(DatasetError::MissingColumns { path: path.to_path_buf(), missing })
}

/// Rows without a severity are dropped; empty title/description count as "".
pub fn load_labeled(path: &Path) -> Result<Vec<LabeledText>, DatasetError> {
    let mut rdr = csv::Reader::from_path(path).map_err(csv_err(path))?;
    let headers = rdr.headers().map_err(csv_err(path))?.clone();
    check_columns(path, &headers, &TRAINING_COLUMNS)?;
    let mut rows = Vec::new();
    for rec in rdr.deserialize::<TrainingRow>() {
        let row = rec.map_err(csv_err(path))?;
        let Some(label) = row.severity.map(|s| s.trim().to_string()).filter(|s| !s.is_empty()) else { continue };
        let text = report_text(row.title.as_deref().unwrap_or(""), row.description.as_deref().unwrap_or(""));
        rows.push(LabeledText { text, label });
    }
    if rows.is_empty() { return Err(DatasetError::Empty { path: path.to_path_buf() }); }
    Ok(rows)
}

/// An input CSV kept verbatim so scored output preserves every column.
#[derive(Debug, Clone)]
pub struct ScoringTable {
    pub headers: csv::StringRecord,
    pub records: Vec<csv::StringRecord>,
    pub texts: Vec<String>,
}

impl ScoringTable {
    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let mut rdr = csv::Reader::from_path(path).map_err(csv_err(path))?;
        let headers = rdr.headers().map_err(csv_err(path))?.clone();
        check_columns(path, &headers, &SCORING_COLUMNS)?;
        let title_idx = headers.iter().position(|h| h == "title");
        let desc_idx = headers.iter().position(|h| h == "description");
        let mut records = Vec::new();
        let mut texts = Vec::new();
        for rec in rdr.records() {
            let rec = rec.map_err(csv_err(path))?;
            let field = |idx: Option<usize>| idx.and_then(|i| rec.get(i)).unwrap_or("");
            texts.push(report_text(field(title_idx), field(desc_idx)));
            records.push(rec);
        }
        Ok(Self { headers, records, texts })
    }

    pub fn len(&self) -> usize { self.records.len() }

    pub fn is_empty(&self) -> bool { self.records.is_empty() }

    pub fn write_scored(&self, path: &Path, predictions: &[String]) -> Result<(), DatasetError> {
        if predictions.len() != self.records.len() {
            return Err(DatasetError::LengthMismatch { rows: self.records.len(), predictions: predictions.len() });
        }
        let mut wtr = csv::Writer::from_path(path).map_err(csv_err(path))?;
        let mut headers = self.headers.clone();
        headers.push_field(PREDICTION_COLUMN);
        wtr.write_record(&headers).map_err(csv_err(path))?;
        for (rec, pred) in self.records.iter().zip(predictions) {
            let mut out = rec.clone();
            out.push_field(pred);
            wtr.write_record(&out).map_err(csv_err(path))?;
        }
        wtr.flush().map_err(|e| DatasetError::Csv { path: path.to_path_buf(), source: e.into() })?;
        Ok(())
    }
}
