//! Seeded train/test split, stratified by label when the data allows it.

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum SplitError {
    #[error("test size must be in (0, 1), got {0}")]
    TestSize(f64),
    #[error("need at least 2 rows to split, got {0}")]
    TooFewRows(usize),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
    pub stratified: bool,
}

fn test_count(n: usize, test_size: f64) -> usize { ((n as f64 * test_size).ceil() as usize).clamp(1, n - 1) }

/// Indices into `labels`. Stratifies only when there is more than one class
/// and every class has at least two rows; otherwise a plain shuffle split.
pub fn train_test_split(labels: &[String], test_size: f64, seed: u64) -> Result<Split, SplitError> {
    if !(test_size > 0.0 && test_size < 1.0) { return Err(SplitError::TestSize(test_size)); }
    let n = labels.len();
    if n < 2 { return Err(SplitError::TooFewRows(n)); }
    let mut rng = StdRng::seed_from_u64(seed);

    let mut by_class: BTreeMap<&str, Vec<usize>> = BTreeMap::new();
    for (i, l) in labels.iter().enumerate() { by_class.entry(l.as_str()).or_default().push(i); }
    let stratify = by_class.len() > 1 && by_class.values().all(|v| v.len() >= 2);

    let (mut train, mut test) = (Vec::new(), Vec::new());
    if stratify {
        for idx in by_class.values_mut() {
            idx.shuffle(&mut rng);
            let k = ((idx.len() as f64 * test_size).round() as usize).clamp(1, idx.len() - 1);
            test.extend_from_slice(&idx[..k]);
            train.extend_from_slice(&idx[k..]);
        }
    } else {
        let mut all: Vec<usize> = (0..n).collect();
        all.shuffle(&mut rng);
        let k = test_count(n, test_size);
        test.extend_from_slice(&all[..k]);
        train.extend_from_slice(&all[k..]);
    }
    train.sort_unstable();
    test.sort_unstable();
    Ok(Split { train, test, stratified: stratify })
}
