use serde::Serialize;
use std::collections::{BTreeSet, HashMap};

pub fn accuracy(truth: &[String], pred: &[String]) -> f64 {
    if truth.is_empty() { return 0.0; }
    truth.iter().zip(pred).filter(|(t, p)| t == p).count() as f64 / truth.len() as f64
}

/// Unweighted mean of per-label F1 over every label seen in `truth` or `pred`.
/// A label with no true or predicted occurrences scores 0.
pub fn f1_macro(truth: &[String], pred: &[String]) -> f64 {
    let labels: BTreeSet<&String> = truth.iter().chain(pred).collect();
    if labels.is_empty() { return 0.0; }
    let total: f64 = labels
        .iter()
        .map(|l| {
            let tp = truth.iter().zip(pred).filter(|(t, p)| t == l && p == l).count() as f64;
            let fp = truth.iter().zip(pred).filter(|(t, p)| t != l && p == l).count() as f64;
            let fn_ = truth.iter().zip(pred).filter(|(t, p)| t == l && p != l).count() as f64;
            let denom = 2.0 * tp + fp + fn_;
            if denom == 0.0 { 0.0 } else { 2.0 * tp / denom }
        })
        .sum();
    total / labels.len() as f64
}

/// Rows are true labels, columns predicted labels, both in `labels` order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfusionMatrix {
    pub labels: Vec<String>,
    pub confusion_matrix: Vec<Vec<u64>>,
}

impl ConfusionMatrix {
    /// Pairs involving a label outside `labels` are not counted.
    pub fn build(labels: &[String], truth: &[String], pred: &[String]) -> Self {
        let pos: HashMap<&str, usize> = labels.iter().enumerate().map(|(i, l)| (l.as_str(), i)).collect();
        let mut m = vec![vec![0u64; labels.len()]; labels.len()];
        for (t, p) in truth.iter().zip(pred) {
            if let (Some(&r), Some(&c)) = (pos.get(t.as_str()), pos.get(p.as_str())) { m[r][c] += 1; }
        }
        Self { labels: labels.to_vec(), confusion_matrix: m }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(xs: &[&str]) -> Vec<String> { xs.iter().map(|s| s.to_string()).collect() }

    #[test]
    fn perfect_predictions() {
        let t = v(&["a", "b", "a"]);
        assert_eq!(accuracy(&t, &t), 1.0);
        assert_eq!(f1_macro(&t, &t), 1.0);
    }

    #[test]
    fn macro_f1_counts_labels_only_predicted() {
        // a: 2/3, b: 1/2, c is predicted but never true: 0
        let t = v(&["a", "a", "b", "b"]);
        let p = v(&["a", "b", "b", "c"]);
        assert!((accuracy(&t, &p) - 0.5).abs() < 1e-12);
        let expected = (2.0 / 3.0 + 0.5 + 0.0) / 3.0;
        assert!((f1_macro(&t, &p) - expected).abs() < 1e-12);
    }

    #[test]
    fn confusion_rows_are_truth() {
        let labels = v(&["a", "b"]);
        let cm = ConfusionMatrix::build(&labels, &v(&["a", "a", "b"]), &v(&["a", "b", "b"]));
        assert_eq!(cm.confusion_matrix, vec![vec![1, 1], vec![0, 1]]);
    }
}
