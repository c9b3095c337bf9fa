//! TF-IDF features + one-vs-rest linear classifier (hinge loss, SGD).
//!
//! The serialized `SeverityModel` is the artifact the trainer writes, the
//! registry stores and the API loads. Serving only relies on [`Predictor`].

use once_cell::sync::Lazy;
use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use thiserror::Error;

pub const FORMAT_VERSION: u32 = 1;

/// Anything that maps report text to a severity label.
pub trait Predictor: Send + Sync {
    fn predict(&self, texts: &[String]) -> Result<Vec<String>, ModelError>;
    fn labels(&self) -> &[String];
}

#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model has no labels")]
    NoLabels,
    #[error("weights are {rows}x{cols}, expected {labels} labels x {features} features")]
    Shape { rows: usize, cols: usize, labels: usize, features: usize },
    #[error("unsupported artifact format version {0}")]
    FormatVersion(u32),
    #[error("artifact decode failed: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("training set is empty or texts/labels lengths differ")]
    BadTrainingSet,
}

#[derive(Debug, Clone)]
pub struct TrainConfig {
    pub max_features: usize,
    pub epochs: usize,
    pub lambda: f64,
    pub seed: u64,
}

impl Default for TrainConfig { fn default() -> Self { Self { max_features: 20_000, epochs: 20, lambda: 1e-4, seed: 42 } } }

static STOP_WORDS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "a", "about", "above", "after", "again", "against", "all", "also", "am", "an", "and", "any", "are", "as", "at",
        "be", "because", "been", "before", "being", "below", "between", "both", "but", "by", "can", "could", "did",
        "do", "does", "doing", "down", "during", "each", "few", "for", "from", "further", "had", "has", "have",
        "having", "he", "her", "here", "hers", "herself", "him", "himself", "his", "how", "however", "if", "in", "into",
        "is", "it", "its", "itself", "just", "may", "me", "might", "more", "most", "must", "my", "myself", "no", "nor",
        "not", "now", "of", "off", "on", "once", "only", "or", "other", "our", "ours", "ourselves", "out", "over", "own",
        "same", "she", "should", "so", "some", "such", "than", "that", "the", "their", "theirs", "them", "themselves",
        "then", "there", "these", "they", "this", "those", "through", "to", "too", "under", "until", "up", "upon", "us",
        "very", "was", "we", "were", "what", "when", "where", "which", "while", "who", "whom", "why", "will", "with",
        "within", "without", "would", "yet", "you", "your", "yours", "yourself", "yourselves",
    ]
    .into_iter()
    .collect()
});

/// Lowercased word tokens of two or more characters, stop words removed.
fn tokenize(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !(c.is_alphanumeric() || c == '_'))
        .filter(|t| t.chars().count() >= 2)
        .map(|t| t.to_lowercase())
        .filter(|t| !STOP_WORDS.contains(t.as_str()))
}

type SparseVec = Vec<(usize, f64)>;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TfidfVectorizer {
    pub vocabulary: BTreeMap<String, usize>,
    pub idf: Vec<f64>,
    pub max_features: usize,
}

impl TfidfVectorizer {
    /// Keeps the `max_features` most frequent terms; indices follow term order.
    pub fn fit(docs: &[String], max_features: usize) -> Self {
        let mut term_count: HashMap<String, u64> = HashMap::new();
        let mut doc_freq: HashMap<String, u64> = HashMap::new();
        for doc in docs {
            let mut seen = HashSet::new();
            for tok in tokenize(doc) {
                *term_count.entry(tok.clone()).or_default() += 1;
                if seen.insert(tok.clone()) { *doc_freq.entry(tok).or_default() += 1; }
            }
        }
        let mut ranked: Vec<(String, u64)> = term_count.into_iter().collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        ranked.truncate(max_features);
        let kept: BTreeSet<String> = ranked.into_iter().map(|(t, _)| t).collect();

        let n = docs.len() as f64;
        let mut vocabulary = BTreeMap::new();
        let mut idf = Vec::with_capacity(kept.len());
        for (idx, term) in kept.into_iter().enumerate() {
            let df = doc_freq.get(&term).copied().unwrap_or(0) as f64;
            idf.push(((1.0 + n) / (1.0 + df)).ln() + 1.0);
            vocabulary.insert(term, idx);
        }
        Self { vocabulary, idf, max_features }
    }

    pub fn dim(&self) -> usize { self.idf.len() }

    /// L2-normalized tf-idf vector sorted by feature index.
    pub fn transform(&self, doc: &str) -> SparseVec {
        let mut counts: BTreeMap<usize, f64> = BTreeMap::new();
        for tok in tokenize(doc) {
            if let Some(&idx) = self.vocabulary.get(&tok) { *counts.entry(idx).or_default() += 1.0; }
        }
        let mut v: SparseVec = counts.into_iter().map(|(i, tf)| (i, tf * self.idf[i])).collect();
        let norm = v.iter().map(|(_, x)| x * x).sum::<f64>().sqrt();
        if norm > 0.0 { for (_, x) in v.iter_mut() { *x /= norm; } }
        v
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SeverityModel {
    pub format_version: u32,
    pub labels: Vec<String>,
    pub vectorizer: TfidfVectorizer,
    pub weights: Vec<Vec<f64>>,
    pub bias: Vec<f64>,
}

fn sparse_dot(w: &[f64], x: &SparseVec) -> f64 { x.iter().map(|(i, v)| w[*i] * v).sum() }

impl SeverityModel {
    pub fn fit(texts: &[String], labels: &[String], cfg: &TrainConfig) -> Result<Self, ModelError> {
        if texts.is_empty() || texts.len() != labels.len() { return Err(ModelError::BadTrainingSet); }
        let classes: Vec<String> = labels.iter().cloned().collect::<BTreeSet<_>>().into_iter().collect();
        let vectorizer = TfidfVectorizer::fit(texts, cfg.max_features);
        let xs: Vec<SparseVec> = texts.iter().map(|t| vectorizer.transform(t)).collect();
        let dim = vectorizer.dim();

        let mut rng = StdRng::seed_from_u64(cfg.seed);
        let mut weights = Vec::with_capacity(classes.len());
        let mut bias = Vec::with_capacity(classes.len());
        for class in &classes {
            let ys: Vec<f64> = labels.iter().map(|l| if l == class { 1.0 } else { -1.0 }).collect();
            let (w, b) = train_binary(&xs, &ys, dim, cfg, &mut rng);
            weights.push(w);
            bias.push(b);
        }
        Ok(Self { format_version: FORMAT_VERSION, labels: classes, vectorizer, weights, bias })
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self, ModelError> {
        let model: Self = serde_json::from_slice(bytes)?;
        model.validate()?;
        Ok(model)
    }

    pub fn to_json_vec(&self) -> Result<Vec<u8>, ModelError> { Ok(serde_json::to_vec(self)?) }

    fn validate(&self) -> Result<(), ModelError> {
        if self.format_version != FORMAT_VERSION { return Err(ModelError::FormatVersion(self.format_version)); }
        if self.labels.is_empty() { return Err(ModelError::NoLabels); }
        let features = self.vectorizer.dim();
        let cols_ok = self.weights.iter().all(|w| w.len() == features);
        let idx_ok = self.vectorizer.vocabulary.values().all(|&i| i < features);
        if self.weights.len() != self.labels.len() || self.bias.len() != self.labels.len() || !cols_ok || !idx_ok {
            return Err(ModelError::Shape {
                rows: self.weights.len(),
                cols: self.weights.first().map(Vec::len).unwrap_or(0),
                labels: self.labels.len(),
                features,
            });
        }
        Ok(())
    }

    /// Per-label decision values, in `labels` order.
    pub fn decision(&self, text: &str) -> Vec<f64> {
        let x = self.vectorizer.transform(text);
        self.weights.iter().zip(&self.bias).map(|(w, b)| sparse_dot(w, &x) + b).collect()
    }
}

/// Pegasos-style SGD on the hinge loss. `w = scale * v` keeps the L2 decay O(1).
fn train_binary(xs: &[SparseVec], ys: &[f64], dim: usize, cfg: &TrainConfig, rng: &mut StdRng) -> (Vec<f64>, f64) {
    let mut v = vec![0.0; dim];
    let mut scale = 1.0f64;
    let mut b = 0.0f64;
    let mut order: Vec<usize> = (0..xs.len()).collect();
    let mut t = 0u64;
    for _ in 0..cfg.epochs.max(1) {
        order.shuffle(rng);
        for &i in &order {
            t += 1;
            let eta = 1.0 / (1.0 + cfg.lambda * t as f64);
            let margin = ys[i] * (scale * sparse_dot(&v, &xs[i]) + b);
            scale *= 1.0 - eta * cfg.lambda;
            if scale < 1e-9 {
                for w in v.iter_mut() { *w *= scale; }
                scale = 1.0;
            }
            if margin < 1.0 {
                let step = eta * ys[i] / scale;
                for (j, x) in &xs[i] { v[*j] += step * x; }
                b += eta * ys[i] * 0.01;
            }
        }
    }
    (v.into_iter().map(|w| w * scale).collect(), b)
}

impl Predictor for SeverityModel {
    fn predict(&self, texts: &[String]) -> Result<Vec<String>, ModelError> {
        texts
            .iter()
            .map(|text| {
                // Text with no known terms scores as the bias alone.
                let scores = self.decision(text);
                let best = scores
                    .iter()
                    .enumerate()
                    .fold(None::<(usize, f64)>, |acc, (i, s)| match acc { Some((_, bs)) if bs >= *s => acc, _ => Some((i, *s)) });
                best.map(|(i, _)| self.labels[i].clone()).ok_or(ModelError::NoLabels)
            })
            .collect()
    }

    fn labels(&self) -> &[String] { &self.labels }
}
