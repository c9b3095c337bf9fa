//! Prometheus metrics for model loading and prediction.
use axum::body::Body;
use axum::response::Response;
use once_cell::sync::Lazy;
use prometheus::{Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder};
use std::time::Duration;
use tracing::warn;

pub struct ApiMetrics {
    registry: Registry,
    pub model_loads: IntCounterVec,
    pub load_seconds: HistogramVec,
    pub predictions: IntCounterVec,
}

fn build() -> prometheus::Result<ApiMetrics> {
    let registry = Registry::new();
    let model_loads = IntCounterVec::new(
        Opts::new("severity_model_loads_total", "Model load attempts by source and outcome"),
        &["source", "outcome"],
    )?;
    let load_seconds = HistogramVec::new(
        HistogramOpts::new("severity_model_load_seconds", "Wall time of a single model load attempt")
            .buckets(vec![0.005, 0.02, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["source"],
    )?;
    let predictions = IntCounterVec::new(
        Opts::new("severity_predictions_total", "Prediction requests by source and outcome"),
        &["source", "outcome"],
    )?;
    registry.register(Box::new(model_loads.clone()))?;
    registry.register(Box::new(load_seconds.clone()))?;
    registry.register(Box::new(predictions.clone()))?;
    Ok(ApiMetrics { registry, model_loads, load_seconds, predictions })
}

static METRICS: Lazy<Option<ApiMetrics>> = Lazy::new(|| match build() {
    Ok(m) => Some(m),
    Err(e) => {
        warn!(error = %e, "metrics registry unavailable");
        None
    }
});

pub fn record_load(source: &str, outcome: &str, elapsed: Duration) {
    if let Some(m) = METRICS.as_ref() {
        m.model_loads.with_label_values(&[source, outcome]).inc();
        m.load_seconds.with_label_values(&[source]).observe(elapsed.as_secs_f64());
    }
}

pub fn record_prediction(source: &str, outcome: &str) {
    if let Some(m) = METRICS.as_ref() {
        m.predictions.with_label_values(&[source, outcome]).inc();
    }
}

fn plain(status: u16, body: impl Into<Body>) -> Response {
    let mut resp = Response::new(body.into());
    *resp.status_mut() = axum::http::StatusCode::from_u16(status).unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
    resp
}

pub async fn metrics_handler() -> Response {
    let Some(m) = METRICS.as_ref() else { return plain(503, "metrics not initialized") };
    let mut buf = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(e) = encoder.encode(&m.registry.gather(), &mut buf) {
        return plain(500, format!("encode error: {e}"));
    }
    let mut resp = plain(200, buf);
    if let Ok(ct) = axum::http::HeaderValue::from_str(encoder.format_type()) {
        resp.headers_mut().insert(axum::http::header::CONTENT_TYPE, ct);
    }
    resp
}
