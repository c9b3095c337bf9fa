use crate::loader::SourceKind;
use crate::resolver::{ModelResolver, PredictError};
use crate::telemetry::metrics_handler;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use severity_core::report_text;
use std::sync::Arc;
use tracing::{error, info};

#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<ModelResolver>,
}

#[derive(Debug, Deserialize)]
pub struct BugReport {
    pub title: String,
    pub description: String,
}

impl BugReport {
    fn text(&self) -> String { report_text(&self.title, &self.description) }
}

pub struct ApiError { status: StatusCode, detail: String }

impl IntoResponse for ApiError {
    fn into_response(self) -> Response { (self.status, Json(json!({ "detail": self.detail }))).into_response() }
}

impl From<PredictError> for ApiError {
    fn from(e: PredictError) -> Self {
        match e {
            PredictError::Unavailable(cause) => {
                let detail = if cause.kind == SourceKind::Local {
                    format!("Model not loaded. Train first or check the artifact: {}", cause.cause)
                } else {
                    format!("Registry model unavailable: {}", cause.cause)
                };
                Self { status: StatusCode::SERVICE_UNAVAILABLE, detail }
            }
            failed @ PredictError::Failed { .. } => {
                error!(error = %failed, "prediction failed");
                Self { status: StatusCode::INTERNAL_SERVER_ERROR, detail: failed.to_string() }
            }
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/predict", post(predict))
        .route("/predict/registry", post(predict_registry))
        .route("/reload", post(reload))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

/// Meta fields are flattened next to the status keys.
fn merge(mut base: Value, extra: impl serde::Serialize) -> Value {
    if let (Some(obj), Ok(Value::Object(more))) = (base.as_object_mut(), serde_json::to_value(extra)) {
        for (k, v) in more { obj.entry(k).or_insert(v); }
    }
    base
}

async fn health(State(st): State<AppState>) -> Json<Value> {
    let source = st.resolver.default_source();
    let h = st.resolver.health(source).await;
    let mut body = json!({
        "status": if h.loaded { "ok" } else { "degraded" },
        "model_loaded": h.loaded,
        "source_mode": source,
    });
    if let Some(meta) = &h.meta { body = merge(body, meta); }
    if let Some(err) = h.error { body["error"] = Value::String(err); }
    Json(body)
}

async fn predict(State(st): State<AppState>, Json(report): Json<BugReport>) -> Result<Json<Value>, ApiError> {
    let p = st.resolver.predict(&report.text(), st.resolver.default_source()).await?;
    Ok(Json(json!({ "severity": p.severity })))
}

async fn predict_registry(State(st): State<AppState>, Json(report): Json<BugReport>) -> Result<Json<Value>, ApiError> {
    let p = st.resolver.predict(&report.text(), SourceKind::Registry).await?;
    Ok(Json(json!({ "severity": p.severity, "meta": p.meta })))
}

async fn reload(State(st): State<AppState>) -> Result<Json<Value>, ApiError> {
    let source = st.resolver.default_source();
    match st.resolver.reload().await {
        Ok(h) => {
            info!(source = %source, sha256 = %h.meta.sha256, "reload complete");
            Ok(Json(json!({ "status": "reloaded", "source_mode": source, "meta": h.meta })))
        }
        Err(e) => Err(ApiError { status: StatusCode::SERVICE_UNAVAILABLE, detail: format!("Reload failed: {}", e.cause) }),
    }
}
