//! Per-source model slots with lazy, single-flight loading and explicit
//! invalidation.
//!
//! A slot is either empty or holds a fully usable handle. Readers never take
//! a lock once a handle is present. While a load is running, every caller
//! joins that attempt and receives its outcome, success or failure. Failed
//! attempts are not cached: the next caller after one finishes starts anew.

use crate::loader::{LoadError, ModelHandle, ModelLoader, ModelMeta, SourceKind};
use crate::telemetry;
use arc_swap::ArcSwapOption;
use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use severity_core::ModelError;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, error, info, warn};

#[derive(Debug, Error)]
#[error("{kind} model unavailable: {cause}")]
pub struct ResolveError {
    pub kind: SourceKind,
    /// Shared by every caller that joined the failed attempt.
    #[source]
    pub cause: Arc<LoadError>,
}

#[derive(Debug, Error)]
pub enum PredictError {
    #[error(transparent)]
    Unavailable(#[from] ResolveError),
    #[error("prediction failed on {kind} model: {source}")]
    Failed { kind: SourceKind, #[source] source: ModelError },
}

#[derive(Debug, Clone, Serialize)]
pub struct Prediction {
    pub severity: String,
    pub meta: ModelMeta,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthStatus {
    pub loaded: bool,
    pub source: SourceKind,
    pub meta: Option<ModelMeta>,
    pub error: Option<String>,
}

type LoadResult = Result<Arc<ModelHandle>, Arc<LoadError>>;
type Attempt = Shared<BoxFuture<'static, LoadResult>>;

struct SlotState {
    loader: Arc<dyn ModelLoader>,
    cell: ArcSwapOption<ModelHandle>,
    /// The running attempt, tagged with its id. Cleared by the attempt itself
    /// when it finishes, so late callers never join a completed failure.
    inflight: Mutex<Option<(u64, Attempt)>>,
    next_attempt: AtomicU64,
    // Bumped by invalidate so an attempt that was already running cannot
    // repopulate a slot cleared underneath it.
    generation: AtomicU64,
}

impl SlotState {
    fn current(&self) -> Option<Arc<ModelHandle>> { self.cell.load_full() }

    async fn attempt(self: Arc<Self>, id: u64) -> LoadResult {
        let generation = self.generation.load(Ordering::Acquire);
        let kind = self.loader.kind();
        let location = self.loader.describe();
        let started = Instant::now();
        let res = self.loader.load().await;
        let elapsed = started.elapsed();

        let res = match res {
            Ok(handle) => {
                telemetry::record_load(kind.as_str(), "loaded", elapsed);
                info!(source = %kind, location = %location, sha256 = %handle.meta.sha256, version = ?handle.meta.version, elapsed_ms = elapsed.as_millis() as u64, "model loaded");
                Ok(Arc::new(handle))
            }
            Err(e) => {
                telemetry::record_load(kind.as_str(), e.outcome(), elapsed);
                if e.is_anomaly() {
                    error!(source = %kind, location = %location, outcome = e.outcome(), error = %e, "model load failed");
                } else {
                    warn!(source = %kind, location = %location, outcome = e.outcome(), error = %e, "model not available");
                }
                Err(Arc::new(e))
            }
        };

        let mut inflight = self.inflight.lock();
        if let Ok(handle) = &res {
            if self.generation.load(Ordering::Acquire) == generation {
                self.cell.store(Some(handle.clone()));
            } else {
                debug!(source = %kind, "slot invalidated during load; result not cached");
            }
        }
        if matches!(inflight.as_ref(), Some((current, _)) if *current == id) {
            *inflight = None;
        }
        res
    }
}

struct Slot(Arc<SlotState>);

impl Slot {
    fn new(loader: Arc<dyn ModelLoader>) -> Self {
        Self(Arc::new(SlotState {
            loader,
            cell: ArcSwapOption::empty(),
            inflight: Mutex::new(None),
            next_attempt: AtomicU64::new(0),
            generation: AtomicU64::new(0),
        }))
    }

    fn current(&self) -> Option<Arc<ModelHandle>> { self.0.current() }

    async fn resolve(&self) -> LoadResult {
        if let Some(h) = self.current() { return Ok(h); }
        let attempt = {
            let mut inflight = self.0.inflight.lock();
            if let Some(h) = self.current() { return Ok(h); }
            match inflight.as_ref() {
                Some((_, running)) => {
                    debug!(source = %self.0.loader.kind(), "joined in-flight load");
                    running.clone()
                }
                None => {
                    let id = self.0.next_attempt.fetch_add(1, Ordering::Relaxed);
                    let fresh = self.0.clone().attempt(id).boxed().shared();
                    *inflight = Some((id, fresh.clone()));
                    fresh
                }
            }
        };
        attempt.await
    }

    fn invalidate(&self) {
        let mut inflight = self.0.inflight.lock();
        self.0.generation.fetch_add(1, Ordering::AcqRel);
        self.0.cell.store(None);
        *inflight = None;
    }
}

pub struct ModelResolver {
    default_source: SourceKind,
    local: Slot,
    registry: Slot,
}

impl ModelResolver {
    pub fn new(default_source: SourceKind, local: Arc<dyn ModelLoader>, registry: Arc<dyn ModelLoader>) -> Self {
        Self { default_source, local: Slot::new(local), registry: Slot::new(registry) }
    }

    pub fn default_source(&self) -> SourceKind { self.default_source }

    fn slot(&self, kind: SourceKind) -> &Slot {
        match kind { SourceKind::Local => &self.local, SourceKind::Registry => &self.registry }
    }

    /// Cached handle, or one load attempt shared by all concurrent callers.
    pub async fn resolve(&self, kind: SourceKind) -> Result<Arc<ModelHandle>, ResolveError> {
        self.slot(kind).resolve().await.map_err(|cause| ResolveError { kind, cause })
    }

    /// Handle currently cached for `kind`, without loading.
    pub fn peek(&self, kind: SourceKind) -> Option<Arc<ModelHandle>> { self.slot(kind).current() }

    pub fn invalidate(&self, kind: SourceKind) {
        self.slot(kind).invalidate();
        info!(source = %kind, "model slot invalidated");
    }

    pub fn invalidate_all(&self) {
        self.invalidate(SourceKind::Local);
        self.invalidate(SourceKind::Registry);
    }

    /// Drop every cached model, then load the default source eagerly.
    pub async fn reload(&self) -> Result<Arc<ModelHandle>, ResolveError> {
        self.invalidate_all();
        self.resolve(self.default_source).await
    }

    pub async fn predict(&self, text: &str, kind: SourceKind) -> Result<Prediction, PredictError> {
        let handle = match self.resolve(kind).await {
            Ok(h) => h,
            Err(e) => {
                telemetry::record_prediction(kind.as_str(), "unavailable");
                return Err(e.into());
            }
        };
        let input = [text.to_string()];
        // A failing prediction leaves the slot untouched.
        let severity = handle
            .predictor
            .predict(&input)
            .and_then(|out| out.into_iter().next().ok_or(ModelError::NoLabels))
            .map_err(|source| {
                telemetry::record_prediction(kind.as_str(), "failed");
                PredictError::Failed { kind, source }
            })?;
        telemetry::record_prediction(kind.as_str(), "ok");
        Ok(Prediction { severity, meta: handle.meta.clone() })
    }

    /// Never errors; failures become `loaded: false` with a message.
    pub async fn health(&self, kind: SourceKind) -> HealthStatus {
        match self.resolve(kind).await {
            Ok(h) => HealthStatus { loaded: true, source: kind, meta: Some(h.meta.clone()), error: None },
            Err(e) => HealthStatus { loaded: false, source: kind, meta: None, error: Some(e.cause.to_string()) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::LocalArtifactLoader;
    use async_trait::async_trait;
    use severity_core::{Predictor, SeverityModel, TrainConfig};
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    struct FixedPredictor(String);

    impl Predictor for FixedPredictor {
        fn predict(&self, texts: &[String]) -> Result<Vec<String>, ModelError> {
            if texts.iter().any(|t| t == "boom") { return Err(ModelError::NoLabels); }
            Ok(texts.iter().map(|_| self.0.clone()).collect())
        }
        fn labels(&self) -> &[String] { std::slice::from_ref(&self.0) }
    }

    struct CountingLoader {
        kind: SourceKind,
        calls: AtomicUsize,
        fail: bool,
        delay: Duration,
    }

    impl CountingLoader {
        fn ok(kind: SourceKind) -> Arc<Self> { Arc::new(Self { kind, calls: AtomicUsize::new(0), fail: false, delay: Duration::ZERO }) }
        fn failing(kind: SourceKind) -> Arc<Self> { Arc::new(Self { kind, calls: AtomicUsize::new(0), fail: true, delay: Duration::ZERO }) }
        fn slow(kind: SourceKind, delay: Duration) -> Arc<Self> { Arc::new(Self { kind, calls: AtomicUsize::new(0), fail: false, delay }) }
        fn slow_failing(kind: SourceKind, delay: Duration) -> Arc<Self> { Arc::new(Self { kind, calls: AtomicUsize::new(0), fail: true, delay }) }
        fn calls(&self) -> usize { self.calls.load(Ordering::SeqCst) }
    }

    #[async_trait]
    impl ModelLoader for CountingLoader {
        fn kind(&self) -> SourceKind { self.kind }
        fn describe(&self) -> String { format!("counting-{}", self.kind) }
        async fn load(&self) -> Result<ModelHandle, LoadError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if !self.delay.is_zero() { tokio::time::sleep(self.delay).await; }
            if self.fail { return Err(LoadError::RegistryNotConfigured); }
            let meta = ModelMeta {
                source: self.kind,
                path: None,
                name: None,
                stage: None,
                version: Some(n.to_string()),
                model_uri: None,
                tracking_uri: None,
                sha256: format!("sha-{n}"),
                labels: vec!["major".into()],
                loaded_at: "now".into(),
            };
            Ok(ModelHandle { predictor: Arc::new(FixedPredictor("major".into())), meta })
        }
    }

    fn resolver(local: Arc<CountingLoader>, registry: Arc<CountingLoader>) -> ModelResolver {
        ModelResolver::new(SourceKind::Local, local, registry)
    }

    #[tokio::test]
    async fn repeated_resolve_loads_once() {
        let local = CountingLoader::ok(SourceKind::Local);
        let r = resolver(local.clone(), CountingLoader::ok(SourceKind::Registry));
        let a = r.resolve(SourceKind::Local).await.unwrap();
        let b = r.resolve(SourceKind::Local).await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(local.calls(), 1);
    }

    #[tokio::test]
    async fn invalidate_forces_exactly_one_new_load() {
        let local = CountingLoader::ok(SourceKind::Local);
        let r = resolver(local.clone(), CountingLoader::ok(SourceKind::Registry));
        r.resolve(SourceKind::Local).await.unwrap();
        r.invalidate(SourceKind::Local);
        assert!(r.peek(SourceKind::Local).is_none());
        let h = r.resolve(SourceKind::Local).await.unwrap();
        r.resolve(SourceKind::Local).await.unwrap();
        assert_eq!(local.calls(), 2);
        assert_eq!(h.meta.sha256, "sha-2");
    }

    #[tokio::test]
    async fn concurrent_first_requests_share_one_load() {
        let local = CountingLoader::slow(SourceKind::Local, Duration::from_millis(50));
        let r = Arc::new(resolver(local.clone(), CountingLoader::ok(SourceKind::Registry)));
        let tasks: Vec<_> = (0..16)
            .map(|_| { let r = r.clone(); tokio::spawn(async move { r.resolve(SourceKind::Local).await.map(|h| h.meta.sha256.clone()) }) })
            .collect();
        for t in tasks { assert_eq!(t.await.unwrap().unwrap(), "sha-1"); }
        assert_eq!(local.calls(), 1);
    }

    #[tokio::test]
    async fn concurrent_waiters_share_a_failed_attempt() {
        let registry = CountingLoader::slow_failing(SourceKind::Registry, Duration::from_millis(100));
        let r = Arc::new(resolver(CountingLoader::ok(SourceKind::Local), registry.clone()));
        let started = std::time::Instant::now();
        let tasks: Vec<_> = (0..8)
            .map(|_| { let r = r.clone(); tokio::spawn(async move { r.resolve(SourceKind::Registry).await.map(|_| ()) }) })
            .collect();
        for t in tasks {
            let err = t.await.unwrap().unwrap_err();
            assert_eq!(err.cause.outcome(), "not_configured");
        }
        assert_eq!(registry.calls(), 1);
        assert!(started.elapsed() < Duration::from_millis(400), "waiters ran their own loads: {:?}", started.elapsed());

        // The failure was not cached: the next caller tries again.
        assert!(r.resolve(SourceKind::Registry).await.is_err());
        assert_eq!(registry.calls(), 2);
    }

    #[tokio::test]
    async fn registry_failure_leaves_local_health_intact() {
        let local = CountingLoader::ok(SourceKind::Local);
        let registry = CountingLoader::failing(SourceKind::Registry);
        let r = resolver(local.clone(), registry.clone());

        let h = r.health(SourceKind::Registry).await;
        assert!(!h.loaded);
        assert!(h.error.unwrap().contains("not configured"));

        let h = r.health(SourceKind::Local).await;
        assert!(h.loaded);
        assert!(h.error.is_none());
        let meta = h.meta.unwrap();
        assert_eq!(meta.source, SourceKind::Local);
        assert_eq!(meta.sha256, "sha-1");
        assert_eq!((local.calls(), registry.calls()), (1, 1));
    }

    #[tokio::test]
    async fn failures_are_not_cached_and_stay_per_source() {
        let local = CountingLoader::ok(SourceKind::Local);
        let registry = CountingLoader::failing(SourceKind::Registry);
        let r = resolver(local.clone(), registry.clone());

        let err = r.resolve(SourceKind::Registry).await.unwrap_err();
        assert_eq!(err.kind, SourceKind::Registry);
        assert!(r.resolve(SourceKind::Registry).await.is_err());
        assert_eq!(registry.calls(), 2);

        let p = r.predict("crash on save", SourceKind::Local).await.unwrap();
        assert_eq!(p.severity, "major");
        assert_eq!(p.meta.source, SourceKind::Local);
    }

    #[tokio::test]
    async fn prediction_failure_keeps_the_slot_loaded() {
        let local = CountingLoader::ok(SourceKind::Local);
        let r = resolver(local.clone(), CountingLoader::ok(SourceKind::Registry));
        let err = r.predict("boom", SourceKind::Local).await.unwrap_err();
        assert!(matches!(err, PredictError::Failed { kind: SourceKind::Local, .. }));
        assert!(r.peek(SourceKind::Local).is_some());
        r.predict("ok now", SourceKind::Local).await.unwrap();
        assert_eq!(local.calls(), 1);
    }

    #[tokio::test]
    async fn unavailable_source_maps_to_unavailable() {
        let r = resolver(CountingLoader::ok(SourceKind::Local), CountingLoader::failing(SourceKind::Registry));
        let err = r.predict("x", SourceKind::Registry).await.unwrap_err();
        assert!(matches!(err, PredictError::Unavailable(ResolveError { kind: SourceKind::Registry, .. })));
    }

    #[tokio::test]
    async fn health_reports_missing_model_without_error() {
        let r = resolver(CountingLoader::failing(SourceKind::Local), CountingLoader::ok(SourceKind::Registry));
        let h = r.health(SourceKind::Local).await;
        assert!(!h.loaded);
        assert!(h.meta.is_none());
        assert!(h.error.is_some());
        let h = r.health(SourceKind::Registry).await;
        assert!(h.loaded);
    }

    #[tokio::test]
    async fn invalidate_during_load_does_not_resurrect_old_handle() {
        let local = CountingLoader::slow(SourceKind::Local, Duration::from_millis(60));
        let r = Arc::new(resolver(local.clone(), CountingLoader::ok(SourceKind::Registry)));
        let bg = { let r = r.clone(); tokio::spawn(async move { r.resolve(SourceKind::Local).await.map(|h| h.meta.sha256.clone()) }) };
        tokio::time::sleep(Duration::from_millis(10)).await;
        r.invalidate(SourceKind::Local);
        assert_eq!(bg.await.unwrap().unwrap(), "sha-1");
        assert!(r.peek(SourceKind::Local).is_none());
        assert_eq!(r.resolve(SourceKind::Local).await.unwrap().meta.sha256, "sha-2");
    }

    #[tokio::test]
    async fn reload_picks_up_a_replaced_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");
        let write = |labels: &[&str]| {
            let texts: Vec<String> = labels.iter().map(|l| format!("{l} report text")).collect();
            let labels: Vec<String> = labels.iter().map(|l| l.to_string()).collect();
            let m = SeverityModel::fit(&texts, &labels, &TrainConfig::default()).unwrap();
            std::fs::write(&path, m.to_json_vec().unwrap()).unwrap();
        };
        write(&["minor", "major"]);
        let r = ModelResolver::new(
            SourceKind::Local,
            Arc::new(LocalArtifactLoader::new(&path, None)),
            CountingLoader::failing(SourceKind::Registry),
        );
        let first = r.resolve(SourceKind::Local).await.unwrap();
        assert_eq!(first.meta.labels, vec!["major", "minor"]);

        write(&["blocker", "minor", "trivial"]);
        assert_eq!(r.resolve(SourceKind::Local).await.unwrap().meta.sha256, first.meta.sha256);
        let reloaded = r.reload().await.unwrap();
        assert_ne!(reloaded.meta.sha256, first.meta.sha256);
        assert_eq!(reloaded.meta.labels, vec!["blocker", "minor", "trivial"]);
    }

    #[tokio::test]
    async fn reload_with_missing_artifact_reports_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let r = ModelResolver::new(
            SourceKind::Local,
            Arc::new(LocalArtifactLoader::new(dir.path().join("absent.json"), None)),
            CountingLoader::ok(SourceKind::Registry),
        );
        let err = r.reload().await.unwrap_err();
        assert_eq!(err.cause.outcome(), "missing");
    }
}
