//! Signature engine HTTP surface: scan, reload, rule listing, and stats.

use std::sync::Arc;
use std::time::Instant;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};

use crate::domain::errors::SwarmError;
use crate::services::signature::{HotReloadScanner, ScanMetricsCollector, StreamScanner};

/// Bodies above this size go through the chunked scanner.
const STREAMING_THRESHOLD: usize = 256 * 1024;

pub struct ScannerState {
    pub scanner: Arc<HotReloadScanner>,
    pub collector: Arc<ScanMetricsCollector>,
    pub metrics_handle: PrometheusHandle,
}

pub fn router(state: Arc<ScannerState>) -> Router {
    Router::new()
        .route("/scan", post(scan))
        .route("/reload", post(reload))
        .route("/v1/rules/reload", post(reload))
        .route("/v1/rules", get(rules))
        .route("/stats", get(stats))
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .layer(axum::middleware::from_fn(super::middleware::request_id_layer))
        // Scan inputs can be large; the chunked scanner handles them.
        .layer(axum::extract::DefaultBodyLimit::max(64 * 1024 * 1024))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "service": "scanner"}))
}

async fn render_metrics(State(state): State<Arc<ScannerState>>) -> String {
    state.metrics_handle.render()
}

/// POST /scan: the raw body is the input buffer; the response is the match
/// list plus rule-count and version headers.
async fn scan(State(state): State<Arc<ScannerState>>, body: Bytes) -> Response {
    let automaton = state.scanner.automaton();
    let started = Instant::now();
    let matches = if body.len() > STREAMING_THRESHOLD {
        StreamScanner::with_defaults(automaton.clone()).scan_bytes_chunked(&body)
    } else {
        automaton.scan(&body)
    };
    state.collector.record_scan(started.elapsed(), body.len(), &matches);

    let mut headers = HeaderMap::new();
    headers.insert(
        "x-rule-count",
        HeaderValue::from_str(&automaton.rule_count().to_string())
            .unwrap_or(HeaderValue::from_static("0")),
    );
    headers.insert(
        "x-scanner-version",
        HeaderValue::from_str(automaton.build_hash())
            .unwrap_or(HeaderValue::from_static("unknown")),
    );

    (StatusCode::OK, headers, Json(matches)).into_response()
}

/// POST /reload (alias /v1/rules/reload): force a reload check now.
async fn reload(State(state): State<Arc<ScannerState>>) -> Result<Json<Value>, SwarmError> {
    let outcome = state.scanner.reload().await.inspect_err(|_| {
        state.collector.record_error();
    })?;
    let automaton = state.scanner.automaton();
    Ok(Json(json!({
        "status": format!("{outcome:?}").to_lowercase(),
        "rule_count": automaton.rule_count(),
        "build_hash": automaton.build_hash(),
    })))
}

/// GET /v1/rules: rule metadata without pattern bytes.
async fn rules(State(state): State<Arc<ScannerState>>) -> Json<Value> {
    let automaton = state.scanner.automaton();
    let rules: Vec<Value> = automaton
        .rules()
        .iter()
        .map(|r| {
            json!({
                "id": r.id,
                "kind": r.kind,
                "severity": r.severity,
                "version": r.version,
                "enabled": r.enabled,
                "sample_percent": r.sample_percent,
                "tags": r.tags,
                "pattern_len": r.pattern.len(),
            })
        })
        .collect();
    Json(json!({
        "build_hash": automaton.build_hash(),
        "rule_count": automaton.rule_count(),
        "rules": rules,
    }))
}

/// GET /stats: collector snapshot.
async fn stats(State(state): State<Arc<ScannerState>>) -> Json<Value> {
    Json(json!({"stats": state.collector.snapshot()}))
}

/// Bind and serve the scanner surface until shutdown resolves.
pub async fn serve(
    state: Arc<ScannerState>,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "scanner listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
