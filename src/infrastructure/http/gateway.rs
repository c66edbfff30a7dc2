//! API gateway: authenticated, rate-limited, validated ingress with
//! circuit-broken forwarding to named downstreams.

use std::sync::Arc;
use std::time::Duration;

use axum::body::to_bytes;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};

use crate::domain::errors::SwarmError;
use crate::infrastructure::config::{Config, DownstreamConfig};
use crate::services::circuit_breaker::{CircuitBreaker, CircuitBreakerPool};
use crate::services::rate_limiter::KeyedLimiterPool;
use crate::services::retry::RetryRunner;
use crate::services::validator::RequestValidator;

use super::middleware::{
    auth_layer, error_response, rate_limit_layer, request_id_layer, RequestContext,
};

/// Shared state of the gateway surface.
pub struct GatewayState {
    pub validator: RequestValidator,
    pub limiters: Arc<KeyedLimiterPool>,
    pub breakers: Arc<CircuitBreakerPool>,
    pub client: reqwest::Client,
    pub downstreams: DownstreamConfig,
    pub downstream_timeout: Duration,
    pub metrics_handle: PrometheusHandle,
}

impl GatewayState {
    pub fn from_config(config: &Config, metrics_handle: PrometheusHandle) -> Arc<Self> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(8)
            .build()
            .expect("reqwest client");
        Arc::new(Self {
            validator: RequestValidator::with_gateway_schemas(),
            limiters: Arc::new(KeyedLimiterPool::new(config.rate_limit.to_limiter_config())),
            breakers: Arc::new(CircuitBreakerPool::new(
                config.circuit_breaker.to_breaker_config(),
            )),
            client,
            downstreams: config.downstreams.clone(),
            downstream_timeout: Duration::from_secs(config.gateway.downstream_timeout_secs.max(1)),
            metrics_handle,
        })
    }
}

/// Build the gateway router. Health, metrics, and the internal introspection
/// endpoints bypass auth and rate limiting; `/v1/*` gets the full chain.
pub fn router(state: Arc<GatewayState>) -> Router {
    let protected = Router::new()
        .route("/v1/ingest", post(ingest))
        .route("/v1/threats", post(threats))
        .layer(middleware::from_fn_with_state(
            state.limiters.clone(),
            rate_limit_layer,
        ))
        .layer(middleware::from_fn(auth_layer));

    Router::new()
        .merge(protected)
        .route("/health", get(health))
        .route("/metrics", get(render_metrics))
        .route("/internal/circuit-breakers", get(circuit_breakers))
        .route("/internal/rate-limits", get(rate_limits))
        .layer(middleware::from_fn(request_id_layer))
        .with_state(state)
}

async fn health() -> Json<Value> {
    Json(json!({"status": "ok", "service": "gateway"}))
}

async fn render_metrics(State(state): State<Arc<GatewayState>>) -> String {
    state.metrics_handle.render()
}

async fn circuit_breakers(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    Json(json!({"circuit_breakers": state.breakers.snapshot().await}))
}

async fn rate_limits(State(state): State<Arc<GatewayState>>) -> Json<Value> {
    Json(json!({"rate_limits": state.limiters.snapshot().await}))
}

/// POST /v1/ingest: validate against `ingest_event`, forward to `detection`.
async fn ingest(State(state): State<Arc<GatewayState>>, request: Request) -> Response {
    handle_submit(state, request, "ingest_event", "detection", "/v1/ingest").await
}

/// POST /v1/threats: validate against `threat_report`, forward to
/// `threat-intel`.
async fn threats(State(state): State<Arc<GatewayState>>, request: Request) -> Response {
    handle_submit(state, request, "threat_report", "threat-intel", "/v1/threats").await
}

async fn handle_submit(
    state: Arc<GatewayState>,
    request: Request,
    schema: &'static str,
    downstream: &'static str,
    path: &'static str,
) -> Response {
    let (parts, body) = request.into_parts();
    let ctx = parts
        .extensions
        .get::<RequestContext>()
        .cloned()
        .unwrap_or(RequestContext {
            request_id: "unknown".into(),
            subject: None,
        });

    let max_size = state.validator.max_size(schema);
    let bytes = match to_bytes(body, max_size).await {
        Ok(bytes) => bytes,
        Err(_) => {
            counter!("swarm_api_validation_failed_total").increment(1);
            return error_response(&SwarmError::validation(
                "$body",
                format!("body exceeds {max_size} bytes or is unreadable"),
            ));
        }
    };

    let payload: Value = match serde_json::from_slice(&bytes) {
        Ok(value) => value,
        Err(e) => {
            counter!("swarm_api_validation_failed_total").increment(1);
            return error_response(&SwarmError::validation("$body", format!("invalid JSON: {e}")));
        }
    };

    if let Err(violation) = state.validator.validate(schema, &payload) {
        counter!("swarm_api_validation_failed_total").increment(1);
        let mut response = error_response(&SwarmError::validation(
            violation.field.clone(),
            violation.message.clone(),
        ));
        *response.status_mut() = StatusCode::BAD_REQUEST;
        return response;
    }

    match forward(&state, &ctx, downstream, path, &bytes).await {
        Ok(()) => {
            let (status, body) = match schema {
                "ingest_event" => (
                    StatusCode::ACCEPTED,
                    json!({"status": "accepted", "id": payload.get("id")}),
                ),
                _ => (
                    StatusCode::CREATED,
                    json!({"status": "recorded", "threat_id": payload.get("threat_id")}),
                ),
            };
            (status, Json(body)).into_response()
        }
        Err(err) => error_response(&err),
    }
}

/// Terminal outcome of a forwarding attempt that the retry policy must not
/// re-attempt.
enum ForwardOutcome {
    Delivered,
    Fatal(SwarmError),
}

/// Forward a validated payload to a named downstream through its circuit
/// breaker, retrying 5xx and transport failures per policy. Status >= 400
/// counts as a breaker failure; circuit-open maps to 503, exhausted or
/// non-retryable failures to 502.
async fn forward(
    state: &GatewayState,
    ctx: &RequestContext,
    downstream: &str,
    path: &str,
    body: &[u8],
) -> Result<(), SwarmError> {
    let base = state
        .downstreams
        .url_for(downstream)
        .ok_or_else(|| SwarmError::Internal(format!("unknown downstream '{downstream}'")))?;

    let url = format!("{}{}", base.trim_end_matches('/'), path);
    let runner = RetryRunner::new(2, Duration::from_millis(100));

    let attempt_state = (
        state.breakers.get(downstream).await,
        state.client.clone(),
        ctx.clone(),
        body.to_vec(),
    );
    let result = runner
        .run(|| {
            let (breaker, client, ctx, body) = attempt_state.clone();
            let url = url.clone();
            let downstream = downstream.to_string();
            let timeout = state.downstream_timeout;
            async move {
                match forward_once(&breaker, &client, &ctx, &downstream, &url, body, timeout)
                    .await
                {
                    Ok(()) => Ok(ForwardOutcome::Delivered),
                    Err(e) if e.is_retryable() => Err(e),
                    Err(e) => Ok(ForwardOutcome::Fatal(e)),
                }
            }
        })
        .await;

    match result {
        Ok(ForwardOutcome::Delivered) => Ok(()),
        Ok(ForwardOutcome::Fatal(e)) => Err(e),
        // An exhausted timeout surfaces like any other failed forward.
        Err(SwarmError::Timeout(_)) => Err(SwarmError::Downstream {
            service: downstream.to_string(),
            status: 504,
        }),
        Err(e) => Err(e),
    }
}

async fn forward_once(
    breaker: &CircuitBreaker,
    client: &reqwest::Client,
    ctx: &RequestContext,
    downstream: &str,
    url: &str,
    body: Vec<u8>,
    timeout: Duration,
) -> Result<(), SwarmError> {
    if !breaker.allow() {
        counter!("swarm_api_circuit_open_total", "service" => downstream.to_string())
            .increment(1);
        return Err(SwarmError::CircuitOpen {
            service: downstream.to_string(),
        });
    }

    let result = client
        .post(url)
        .timeout(timeout)
        .header("content-type", "application/json")
        .header("x-request-id", &ctx.request_id)
        .header("x-forwarded-by", "swarmguard-gateway")
        .header("traceparent", ctx.traceparent())
        .body(body)
        .send()
        .await;

    match result {
        Ok(response) if response.status().as_u16() < 400 => {
            breaker.record(true);
            Ok(())
        }
        Ok(response) => {
            breaker.record(false);
            Err(SwarmError::Downstream {
                service: downstream.to_string(),
                status: response.status().as_u16(),
            })
        }
        Err(e) => {
            breaker.record(false);
            if e.is_timeout() {
                Err(SwarmError::Timeout(timeout))
            } else {
                Err(SwarmError::Downstream {
                    service: downstream.to_string(),
                    status: 502,
                })
            }
        }
    }
}

/// Bind and serve the gateway until the shutdown signal resolves.
pub async fn serve(
    state: Arc<GatewayState>,
    port: u16,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "gateway listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
