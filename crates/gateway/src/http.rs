use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::AtomicI64;
use std::time::{Duration, Instant};

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tbac_contracts::{ADMIN_SETTINGS_PATH, SearchRequest, SearchResponse};
use tbac_policy::PolicyDecisionPoint;
use tbac_settings::{MemorySettingsStore, PgSettingsStore, SettingsStore, VersionedSettingsCache};
use tracing::Instrument;
use ulid::Ulid;

use crate::config::{GatewayConfig, SettingsStoreKind, StartupError};
use crate::pdp::{HttpPdp, HttpPdpConfig};
use crate::pipeline::{DecisionPipeline, PipelineOptions};
use crate::processor::SearchFilter;

mod admin;

const REQUEST_ID_HEADER: &str = "x-tbac-request-id";

#[derive(Clone)]
pub struct AppState {
    pub config: GatewayConfig,
    filter: SearchFilter,
    store: Arc<dyn SettingsStore>,
    pdp: Arc<dyn PolicyDecisionPoint>,
    last_settings_version: Arc<AtomicI64>,
}

impl AppState {
    fn cache(&self) -> &Arc<VersionedSettingsCache> {
        self.filter.cache()
    }
}

type ApiError = (StatusCode, Json<ErrorResponse>);

pub async fn router(config: GatewayConfig) -> Result<Router, StartupError> {
    let store: Arc<dyn SettingsStore> = match config.settings_store {
        SettingsStoreKind::Memory => Arc::new(MemorySettingsStore::new()),
        SettingsStoreKind::Postgres => {
            let db_url = config.db_url.as_deref().ok_or_else(|| StartupError {
                code: "ERR_MISSING_CONFIG",
                message: "TBAC_DB_URL is required for the postgres settings store".to_string(),
            })?;

            let store = PgSettingsStore::connect_and_migrate(
                db_url,
                Duration::from_millis(config.settings_write_timeout_ms),
            )
            .await
            .map_err(|err| StartupError {
                code: "ERR_SETTINGS_STORE_UNAVAILABLE",
                message: format!("failed to initialize settings store: {}", err),
            })?;
            Arc::new(store)
        }
    };

    let pdp = HttpPdp::new(HttpPdpConfig {
        base_url: config.pdp_url.clone(),
        decision_path: config.pdp_decision_path.clone(),
        bootstrap_path: config.pdp_bootstrap_path.clone(),
        timeout: Duration::from_millis(config.pdp_timeout_ms),
    })
    .map_err(|_| StartupError {
        code: "ERR_PDP_UNAVAILABLE",
        message: "failed to initialize policy decision point client".to_string(),
    })?;

    Ok(build_router(config, store, Arc::new(pdp)))
}

/// Router over explicitly provided store and PDP; `router` wires the real ones.
pub fn build_router(
    config: GatewayConfig,
    store: Arc<dyn SettingsStore>,
    pdp: Arc<dyn PolicyDecisionPoint>,
) -> Router {
    let cache = Arc::new(
        VersionedSettingsCache::new(store.clone(), pdp.clone()).with_observer(Arc::new(
            |outcome| crate::metrics::observe_settings_reload(outcome.as_str()),
        )),
    );

    let pipeline = DecisionPipeline::new(
        pdp.clone(),
        PipelineOptions {
            on_decision_error: config.decision_error_policy,
            averaging: config.decision_time_averaging,
            decision_timeout: Some(Duration::from_millis(config.pdp_timeout_ms)),
        },
    );

    let state = AppState {
        config,
        filter: SearchFilter::new(cache, pipeline),
        store,
        pdp,
        last_settings_version: Arc::new(AtomicI64::new(0)),
    };

    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .route("/v1/search/filter", post(filter_search))
        .route(
            ADMIN_SETTINGS_PATH,
            get(admin::get_settings).put(admin::put_settings),
        )
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
struct ReadyzResponse {
    status: &'static str,
    checks: BTreeMap<&'static str, bool>,
}

async fn readyz(State(state): State<AppState>) -> impl IntoResponse {
    let mut checks = BTreeMap::new();

    let store_ready = tokio::time::timeout(
        Duration::from_millis(state.config.settings_write_timeout_ms.max(50)),
        state.store.read(),
    )
    .await
    .is_ok_and(|res| res.is_ok());
    checks.insert("settings_store", store_ready);

    let pdp_ready = state.pdp.ready().await.is_ok();
    checks.insert("pdp", pdp_ready);

    let all_ready = checks.values().all(|ok| *ok);
    let status = if all_ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(ReadyzResponse {
            status: if all_ready { "ready" } else { "not_ready" },
            checks,
        }),
    )
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::render() {
        Ok((body, content_type)) => {
            let mut headers = HeaderMap::new();
            if let Ok(value) = HeaderValue::from_str(content_type.as_str()) {
                headers.insert(header::CONTENT_TYPE, value);
            }
            (headers, body).into_response()
        }
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct FilterRequest {
    request: SearchRequest,
    response: SearchResponse,
}

async fn filter_search(
    State(state): State<AppState>,
    headers: HeaderMap,
    req: Result<Json<FilterRequest>, JsonRejection>,
) -> Result<(HeaderMap, Json<SearchResponse>), ApiError> {
    let started = Instant::now();
    let request_id = extract_request_id(&headers);

    let result = async {
        let Json(req) = req.map_err(|_| {
            json_error(
                StatusCode::BAD_REQUEST,
                "ERR_INVALID_PARAMS",
                "invalid JSON body".to_string(),
                false,
            )
        })?;

        let span = tracing::info_span!(
            "search.filter",
            request_id = %request_id,
            hits = tracing::field::Empty,
            authorized = tracing::field::Empty,
            latency_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let response = async {
            let started = Instant::now();
            let (response, outcome) = state.filter.process(&req.request, req.response).await;
            tracing::Span::current().record("latency_ms", started.elapsed().as_millis() as u64);
            tracing::Span::current().record("outcome", outcome.as_str());
            response
        }
        .instrument(span)
        .await;

        let mut headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(request_id.as_str()) {
            headers.insert(REQUEST_ID_HEADER, value);
        }
        Ok((headers, Json(response)))
    }
    .await;

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    crate::metrics::observe_http_request(
        "/v1/search/filter",
        "POST",
        status.as_u16(),
        started.elapsed(),
    );
    result
}

fn extract_request_id(headers: &HeaderMap) -> String {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .and_then(sanitize_request_id)
        .unwrap_or_else(|| Ulid::new().to_string())
}

fn sanitize_request_id(raw: &str) -> Option<String> {
    const MAX_LEN: usize = 64;
    let mut out = String::with_capacity(raw.len().min(MAX_LEN));

    for ch in raw.chars() {
        if out.len() >= MAX_LEN {
            break;
        }
        if ch.is_ascii_alphanumeric() || matches!(ch, '-' | '_' | '.') {
            out.push(ch);
        }
    }

    (!out.is_empty()).then_some(out)
}

#[derive(Debug, Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
    retryable: bool,
}

fn json_error(
    status: StatusCode,
    code: impl Into<String>,
    message: impl Into<String>,
    retryable: bool,
) -> (StatusCode, Json<ErrorResponse>) {
    (
        status,
        Json(ErrorResponse {
            code: code.into(),
            message: message.into(),
            retryable,
        }),
    )
}
