use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use axum::Json;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode, header};
use serde::Serialize;
use tbac_contracts::ADMIN_SETTINGS_PATH;

use super::{ApiError, AppState, json_error};

const ADMIN_SECRET_HEADER: &str = "x-tbac-admin-secret";

#[derive(Debug, Serialize)]
pub(super) struct AcknowledgedResponse {
    acknowledged: bool,
}

pub(super) async fn get_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<serde_json::Value>, ApiError> {
    let started = Instant::now();

    let result = async {
        validate_admin_secret(&headers, state.config.admin_shared_secret.as_deref())?;

        match state.cache().current().await {
            Some(snapshot) => Ok(Json(snapshot.to_document_value())),
            None => {
                tracing::warn!("no valid authorization settings loaded");
                Ok(Json(serde_json::json!({})))
            }
        }
    }
    .await;

    let status = match &result {
        Ok(_) => StatusCode::OK,
        Err((status, _)) => *status,
    };
    observe(status, "GET", started);
    result
}

pub(super) async fn put_settings(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<(StatusCode, Json<AcknowledgedResponse>), ApiError> {
    let started = Instant::now();

    let result = async {
        validate_admin_secret(&headers, state.config.admin_shared_secret.as_deref())?;

        if !is_json_content_type(&headers) {
            return Err(json_error(
                StatusCode::NOT_ACCEPTABLE,
                "ERR_UNEXPECTED_CONTENT_TYPE",
                "Unexpected Content-Type header".to_string(),
                false,
            ));
        }

        // The document is stored as sent; parsing only validates its shape.
        let payload = match serde_json::from_slice::<serde_json::Value>(&body) {
            Ok(serde_json::Value::Object(_)) => std::str::from_utf8(&body).ok(),
            _ => None,
        }
        .ok_or_else(|| {
            json_error(
                StatusCode::BAD_REQUEST,
                "ERR_INVALID_PARAMS",
                "settings body must be a JSON object".to_string(),
                false,
            )
        })?;

        let write = async {
            let stored = state.store.read().await?;
            let version = next_version(
                &state.last_settings_version,
                stored.version.unwrap_or(0),
                unix_epoch_ms_now(),
            );
            let acknowledged = state.store.write(&payload, version).await?;
            Ok::<_, tbac_settings::StoreError>((acknowledged, version))
        };

        let (acknowledged, version) = tokio::time::timeout(
            Duration::from_millis(state.config.settings_write_timeout_ms),
            write,
        )
        .await
        .map_err(|_| {
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "ERR_SETTINGS_STORE_TIMEOUT",
                "settings write timed out".to_string(),
                true,
            )
        })?
        .map_err(|err| {
            tracing::error!(error = %err, "settings write failed");
            json_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "ERR_SETTINGS_STORE_UNAVAILABLE",
                "failed to write settings".to_string(),
                true,
            )
        })?;

        if !acknowledged {
            tracing::warn!(version, "settings write was not acknowledged");
            return Ok((
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(AcknowledgedResponse {
                    acknowledged: false,
                }),
            ));
        }

        state.cache().invalidate();
        tracing::info!(version, "authorization settings updated");
        Ok((
            StatusCode::OK,
            Json(AcknowledgedResponse { acknowledged: true }),
        ))
    }
    .await;

    let status = match &result {
        Ok((status, _)) => *status,
        Err((status, _)) => *status,
    };
    observe(status, "PUT", started);
    result
}

fn observe(status: StatusCode, method: &str, started: Instant) {
    crate::metrics::observe_http_request(
        ADMIN_SETTINGS_PATH,
        method,
        status.as_u16(),
        started.elapsed(),
    );
}

fn validate_admin_secret(headers: &HeaderMap, expected_secret: Option<&str>) -> Result<(), ApiError> {
    let Some(expected_secret) = expected_secret else {
        return Ok(());
    };

    let provided_secret = headers
        .get(ADMIN_SECRET_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.trim())
        .filter(|v| !v.is_empty())
        .ok_or_else(|| {
            json_error(
                StatusCode::UNAUTHORIZED,
                "ERR_AUTH_REQUIRED",
                "missing admin secret".to_string(),
                false,
            )
        })?;

    if provided_secret != expected_secret {
        return Err(json_error(
            StatusCode::UNAUTHORIZED,
            "ERR_AUTH_INVALID",
            "invalid admin secret".to_string(),
            false,
        ));
    }

    Ok(())
}

fn is_json_content_type(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(';').next())
        .is_some_and(|mime| mime.trim().eq_ignore_ascii_case("application/json"))
}

/// Next settings version: wall-clock milliseconds, but always past both the
/// version already in the store and the last one this node wrote.
fn next_version(last_written: &AtomicI64, stored: i64, now_ms: i64) -> i64 {
    let floor = stored.saturating_add(1).max(now_ms);
    let previous = last_written
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(floor.max(last.saturating_add(1)))
        })
        .unwrap_or_else(|last| last);
    floor.max(previous.saturating_add(1))
}

fn unix_epoch_ms_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
