use std::time::Instant;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use metrics::{counter, histogram};
use serde::Deserialize;
use serde_json::json;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::problem::ProblemResponse;
use crate::router::AppState;

const HEADER_TIMESTAMP: &str = "X-Hook-Timestamp";
const HEADER_SIGNATURE: &str = "X-Hook-Signature";
const MAX_SKEW_SECS: i64 = 600;

#[derive(Debug, Deserialize)]
struct LifecycleEvent {
    event: String,
    user_id: i64,
    #[serde(default)]
    email: Option<String>,
}

#[derive(Debug, Clone, Copy)]
enum EventKind {
    UserCreated,
    UserUpdated,
    LoginSucceeded,
}

impl EventKind {
    fn metric_label(self) -> &'static str {
        match self {
            Self::UserCreated => "user.created",
            Self::UserUpdated => "user.updated",
            Self::LoginSucceeded => "login.succeeded",
        }
    }
}

impl TryFrom<&str> for EventKind {
    type Error = String;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        match value {
            "user.created" => Ok(Self::UserCreated),
            "user.updated" => Ok(Self::UserUpdated),
            "login.succeeded" => Ok(Self::LoginSucceeded),
            other => Err(format!("unsupported lifecycle event: {other}")),
        }
    }
}

/// Entry point for account lifecycle events delivered by the host platform.
pub async fn handle(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ProblemResponse> {
    let start = Instant::now();
    let result = process(&state, &headers, &body).await;
    histogram!("hook_latency_seconds").record(start.elapsed().as_secs_f64());
    result
}

async fn process(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<Response, ProblemResponse> {
    let timestamp_raw = get_required_header(headers, HEADER_TIMESTAMP)?;
    let signature = get_required_header(headers, HEADER_SIGNATURE)?;

    let timestamp = DateTime::parse_from_rfc3339(timestamp_raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|err| {
            ProblemResponse::bad_request("invalid_timestamp", format!("invalid timestamp: {err}"))
        })?;

    let now = state.now();
    let skew = now.signed_duration_since(timestamp).num_seconds().abs();
    if skew > MAX_SKEW_SECS {
        warn!(stage = "hooks", %timestamp_raw, now = %now.to_rfc3339(), skew_seconds = skew, "timestamp outside ±10 minute window");
        return Err(ProblemResponse::bad_request(
            "timestamp_out_of_range",
            "timestamp outside the allowed ±10 minute window",
        ));
    }

    verify_signature(state.hook_secret(), timestamp_raw, body, signature).map_err(|err| {
        counter!("hook_invalid_signature_total").increment(1);
        ProblemResponse::new(StatusCode::FORBIDDEN, "invalid_signature", err)
    })?;

    let payload: LifecycleEvent = serde_json::from_slice(body).map_err(|err| {
        ProblemResponse::bad_request("invalid_json", format!("failed to parse payload: {err}"))
    })?;
    let kind = EventKind::try_from(payload.event.as_str())
        .map_err(|detail| ProblemResponse::bad_request("invalid_event", detail))?;

    let delivery_id = Uuid::new_v4();
    let user_id = payload.user_id;
    counter!("hook_ingress_total", "event" => kind.metric_label()).increment(1);
    info!(stage = "hooks", %delivery_id, event = kind.metric_label(), user_id, "lifecycle event received");

    if let Some(email) = payload.email.as_deref() {
        if let Err(err) = state.storage().users().upsert_user(user_id, email, now).await {
            // Logins must never be impeded by bookkeeping failures.
            if matches!(kind, EventKind::LoginSucceeded) {
                warn!(stage = "hooks", %delivery_id, user_id, error = %err, "failed to mirror user on login");
            } else {
                error!(stage = "hooks", %delivery_id, user_id, error = %err, "failed to mirror user");
                return Err(ProblemResponse::internal(
                    "storage_error",
                    "failed to store user record",
                ));
            }
        }
    }

    let body = match kind {
        EventKind::UserCreated | EventKind::UserUpdated => {
            let outcome = state.engine().assign(user_id).await.map_err(|err| {
                error!(stage = "hooks", %delivery_id, user_id, error = %err, "assignment failed");
                ProblemResponse::internal("assignment_failed", "failed to assign customer group")
            })?;
            json!({
                "delivery_id": delivery_id,
                "event": kind.metric_label(),
                "outcome": outcome,
            })
        }
        EventKind::LoginSucceeded => {
            let outcome = state.reverifier().on_login(user_id).await;
            json!({
                "delivery_id": delivery_id,
                "event": kind.metric_label(),
                "outcome": outcome,
            })
        }
    };

    Ok((StatusCode::OK, Json(body)).into_response())
}

fn get_required_header<'a>(
    headers: &'a HeaderMap,
    name: &'static str,
) -> Result<&'a str, ProblemResponse> {
    headers
        .get(name)
        .ok_or_else(|| {
            ProblemResponse::bad_request("missing_header", format!("missing required header {name}"))
        })?
        .to_str()
        .map_err(|_| {
            ProblemResponse::bad_request("invalid_header", format!("header {name} must be ASCII"))
        })
}

fn verify_signature(
    secret: &[u8],
    timestamp: &str,
    body: &[u8],
    provided: &str,
) -> Result<(), String> {
    let hex_part = provided
        .strip_prefix("sha256=")
        .ok_or_else(|| "signature must start with 'sha256='".to_string())?;
    let provided_bytes =
        hex::decode(hex_part).map_err(|_| "signature is not valid hex".to_string())?;

    let mut mac = Hmac::<Sha256>::new_from_slice(secret)
        .map_err(|_| "failed to initialize signature verifier".to_string())?;
    mac.update(timestamp.as_bytes());
    mac.update(body);
    let expected = mac.finalize().into_bytes();
    let expected_bytes: &[u8] = expected.as_ref();

    if expected_bytes.ct_eq(provided_bytes.as_slice()).into() {
        Ok(())
    } else {
        Err("signature mismatch".to_string())
    }
}

#[cfg(test)]
pub(crate) fn sign(secret: &[u8], timestamp: &str, body: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(secret).expect("hmac");
    mac.update(timestamp.as_bytes());
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}
