use axum::{
    extract::{Path, State},
    http::{header, HeaderMap, StatusCode},
    Json,
};
use b2b_group_core::legacy::LEGACY_MAPPING_OPTIONS;
use metrics::counter;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{error, info, warn};

use crate::auth::{AdminAction, AdminSession, AuthError};
use crate::groups::discover_groups;
use crate::problem::ProblemResponse;
use crate::router::AppState;

const HEADER_NONCE: &str = "X-Admin-Nonce";

type AdminResult = Result<Json<Value>, ProblemResponse>;

#[derive(Debug, Deserialize)]
pub struct NewMapping {
    domain: String,
    group: String,
}

pub async fn overview(State(state): State<AppState>, headers: HeaderMap) -> AdminResult {
    authorize(&state, &headers)?;
    let mappings = state
        .storage()
        .mappings()
        .get_all()
        .await
        .map_err(|err| storage_problem("load mappings", err))?;
    let logs = state
        .storage()
        .assignment_logs()
        .get_all()
        .await
        .map_err(|err| storage_problem("load logs", err))?;
    let groups = discover_groups(state.storage(), state.engine().group_field()).await;

    Ok(Json(json!({
        "group_field": state.settings().group_field,
        "reverify_window_days": state.settings().reverify_window_days,
        "log_capacity": state.settings().log_capacity,
        "mappings": mappings,
        "logs": logs,
        "groups": groups,
    })))
}

pub async fn issue_nonce(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(action): Path<String>,
) -> AdminResult {
    let session = authorize(&state, &headers)?;
    let action = AdminAction::try_from(action.as_str())
        .map_err(|detail| ProblemResponse::bad_request("invalid_action", detail))?;
    let nonce = state
        .admin_auth()
        .issue_nonce(action, &session, state.now())
        .map_err(|err| ProblemResponse::internal("nonce_failed", err.to_string()))?;
    Ok(Json(json!({ "action": action.as_str(), "nonce": nonce })))
}

pub async fn list_mappings(State(state): State<AppState>, headers: HeaderMap) -> AdminResult {
    authorize(&state, &headers)?;
    let mappings = state
        .storage()
        .mappings()
        .get_all()
        .await
        .map_err(|err| storage_problem("load mappings", err))?;
    Ok(Json(json!({ "mappings": mappings })))
}

pub async fn add_mapping(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<NewMapping>,
) -> AdminResult {
    let action = AdminAction::AddMapping;
    authorize_action(&state, &headers, action)?;

    let domain = request.domain.trim();
    let group = request.group.trim();
    if domain.is_empty() || group.is_empty() {
        record(action, "invalid");
        return Err(ProblemResponse::bad_request(
            "invalid_mapping",
            "domain and group must both be non-empty",
        ));
    }

    state
        .storage()
        .mappings()
        .set(domain, group)
        .await
        .map_err(|err| {
            record(action, "error");
            storage_problem("save mapping", err)
        })?;

    record(action, "ok");
    info!(stage = "admin", %domain, %group, "mapping saved");
    Ok(Json(json!({ "domain": domain, "group": group })))
}

pub async fn delete_mapping(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(domain): Path<String>,
) -> AdminResult {
    let action = AdminAction::DeleteMapping;
    authorize_action(&state, &headers, action)?;

    let mappings = state.storage().mappings();
    let removed = mappings.delete(&domain).await.map_err(|err| {
        record(action, "error");
        storage_problem("delete mapping", err)
    })?;

    // Older releases kept their own copies; clear the domain there too so a
    // re-migration could never resurrect it.
    let mut legacy_removed = Vec::new();
    for option_name in LEGACY_MAPPING_OPTIONS {
        match mappings.delete_from(option_name, &domain).await {
            Ok(true) => legacy_removed.push(option_name),
            Ok(false) => {}
            Err(err) => {
                warn!(stage = "admin", option = option_name, %domain, error = %err, "legacy mapping cleanup failed")
            }
        }
    }

    record(action, if removed { "ok" } else { "absent" });
    info!(stage = "admin", %domain, removed, legacy = legacy_removed.len(), "mapping deleted");
    Ok(Json(json!({
        "domain": domain,
        "removed": removed,
        "legacy_removed": legacy_removed,
    })))
}

pub async fn list_logs(State(state): State<AppState>, headers: HeaderMap) -> AdminResult {
    authorize(&state, &headers)?;
    let logs = state
        .storage()
        .assignment_logs()
        .get_all()
        .await
        .map_err(|err| storage_problem("load logs", err))?;
    Ok(Json(json!({ "logs": logs })))
}

pub async fn clear_logs(State(state): State<AppState>, headers: HeaderMap) -> AdminResult {
    let action = AdminAction::ClearLogs;
    authorize_action(&state, &headers, action)?;
    state
        .storage()
        .assignment_logs()
        .clear()
        .await
        .map_err(|err| {
            record(action, "error");
            storage_problem("clear logs", err)
        })?;
    record(action, "ok");
    info!(stage = "admin", "assignment logs cleared");
    Ok(Json(json!({ "cleared": true })))
}

pub async fn list_groups(State(state): State<AppState>, headers: HeaderMap) -> AdminResult {
    authorize(&state, &headers)?;
    let groups = discover_groups(state.storage(), state.engine().group_field()).await;
    Ok(Json(json!({ "groups": groups })))
}

pub async fn reassign_user(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> AdminResult {
    let action = AdminAction::ReassignUser;
    authorize_action(&state, &headers, action)?;

    let outcome = state.engine().assign(user_id).await.map_err(|err| {
        record(action, "error");
        error!(stage = "admin", user_id, error = %err, "manual reassignment failed");
        ProblemResponse::internal("assignment_failed", "failed to assign customer group")
    })?;

    record(action, outcome.metric_label());
    Ok(Json(json!({ "user_id": user_id, "outcome": outcome })))
}

pub async fn user_assignment(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<i64>,
) -> AdminResult {
    authorize(&state, &headers)?;
    let users = state.storage().users();
    let user = users
        .get_user(user_id)
        .await
        .map_err(|err| storage_problem("load user", err))?
        .ok_or_else(|| {
            ProblemResponse::new(StatusCode::NOT_FOUND, "user_not_found", "user does not exist")
        })?;

    let group_field = state.engine().group_field();
    let current_group = users
        .get_field(user_id, group_field)
        .await
        .map_err(|err| storage_problem("load group field", err))?;
    let assignment = users
        .assignment_state(user_id)
        .await
        .map_err(|err| storage_problem("load assignment state", err))?;

    Ok(Json(json!({
        "user_id": user.id,
        "email": user.email,
        "group_field": group_field,
        "current_group": current_group,
        "assignment": assignment,
    })))
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<AdminSession, ProblemResponse> {
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or_else(|| {
            ProblemResponse::new(StatusCode::UNAUTHORIZED, "missing_token", "bearer token required")
        })?;

    state
        .admin_auth()
        .authenticate(token, state.now())
        .map_err(|err| match err {
            AuthError::MissingCapability => {
                ProblemResponse::new(StatusCode::FORBIDDEN, "forbidden", err.to_string())
            }
            other => ProblemResponse::new(StatusCode::UNAUTHORIZED, "invalid_token", other.to_string()),
        })
}

fn authorize_action(
    state: &AppState,
    headers: &HeaderMap,
    action: AdminAction,
) -> Result<AdminSession, ProblemResponse> {
    let session = authorize(state, headers)?;
    let nonce = headers
        .get(HEADER_NONCE)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default();

    state
        .admin_auth()
        .verify_nonce(action, &session, nonce, state.now())
        .map_err(|err| {
            record(action, "invalid_nonce");
            warn!(stage = "admin", action = action.as_str(), subject = %session.subject, "rejected admin action with invalid nonce");
            ProblemResponse::new(StatusCode::FORBIDDEN, "invalid_nonce", err.to_string())
        })?;
    Ok(session)
}

fn record(action: AdminAction, result: &'static str) {
    counter!("admin_actions_total", "action" => action.as_str(), "result" => result).increment(1);
}

fn storage_problem(what: &str, err: impl std::fmt::Display) -> ProblemResponse {
    error!(stage = "admin", error = %err, "failed to {what}");
    ProblemResponse::internal("storage_error", format!("failed to {what}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request, response::Response};
    use chrono::Duration;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    use crate::auth::test_support::admin_token;
    use crate::auth::MANAGE_CAPABILITY;
    use crate::engine::test_support::{fixed_now, GROUP_FIELD};
    use crate::router::{app_router, test_support::setup_state};

    fn token() -> String {
        admin_token(&[MANAGE_CAPABILITY], fixed_now() + Duration::hours(1))
    }

    async fn send(state: &AppState, request: Request<Body>) -> Response {
        app_router(state.clone()).oneshot(request).await.unwrap()
    }

    async fn json_body(response: Response) -> Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn nonce(state: &AppState, action: &str) -> String {
        let response = send(
            state,
            Request::builder()
                .uri(format!("/admin/nonces/{action}"))
                .header("authorization", format!("Bearer {}", token()))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        json_body(response).await["nonce"]
            .as_str()
            .expect("nonce string")
            .to_string()
    }

    fn mutating(method: &str, uri: &str, nonce: &str, body: Option<Value>) -> Request<Body> {
        let builder = Request::builder()
            .method(method)
            .uri(uri)
            .header("authorization", format!("Bearer {}", token()))
            .header(HEADER_NONCE, nonce);
        match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        }
    }

    #[tokio::test]
    async fn requires_token_with_capability() {
        let (state, _dir) = setup_state().await;

        let response = send(
            &state,
            Request::builder().uri("/admin/mappings").body(Body::empty()).unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let weak = admin_token(&["read"], fixed_now() + Duration::hours(1));
        let response = send(
            &state,
            Request::builder()
                .uri("/admin/mappings")
                .header("authorization", format!("Bearer {weak}"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn add_mapping_requires_matching_nonce() {
        let (state, _dir) = setup_state().await;
        let wrong = nonce(&state, "clear_logs").await;
        let response = send(
            &state,
            mutating(
                "POST",
                "/admin/mappings",
                &wrong,
                Some(json!({"domain": "acme.com", "group": "Gold"})),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert_eq!(json_body(response).await["type"], "invalid_nonce");
        assert!(state.storage().mappings().get_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn add_list_and_delete_mapping() {
        let (state, _dir) = setup_state().await;
        state
            .storage()
            .options()
            .set("b2b_auto_group_mappings", &json!({"acme.com": "Old"}))
            .await
            .unwrap();

        let add = nonce(&state, "add_mapping").await;
        let response = send(
            &state,
            mutating(
                "POST",
                "/admin/mappings",
                &add,
                Some(json!({"domain": " acme.com ", "group": "Gold"})),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);

        let response = send(
            &state,
            Request::builder()
                .uri("/admin/mappings")
                .header("authorization", format!("Bearer {}", token()))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(
            json_body(response).await["mappings"],
            json!({"acme.com": "Gold"})
        );

        let delete = nonce(&state, "delete_mapping").await;
        let response = send(
            &state,
            mutating("DELETE", "/admin/mappings/acme.com", &delete, None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["removed"], true);
        assert_eq!(json["legacy_removed"], json!(["b2b_auto_group_mappings"]));
        assert!(state.storage().mappings().get_all().await.unwrap().is_empty());
        assert_eq!(
            state
                .storage()
                .options()
                .get("b2b_auto_group_mappings")
                .await
                .unwrap(),
            Some(json!({}))
        );
    }

    #[tokio::test]
    async fn rejects_blank_mapping_fields() {
        let (state, _dir) = setup_state().await;
        let add = nonce(&state, "add_mapping").await;
        let response = send(
            &state,
            mutating(
                "POST",
                "/admin/mappings",
                &add,
                Some(json!({"domain": "acme.com", "group": "   "})),
            ),
        )
        .await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(json_body(response).await["type"], "invalid_mapping");
    }

    #[tokio::test]
    async fn clear_logs_empties_store() {
        let (state, _dir) = setup_state().await;
        state
            .storage()
            .assignment_logs()
            .append("entry".to_string(), 100)
            .await
            .unwrap();

        let clear = nonce(&state, "clear_logs").await;
        let response = send(&state, mutating("DELETE", "/admin/logs", &clear, None)).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state
            .storage()
            .assignment_logs()
            .get_all()
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn reassign_and_inspect_user() {
        let (state, _dir) = setup_state().await;
        let storage = state.storage().clone();
        storage
            .users()
            .upsert_user(5, "dana@acme.com", fixed_now())
            .await
            .unwrap();
        storage.mappings().set("acme.com", "Gold").await.unwrap();

        let reassign = nonce(&state, "reassign_user").await;
        let response = send(
            &state,
            mutating("POST", "/admin/users/5/reassign", &reassign, None),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(json_body(response).await["outcome"]["result"], "assigned");

        let response = send(
            &state,
            Request::builder()
                .uri("/admin/users/5/assignment")
                .header("authorization", format!("Bearer {}", token()))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        let json = json_body(response).await;
        assert_eq!(json["group_field"], GROUP_FIELD);
        assert_eq!(json["current_group"], "Gold");
        assert_eq!(json["assignment"]["domain"], "acme.com");
        assert_eq!(json["assignment"]["assigned_at"], "2024-06-01 12:00:00");

        let response = send(
            &state,
            Request::builder()
                .uri("/admin/users/77/assignment")
                .header("authorization", format!("Bearer {}", token()))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn overview_lists_everything() {
        let (state, _dir) = setup_state().await;
        state.storage().mappings().set("acme.com", "Gold").await.unwrap();

        let response = send(
            &state,
            Request::builder()
                .uri("/admin/overview")
                .header("authorization", format!("Bearer {}", token()))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let json = json_body(response).await;
        assert_eq!(json["mappings"]["acme.com"], "Gold");
        assert_eq!(json["logs"], json!([]));
        assert_eq!(json["reverify_window_days"], 30);
        assert!(json["groups"]
            .as_array()
            .unwrap()
            .iter()
            .any(|g| g == "PCUsato"));
    }
}
