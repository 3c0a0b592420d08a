//! HTTP API over the engine services.
//!
//! Callers are identified by the `x-user-id` header, set by the auth layer in
//! front of this server. Engine calls are blocking, so every handler hops onto
//! the blocking pool before touching the database.

use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use heirloom_core::{CheckInMethod, ItemScope, Timestamp};
use heirloom_engine::{
    CheckInTracker, EngineError, LegacyTokenService, NotificationInbox, TimeCapsuleIndex,
    TokenTerms, VaultRegistry,
};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::sync::{Arc, Mutex};

const USER_HEADER: &str = "x-user-id";
const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 500;

/// The engine services the API dispatches to.
pub struct Services {
    pub vaults: VaultRegistry,
    pub checkins: CheckInTracker,
    pub capsules: TimeCapsuleIndex,
    pub tokens: LegacyTokenService,
    pub inbox: NotificationInbox,
}

type AppState = Arc<Mutex<Services>>;

pub fn router(services: Services) -> Router {
    Router::new()
        .route("/vaults", post(create_vault))
        .route("/vaults/{id}/status", get(vault_status))
        .route("/vaults/{id}/check-in", post(check_in))
        .route("/vaults/{id}/check-ins", get(check_in_history))
        .route("/vaults/{id}/time-capsules", post(schedule_capsule).get(list_capsules))
        .route("/vaults/{id}/legacy-tokens", post(issue_token).get(list_tokens))
        .route("/legacy-tokens/{token}/redeem", post(redeem_token))
        .route("/notifications", get(list_notifications))
        .route("/notifications/{id}/read", post(mark_notification_read))
        .with_state(Arc::new(Mutex::new(services)))
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug)]
pub enum ApiError {
    Unauthenticated,
    BadRequest(String),
    Engine(EngineError),
}

impl From<EngineError> for ApiError {
    fn from(e: EngineError) -> Self {
        ApiError::Engine(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self {
            ApiError::Unauthenticated => {
                (StatusCode::UNAUTHORIZED, format!("missing {} header", USER_HEADER))
            }
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            ApiError::Engine(e) => (status_for(e), e.to_string()),
        };
        if status.is_server_error() {
            log::error!("Request failed: {}", message);
        }

        let mut response = (status, Json(json!({ "error": message }))).into_response();
        if status == StatusCode::SERVICE_UNAVAILABLE {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from_static("1"));
        }
        response
    }
}

fn status_for(e: &EngineError) -> StatusCode {
    match e {
        EngineError::VaultNotFound(_)
        | EngineError::TokenNotFound
        | EngineError::NotificationNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::VaultAlreadyReleased(_) => StatusCode::CONFLICT,
        EngineError::VaultNotReleased(_) | EngineError::NotOwner(_) => StatusCode::FORBIDDEN,
        EngineError::TokenExpired | EngineError::TokenExhausted => StatusCode::GONE,
        EngineError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        EngineError::StorageTimeout => StatusCode::SERVICE_UNAVAILABLE,
        EngineError::Storage(_) | EngineError::Worker(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn caller(headers: &HeaderMap) -> Result<String, ApiError> {
    headers
        .get(USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .ok_or(ApiError::Unauthenticated)
}

/// Parse an optional JSON body; an empty body yields the default.
fn optional_body<T: DeserializeOwned + Default>(body: &Bytes) -> Result<T, ApiError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(body).map_err(|e| ApiError::BadRequest(format!("invalid body: {}", e)))
}

/// Run `f` against the services on the blocking pool.
async fn call<T, F>(state: &AppState, f: F) -> Result<T, ApiError>
where
    T: Send + 'static,
    F: FnOnce(&mut Services) -> Result<T, EngineError> + Send + 'static,
{
    let state = state.clone();
    tokio::task::spawn_blocking(move || {
        let mut services = state
            .lock()
            .map_err(|_| EngineError::Worker("service lock poisoned".into()))?;
        f(&mut services)
    })
    .await
    .map_err(|e| EngineError::Worker(format!("request task: {}", e)))?
    .map_err(ApiError::from)
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateVaultBody {
    check_in_interval_secs: i64,
    grace_secs: i64,
}

async fn create_vault(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateVaultBody>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = caller(&headers)?;
    let vault = call(&state, move |s| {
        s.vaults
            .create(&owner, body.check_in_interval_secs, body.grace_secs)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": vault.id }))))
}

async fn vault_status(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user = caller(&headers)?;
    let status = call(&state, move |s| s.checkins.status(&id, &user)).await?;
    Ok(Json(status))
}

#[derive(Debug, Default, Deserialize)]
struct CheckInBody {
    method: Option<CheckInMethod>,
}

async fn check_in(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    let user = caller(&headers)?;
    let body: CheckInBody = optional_body(&body)?;
    let method = body.method.unwrap_or(CheckInMethod::Api);
    call(&state, move |s| s.checkins.record_check_in(&id, &user, method)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
struct HistoryQuery {
    limit: Option<usize>,
}

async fn check_in_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let user = caller(&headers)?;
    let limit = query
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .clamp(1, MAX_HISTORY_LIMIT);
    let history = call(&state, move |s| s.checkins.history(&id, &user, limit)).await?;
    Ok(Json(history))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CapsuleBody {
    release_at: Timestamp,
    #[serde(default = "all_items")]
    item_scope: ItemScope,
}

fn all_items() -> ItemScope {
    ItemScope::All
}

async fn schedule_capsule(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(body): Json<CapsuleBody>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = caller(&headers)?;
    let capsule = call(&state, move |s| {
        s.capsules
            .schedule(&id, &owner, body.release_at, body.item_scope)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(json!({ "id": capsule.id }))))
}

async fn list_capsules(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user = caller(&headers)?;
    let capsules = call(&state, move |s| s.capsules.list(&id, &user)).await?;
    Ok(Json(capsules))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IssueTokenBody {
    max_redemptions: Option<u32>,
    expires_at: Option<Timestamp>,
    holder: Option<String>,
}

async fn issue_token(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
    body: Bytes,
) -> Result<impl IntoResponse, ApiError> {
    let owner = caller(&headers)?;
    let body: IssueTokenBody = optional_body(&body)?;
    let terms = TokenTerms {
        max_redemptions: body.max_redemptions,
        expires_at: body.expires_at,
        holder: body.holder,
    };
    let issued = call(&state, move |s| s.tokens.issue(&id, &owner, terms)).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({
            "token": issued.token.as_str(),
            "tokenId": issued.summary.id,
            "expiresAt": issued.summary.expires_at,
            "maxRedemptions": issued.summary.max_redemptions,
        })),
    ))
}

async fn list_tokens(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let owner = caller(&headers)?;
    let tokens = call(&state, move |s| s.tokens.list(&id, &owner)).await?;
    Ok(Json(tokens))
}

/// Beneficiaries hold no account, so the token alone authorises this call.
async fn redeem_token(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let grant = call(&state, move |s| s.tokens.redeem(&token)).await?;
    Ok(Json(grant))
}

async fn list_notifications(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    let user = caller(&headers)?;
    let notes = call(&state, move |s| s.inbox.list(&user)).await?;
    Ok(Json(notes))
}

async fn mark_notification_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let user = caller(&headers)?;
    call(&state, move |s| s.inbox.mark_read(&user, &id)).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::Request;
    use heirloom_core::{Clock, ManualClock};
    use heirloom_engine::{EngineConfig, ReleaseSweeper};
    use heirloom_store::{Store, DEFAULT_BUSY_TIMEOUT};
    use serde_json::Value;
    use tempfile::NamedTempFile;
    use tower::ServiceExt;

    const T0: Timestamp = 1_700_000_000;
    const DAY: i64 = 86_400;

    struct Harness {
        file: NamedTempFile,
        clock: ManualClock,
        app: Router,
    }

    fn open(file: &NamedTempFile) -> Store {
        Store::open(file.path(), DEFAULT_BUSY_TIMEOUT).unwrap()
    }

    fn harness() -> Harness {
        let file = NamedTempFile::new().unwrap();
        let clock = ManualClock::new(T0);
        let shared = || -> Arc<dyn Clock> { Arc::new(clock.clone()) };
        let services = Services {
            vaults: VaultRegistry::new(open(&file), shared()),
            checkins: CheckInTracker::new(open(&file), shared()),
            capsules: TimeCapsuleIndex::new(open(&file), shared()),
            tokens: LegacyTokenService::new(open(&file), shared(), &EngineConfig::default())
                .unwrap(),
            inbox: NotificationInbox::new(open(&file)),
        };
        let app = router(services);
        Harness { file, clock, app }
    }

    impl Harness {
        async fn send(&self, method: &str, uri: &str, user: Option<&str>, body: Option<Value>) -> (StatusCode, HeaderMap, Value) {
            let mut request = Request::builder().method(method).uri(uri);
            if let Some(user) = user {
                request = request.header(USER_HEADER, user);
            }
            let body = match body {
                Some(v) => {
                    request = request.header(header::CONTENT_TYPE, "application/json");
                    Body::from(v.to_string())
                }
                None => Body::empty(),
            };
            let response = self
                .app
                .clone()
                .oneshot(request.body(body).unwrap())
                .await
                .unwrap();
            let status = response.status();
            let headers = response.headers().clone();
            let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            let value = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes).unwrap()
            };
            (status, headers, value)
        }

        async fn create_vault(&self) -> String {
            let (status, _, body) = self
                .send(
                    "POST",
                    "/vaults",
                    Some("alice"),
                    Some(json!({ "checkInIntervalSecs": DAY, "graceSecs": DAY })),
                )
                .await;
            assert_eq!(status, StatusCode::CREATED);
            body["id"].as_str().unwrap().to_string()
        }

        fn release(&self) {
            let mut sweeper = ReleaseSweeper::new(
                open(&self.file),
                Arc::new(self.clock.clone()),
                &EngineConfig::default(),
            );
            self.clock.set(T0 + DAY);
            sweeper.run_once().unwrap();
            self.clock.set(T0 + 2 * DAY);
            sweeper.run_once().unwrap();
        }
    }

    #[tokio::test]
    async fn test_missing_identity_is_unauthorized() {
        let h = harness();
        let (status, _, _) = h
            .send(
                "POST",
                "/vaults",
                None,
                Some(json!({ "checkInIntervalSecs": DAY, "graceSecs": DAY })),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn test_check_in_and_status() {
        let h = harness();
        let id = h.create_vault().await;

        h.clock.set(T0 + 100);
        let (status, _, _) = h
            .send("POST", &format!("/vaults/{}/check-in", id), Some("alice"), None)
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _, _) = h
            .send(
                "POST",
                &format!("/vaults/{}/check-in", id),
                Some("alice"),
                Some(json!({ "method": "app" })),
            )
            .await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (status, _, body) = h
            .send("GET", &format!("/vaults/{}/status", id), Some("alice"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["state"], "sealed");
        assert_eq!(body["nextDeadline"], T0 + 100 + DAY);

        let (status, _, body) = h
            .send("GET", &format!("/vaults/{}/check-ins?limit=1", id), Some("alice"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);
        assert_eq!(body[0]["method"], "app");
    }

    #[tokio::test]
    async fn test_unknown_method_is_bad_request() {
        let h = harness();
        let id = h.create_vault().await;
        let (status, _, _) = h
            .send(
                "POST",
                &format!("/vaults/{}/check-in", id),
                Some("alice"),
                Some(json!({ "method": "carrier-pigeon" })),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_foreign_and_unknown_vaults() {
        let h = harness();
        let id = h.create_vault().await;
        let (status, _, _) = h
            .send("GET", &format!("/vaults/{}/status", id), Some("mallory"), None)
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _, _) = h
            .send("POST", "/vaults/ghost/check-in", Some("alice"), None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_check_in_after_release_conflicts() {
        let h = harness();
        let id = h.create_vault().await;
        h.release();
        let (status, _, body) = h
            .send("POST", &format!("/vaults/{}/check-in", id), Some("alice"), None)
            .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert!(body["error"].as_str().is_some());
    }

    #[tokio::test]
    async fn test_token_issue_and_redeem() {
        let h = harness();
        let id = h.create_vault().await;

        let (status, _, issued) = h
            .send(
                "POST",
                &format!("/vaults/{}/legacy-tokens", id),
                Some("alice"),
                Some(json!({ "maxRedemptions": 1, "holder": "bob" })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(issued["maxRedemptions"], 1);
        assert!(issued["expiresAt"].is_null());
        let token = issued["token"].as_str().unwrap().to_string();
        let redeem = format!("/legacy-tokens/{}/redeem", token);

        let (status, _, _) = h.send("POST", &redeem, None, None).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        h.release();
        let (status, _, grant) = h.send("POST", &redeem, None, None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(grant["vaultId"], id.as_str());
        assert_eq!(grant["itemScope"], "all");

        let (status, _, _) = h.send("POST", &redeem, None, None).await;
        assert_eq!(status, StatusCode::GONE);

        let (status, _, _) = h
            .send("POST", "/legacy-tokens/hlt_bogus/redeem", None, None)
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _, listed) = h
            .send("GET", &format!("/vaults/{}/legacy-tokens", id), Some("alice"), None)
            .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed[0]["redemptionCount"], 1);
    }

    #[tokio::test]
    async fn test_token_without_body_is_unlimited() {
        let h = harness();
        let id = h.create_vault().await;
        let (status, _, issued) = h
            .send("POST", &format!("/vaults/{}/legacy-tokens", id), Some("alice"), None)
            .await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(issued["maxRedemptions"].is_null());
    }

    #[tokio::test]
    async fn test_schedule_capsule() {
        let h = harness();
        let id = h.create_vault().await;
        let uri = format!("/vaults/{}/time-capsules", id);

        let (status, _, created) = h
            .send(
                "POST",
                &uri,
                Some("alice"),
                Some(json!({ "releaseAt": T0 + DAY / 2, "itemScope": { "items": ["letter"] } })),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _, _) = h
            .send("POST", &uri, Some("alice"), Some(json!({ "releaseAt": T0 - 1 })))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, listed) = h.send("GET", &uri, Some("alice"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(listed.as_array().unwrap().len(), 1);
        assert_eq!(listed[0]["id"], created["id"]);
    }

    #[tokio::test]
    async fn test_notifications_inbox() {
        let h = harness();
        h.create_vault().await;
        h.release();

        let (status, _, notes) = h.send("GET", "/notifications", Some("alice"), None).await;
        assert_eq!(status, StatusCode::OK);
        let notes = notes.as_array().unwrap().clone();
        assert!(!notes.is_empty());
        let id = notes[0]["id"].as_str().unwrap();
        let read = format!("/notifications/{}/read", id);

        let (status, _, _) = h.send("POST", &read, Some("mallory"), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _, _) = h.send("POST", &read, Some("alice"), None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);

        let (_, _, notes) = h.send("GET", "/notifications", Some("alice"), None).await;
        let marked = notes.as_array().unwrap().iter().find(|n| n["id"] == id).unwrap();
        assert_eq!(marked["read"], true);
    }

    #[test]
    fn test_storage_timeout_is_retryable() {
        let response = ApiError::Engine(EngineError::StorageTimeout).into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(response.headers()[header::RETRY_AFTER], "1");
    }
}
