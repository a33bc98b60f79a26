use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use chrono::Utc;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::actions::OperationResult;
use crate::context::PriorTurn;
use crate::database::{AssistantDatabase, InsightFilter, KeywordConfigUpdate, MemoryFilter};
use crate::insights::{self, Insight, InsightCategory};
use crate::keywords::{
    default_configs, detect_conflicts, list_or_seed, KeywordConfig, KeywordConfigInput,
    KeywordConflict,
};
use crate::llm_client::Message;
use crate::memory::{Memory, MemoryKind, MemoryUpsert, PERSONALIZATION_MIN_CONFIDENCE};
use crate::pipeline::{
    ChatPipeline, ChatRequest, DonePayload, Entities, ReportedAction, StreamEvent,
    UNAVAILABLE_MESSAGE,
};
use crate::runtime::BackendRuntime;

const USER_HEADER: &str = "x-user-id";
const DEFAULT_USER: &str = "local";

#[derive(Clone)]
pub struct ServerState {
    pub pipeline: Arc<ChatPipeline>,
    pub db: Arc<AssistantDatabase>,
    pub auth: BackendAuthConfig,
}

#[derive(Debug, Clone)]
pub struct BackendAuthConfig {
    mode: AuthMode,
    token: Option<String>,
}

impl BackendAuthConfig {
    pub fn disabled() -> Self {
        Self {
            mode: AuthMode::Disabled,
            token: None,
        }
    }

    pub fn with_token(token: impl Into<String>) -> Self {
        Self {
            mode: AuthMode::Required,
            token: Some(token.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AuthMode {
    Required,
    Disabled,
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
}

#[derive(Debug, Deserialize)]
struct ChatBody {
    #[serde(default)]
    message: String,
    #[serde(default)]
    context: Option<ChatContext>,
    #[serde(default = "default_stream")]
    stream: bool,
}

fn default_stream() -> bool {
    true
}

#[derive(Debug, Default, Deserialize)]
struct ChatContext {
    #[serde(default)]
    history: Vec<HistoryEntry>,
}

#[derive(Debug, Deserialize)]
struct HistoryEntry {
    #[serde(default)]
    role: Option<String>,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatResponse {
    success: bool,
    response: String,
    actions: Vec<ReportedAction>,
    entities: Entities,
    #[serde(rename = "operationResults")]
    operation_results: Vec<OperationResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    warning: Option<String>,
}

/// Write result for keyword configs, with the conflicts present afterwards.
#[derive(Debug, Serialize)]
struct KeywordWriteResponse<T> {
    data: T,
    conflicts: Vec<KeywordConflict>,
}

#[derive(Debug, Deserialize)]
struct ImportKeywordsRequest {
    configs: Vec<KeywordConfigInput>,
}

#[derive(Debug, Serialize)]
struct DeletedResponse {
    deleted: usize,
}

#[derive(Debug, Serialize)]
struct MemoryProfileResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    basic_info: Option<Value>,
    preferences: BTreeMap<String, Value>,
    habits: BTreeMap<String, Value>,
    goals: BTreeMap<String, Value>,
}

#[derive(Debug, Deserialize)]
struct BasicInfoRequest {
    basic_info: Value,
}

#[derive(Debug, Deserialize)]
struct ListConversationsQuery {
    limit: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct GenerateInsightsRequest {
    #[serde(default)]
    categories: Option<Vec<InsightCategory>>,
}

pub async fn serve_backend(runtime: BackendRuntime) -> Result<()> {
    let bind_addr = std::env::var("STEWARD_BACKEND_BIND")
        .unwrap_or_else(|_| "127.0.0.1:8787".to_string())
        .parse::<SocketAddr>()
        .context("Invalid STEWARD_BACKEND_BIND (expected host:port)")?;

    let auth = load_auth_config()?;
    let state = Arc::new(ServerState {
        pipeline: runtime.pipeline.clone(),
        db: runtime.db.clone(),
        auth,
    });
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("Failed to bind backend server to {}", bind_addr))?;
    tracing::info!("Steward backend listening on http://{}", bind_addr);
    axum::serve(listener, app)
        .await
        .context("Backend server failed")?;
    Ok(())
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    let protected = Router::new()
        .route("/health", get(health))
        .route("/ai/chat", post(chat))
        .route("/keywords", get(list_keywords).post(create_keyword))
        .route("/keywords/import", post(import_keywords))
        .route("/keywords/reset", post(reset_keywords))
        .route("/keywords/conflicts", get(keyword_conflicts))
        .route("/keywords/:id", put(update_keyword).delete(delete_keyword))
        .route("/memories", get(list_memories).post(upsert_memory))
        .route(
            "/memories/profile",
            get(memory_profile).put(update_basic_info),
        )
        .route("/memories/:id", delete(delete_memory))
        .route("/memories/type/:memory_type", delete(clear_memories))
        .route("/conversations", get(list_conversations))
        .route("/insights", get(list_insights))
        .route("/insights/generate", post(generate_insights))
        .with_state(state.clone())
        .layer(middleware::from_fn_with_state(
            state.clone(),
            auth_middleware,
        ));

    Router::new().nest("/v1", protected)
}

fn load_auth_config() -> Result<BackendAuthConfig> {
    let mode = parse_auth_mode(std::env::var("STEWARD_BACKEND_AUTH_MODE").ok())?;
    let token = std::env::var("STEWARD_BACKEND_TOKEN")
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty());

    if mode == AuthMode::Required && token.is_none() {
        return Err(anyhow!(
            "STEWARD_BACKEND_TOKEN is required when auth mode is 'required'"
        ));
    }
    if mode == AuthMode::Disabled {
        tracing::warn!("Backend auth mode is disabled; all API routes are unauthenticated");
    }

    Ok(BackendAuthConfig { mode, token })
}

fn parse_auth_mode(raw: Option<String>) -> Result<AuthMode> {
    let normalized = raw
        .unwrap_or_else(|| "required".to_string())
        .trim()
        .to_ascii_lowercase();
    match normalized.as_str() {
        "" | "required" | "on" | "enabled" | "true" => Ok(AuthMode::Required),
        "disabled" | "off" | "false" => Ok(AuthMode::Disabled),
        other => Err(anyhow!(
            "Invalid STEWARD_BACKEND_AUTH_MODE '{}'. Expected 'required' or 'disabled'",
            other
        )),
    }
}

async fn auth_middleware(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    request: axum::extract::Request,
    next: Next,
) -> Result<Response, StatusCode> {
    authorize(&headers, &state.auth)?;
    Ok(next.run(request).await)
}

fn authorize(headers: &HeaderMap, auth: &BackendAuthConfig) -> Result<(), StatusCode> {
    if auth.mode == AuthMode::Disabled {
        return Ok(());
    }
    let Some(token) = auth.token.as_deref() else {
        return Err(StatusCode::UNAUTHORIZED);
    };

    let Some(raw_header) = headers.get(header::AUTHORIZATION) else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let Ok(auth_value) = raw_header.to_str() else {
        return Err(StatusCode::UNAUTHORIZED);
    };
    let expected = format!("Bearer {}", token);
    if auth_value.trim() != expected {
        return Err(StatusCode::UNAUTHORIZED);
    }
    Ok(())
}

fn user_id(headers: &HeaderMap) -> String {
    headers
        .get(USER_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .unwrap_or(DEFAULT_USER)
        .to_string()
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

// ============================================================================
// Chat
// ============================================================================

async fn chat(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<ChatBody>,
) -> Result<Response, (StatusCode, String)> {
    let message = body.message.trim();
    if message.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "message cannot be empty".to_string(),
        ));
    }

    let history = body
        .context
        .unwrap_or_default()
        .history
        .into_iter()
        .map(|entry| Message {
            role: entry.role.unwrap_or_else(|| "user".to_string()),
            content: entry.content,
        })
        .collect();
    let request = ChatRequest {
        user_id: user_id(&headers),
        message: message.to_string(),
        history,
    };

    let (tx, rx) = flume::unbounded::<StreamEvent>();
    if body.stream {
        let pipeline = state.pipeline.clone();
        tokio::spawn(async move {
            if let Err(e) = pipeline.run(&request, &tx).await {
                tracing::warn!("Streaming chat for {} failed: {:#}", request.user_id, e);
            }
        });
        let events = rx.into_stream().map(sse_event);
        return Ok(Sse::new(events)
            .keep_alive(KeepAlive::default())
            .into_response());
    }

    drop(rx);
    let outcome = state.pipeline.run(&request, &tx).await.map_err(|e| {
        tracing::warn!("Chat for {} failed: {:#}", request.user_id, e);
        (
            StatusCode::SERVICE_UNAVAILABLE,
            UNAVAILABLE_MESSAGE.to_string(),
        )
    })?;

    let DonePayload {
        actions,
        entities,
        operation_results,
        warning,
        ..
    } = outcome.done;
    Ok(Json(ChatResponse {
        success: true,
        response: outcome.response,
        actions,
        entities,
        operation_results,
        warning,
    })
    .into_response())
}

fn sse_event(event: StreamEvent) -> Result<Event, Infallible> {
    Ok(Event::default()
        .event(event.name())
        .data(event.data().to_string()))
}

// ============================================================================
// Keyword configs
// ============================================================================

async fn list_keywords(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<KeywordConfig>>, (StatusCode, String)> {
    list_or_seed(&state.db, &user_id(&headers))
        .map(Json)
        .map_err(internal_error)
}

async fn create_keyword(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(input): Json<KeywordConfigInput>,
) -> Result<Json<KeywordWriteResponse<KeywordConfig>>, (StatusCode, String)> {
    validate_keywords(&input)?;
    let user = user_id(&headers);
    let created = state
        .db
        .create_keyword_config(&user, &input)
        .map_err(internal_error)?;
    with_conflicts(&state, &user, created)
}

async fn update_keyword(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Json(update): Json<KeywordConfigUpdate>,
) -> Result<Json<KeywordWriteResponse<KeywordConfig>>, (StatusCode, String)> {
    let user = user_id(&headers);
    let updated = state
        .db
        .update_keyword_config(&user, &id, &update)
        .map_err(internal_error)?
        .ok_or_else(|| not_found(format!("keyword config '{}' not found", id)))?;
    with_conflicts(&state, &user, updated)
}

async fn delete_keyword(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<DeletedResponse>, (StatusCode, String)> {
    let deleted = state
        .db
        .deactivate_keyword_config(&user_id(&headers), &id)
        .map_err(internal_error)?;
    if !deleted {
        return Err(not_found(format!("keyword config '{}' not found", id)));
    }
    Ok(Json(DeletedResponse { deleted: 1 }))
}

async fn import_keywords(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<ImportKeywordsRequest>,
) -> Result<Json<KeywordWriteResponse<Vec<KeywordConfig>>>, (StatusCode, String)> {
    if body.configs.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "configs cannot be empty".to_string(),
        ));
    }
    for input in &body.configs {
        validate_keywords(input)?;
    }
    let user = user_id(&headers);
    let imported = state
        .db
        .replace_keyword_configs(&user, &body.configs)
        .map_err(internal_error)?;
    tracing::info!("Imported {} keyword config(s) for {}", imported.len(), user);
    with_conflicts(&state, &user, imported)
}

async fn reset_keywords(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<KeywordConfig>>, (StatusCode, String)> {
    let user = user_id(&headers);
    tracing::info!("Resetting keyword configs for {}", user);
    state
        .db
        .replace_keyword_configs(&user, &default_configs())
        .map(Json)
        .map_err(internal_error)
}

async fn keyword_conflicts(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Result<Json<Vec<KeywordConflict>>, (StatusCode, String)> {
    let configs = state
        .db
        .list_keyword_configs(&user_id(&headers))
        .map_err(internal_error)?;
    Ok(Json(detect_conflicts(&configs)))
}

fn validate_keywords(input: &KeywordConfigInput) -> Result<(), (StatusCode, String)> {
    if input.keywords.iter().all(|k| k.trim().is_empty()) {
        return Err((
            StatusCode::BAD_REQUEST,
            "keywords must contain at least one non-empty entry".to_string(),
        ));
    }
    Ok(())
}

fn with_conflicts<T>(
    state: &ServerState,
    user: &str,
    data: T,
) -> Result<Json<KeywordWriteResponse<T>>, (StatusCode, String)> {
    let active = state
        .db
        .list_keyword_configs(user)
        .map_err(internal_error)?;
    let conflicts = detect_conflicts(&active);
    if !conflicts.is_empty() {
        tracing::warn!("{} keyword conflict(s) for {}", conflicts.len(), user);
    }
    Ok(Json(KeywordWriteResponse { data, conflicts }))
}

// ============================================================================
// Memories
// ============================================================================

async fn list_memories(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Query(filter): Query<MemoryFilter>,
) -> Result<Json<Vec<Memory>>, (StatusCode, String)> {
    state
        .db
        .list_memories(&user_id(&headers), &filter)
        .map(Json)
        .map_err(internal_error)
}

async fn upsert_memory(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(body): Json<MemoryUpsert>,
) -> Result<Json<Memory>, (StatusCode, String)> {
    if body.key.trim().is_empty() {
        return Err((StatusCode::BAD_REQUEST, "key cannot be empty".to_string()));
    }
    if !(0.0..=1.0).contains(&body.confidence) {
        return Err((
            StatusCode::BAD_REQUEST,
            "confidence must be between 0 and 1".to_string(),
        ));
    }
    state
        .db
        .upsert_memory(&user_id(&headers), &body)
        .map(Json)
        .map_err(internal_error)
}

async fn memory_profile(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
) -> Result<Json<MemoryProfileResponse>, (StatusCode, String)> {
    let profile = state
        .db
        .build_user_profile(&user_id(&headers), PERSONALIZATION_MIN_CONFIDENCE)
        .map_err(internal_error)?;
    Ok(Json(MemoryProfileResponse {
        basic_info: profile.basic_info,
        preferences: profile.preferences,
        habits: profile.habits,
        goals: profile.goals,
    }))
}

async fn update_basic_info(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Json(request): Json<BasicInfoRequest>,
) -> Result<Json<MemoryProfileResponse>, (StatusCode, String)> {
    if !request.basic_info.is_object() {
        return Err((
            StatusCode::BAD_REQUEST,
            "basic_info must be a JSON object".to_string(),
        ));
    }
    state
        .db
        .set_basic_info(&user_id(&headers), &request.basic_info)
        .map_err(internal_error)?;
    memory_profile(State(state), headers).await
}

async fn delete_memory(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<Json<DeletedResponse>, (StatusCode, String)> {
    let deleted = state
        .db
        .delete_memory(&user_id(&headers), &id)
        .map_err(internal_error)?;
    if !deleted {
        return Err(not_found(format!("memory '{}' not found", id)));
    }
    Ok(Json(DeletedResponse { deleted: 1 }))
}

async fn clear_memories(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Path(memory_type): Path<String>,
) -> Result<Json<DeletedResponse>, (StatusCode, String)> {
    let kind = MemoryKind::parse(&memory_type).ok_or_else(|| {
        (
            StatusCode::BAD_REQUEST,
            format!("unknown memory type '{}'", memory_type),
        )
    })?;
    let deleted = state
        .db
        .clear_memories(&user_id(&headers), kind)
        .map_err(internal_error)?;
    Ok(Json(DeletedResponse { deleted }))
}

// ============================================================================
// Conversations and insights
// ============================================================================

async fn list_conversations(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Query(query): Query<ListConversationsQuery>,
) -> Result<Json<Vec<PriorTurn>>, (StatusCode, String)> {
    let limit = clamp_limit(query.limit, 50, 1, 500);
    state
        .db
        .list_conversations(&user_id(&headers), limit)
        .map(Json)
        .map_err(internal_error)
}

async fn list_insights(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    Query(filter): Query<InsightFilter>,
) -> Result<Json<Vec<Insight>>, (StatusCode, String)> {
    state
        .db
        .list_insights(&user_id(&headers), &filter)
        .map(Json)
        .map_err(internal_error)
}

async fn generate_insights(
    State(state): State<Arc<ServerState>>,
    headers: HeaderMap,
    body: Option<Json<GenerateInsightsRequest>>,
) -> Result<Json<Vec<Insight>>, (StatusCode, String)> {
    let categories = body
        .and_then(|Json(body)| body.categories)
        .filter(|categories| !categories.is_empty())
        .unwrap_or_else(|| InsightCategory::ALL.to_vec());
    insights::generate_and_store(&state.db, &user_id(&headers), &categories, Utc::now())
        .map(Json)
        .map_err(internal_error)
}

fn clamp_limit(value: Option<usize>, default: usize, min: usize, max: usize) -> usize {
    value.unwrap_or(default).clamp(min, max)
}

fn not_found(message: String) -> (StatusCode, String) {
    (StatusCode::NOT_FOUND, message)
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AssistantConfig;
    use crate::llm_client::{FallbackChain, LlmClient, FALLBACK_WARNING};
    use crate::memory::MemoryUpdater;
    use axum::body::Body;
    use axum::http::{HeaderValue, Request};
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    fn test_state(dir: &tempfile::TempDir, auth: BackendAuthConfig) -> Arc<ServerState> {
        let db = Arc::new(AssistantDatabase::new(dir.path().join("steward.db")).unwrap());
        let config = AssistantConfig {
            llm_api_key: None,
            ..AssistantConfig::default()
        };
        let client = Arc::new(LlmClient::new(
            "http://127.0.0.1:9".to_string(),
            None,
            "m".to_string(),
        ));
        let (memory, _worker) = MemoryUpdater::spawn(db.clone());
        let pipeline = ChatPipeline::new(
            db.clone(),
            FallbackChain::standard(client, &config),
            memory,
            &config,
        );
        Arc::new(ServerState {
            pipeline: Arc::new(pipeline),
            db,
            auth,
        })
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .header(USER_HEADER, "u1")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    async fn body_text(response: Response) -> String {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    #[tokio::test]
    async fn unreachable_model_without_credential_returns_canned_reply() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(&dir, BackendAuthConfig::disabled()));

        let response = app
            .oneshot(json_request(
                "POST",
                "/v1/ai/chat",
                serde_json::json!({ "message": "提醒我喝水", "stream": false }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        let json: Value = serde_json::from_str(&body_text(response).await).unwrap();
        assert_eq!(json["success"], true);
        assert_eq!(json["warning"], FALLBACK_WARNING);
        assert!(json["response"].as_str().unwrap().contains("创建提醒"));
        assert_eq!(json["entities"]["intent"], "create_reminder");
    }

    #[tokio::test]
    async fn streaming_chat_emits_messages_then_done() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(&dir, BackendAuthConfig::disabled()));

        let response = app
            .oneshot(json_request(
                "POST",
                "/v1/ai/chat",
                serde_json::json!({ "message": "你好" }),
            ))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()[header::CONTENT_TYPE]
            .to_str()
            .unwrap()
            .starts_with("text/event-stream"));
        let body = body_text(response).await;
        let message_at = body.find("event: message").unwrap();
        let done_at = body.find("event: done").unwrap();
        assert!(message_at < done_at);
        assert!(body.contains(FALLBACK_WARNING));
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(&dir, BackendAuthConfig::disabled()));

        let response = app
            .oneshot(json_request(
                "POST",
                "/v1/ai/chat",
                serde_json::json!({ "message": "   " }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn keyword_routes_seed_report_conflicts_and_reset() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(&dir, BackendAuthConfig::disabled()));

        let listed = app
            .clone()
            .oneshot(json_request("GET", "/v1/keywords", Value::Null))
            .await
            .unwrap();
        let listed: Vec<KeywordConfig> =
            serde_json::from_str(&body_text(listed).await).unwrap();
        assert_eq!(listed.len(), 5);

        let created = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/keywords",
                serde_json::json!({ "category": "growth", "keywords": ["健康"] }),
            ))
            .await
            .unwrap();
        assert_eq!(created.status(), StatusCode::OK);
        let created: Value = serde_json::from_str(&body_text(created).await).unwrap();
        assert_eq!(created["data"]["priority"], 2);
        assert_eq!(created["conflicts"][0]["keyword"], "健康");

        let reset = app
            .clone()
            .oneshot(json_request("POST", "/v1/keywords/reset", Value::Null))
            .await
            .unwrap();
        let reset: Vec<KeywordConfig> = serde_json::from_str(&body_text(reset).await).unwrap();
        assert_eq!(reset.len(), 5);

        let conflicts = app
            .oneshot(json_request("GET", "/v1/keywords/conflicts", Value::Null))
            .await
            .unwrap();
        assert_eq!(body_text(conflicts).await, "[]");
    }

    #[tokio::test]
    async fn unknown_keyword_update_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(&dir, BackendAuthConfig::disabled()));

        let response = app
            .oneshot(json_request(
                "PUT",
                "/v1/keywords/missing",
                serde_json::json!({ "priority": 9 }),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn memory_routes_upsert_and_summarize() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(&dir, BackendAuthConfig::disabled()));

        let upserted = app
            .clone()
            .oneshot(json_request(
                "POST",
                "/v1/memories",
                serde_json::json!({
                    "key": "user_goal",
                    "memory_type": "goal",
                    "value": { "summary": "减重5公斤" },
                    "confidence": 0.9
                }),
            ))
            .await
            .unwrap();
        assert_eq!(upserted.status(), StatusCode::OK);

        let profile = app
            .clone()
            .oneshot(json_request("GET", "/v1/memories/profile", Value::Null))
            .await
            .unwrap();
        let profile: Value = serde_json::from_str(&body_text(profile).await).unwrap();
        assert_eq!(profile["goals"]["user_goal"]["summary"], "减重5公斤");

        let cleared = app
            .clone()
            .oneshot(json_request("DELETE", "/v1/memories/type/goal", Value::Null))
            .await
            .unwrap();
        let cleared: Value = serde_json::from_str(&body_text(cleared).await).unwrap();
        assert_eq!(cleared["deleted"], 1);

        let bad_type = app
            .oneshot(json_request("DELETE", "/v1/memories/type/mood", Value::Null))
            .await
            .unwrap();
        assert_eq!(bad_type.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn basic_info_is_stored_and_returned_with_profile() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(&dir, BackendAuthConfig::disabled()));

        let updated = app
            .clone()
            .oneshot(json_request(
                "PUT",
                "/v1/memories/profile",
                serde_json::json!({ "basic_info": { "name": "小王", "city": "杭州" } }),
            ))
            .await
            .unwrap();
        assert_eq!(updated.status(), StatusCode::OK);

        let profile = app
            .clone()
            .oneshot(json_request("GET", "/v1/memories/profile", Value::Null))
            .await
            .unwrap();
        let profile: Value = serde_json::from_str(&body_text(profile).await).unwrap();
        assert_eq!(profile["basic_info"]["city"], "杭州");

        let rejected = app
            .oneshot(json_request(
                "PUT",
                "/v1/memories/profile",
                serde_json::json!({ "basic_info": "小王" }),
            ))
            .await
            .unwrap();
        assert_eq!(rejected.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn protected_routes_require_bearer_token() {
        let dir = tempfile::tempdir().unwrap();
        let app = build_router(test_state(&dir, BackendAuthConfig::with_token("token-123")));

        let denied = app
            .clone()
            .oneshot(json_request("GET", "/v1/health", Value::Null))
            .await
            .unwrap();
        assert_eq!(denied.status(), StatusCode::UNAUTHORIZED);

        let mut request = json_request("GET", "/v1/health", Value::Null);
        request.headers_mut().insert(
            header::AUTHORIZATION,
            HeaderValue::from_static("Bearer token-123"),
        );
        let allowed = app.oneshot(request).await.unwrap();
        assert_eq!(allowed.status(), StatusCode::OK);
    }

    #[test]
    fn user_id_defaults_to_local() {
        let mut headers = HeaderMap::new();
        assert_eq!(user_id(&headers), "local");
        headers.insert(USER_HEADER, HeaderValue::from_static(" alice "));
        assert_eq!(user_id(&headers), "alice");
    }

    #[test]
    fn parse_auth_mode_defaults_to_required() {
        assert!(matches!(parse_auth_mode(None).unwrap(), AuthMode::Required));
        assert!(matches!(
            parse_auth_mode(Some("disabled".to_string())).unwrap(),
            AuthMode::Disabled
        ));
        assert!(parse_auth_mode(Some("nope".to_string())).is_err());
    }
}
