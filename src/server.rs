use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::{Json, Router, routing::{get, post}};
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent::context::ReasoningStep;
use crate::agent::tools::ToolSpec;
use crate::agent::{Engine, LoopResult};
use crate::error::{LoopErrorKind, StoreError};
use crate::insights::{DEFAULT_RELATED_LIMIT, DEFAULT_SUMMARY_LENGTH, RelatedSession};
use crate::preferences::{self, DEFAULT_MIN_OCCURRENCES, Preference, PreferenceStore};
use crate::session::Turn;
use crate::settings::{LoopConfig, LoopConfigOverrides, resolve_loop_config};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub preferences: Arc<dyn PreferenceStore>,
    pub defaults: LoopConfig,
    /// Root token; every request runs on a child of it.
    pub cancel: CancellationToken,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, preferences: Arc<dyn PreferenceStore>, defaults: LoopConfig) -> Self {
        Self { engine, preferences, defaults, cancel: CancellationToken::new() }
    }
}

#[derive(Debug, Deserialize)]
pub struct ChatBody {
    pub session_id: Option<String>,
    pub message: String,
    #[serde(default)]
    pub config: LoopConfigOverrides,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ChatResponse {
    Answer { session_id: String, answer: String, steps: usize, degraded: bool },
    Exhausted { session_id: String, steps: Vec<ReasoningStep> },
    Failed { session_id: String, error: LoopErrorKind },
}

fn failure_status(kind: LoopErrorKind) -> StatusCode {
    match kind {
        LoopErrorKind::GatewayUnavailable => StatusCode::BAD_GATEWAY,
        LoopErrorKind::ParseError | LoopErrorKind::StoreUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
        LoopErrorKind::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
    }
}

async fn chat(State(state): State<AppState>, Json(body): Json<ChatBody>) -> (StatusCode, Json<ChatResponse>) {
    let session_id = body.session_id.filter(|s| !s.is_empty()).unwrap_or_else(|| Uuid::new_v4().to_string());
    let config = resolve_loop_config(&state.defaults, &body.config);
    if let Err(e) = preferences::learn_from_message(state.preferences.as_ref(), &body.message).await {
        warn!(error = %e, "could not save stated preference");
    }
    let token = state.cancel.child_token();
    let report = state.engine.run_loop_with_cancel(&session_id, &body.message, &config, &token).await;
    match report.result {
        LoopResult::Answer(answer) => (
            StatusCode::OK,
            Json(ChatResponse::Answer { session_id, answer, steps: report.step_count, degraded: report.degraded }),
        ),
        LoopResult::Exhausted(steps) => (StatusCode::OK, Json(ChatResponse::Exhausted { session_id, steps })),
        LoopResult::Failed(kind) => (failure_status(kind), Json(ChatResponse::Failed { session_id, error: kind })),
    }
}

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TurnsResponse {
    pub turns: Vec<Turn>,
}

fn store_failure(e: StoreError) -> StatusCode {
    error!(error = %e, "store request failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

async fn history(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<HistoryQuery>,
) -> Result<Json<TurnsResponse>, StatusCode> {
    let limit = q.limit.unwrap_or(state.defaults.context_window_turns);
    let turns = state.engine.history(&id, limit).await.map_err(store_failure)?;
    Ok(Json(TurnsResponse { turns }))
}

#[derive(Debug, Deserialize)]
pub struct SearchBody {
    pub query: String,
    pub k: Option<usize>,
}

async fn search(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(body): Json<SearchBody>,
) -> Result<Json<TurnsResponse>, StatusCode> {
    let turns = state.engine.search_memory(&id, &body.query, body.k.unwrap_or(5)).await.map_err(store_failure)?;
    Ok(Json(TurnsResponse { turns }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListSessionsResponse {
    pub sessions: Vec<String>,
}

async fn list_sessions(State(state): State<AppState>) -> Result<Json<ListSessionsResponse>, StatusCode> {
    let sessions = state.engine.memory().sessions().await.map_err(store_failure)?;
    Ok(Json(ListSessionsResponse { sessions }))
}

#[derive(Debug, Deserialize)]
pub struct SummaryQuery {
    pub max_length: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct SummaryResponse {
    pub session_id: String,
    pub summary: String,
}

async fn session_summary(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<SummaryQuery>,
) -> Result<Json<SummaryResponse>, StatusCode> {
    let max_length = q.max_length.unwrap_or(DEFAULT_SUMMARY_LENGTH);
    let summary = state.engine.session_summary(&id, max_length).await.map_err(store_failure)?;
    Ok(Json(SummaryResponse { session_id: id, summary }))
}

#[derive(Debug, Deserialize)]
pub struct RelatedQuery {
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RelatedResponse {
    pub related: Vec<RelatedSession>,
}

async fn related_sessions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(q): Query<RelatedQuery>,
) -> Result<Json<RelatedResponse>, StatusCode> {
    let related = state.engine.related_sessions(&id, q.limit.unwrap_or(DEFAULT_RELATED_LIMIT)).await.map_err(store_failure)?;
    Ok(Json(RelatedResponse { related }))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PreferencesResponse {
    pub preferences: Vec<Preference>,
    pub summary: String,
}

async fn list_preferences(State(state): State<AppState>) -> Result<Json<PreferencesResponse>, StatusCode> {
    let prefs = state.preferences.list().await.map_err(store_failure)?;
    let summary = preferences::summary(&prefs);
    Ok(Json(PreferencesResponse { preferences: prefs, summary }))
}

#[derive(Debug, Deserialize)]
pub struct PreferenceBody {
    pub category: String,
    pub key: String,
    pub value: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PreferenceUpdated {
    pub success: bool,
    pub message: String,
    pub preference: Preference,
}

async fn put_preference(
    State(state): State<AppState>,
    Json(body): Json<PreferenceBody>,
) -> Result<Json<PreferenceUpdated>, StatusCode> {
    let (category, key) = (body.category.trim(), body.key.trim());
    if category.is_empty() || key.is_empty() || body.value.is_null() {
        return Err(StatusCode::BAD_REQUEST);
    }
    let pref = Preference::explicit(category, key, body.value);
    state.preferences.put(pref.clone()).await.map_err(store_failure)?;
    info!(category, key, "preference updated");
    let message = format!("Preference saved: {}.{}", pref.category, pref.key);
    Ok(Json(PreferenceUpdated { success: true, message, preference: pref }))
}

async fn get_preference(
    State(state): State<AppState>,
    Path((category, key)): Path<(String, String)>,
) -> Result<Json<Preference>, StatusCode> {
    match state.preferences.get(&category, &key).await.map_err(store_failure)? {
        Some(pref) => Ok(Json(pref)),
        None => Err(StatusCode::NOT_FOUND),
    }
}

#[derive(Debug, Deserialize)]
pub struct DetectQuery {
    pub min_occurrences: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DetectResponse {
    pub success: bool,
    pub message: String,
    pub patterns: Vec<Preference>,
}

async fn detect_patterns(
    State(state): State<AppState>,
    Query(q): Query<DetectQuery>,
) -> Result<Json<DetectResponse>, StatusCode> {
    let min = q.min_occurrences.unwrap_or(DEFAULT_MIN_OCCURRENCES);
    let patterns = preferences::detect_patterns(state.engine.memory(), state.preferences.as_ref(), min)
        .await
        .map_err(store_failure)?;
    let message = format!("Detected {} patterns", patterns.len());
    Ok(Json(DetectResponse { success: true, message, patterns }))
}

#[derive(Debug, Serialize)]
struct ToolsResponse {
    tools: Vec<ToolSpec>,
}

async fn list_tools(State(state): State<AppState>) -> Json<ToolsResponse> {
    Json(ToolsResponse { tools: state.engine.tool_specs().to_vec() })
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/v1/chat", post(chat))
        .route("/v1/tools", get(list_tools))
        .route("/v1/sessions", get(list_sessions))
        .route("/v1/sessions/:id/history", get(history))
        .route("/v1/sessions/:id/search", post(search))
        .route("/v1/sessions/:id/summary", get(session_summary))
        .route("/v1/sessions/:id/related", get(related_sessions))
        .route("/v1/preferences", get(list_preferences).put(put_preference))
        .route("/v1/preferences/detect", post(detect_patterns))
        .route("/v1/preferences/:category/:key", get(get_preference))
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let cancel = state.cancel.clone();
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("shutdown requested; cancelling in-flight loops");
            }
            cancel.cancel();
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::tools::ToolRegistry;
    use crate::embedding::{Embedder, HashingEmbedder};
    use crate::error::GatewayError;
    use crate::models::{CompletionRequest, ModelGateway, ModelOutput, ToolCallRequest};
    use crate::preferences::InMemoryPreferenceStore;
    use crate::storage::InMemoryStore;
    use async_trait::async_trait;
    use serde_json::{Value, json};

    /// Answers "pong" unless the message asks for a calculation.
    struct EchoGateway;

    #[async_trait]
    impl ModelGateway for EchoGateway {
        async fn complete(&self, req: CompletionRequest<'_>) -> Result<ModelOutput, GatewayError> {
            let last = req.history.last().map(|m| m.content.clone()).unwrap_or_default();
            match last.as_str() {
                "calc" => Ok(ModelOutput::ToolCall(ToolCallRequest {
                    thought: None,
                    name: "calculator".into(),
                    arguments: json!({"expr": "6*7"}),
                })),
                "down" => Err(GatewayError::transport("connection refused")),
                "garbage" => Err(GatewayError::malformed("not json")),
                _ if req.history.len() > 1 && last.contains("42") => Ok(ModelOutput::FinalAnswer("42".into())),
                _ => Ok(ModelOutput::FinalAnswer("pong".into())),
            }
        }
    }

    async fn spawn_app() -> (String, AppState) {
        let embedder: Arc<dyn Embedder> = Arc::new(HashingEmbedder::default());
        let memory = Arc::new(InMemoryStore::new(embedder.clone()));
        let tools = Arc::new(ToolRegistry::with_default_tools(Default::default()).unwrap());
        let engine = Arc::new(Engine::new(Arc::new(EchoGateway), tools, memory, embedder));
        let defaults = LoopConfig { max_gateway_retries: 0, retry_backoff_ms: 1, ..LoopConfig::default() };
        let state = AppState::new(engine, Arc::new(InMemoryPreferenceStore::new()), defaults);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = router(state.clone());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (format!("http://{}", addr), state)
    }

    async fn post_chat(base: &str, body: Value) -> (u16, Value) {
        let resp = reqwest::Client::new().post(format!("{}/v1/chat", base)).json(&body).send().await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.json().await.unwrap())
    }

    #[tokio::test]
    async fn health_and_tools() {
        let (base, _) = spawn_app().await;
        let v: Value = reqwest::get(format!("{}/health", base)).await.unwrap().json().await.unwrap();
        assert_eq!(v["status"], "ok");
        let v: Value = reqwest::get(format!("{}/v1/tools", base)).await.unwrap().json().await.unwrap();
        let names: Vec<&str> = v["tools"].as_array().unwrap().iter().map(|t| t["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["calculator", "current_time", "memory_search", "web_search", "fetch_url"]);
    }

    #[tokio::test]
    async fn chat_answers_and_persists_history() {
        let (base, _) = spawn_app().await;
        let (status, v) = post_chat(&base, json!({"session_id": "alice", "message": "ping"})).await;
        assert_eq!(status, 200);
        assert_eq!(v["status"], "answer");
        assert_eq!(v["answer"], "pong");

        let (status, v) = post_chat(&base, json!({"session_id": "alice", "message": "calc"})).await;
        assert_eq!(status, 200);
        assert_eq!(v["answer"], "42");
        assert_eq!(v["steps"], 1);

        let h: Value = reqwest::get(format!("{}/v1/sessions/alice/history?limit=10", base)).await.unwrap().json().await.unwrap();
        let roles: Vec<&str> = h["turns"].as_array().unwrap().iter().map(|t| t["role"].as_str().unwrap()).collect();
        assert_eq!(roles, vec!["user", "assistant", "user", "tool", "assistant"]);

        let h: Value = reqwest::get(format!("{}/v1/sessions/alice/history?limit=2", base)).await.unwrap().json().await.unwrap();
        assert_eq!(h["turns"].as_array().unwrap().len(), 2);

        let s: Value = reqwest::Client::new()
            .post(format!("{}/v1/sessions/alice/search", base))
            .json(&json!({"query": "ping", "k": 1}))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(s["turns"][0]["content"]["value"], "ping");

        let s: Value = reqwest::get(format!("{}/v1/sessions", base)).await.unwrap().json().await.unwrap();
        assert_eq!(s["sessions"], json!(["alice"]));
    }

    #[tokio::test]
    async fn anonymous_chat_gets_session_id() {
        let (base, _) = spawn_app().await;
        let (_, v) = post_chat(&base, json!({"message": "ping"})).await;
        let id = v["session_id"].as_str().unwrap();
        assert!(Uuid::parse_str(id).is_ok());
    }

    #[tokio::test]
    async fn failures_map_to_status_codes() {
        let (base, _) = spawn_app().await;
        let (status, v) = post_chat(&base, json!({"message": "down"})).await;
        assert_eq!(status, 502);
        assert_eq!(v["status"], "failed");
        assert_eq!(v["error"], "gateway_unavailable");

        let (status, v) = post_chat(&base, json!({"message": "garbage"})).await;
        assert_eq!(status, 500);
        assert_eq!(v["error"], "parse_error");
    }

    #[tokio::test]
    async fn overrides_apply_per_request() {
        let (base, _) = spawn_app().await;
        let (status, v) = post_chat(&base, json!({"message": "calc", "config": {"max_steps": 0}})).await;
        assert_eq!(status, 200);
        assert_eq!(v["status"], "exhausted");
        assert_eq!(v["steps"], json!([]));
    }

    #[tokio::test]
    async fn preferences_roundtrip_over_http() {
        let (base, _) = spawn_app().await;
        let client = reqwest::Client::new();
        let v: Value = reqwest::get(format!("{}/v1/preferences", base)).await.unwrap().json().await.unwrap();
        assert_eq!(v["preferences"], json!([]));
        assert_eq!(v["summary"], "No preferences set yet.");

        let resp = client
            .put(format!("{}/v1/preferences", base))
            .json(&json!({"category": "responses", "key": "language", "value": "French"}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status().as_u16(), 200);
        let v: Value = resp.json().await.unwrap();
        assert_eq!(v["success"], true);
        assert_eq!(v["preference"]["source"], "explicit");

        let v: Value = reqwest::get(format!("{}/v1/preferences/responses/language", base)).await.unwrap().json().await.unwrap();
        assert_eq!(v["value"], "French");
        let missing = reqwest::get(format!("{}/v1/preferences/responses/tone", base)).await.unwrap();
        assert_eq!(missing.status().as_u16(), 404);

        let bad = client.put(format!("{}/v1/preferences", base)).json(&json!({"category": " ", "key": "k", "value": 1})).send().await.unwrap();
        assert_eq!(bad.status().as_u16(), 400);

        // stated preferences in chat are picked up
        post_chat(&base, json!({"session_id": "p", "message": "I prefer short answers"})).await;
        let v: Value = reqwest::get(format!("{}/v1/preferences", base)).await.unwrap().json().await.unwrap();
        assert_eq!(v["preferences"].as_array().unwrap().len(), 2);
        assert!(v["summary"].as_str().unwrap().starts_with("Your Preferences:"));
    }

    #[tokio::test]
    async fn pattern_detection_over_http() {
        let (base, _) = spawn_app().await;
        for _ in 0..3 {
            post_chat(&base, json!({"session_id": "habit", "message": "calc"})).await;
        }
        let v: Value = reqwest::Client::new()
            .post(format!("{}/v1/preferences/detect?min_occurrences=3", base))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(v["success"], true);
        let keys: Vec<&str> = v["patterns"].as_array().unwrap().iter().map(|p| p["key"].as_str().unwrap()).collect();
        assert!(keys.contains(&"most_used"));
        let v: Value = reqwest::get(format!("{}/v1/preferences/tools/most_used", base)).await.unwrap().json().await.unwrap();
        assert_eq!(v["value"], "calculator");
        assert_eq!(v["source"], "pattern");
    }

    #[tokio::test]
    async fn session_summary_and_related() {
        let (base, _) = spawn_app().await;
        post_chat(&base, json!({"session_id": "a", "message": "book a dentist appointment"})).await;
        post_chat(&base, json!({"session_id": "b", "message": "weather forecast for paris"})).await;
        post_chat(&base, json!({"session_id": "c", "message": "cancel the dentist appointment"})).await;

        let v: Value = reqwest::get(format!("{}/v1/sessions/a/summary", base)).await.unwrap().json().await.unwrap();
        assert_eq!(v["summary"], "Discussed 1 topics: book a dentist appointment");
        let v: Value = reqwest::get(format!("{}/v1/sessions/a/summary?max_length=12", base)).await.unwrap().json().await.unwrap();
        assert_eq!(v["summary"], "Discussed...");
        let v: Value = reqwest::get(format!("{}/v1/sessions/nobody/summary", base)).await.unwrap().json().await.unwrap();
        assert_eq!(v["summary"], "No conversation history found.");

        let v: Value = reqwest::get(format!("{}/v1/sessions/c/related?limit=3", base)).await.unwrap().json().await.unwrap();
        let ids: Vec<&str> = v["related"].as_array().unwrap().iter().map(|r| r["session_id"].as_str().unwrap()).collect();
        assert_eq!(ids, vec!["a"]);
    }

    #[tokio::test]
    async fn strategy_is_selected_per_request() {
        let (base, _) = spawn_app().await;
        let (status, v) = post_chat(&base, json!({"message": "ping", "config": {"strategy": "chain_of_thought"}})).await;
        assert_eq!(status, 200);
        assert_eq!(v["status"], "answer");
        assert_eq!(v["answer"], "pong");
        let (status, _) = post_chat(&base, json!({"message": "ping", "config": {"strategy": "astrology"}})).await;
        assert_eq!(status, 422);
    }

    #[tokio::test]
    async fn cancelled_root_token_rejects_new_runs() {
        let (base, state) = spawn_app().await;
        state.cancel.cancel();
        let (status, v) = post_chat(&base, json!({"message": "ping"})).await;
        assert_eq!(status, 503);
        assert_eq!(v["error"], "cancelled");
    }
}
