#![allow(dead_code)]

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use nutrilens_core::backend::BackendClient;
use nutrilens_core::capture::SensorFrame;
use nutrilens_core::config::NutriLensConfig;
use nutrilens_core::session::TokenStore;
use nutrilens_core::Pipeline;

/// Password the mock accepts for every user.
pub const PASSWORD: &str = "secret";

/// Token the mock always rejects.
pub const EXPIRED_TOKEN: &str = "expired";

/// Canned HTTP reply, optionally held back before it is sent.
#[derive(Debug, Clone)]
pub struct Reply {
    pub status: StatusCode,
    pub body: Value,
    pub delay: Duration,
}

impl Reply {
    pub fn ok(body: Value) -> Self {
        Self {
            status: StatusCode::OK,
            body,
            delay: Duration::ZERO,
        }
    }

    pub fn status(status: u16) -> Self {
        Self {
            status: StatusCode::from_u16(status).unwrap(),
            body: json!({"error": "mock"}),
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    async fn send(self) -> Response {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        (self.status, Json(self.body)).into_response()
    }
}

pub fn analysis_reply(food_name: &str, calories: u32) -> Reply {
    Reply::ok(json!({
        "foodName": food_name,
        "calories": calories,
        "narrative": format!("{food_name}: mostly carbs, some fibre."),
    }))
}

/// Mutable behavior and recorded traffic of the mock backend.
#[derive(Default)]
pub struct MockState {
    /// Replies for `/analyze_food` and `/v1/chat/completions`, in arrival order.
    /// When empty, those endpoints answer 500.
    pub analyze: Mutex<VecDeque<Reply>>,
    /// Bodies received by the analysis endpoints.
    pub analyze_bodies: Mutex<Vec<Value>>,
    /// Overrides `POST /food-logs`; `None` accepts and stores the record.
    pub create_reply: Mutex<Option<Reply>>,
    pub food_logs: Mutex<Vec<Value>>,
    /// `None` answers 503.
    pub insights_reply: Mutex<Option<Reply>>,
    pub users: Mutex<Vec<String>>,
    /// When set, every bearer token is rejected.
    pub revoked: AtomicBool,
    /// Every request as "METHOD /path".
    pub requests: Mutex<Vec<String>>,
}

impl MockState {
    pub fn push_analysis(&self, reply: Reply) {
        self.analyze.lock().unwrap().push_back(reply);
    }

    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().unwrap().clone()
    }

    pub fn count(&self, request: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.as_str() == request)
            .count()
    }

    /// Poll until `n` analysis requests have arrived.
    pub async fn wait_for_analyses(&self, n: usize) {
        for _ in 0..200 {
            if self.analyze_bodies.lock().unwrap().len() >= n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("expected {n} analysis requests");
    }

    pub fn revoke_tokens(&self) {
        self.revoked.store(true, Ordering::SeqCst);
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        !self.revoked.load(Ordering::SeqCst)
            && headers
                .get("authorization")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .is_some_and(|token| !token.is_empty() && token != EXPIRED_TOKEN)
    }

    fn record(&self, request: &str) {
        self.requests.lock().unwrap().push(request.to_string());
    }
}

pub struct MockServer {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

impl MockServer {
    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// Configuration pointing every endpoint at this server, with state
    /// files under `dir`.
    pub fn config(&self, dir: &Path) -> NutriLensConfig {
        let mut config = NutriLensConfig::default_config();
        config.backend.base_url = self.url();
        config.session.token_path = Some(dir.join("token").display().to_string());
        config.log.pending_path = Some(dir.join("pending.jsonl").display().to_string());
        config
    }

    pub fn backend(&self) -> BackendClient {
        let mut config = NutriLensConfig::default_config();
        config.backend.base_url = self.url();
        BackendClient::from_config(&config.backend).unwrap()
    }

    pub fn pipeline(&self, dir: &Path) -> Arc<Pipeline> {
        pipeline_from(&self.config(dir))
    }
}

pub fn pipeline_from(config: &NutriLensConfig) -> Arc<Pipeline> {
    Arc::new(Pipeline::from_config_with_tokens(config, TokenStore::memory()).unwrap())
}

/// A frame with a JPEG header and no depth or raycast hit.
pub fn jpeg_frame() -> SensorFrame {
    SensorFrame {
        image: Some(vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10]),
        ..Default::default()
    }
}

/// Start the mock backend on an ephemeral port.
pub async fn spawn_backend() -> MockServer {
    let state = Arc::new(MockState::default());
    let app = Router::new()
        .route("/login", post(login))
        .route("/register", post(register))
        .route("/user-profile", get(user_profile))
        .route("/food-logs", get(list_food_logs).post(create_food_log))
        .route("/insights", get(insights))
        .route("/analyze_food", post(analyze_food))
        .route("/v1/chat/completions", post(chat_completions))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    MockServer { addr, state }
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": "Unauthorized"}))).into_response()
}

async fn login(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    state.record("POST /login");
    let username = body["username"].as_str().unwrap_or_default();
    if body["password"] != PASSWORD {
        return unauthorized();
    }
    Json(json!({"token": format!("token-{username}")})).into_response()
}

async fn register(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    state.record("POST /register");
    let username = body["username"].as_str().unwrap_or_default().to_string();
    let mut users = state.users.lock().unwrap();
    if users.contains(&username) {
        return (StatusCode::CONFLICT, Json(json!({"error": "exists"}))).into_response();
    }
    users.push(username);
    (StatusCode::CREATED, Json(json!({"message": "User created"}))).into_response()
}

async fn user_profile(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    state.record("GET /user-profile");
    if !state.authorized(&headers) {
        return unauthorized();
    }
    Json(json!({
        "id": "0190a5b4-8c2e-7d4e-9b1a-3f2e1d0c9b8a",
        "username": "sam",
        "dailyCalorieGoal": 1800,
    }))
    .into_response()
}

async fn list_food_logs(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    state.record("GET /food-logs");
    if !state.authorized(&headers) {
        return unauthorized();
    }
    let logs = state.food_logs.lock().unwrap().clone();
    Json(Value::Array(logs)).into_response()
}

async fn create_food_log(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.record("POST /food-logs");
    if !state.authorized(&headers) {
        return unauthorized();
    }
    let reply = state.create_reply.lock().unwrap().clone();
    if let Some(reply) = reply {
        if reply.status.is_success() {
            state.food_logs.lock().unwrap().push(body);
        }
        return reply.send().await;
    }
    state.food_logs.lock().unwrap().push(body.clone());
    (StatusCode::CREATED, Json(body)).into_response()
}

async fn insights(State(state): State<Arc<MockState>>, headers: HeaderMap) -> Response {
    state.record("GET /insights");
    if !state.authorized(&headers) {
        return unauthorized();
    }
    let reply = state.insights_reply.lock().unwrap().clone();
    match reply {
        Some(reply) => reply.send().await,
        None => Reply::status(503).send().await,
    }
}

async fn analyze_food(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.record("POST /analyze_food");
    state.analyze_bodies.lock().unwrap().push(body);
    if !state.authorized(&headers) {
        return unauthorized();
    }
    next_analysis(&state).send().await
}

/// OpenAI-compatible endpoint: wraps the queued result as message content.
async fn chat_completions(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.record("POST /v1/chat/completions");
    state.analyze_bodies.lock().unwrap().push(body);
    if headers.get("authorization").is_none() {
        return unauthorized();
    }
    let reply = next_analysis(&state);
    if !reply.status.is_success() {
        return reply.send().await;
    }
    let content = format!("```json\n{}\n```", reply.body);
    Reply {
        body: json!({"choices": [{"message": {"role": "assistant", "content": content}}]}),
        ..reply
    }
    .send()
    .await
}

fn next_analysis(state: &MockState) -> Reply {
    state
        .analyze
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| Reply::status(500))
}
