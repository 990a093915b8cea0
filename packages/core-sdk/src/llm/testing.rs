use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

/** \brief 测试用的本地 Gemini REST 替身所记录的请求。 */
#[derive(Debug, Clone)]
pub(crate) struct CapturedRequest {
    pub call: String,
    pub key: String,
    pub body: Value,
}

#[derive(Clone, Default)]
struct MockState {
    reply: Arc<Mutex<String>>,
    requests: Arc<Mutex<Vec<CapturedRequest>>>,
}

pub(crate) struct MockGemini {
    pub base_url: String,
    state: MockState,
}

impl MockGemini {
    pub fn set_reply(&self, reply: &str) {
        *self.state.reply.lock().expect("reply lock") = reply.to_string();
    }

    pub fn requests(&self) -> Vec<CapturedRequest> {
        self.state.requests.lock().expect("requests lock").clone()
    }
}

/**
 * \brief 启动本地 Mock：以 "valid" 开头的 key 视为有效。
 */
pub(crate) async fn spawn_gemini(reply: &str) -> MockGemini {
    let state = MockState::default();
    *state.reply.lock().expect("reply lock") = reply.to_string();

    let app = Router::new()
        .route("/v1beta/models", get(list_models))
        .route("/v1beta/models/{call}", post(generate_content))
        .with_state(state.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind mock gemini");
    let addr = listener.local_addr().expect("mock addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });

    MockGemini {
        base_url: format!("http://{}", addr),
        state,
    }
}

fn key_is_valid(query: &HashMap<String, String>) -> bool {
    query.get("key").is_some_and(|k| k.starts_with("valid"))
}

fn rejected() -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(json!({
            "error": {"code": 400, "message": "API key not valid. Please pass a valid API key.", "status": "INVALID_ARGUMENT"}
        })),
    )
        .into_response()
}

async fn list_models(Query(query): Query<HashMap<String, String>>) -> Response {
    if !key_is_valid(&query) {
        return rejected();
    }
    Json(json!({
        "models": [
            {"name": "models/gemini-2.0-flash-lite"},
            {"name": "models/gemini-1.5-pro"}
        ]
    }))
    .into_response()
}

async fn generate_content(
    State(state): State<MockState>,
    Path(call): Path<String>,
    Query(query): Query<HashMap<String, String>>,
    Json(body): Json<Value>,
) -> Response {
    state
        .requests
        .lock()
        .expect("requests lock")
        .push(CapturedRequest {
            call,
            key: query.get("key").cloned().unwrap_or_default(),
            body,
        });
    if !key_is_valid(&query) {
        return rejected();
    }
    let reply = state.reply.lock().expect("reply lock").clone();
    Json(json!({
        "candidates": [{"content": {"parts": [{"text": reply}], "role": "model"}}],
        "usageMetadata": {"totalTokenCount": 42}
    }))
    .into_response()
}
