//! Test fixtures shared by the batchgen crates.
//!
//! [`FakeComfyUI`] is an in-process ComfyUI server. It serves
//! `POST /prompt`, `GET /history/{prompt_id}` and `GET /system_stats` on an
//! ephemeral localhost port.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::{Path, State};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};

/// Re-exported so tests can set statuses without depending on axum.
pub use axum::http::StatusCode;

/// Behaviour knobs for the fake server.
#[derive(Debug, Clone)]
pub struct FakeConfig {
    /// Number of history polls answered with `{}` before a job shows up.
    /// `None` means jobs never complete.
    pub polls_until_done: Option<usize>,
    /// Status returned by `POST /prompt`.
    pub submit_status: StatusCode,
    /// Answer `POST /prompt` with a body lacking `prompt_id`.
    pub omit_prompt_id: bool,
    /// Status returned by `GET /history/{id}`.
    pub history_status: StatusCode,
    /// Number of initial history polls per job answered with 500. These
    /// polls count towards `polls_until_done`.
    pub failing_polls: usize,
}

impl Default for FakeConfig {
    fn default() -> Self {
        Self {
            polls_until_done: Some(0),
            submit_status: StatusCode::OK,
            omit_prompt_id: false,
            history_status: StatusCode::OK,
            failing_polls: 0,
        }
    }
}

#[derive(Default)]
pub struct FakeState {
    config: Mutex<Option<FakeConfig>>,
    next_id: AtomicUsize,
    /// Every `POST /prompt` body, in arrival order.
    pub submissions: Mutex<Vec<Value>>,
    /// History polls received per prompt id.
    pub polls: Mutex<HashMap<String, usize>>,
}

impl FakeState {
    fn config(&self) -> FakeConfig {
        self.config.lock().unwrap().clone().unwrap_or_default()
    }

    pub fn submission_count(&self) -> usize {
        self.submissions.lock().unwrap().len()
    }

    pub fn polls_for(&self, prompt_id: &str) -> usize {
        self.polls.lock().unwrap().get(prompt_id).copied().unwrap_or(0)
    }
}

pub struct FakeComfyUI {
    pub addr: SocketAddr,
    pub state: Arc<FakeState>,
    handle: tokio::task::JoinHandle<()>,
}

impl FakeComfyUI {
    pub async fn spawn(config: FakeConfig) -> Self {
        let state = Arc::new(FakeState {
            config: Mutex::new(Some(config)),
            ..Default::default()
        });

        let app = Router::new()
            .route("/prompt", post(submit))
            .route("/history/{prompt_id}", get(history))
            .route("/system_stats", get(system_stats))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake server");
        let addr = listener.local_addr().expect("local addr");

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.expect("fake server");
        });

        Self {
            addr,
            state,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }
}

impl Drop for FakeComfyUI {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// A URL on which nothing is listening.
pub async fn unreachable_url() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind throwaway listener");
    let addr = listener.local_addr().expect("local addr");
    drop(listener);
    format!("http://{addr}")
}

async fn submit(State(state): State<Arc<FakeState>>, Json(body): Json<Value>) -> Response {
    let config = state.config();
    state.submissions.lock().unwrap().push(body);

    if !config.submit_status.is_success() {
        return (config.submit_status, "submission rejected").into_response();
    }

    let number = state.next_id.fetch_add(1, Ordering::SeqCst);
    if config.omit_prompt_id {
        return Json(json!({ "number": number })).into_response();
    }

    Json(json!({
        "prompt_id": format!("job-{number}"),
        "number": number,
        "node_errors": {}
    }))
    .into_response()
}

async fn history(State(state): State<Arc<FakeState>>, Path(prompt_id): Path<String>) -> Response {
    let config = state.config();

    let seen = {
        let mut polls = state.polls.lock().unwrap();
        let count = polls.entry(prompt_id.clone()).or_insert(0);
        *count += 1;
        *count
    };

    if !config.history_status.is_success() {
        return (config.history_status, "history unavailable").into_response();
    }
    if seen <= config.failing_polls {
        return (StatusCode::INTERNAL_SERVER_ERROR, "history unavailable").into_response();
    }

    match config.polls_until_done {
        Some(pending_polls) if seen > pending_polls => Json(json!({
            prompt_id: {
                "outputs": { "9": { "images": [{ "filename": "out.png" }] } },
                "status": { "status_str": "success", "completed": true }
            }
        }))
        .into_response(),
        _ => Json(json!({})).into_response(),
    }
}

async fn system_stats() -> Json<Value> {
    Json(json!({ "system": { "os": "posix", "comfyui_version": "test" }, "devices": [] }))
}
