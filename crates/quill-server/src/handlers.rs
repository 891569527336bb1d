use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use quill_core::ids::SessionId;
use quill_engine::{AgentRunner, Outcome, TransportAdapter};

use crate::server::AppState;
use crate::transport;

pub const NEW_CONVERSATION_COMMAND: &str = "start a new conversation";
pub const NEW_CONVERSATION_REPLY: &str =
    "Your previous conversation has been saved. You are now ready to begin a new conversation.";

/// Body of `POST /invoke`.
#[derive(Debug, Deserialize)]
pub struct InvokeRequest {
    #[serde(default, alias = "message")]
    pub goal: String,
    #[serde(default, alias = "userId")]
    pub session_id: Option<String>,
}

pub fn is_new_conversation(goal: &str) -> bool {
    goal.trim().to_lowercase().contains(NEW_CONVERSATION_COMMAND)
}

fn json_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

pub async fn invoke(State(state): State<AppState>, Json(request): Json<InvokeRequest>) -> Response {
    let goal = request.goal.trim().to_string();
    if goal.is_empty() {
        return json_error(StatusCode::BAD_REQUEST, "goal must not be empty");
    }
    let session_id = request
        .session_id
        .filter(|s| !s.trim().is_empty())
        .map(SessionId::from_raw)
        .unwrap_or_default();

    if is_new_conversation(&goal) {
        return new_conversation(&state, &session_id).await;
    }

    let (http, pending) = transport::channel(state.config.send_window);
    let runner = state.runner.clone();
    let cancel = state.shutdown.child_token();
    tokio::spawn(async move {
        let mut adapter = TransportAdapter::new(http);
        let report = runner.run(&goal, &session_id, &mut adapter, &cancel).await;
        log_report(&runner, &session_id, &report.outcome, adapter.bytes_written());
    });

    pending.into_response().await
}

async fn new_conversation(state: &AppState, session_id: &SessionId) -> Response {
    match state.store.increment_chat_index(session_id.as_str()).await {
        Ok(chat_index) => {
            info!(session_id = %session_id, chat_index, "new conversation started");
            (
                StatusCode::OK,
                Json(json!({
                    "message": NEW_CONVERSATION_REPLY,
                    "session_id": session_id,
                    "chat_index": chat_index,
                })),
            )
                .into_response()
        }
        Err(e) => {
            warn!(session_id = %session_id, error = %e, "failed to start new conversation");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

fn log_report(runner: &AgentRunner, session_id: &SessionId, outcome: &Outcome, bytes: usize) {
    match outcome {
        Outcome::Answered { synthetic, .. } => {
            info!(session_id = %session_id, model = runner.model_name(), synthetic, bytes, "request answered")
        }
        Outcome::Aborted(reason) => {
            warn!(session_id = %session_id, kind = reason.kind(), reason = %reason, bytes, "request aborted")
        }
    }
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "model": state.runner.model_name(),
        "tools": state.runner.tools().names(),
    }))
}
