use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::post,
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::control::ControlSession;

use super::tools;

#[derive(Clone)]
struct AppState {
    session: Arc<ControlSession>,
}

#[derive(Deserialize)]
struct ToolCall {
    name: String,
    #[serde(default)]
    arguments: Value,
}

/// Serves the remote tool endpoint: stateless `POST /mcp` taking
/// `{name, arguments}` and answering a text content envelope.
pub async fn run_server(session: Arc<ControlSession>, port: u16) -> Result<(), String> {
    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    let app = Router::new()
        .route("/mcp", post(call_tool))
        .with_state(AppState { session });

    log::info!("Tool server listening on http://{}/mcp", addr);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| format!("failed to bind {}: {}", addr, e))?;
    axum::serve(listener, app).await.map_err(|e| e.to_string())
}

async fn call_tool(State(state): State<AppState>, Json(call): Json<ToolCall>) -> impl IntoResponse {
    log::debug!("Tool call: {}", call.name);
    let body = match tools::dispatch(&state.session, &call.name, &call.arguments).await {
        Ok(result) => {
            let text =
                serde_json::to_string(&result).unwrap_or_else(|e| format!("\"serialize: {e}\""));
            json!({"content": [{"type": "text", "text": text}]})
        }
        Err(e) => {
            log::warn!("Tool '{}' failed: {}", call.name, e);
            json!({
                "content": [{"type": "text", "text": e.to_string()}],
                "isError": true,
            })
        }
    };
    (StatusCode::OK, Json(body))
}
