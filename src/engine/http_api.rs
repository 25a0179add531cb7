// Lucy Engine — Inbound HTTP Surface
//
// Three route groups on one axum router:
//   • /api/lucy-spaces/* — fixed callback endpoints for the web apps Lucy
//     builds ("Spaces"): OTP email relay and a small tool gateway. Both
//     authenticate with a per-project secret; 403 on mismatch.
//   • /slack/events — the HTTP receiver used by `run --http` instead of
//     Socket Mode (URL-verification challenge + event dispatch).
//   • /slack/interactions — approval buttons resolving HITL actions.

use crate::atoms::error::EngineResult;
use crate::atoms::types::Message;
use crate::engine::pipeline::MessagePipeline;
use crate::engine::providers::ChatProvider;
use crate::engine::slack::extract_event;
use crate::engine::tools::gateway::GatewayClient;
use async_trait::async_trait;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::{Json, Router};
use log::{info, warn};
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tower_http::cors::CorsLayer;

/// Sends Spaces OTP emails. The concrete mail provider is a collaborator;
/// when none is wired the endpoint answers 503.
#[async_trait]
pub trait SpacesMailer: Send + Sync {
    async fn send(&self, to: &str, subject: &str, html: &str, text: &str) -> EngineResult<()>;
}

#[derive(Clone)]
pub struct ApiState {
    pub pipeline: Arc<MessagePipeline>,
    pub provider: Arc<dyn ChatProvider>,
    pub gateway: Option<Arc<GatewayClient>>,
    pub mailer: Option<Arc<dyn SpacesMailer>>,
    pub workspace_root: PathBuf,
    pub search_model: String,
}

pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/api/lucy-spaces/send-email", post(send_email))
        .route("/api/lucy-spaces/tools/call", post(tools_call))
        .route("/slack/events", post(slack_events))
        .route("/slack/interactions", post(slack_interactions))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ── Spaces: send-email ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SendEmailRequest {
    project_name: String,
    project_secret: String,
    to_email: String,
    subject: String,
    html_content: String,
    #[serde(default)]
    text_content: String,
    #[serde(default)]
    email_type: String,
}

async fn send_email(
    State(state): State<ApiState>,
    Json(req): Json<SendEmailRequest>,
) -> impl IntoResponse {
    if !verify_project_secret(&state.workspace_root, &req.project_name, &req.project_secret) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"success": false, "error": "Invalid project credentials"})),
        );
    }

    let Some(mailer) = &state.mailer else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({"success": false, "error": "Email service not configured"})),
        );
    };

    let text = if req.text_content.is_empty() {
        req.subject.clone()
    } else {
        req.text_content.clone()
    };
    match mailer
        .send(&req.to_email, &req.subject, &req.html_content, &text)
        .await
    {
        Ok(()) => {
            info!(
                "[http] Spaces email sent for project {} (type={})",
                req.project_name,
                if req.email_type.is_empty() { "otp" } else { &req.email_type }
            );
            (StatusCode::OK, Json(json!({"success": true})))
        }
        Err(e) => {
            warn!("[http] Spaces email failed for {}: {}", req.project_name, e);
            (
                StatusCode::OK,
                Json(json!({"success": false, "error": e.to_string()})),
            )
        }
    }
}

// ── Spaces: tools/call ─────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ToolCallRequest {
    project_name: String,
    project_secret: String,
    role: String,
    #[serde(default)]
    arguments: Value,
}

async fn tools_call(
    State(state): State<ApiState>,
    Json(req): Json<ToolCallRequest>,
) -> impl IntoResponse {
    if !verify_project_secret(&state.workspace_root, &req.project_name, &req.project_secret) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"success": false, "error": "Invalid project credentials"})),
        );
    }

    let result = match req.role.as_str() {
        "quick_ai_search" => quick_ai_search(&state, &req.arguments).await,
        "text2im" => Ok(json!({
            "response_text": format!(
                "Image generation requested: {}. Image generation via Spaces is a coming-soon feature.",
                req.arguments["prompt"].as_str().unwrap_or_default()
            ),
        })),
        "file_to_markdown" => file_to_markdown(&state, &req.arguments).await,
        other => {
            return (
                StatusCode::OK,
                Json(json!({"success": false, "error": format!("Unknown tool: {}", other)})),
            )
        }
    };

    match result {
        Ok(value) => (StatusCode::OK, Json(json!({"success": true, "result": value}))),
        Err(e) => {
            warn!("[http] Spaces tool '{}' failed: {}", req.role, e);
            (
                StatusCode::OK,
                Json(json!({"success": false, "error": e.to_string()})),
            )
        }
    }
}

async fn quick_ai_search(state: &ApiState, arguments: &Value) -> EngineResult<Value> {
    let query = arguments["search_question"].as_str().unwrap_or_default();
    if query.is_empty() {
        return Ok(json!({"search_response": "No query provided."}));
    }
    let messages = vec![
        Message::system(
            "You are a helpful search assistant. Provide a concise, accurate answer to the \
             user's query.",
        ),
        Message::user(query),
    ];
    let reply = state
        .provider
        .chat(&state.search_model, &messages, &[], 1000, 0.3)
        .await
        .map_err(|e| crate::atoms::error::EngineError::Other(e.to_string()))?;
    Ok(json!({"search_response": reply.content}))
}

async fn file_to_markdown(state: &ApiState, arguments: &Value) -> EngineResult<Value> {
    let url = arguments["url"].as_str().unwrap_or_default();
    if url.is_empty() {
        return Ok(json!({"markdown": "", "error": "No url provided."}));
    }
    let gateway = state.gateway.as_ref().ok_or_else(|| {
        crate::atoms::error::EngineError::Config("file conversion requires the gateway".into())
    })?;
    let markdown = gateway.web_fetch(url, 30_000).await?;
    Ok(json!({"markdown": markdown}))
}

/// Check a project secret against spaces/{project}/project.json in any
/// workspace. Constant shape either way; the caller only learns pass/fail.
fn verify_project_secret(workspace_root: &PathBuf, project_name: &str, secret: &str) -> bool {
    // Project names come from the wire: refuse separators outright.
    if project_name.contains('/') || project_name.contains("..") || project_name.is_empty() {
        return false;
    }
    let Ok(entries) = std::fs::read_dir(workspace_root) else {
        return false;
    };
    for entry in entries.flatten() {
        let config = entry
            .path()
            .join("spaces")
            .join(project_name)
            .join("project.json");
        if let Ok(text) = std::fs::read_to_string(&config) {
            if let Ok(data) = serde_json::from_str::<Value>(&text) {
                if data["project_secret"].as_str() == Some(secret) {
                    return true;
                }
            }
        }
    }
    false
}

// ── Slack over HTTP ────────────────────────────────────────────────────────

async fn slack_events(State(state): State<ApiState>, Json(body): Json<Value>) -> impl IntoResponse {
    // URL-verification handshake.
    if body["type"].as_str() == Some("url_verification") {
        return (
            StatusCode::OK,
            Json(json!({"challenge": body["challenge"].as_str().unwrap_or_default()})),
        );
    }

    if body["type"].as_str() == Some("event_callback") {
        let payload = json!({
            "team_id": body["team_id"],
            "event": body["event"],
        });
        if let Some(event) = extract_event(&payload, "") {
            let pipeline = state.pipeline.clone();
            tokio::spawn(async move {
                pipeline.handle_event(event).await;
            });
        }
    }
    (StatusCode::OK, Json(json!({"ok": true})))
}

#[derive(Deserialize)]
struct InteractionRequest {
    action_id: String,
    approved: bool,
    channel: String,
}

async fn slack_interactions(
    State(state): State<ApiState>,
    Json(req): Json<InteractionRequest>,
) -> impl IntoResponse {
    let result = if req.approved {
        state.pipeline.approve_action(&req.action_id, &req.channel).await
    } else {
        state.pipeline.cancel_action(&req.action_id, &req.channel).await
    };
    match result {
        Ok(()) => (StatusCode::OK, Json(json!({"ok": true}))),
        Err(e) => (
            StatusCode::OK,
            Json(json!({"ok": false, "error": e.to_string()})),
        ),
    }
}
