//! Messenger webhook server.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/webhook` | Subscription handshake, echoes `hub.challenge` |
//! | `POST` | `/webhook` | Inbound message events |
//! | `GET`  | `/health` | Health check (returns version) |
//!
//! `POST /webhook` acknowledges as soon as each inbound message is stored.
//! Replies are produced by one spawned task per message, so a slow model
//! call never holds up the platform's delivery. Tasks for the same sender
//! are not sequenced: two quick messages may be answered out of order.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;

use crate::answer::{with_conversation, AnswerPipeline};
use crate::cache::IndexCache;
use crate::config::{env_optional, Config, FB_APP_SECRET, FB_VERIFY_TOKEN};
use crate::identity::{IdentityStore, SqliteIdentityStore};
use crate::lifecycle::IndexManager;
use crate::messenger::{verify_signature, GraphMessenger, Messenger};
use crate::models::Direction;

pub const UNLINKED_REPLY: &str =
    "Thanks for reaching out! An agent will connect your account shortly.";
pub const NOT_READY_REPLY: &str =
    "Your account is connected, but our knowledge base is not ready yet. Please try again later.";
pub const ERROR_REPLY: &str = "Sorry, I encountered an error. Please try again.";

const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Everything a webhook handler and its background tasks share.
#[derive(Clone)]
pub struct WebhookState {
    pub cache: Arc<IndexCache>,
    pub answers: Arc<AnswerPipeline>,
    pub identities: Arc<dyn IdentityStore>,
    pub messenger: Arc<dyn Messenger>,
    /// Expected `hub.verify_token`. Without one every handshake is refused.
    pub verify_token: Option<String>,
    /// When set, `POST /webhook` requires a valid signature header.
    pub app_secret: Option<String>,
    pub history_limit: usize,
}

impl WebhookState {
    pub async fn from_config(config: &Config) -> Result<Self> {
        let verify_token = env_optional(FB_VERIFY_TOKEN);
        if verify_token.is_none() {
            tracing::warn!("{} is not set, subscription handshakes will be refused", FB_VERIFY_TOKEN);
        }
        let app_secret = env_optional(FB_APP_SECRET);
        if app_secret.is_none() {
            tracing::warn!("{} is not set, webhook signatures are not checked", FB_APP_SECRET);
        }

        Ok(Self {
            cache: Arc::new(IndexCache::new(Arc::new(IndexManager::new(&config.index)))),
            answers: Arc::new(AnswerPipeline::from_config(config)?),
            identities: Arc::new(SqliteIdentityStore::open(&config.identity.path).await?),
            messenger: Arc::new(GraphMessenger::from_config(&config.messenger)?),
            verify_token,
            app_secret,
            history_limit: config.retrieval.history_limit,
        })
    }
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhook", get(verify_webhook).post(receive_webhook))
        .route("/health", get(handle_health))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// `crag serve webhook`.
pub async fn run_server(config: &Config) -> Result<()> {
    let state = WebhookState::from_config(config).await?;
    let listener = tokio::net::TcpListener::bind(&config.server.bind)
        .await
        .with_context(|| format!("Failed to bind {}", config.server.bind))?;

    println!("Webhook listening on http://{}/webhook", config.server.bind);
    axum::serve(listener, router(state)).await?;
    Ok(())
}

// ============ GET /webhook ============

async fn verify_webhook(
    State(state): State<WebhookState>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    let mode = params.get("hub.mode").map(String::as_str);
    let token = params.get("hub.verify_token");
    let challenge = params.get("hub.challenge").filter(|c| !c.is_empty());

    match (mode, token, challenge, &state.verify_token) {
        (Some("subscribe"), Some(token), Some(challenge), Some(expected)) if token == expected => {
            tracing::info!("webhook subscription verified");
            (StatusCode::OK, challenge.clone())
        }
        _ => (StatusCode::FORBIDDEN, "Forbidden".to_string()),
    }
}

// ============ POST /webhook ============

#[derive(Debug, Deserialize)]
struct WebhookPayload {
    #[serde(default)]
    entry: Vec<Entry>,
}

#[derive(Debug, Deserialize)]
struct Entry {
    #[serde(default)]
    messaging: Vec<MessagingEvent>,
}

#[derive(Debug, Deserialize)]
struct MessagingEvent {
    sender: Option<Sender>,
    message: Option<IncomingMessage>,
}

#[derive(Debug, Deserialize)]
struct Sender {
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IncomingMessage {
    text: Option<String>,
    #[serde(default)]
    is_echo: bool,
}

async fn receive_webhook(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    body: Bytes,
) -> impl IntoResponse {
    if let Some(secret) = &state.app_secret {
        let signature = headers
            .get(SIGNATURE_HEADER)
            .and_then(|v| v.to_str().ok());
        if !verify_signature(&body, signature, secret) {
            tracing::warn!("rejected webhook with invalid signature");
            return (StatusCode::UNAUTHORIZED, "Invalid signature");
        }
    }

    let Ok(value) = serde_json::from_slice::<serde_json::Value>(&body) else {
        return (StatusCode::BAD_REQUEST, "Bad request");
    };
    if value.get("object").and_then(|o| o.as_str()) != Some("page") {
        return (StatusCode::OK, "OK");
    }
    let Ok(payload) = serde_json::from_value::<WebhookPayload>(value) else {
        return (StatusCode::BAD_REQUEST, "Bad request");
    };

    for event in payload.entry.into_iter().flat_map(|e| e.messaging) {
        let Some(identity) = event.sender.and_then(|s| s.id).filter(|id| !id.is_empty()) else {
            continue;
        };
        let Some(message) = event.message.filter(|m| !m.is_echo) else {
            continue;
        };
        let text = message.text.unwrap_or_default().trim().to_string();
        if text.is_empty() {
            continue;
        }

        let message_id = match state
            .identities
            .save_message(&identity, Direction::In, &text)
            .await
        {
            Ok(id) => Some(id),
            Err(e) => {
                tracing::warn!(identity = %identity, error = %e, "failed to store inbound message");
                None
            }
        };

        let state = state.clone();
        tokio::spawn(async move {
            respond_to_message(&state, &identity, &text, message_id).await;
        });
    }

    (StatusCode::OK, "OK")
}

/// Compose, send, and store the reply to one inbound message. Every
/// failure ends in a fixed reply; nothing propagates to the caller.
pub async fn respond_to_message(
    state: &WebhookState,
    identity: &str,
    text: &str,
    message_id: Option<i64>,
) {
    let reply = match compose_reply(state, identity, text, message_id).await {
        Ok(reply) => reply,
        Err(err) => {
            state.cache.invalidate_if_corrupt(&err);
            tracing::error!(identity, error = %format!("{:#}", err), "failed to answer message");
            ERROR_REPLY.to_string()
        }
    };

    if !state.messenger.send(identity, &reply).await {
        tracing::warn!(identity, "reply was not delivered");
    }
    if let Err(e) = state
        .identities
        .save_message(identity, Direction::Out, &reply)
        .await
    {
        tracing::warn!(identity, error = %e, "failed to store outbound message");
    }
}

async fn compose_reply(
    state: &WebhookState,
    identity: &str,
    text: &str,
    message_id: Option<i64>,
) -> Result<String> {
    let Some(link) = state.identities.get_link(identity).await? else {
        tracing::info!(identity, "message from unlinked identity");
        return Ok(UNLINKED_REPLY.to_string());
    };
    let Some(index) = state.cache.get().await else {
        return Ok(NOT_READY_REPLY.to_string());
    };

    let history = match message_id {
        Some(id) if state.history_limit > 0 => {
            state
                .identities
                .history_before(identity, id, state.history_limit)
                .await?
        }
        _ => Vec::new(),
    };
    let question = with_conversation(&history, text);

    state
        .answers
        .answer_for_identity(&index, &link.contact_id, &question)
        .await
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}
