use std::{collections::HashMap, env, sync::Arc};

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, patch, post},
    Json, Router,
};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use tower_http::cors::CorsLayer;
use tracing::{error, info, warn};

use crate::errors::{GraphErrorKind, SyncError, WebhookError};
use crate::graph::{GraphClient, DEFAULT_GRAPH_BASE_URL};
use crate::prompting::DEFAULT_OPENAI_BASE_URL;
use crate::store::{ChatStore, PgStore};
use crate::sync::{run_conversation_sync, SyncOptions};
use crate::types::{AiModeBody, SendMessageBody, SyncRequestBody};
use crate::webhook::{self, DeliveryOutcome, VerificationOutcome};

pub struct AppState {
    pub store: Arc<dyn ChatStore>,
    pub graph: GraphClient,
    pub http: reqwest::Client,
    pub openai_base_url: String,
    pub verify_token: String,
    pub app_token: String,
}

fn resolve_database_url() -> String {
    if let Ok(url) = env::var("DATABASE_URL") {
        if !url.trim().is_empty() {
            return url;
        }
    }
    let host = env::var("POSTGRES_HOST")
        .or_else(|_| env::var("PGHOST"))
        .unwrap_or_else(|_| "localhost".to_string());
    let port = env::var("POSTGRES_PORT")
        .or_else(|_| env::var("PGPORT"))
        .unwrap_or_else(|_| "5432".to_string());
    let user = env::var("POSTGRES_USER")
        .or_else(|_| env::var("PGUSER"))
        .unwrap_or_else(|_| "postgres".to_string());
    let password = env::var("POSTGRES_PASSWORD")
        .or_else(|_| env::var("PGPASSWORD"))
        .unwrap_or_default();
    let db = env::var("POSTGRES_DB")
        .or_else(|_| env::var("PGDATABASE"))
        .unwrap_or_else(|_| "messenger".to_string());
    format!("postgres://{user}:{password}@{host}:{port}/{db}")
}

async fn health() -> impl IntoResponse {
    Json(json!({ "ok": true, "now": crate::types::now_iso() }))
}

async fn webhook_verify(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match webhook::verify_subscription(&params, &state.verify_token) {
        VerificationOutcome::Verified(challenge) => (StatusCode::OK, challenge).into_response(),
        VerificationOutcome::Forbidden => {
            (StatusCode::FORBIDDEN, "Forbidden").into_response()
        }
        VerificationOutcome::BadRequest => {
            (StatusCode::BAD_REQUEST, "Bad Request").into_response()
        }
    }
}

async fn webhook_deliver(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    match webhook::process_delivery(&state, &payload).await {
        Ok(DeliveryOutcome::Received(message)) => (
            StatusCode::OK,
            Json(json!({ "message": "Message received", "data": message })),
        )
            .into_response(),
        Ok(DeliveryOutcome::Replied(reply)) => (
            StatusCode::OK,
            Json(json!({ "message": "Reply sent", "data": reply })),
        )
            .into_response(),
        Err(WebhookError::Validation(message)) => (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": message })),
        )
            .into_response(),
        Err(err) => {
            error!("webhook delivery failed: {err}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn trigger_sync(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SyncRequestBody>,
) -> impl IntoResponse {
    if body.facebook_page_id.trim().is_empty()
        || body.access_token.trim().is_empty()
        || body.user_id.trim().is_empty()
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "facebookPageId, accessToken and userId are required" })),
        )
            .into_response();
    }

    let result = run_conversation_sync(
        state.store.as_ref(),
        &state.graph,
        &body.facebook_page_id,
        &body.access_token,
        &body.user_id,
        &SyncOptions::default(),
    )
    .await;

    match result {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({ "success": true, "message": "Conversation sync completed" })),
        )
            .into_response(),
        Err(SyncError::Graph(err)) => {
            error!("conversation sync failed upstream: {err}");
            let message = match err.kind {
                GraphErrorKind::Auth => {
                    "Facebook rejected the access token; reconnect the page".to_string()
                }
                GraphErrorKind::Session => {
                    "The page session has expired; log in to Facebook again".to_string()
                }
                GraphErrorKind::SessionNoId => {
                    "The page session has no linked user; reconnect the page".to_string()
                }
                GraphErrorKind::Generic => err.message,
            };
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": message })),
            )
                .into_response()
        }
        Err(SyncError::Persistence(err)) => {
            error!("conversation sync failed to persist: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to store synced conversations" })),
            )
                .into_response()
        }
    }
}

async fn send_outbound_message(
    State(state): State<Arc<AppState>>,
    Json(body): Json<SendMessageBody>,
) -> impl IntoResponse {
    if body.message.trim().is_empty()
        || body.recipient_page_scope_id.trim().is_empty()
        || body.facebook_access_token.trim().is_empty()
    {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({
                "success": false,
                "error": "message, recipientPageScopeId and facebookAccessToken are required"
            })),
        )
            .into_response();
    }

    info!(
        conversation_id = %body.conversation_id,
        "dispatching outbound message"
    );
    let delivered = state
        .graph
        .send_message(
            &body.recipient_page_scope_id,
            &body.message,
            &body.facebook_access_token,
        )
        .await;
    if delivered {
        Json(json!({ "success": true })).into_response()
    } else {
        Json(json!({ "success": false, "error": "message was not delivered" })).into_response()
    }
}

async fn patch_ai_mode(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
    Json(body): Json<AiModeBody>,
) -> impl IntoResponse {
    match state.store.set_ai_mode(&conversation_id, body.ai_mode).await {
        Ok(true) => Json(json!({ "success": true, "aiMode": body.ai_mode })).into_response(),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "conversation not found" })),
        )
            .into_response(),
        Err(err) => {
            error!("ai mode update failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to update conversation" })),
            )
                .into_response()
        }
    }
}

async fn get_conversations(
    Query(params): Query<HashMap<String, String>>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    let Some(user_id) = params.get("userId").filter(|id| !id.is_empty()) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "userId is required" })),
        )
            .into_response();
    };
    match state.store.conversations_for_user(user_id).await {
        Ok(conversations) => Json(conversations).into_response(),
        Err(err) => {
            error!("conversation list failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to load conversations" })),
            )
                .into_response()
        }
    }
}

async fn get_conversation_messages(
    Path(conversation_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    match state.store.conversation_by_id(&conversation_id).await {
        Ok(Some(_)) => {}
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({ "error": "conversation not found" })),
            )
                .into_response();
        }
        Err(err) => {
            error!("conversation lookup failed: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to load conversation" })),
            )
                .into_response();
        }
    }
    match state.store.messages_for_conversation(&conversation_id).await {
        Ok(messages) => Json(messages).into_response(),
        Err(err) => {
            error!("message list failed: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "failed to load messages" })),
            )
                .into_response()
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/webhook", get(webhook_verify).post(webhook_deliver))
        .route("/api/sync", post(trigger_sync))
        .route("/api/messages/send", post(send_outbound_message))
        .route("/api/conversations", get(get_conversations))
        .route(
            "/api/conversations/{conversation_id}/ai-mode",
            patch(patch_ai_mode),
        )
        .route(
            "/api/conversations/{conversation_id}/messages",
            get(get_conversation_messages),
        )
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub async fn run() {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let port = env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(4000);
    let database_url = resolve_database_url();
    let verify_token = env::var("FACEBOOK_VERIFY_TOKEN").unwrap_or_default();
    if verify_token.trim().is_empty() {
        warn!("FACEBOOK_VERIFY_TOKEN is not set; webhook verification will reject all attempts");
    }
    let app_token = env::var("FACEBOOK_APP_TOKEN").unwrap_or_default();
    let graph_base_url =
        env::var("GRAPH_API_BASE_URL").unwrap_or_else(|_| DEFAULT_GRAPH_BASE_URL.to_string());
    let openai_base_url =
        env::var("OPENAI_BASE_URL").unwrap_or_else(|_| DEFAULT_OPENAI_BASE_URL.to_string());

    let db = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .expect("failed to connect to postgres (set DATABASE_URL or POSTGRES_* env vars)");

    sqlx::migrate!("./migrations")
        .run(&db)
        .await
        .expect("failed to run sqlx migrations");

    let http = reqwest::Client::new();
    let state = Arc::new(AppState {
        store: Arc::new(PgStore::new(db)),
        graph: GraphClient::new(http.clone(), graph_base_url),
        http,
        openai_base_url,
        verify_token,
        app_token,
    });

    let app = router(state);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .expect("failed to bind TCP listener");

    info!("messenger server running at http://localhost:{port}");
    axum::serve(listener, app)
        .await
        .expect("server runtime failure");
}
