//! REST routes served next to the WebSocket endpoint.
//!
//! All routes require `Authorization: Bearer <token>` with a configured
//! account token.

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get};
use axum::{Json, Router};
use projchat_proto::member::Member;
use projchat_proto::message::{ChannelId, Message, MessageId};

use crate::broker::BrokerState;

/// Errors returned by the REST routes.
#[derive(Debug, thiserror::Error)]
pub enum RestError {
    /// Missing or unknown bearer token.
    #[error("missing or invalid bearer token")]
    Unauthorized,

    /// The addressed resource does not exist.
    #[error("{0} not found")]
    NotFound(String),
}

impl RestError {
    const fn status_code(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for RestError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": status.as_str(),
            "message": self.to_string(),
        });
        (status, Json(body)).into_response()
    }
}

/// Routes relative to the `/api` prefix.
#[must_use]
pub fn routes() -> Router<Arc<BrokerState>> {
    Router::new()
        .route("/channels/{channel_id}/messages", get(list_messages))
        .route("/channels/{channel_id}/members", get(list_members))
        .route(
            "/channels/{channel_id}/messages/{message_id}",
            delete(delete_message),
        )
}

fn authorize<'a>(state: &'a BrokerState, headers: &HeaderMap) -> Result<&'a Member, RestError> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .and_then(|token| state.authenticate(token))
        .ok_or(RestError::Unauthorized)
}

async fn list_messages(
    State(state): State<Arc<BrokerState>>,
    Path(channel_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<Message>>, RestError> {
    authorize(&state, &headers)?;
    let messages = state.channels.messages(&ChannelId::new(channel_id)).await;
    Ok(Json(messages))
}

async fn list_members(
    State(state): State<Arc<BrokerState>>,
    Path(_channel_id): Path<String>,
    headers: HeaderMap,
) -> Result<Json<Vec<Member>>, RestError> {
    authorize(&state, &headers)?;
    Ok(Json(state.roster()))
}

async fn delete_message(
    State(state): State<Arc<BrokerState>>,
    Path((channel_id, message_id)): Path<(String, String)>,
    headers: HeaderMap,
) -> Result<StatusCode, RestError> {
    let member = authorize(&state, &headers)?;
    let channel_id = ChannelId::new(channel_id);
    let message_id = MessageId::new(message_id);
    tracing::debug!(user = %member.id, channel = %channel_id, message_id = %message_id, "REST delete");
    if state.delete_message(&channel_id, &message_id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(RestError::NotFound(format!("message {message_id}")))
    }
}
