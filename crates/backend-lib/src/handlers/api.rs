// ============================
// crates/backend-lib/src/handlers/api.rs
// ============================
//! JSON REST handlers: profile directory, queue size, room lookup and
//! post-match messaging.
use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use chrono::Utc;
use metrics::counter;
use protv_common::{
    ChatMessage, ConnectionSummary, MatchRecord, Profile, ServerToClient, UserId,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    error::AppError,
    metrics::CHAT_SENT,
    validation::{validate_chat_body, validate_profile, validate_room_id, ValidationError},
    AppState,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct QueueCountResponse {
    pub count: usize,
}

/// Body of `POST /api/matches/{match_id}/messages`
#[derive(Debug, Serialize, Deserialize)]
pub struct PostMessageRequest {
    pub sender_id: UserId,
    pub body: String,
}

/// Health check endpoint
pub async fn health() -> &'static str {
    "Healthy"
}

pub async fn queue_count(
    State(state): State<AppState>,
) -> Result<Json<QueueCountResponse>, AppError> {
    let count = state.matchmaker.count().await?;
    Ok(Json(QueueCountResponse { count }))
}

pub async fn get_profile(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<Profile>, AppError> {
    state
        .storage
        .get_profile(user_id)
        .await?
        .map(Json)
        .ok_or(AppError::ProfileNotFound(user_id))
}

pub async fn put_profile(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
    Json(profile): Json<Profile>,
) -> Result<Json<Profile>, AppError> {
    if profile.id != user_id {
        return Err(ValidationError::InvalidProfile(
            "Profile id does not match the path".to_string(),
        )
        .into());
    }
    validate_profile(&profile)?;

    state.storage.upsert_profile(&profile).await?;
    Ok(Json(profile))
}

/// The active match behind a room, as the room page loads it
pub async fn get_room(
    State(state): State<AppState>,
    Path(room_id): Path<String>,
) -> Result<Json<MatchRecord>, AppError> {
    validate_room_id(&room_id)?;
    state
        .storage
        .find_match_by_room(&room_id)
        .await?
        .filter(MatchRecord::is_active)
        .map(Json)
        .ok_or(AppError::MatchNotFound(room_id))
}

/// A user's connections, each with the match the pair last shared so the
/// client knows where to send messages
pub async fn list_connections(
    State(state): State<AppState>,
    Path(user_id): Path<UserId>,
) -> Result<Json<Vec<ConnectionSummary>>, AppError> {
    let connections = state.storage.connections_for_user(user_id).await?;
    let mut summaries = Vec::with_capacity(connections.len());
    for connection in connections {
        let Some(partner_id) = connection.partner_of(user_id) else {
            continue;
        };
        let match_id = state
            .storage
            .latest_match_between(user_id, partner_id)
            .await?
            .map(|record| record.id);
        summaries.push(ConnectionSummary {
            connection,
            partner_id,
            match_id,
        });
    }
    Ok(Json(summaries))
}

/// Latest match between two users, active or not
pub async fn latest_match(
    State(state): State<AppState>,
    Path((user_id, partner_id)): Path<(UserId, UserId)>,
) -> Result<Json<MatchRecord>, AppError> {
    state
        .storage
        .latest_match_between(user_id, partner_id)
        .await?
        .map(Json)
        .ok_or_else(|| AppError::NotFound(format!("match between {user_id} and {partner_id}")))
}

pub async fn list_messages(
    State(state): State<AppState>,
    Path(match_id): Path<Uuid>,
) -> Result<Json<Vec<ChatMessage>>, AppError> {
    load_match(&state, match_id).await?;
    Ok(Json(state.storage.chat_history(match_id).await?))
}

/// Messages outside the room: allowed while the match is live, or afterwards
/// once the two participants are connected
pub async fn post_message(
    State(state): State<AppState>,
    Path(match_id): Path<Uuid>,
    Json(request): Json<PostMessageRequest>,
) -> Result<(StatusCode, Json<ChatMessage>), AppError> {
    let record = load_match(&state, match_id).await?;
    let partner = record
        .counterpart(request.sender_id)
        .ok_or(AppError::NotParticipant(request.sender_id))?;

    if !record.is_active()
        && state
            .storage
            .find_connection(request.sender_id, partner)
            .await?
            .is_none()
    {
        return Err(AppError::Conflict(
            "Match has ended and the users are not connected".to_string(),
        ));
    }

    let body = validate_chat_body(&request.body)?;
    let message = ChatMessage {
        id: Uuid::new_v4(),
        match_id,
        sender_id: request.sender_id,
        body: body.to_string(),
        created_at: Utc::now(),
    };
    state.storage.append_chat_message(&message).await?;
    counter!(CHAT_SENT).increment(1);
    state.notifier.publish_to_match(
        match_id,
        ServerToClient::Chat {
            message: message.clone(),
        },
    );

    Ok((StatusCode::CREATED, Json(message)))
}

async fn load_match(state: &AppState, match_id: Uuid) -> Result<MatchRecord, AppError> {
    state
        .storage
        .get_match(match_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("match {match_id}")))
}
