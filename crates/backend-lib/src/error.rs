// crates/backend-lib/src/error.rs

//! Central error type + Axum integration.
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use uuid::Uuid;

use crate::validation::ValidationError;

/// Application error types with error codes and context
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Profile not found: {0}")]
    ProfileNotFound(Uuid),

    #[error("Match not found for room {0}")]
    MatchNotFound(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("User {0} is not a participant of this match")]
    NotParticipant(Uuid),

    #[error("Connection has not identified a user yet")]
    NotIdentified,

    #[error("Connection is already identified as {0}")]
    AlreadyIdentified(Uuid),

    #[error("Not in a room")]
    NotInRoom,

    #[error("Match {0} has ended")]
    MatchEnded(Uuid),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Video transport error: {0}")]
    Transport(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::ProfileNotFound(_) | AppError::MatchNotFound(_) | AppError::NotFound(_) => {
                StatusCode::NOT_FOUND
            },
            AppError::NotParticipant(_) => StatusCode::FORBIDDEN,
            AppError::NotIdentified => StatusCode::UNAUTHORIZED,
            AppError::AlreadyIdentified(_)
            | AppError::Conflict(_)
            | AppError::NotInRoom
            | AppError::MatchEnded(_) => StatusCode::CONFLICT,
            AppError::Transport(_) | AppError::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code for this error
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VAL_001",
            AppError::ProfileNotFound(_) => "PROFILE_001",
            AppError::MatchNotFound(_) => "MATCH_001",
            AppError::NotFound(_) => "NF_001",
            AppError::NotParticipant(_) => "MATCH_002",
            AppError::NotIdentified => "AUTH_001",
            AppError::AlreadyIdentified(_) => "AUTH_002",
            AppError::NotInRoom => "ROOM_001",
            AppError::MatchEnded(_) => "ROOM_002",
            AppError::Conflict(_) => "CONFLICT_001",
            AppError::Transport(_) => "VIDEO_001",
            AppError::Internal(_) => "INT_001",
            AppError::Io(_) => "IO_001",
            AppError::Json(_) => "JSON_001",
            AppError::Http(_) => "HTTP_001",
        }
    }

    /// Get a sanitized message suitable for production use
    pub fn sanitized_message(&self) -> String {
        match self {
            AppError::Validation(e) => e.to_string(),
            AppError::ProfileNotFound(_) => "Complete your profile first".to_string(),
            AppError::MatchNotFound(_) => "Match not found".to_string(),
            AppError::NotFound(_) => "Resource not found".to_string(),
            AppError::NotParticipant(_) => "You are not part of this match".to_string(),
            AppError::NotIdentified => "Identify first".to_string(),
            AppError::AlreadyIdentified(_) => "Connection already identified".to_string(),
            AppError::NotInRoom => "You are not in a room".to_string(),
            AppError::MatchEnded(_) => "This match has ended".to_string(),
            AppError::Conflict(_) => "Request conflicts with current state".to_string(),
            AppError::Transport(_) | AppError::Http(_) => "Failed to start video call".to_string(),
            AppError::Internal(_) | AppError::Io(_) => {
                "An internal server error occurred".to_string()
            },
            AppError::Json(_) => "Invalid request format".to_string(),
        }
    }

    /// Detailed message in debug builds, sanitized otherwise
    pub fn client_message(&self) -> String {
        if cfg!(debug_assertions) {
            self.to_string()
        } else {
            self.sanitized_message()
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = serde_json::json!({
            "error": {
                "code": self.error_code(),
                "message": self.client_message(),
            }
        });

        (status, axum::Json(body)).into_response()
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for AppError {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        AppError::Internal("Failed to send message".to_string())
    }
}

impl From<tokio::sync::oneshot::error::RecvError> for AppError {
    fn from(_: tokio::sync::oneshot::error::RecvError) -> Self {
        AppError::Internal("Actor dropped the reply".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Error as IoError, ErrorKind};

    #[test]
    fn test_app_error_display() {
        let missing = AppError::MatchNotFound("room_1_abc".to_string());
        assert_eq!(missing.to_string(), "Match not found for room room_1_abc");

        let io_error = AppError::Io(IoError::new(ErrorKind::NotFound, "File not found"));
        assert!(io_error.to_string().contains("IO error"));

        let validation = AppError::from(ValidationError::EmptyReportReason);
        assert!(validation.to_string().starts_with("Validation failed"));
    }

    #[test]
    fn test_app_error_status_codes() {
        assert_eq!(
            AppError::MatchNotFound("r".to_string()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::ProfileNotFound(Uuid::new_v4()).status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::NotParticipant(Uuid::new_v4()).status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AppError::Validation(ValidationError::EmptyChatMessage).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Transport("boom".to_string()).status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            AppError::Internal("test".to_string()).status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_app_error_error_codes() {
        assert_eq!(AppError::NotIdentified.error_code(), "AUTH_001");
        assert_eq!(AppError::MatchNotFound("r".to_string()).error_code(), "MATCH_001");
        assert_eq!(AppError::Transport("x".to_string()).error_code(), "VIDEO_001");

        let json_err: serde_json::Error =
            serde_json::from_str::<serde_json::Value>("invalid json").unwrap_err();
        assert_eq!(AppError::Json(json_err).error_code(), "JSON_001");
    }

    #[test]
    fn test_error_from_impls() {
        let io_err = IoError::new(ErrorKind::PermissionDenied, "Permission denied");
        let app_err: AppError = io_err.into();
        assert!(matches!(app_err, AppError::Io(_)));

        let (tx, rx) = tokio::sync::oneshot::channel::<()>();
        drop(tx);
        let recv_err = futures_util::FutureExt::now_or_never(rx).unwrap().unwrap_err();
        let app_err: AppError = recv_err.into();
        assert!(matches!(app_err, AppError::Internal(_)));

        let app_err: AppError = ValidationError::EmptyReportReason.into();
        assert!(matches!(app_err, AppError::Validation(_)));
    }

    #[tokio::test]
    async fn test_error_into_response() {
        let response = AppError::MatchNotFound("room_1_abc".to_string()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert!(response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .contains("application/json"));
    }
}
