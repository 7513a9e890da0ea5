//! API error type.
//!
//! Every failure a handler can report maps to an HTTP status and a short,
//! stable error tag that clients switch on. Internal failures are logged and
//! reported as a generic `internal_error`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;
use tracing::error;

use crate::models::ErrorResponse;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("missing_fields")]
    MissingFields,
    #[error("invalid_username")]
    InvalidUsername(String),
    #[error("invalid_email")]
    InvalidEmail(String),
    #[error("invalid_password")]
    InvalidPassword(String),
    #[error("username_taken")]
    UsernameTaken,
    #[error("email_taken")]
    EmailTaken,
    #[error("invalid_credentials")]
    InvalidCredentials,
    #[error("unauthorized")]
    Unauthorized,

    #[error("user_not_found")]
    UserNotFound,
    #[error("cannot_add_self")]
    CannotAddSelf,
    #[error("already_friends")]
    AlreadyFriends,
    #[error("request_already_pending")]
    RequestAlreadyPending,
    #[error("request_not_found")]
    RequestNotFound,
    #[error("request_already_handled")]
    RequestAlreadyHandled,
    #[error("invalid_action")]
    InvalidAction,

    #[error("empty_message")]
    EmptyMessage,
    #[error("message_too_long")]
    MessageTooLong,
    #[error("invalid_group_name")]
    InvalidGroupName(String),
    #[error("group_not_found")]
    GroupNotFound,
    #[error("not_group_member")]
    NotGroupMember,

    #[error("game_not_found")]
    GameNotFound,
    #[error("unknown_rank")]
    UnknownRank(String),
    #[error("invalid_mode")]
    InvalidMode,
    #[error("invalid_tolerance")]
    InvalidTolerance(u32),
    #[error("settings_missing")]
    SettingsMissing,

    #[error("rate_limited")]
    RateLimited { retry_after_secs: u64 },

    #[error("internal_error")]
    Internal(#[from] anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingFields
            | ApiError::InvalidUsername(_)
            | ApiError::InvalidEmail(_)
            | ApiError::InvalidPassword(_)
            | ApiError::CannotAddSelf
            | ApiError::InvalidAction
            | ApiError::EmptyMessage
            | ApiError::MessageTooLong
            | ApiError::InvalidGroupName(_)
            | ApiError::UnknownRank(_)
            | ApiError::InvalidMode
            | ApiError::InvalidTolerance(_)
            | ApiError::SettingsMissing => StatusCode::BAD_REQUEST,

            ApiError::InvalidCredentials | ApiError::Unauthorized => StatusCode::UNAUTHORIZED,

            ApiError::NotGroupMember => StatusCode::FORBIDDEN,

            ApiError::UserNotFound
            | ApiError::RequestNotFound
            | ApiError::GroupNotFound
            | ApiError::GameNotFound => StatusCode::NOT_FOUND,

            ApiError::UsernameTaken
            | ApiError::EmailTaken
            | ApiError::AlreadyFriends
            | ApiError::RequestAlreadyPending
            | ApiError::RequestAlreadyHandled => StatusCode::CONFLICT,

            ApiError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,

            ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Human-readable detail for validation failures
    fn detail(&self) -> Option<String> {
        match self {
            ApiError::InvalidUsername(msg)
            | ApiError::InvalidEmail(msg)
            | ApiError::InvalidPassword(msg)
            | ApiError::InvalidGroupName(msg) => Some(msg.clone()),
            ApiError::UnknownRank(rank) => Some(format!("'{}' is not a rank for this game", rank)),
            ApiError::InvalidTolerance(t) => Some(format!("tolerance {} exceeds the rank ladder", t)),
            ApiError::RateLimited { retry_after_secs } => {
                Some(format!("retry after {} seconds", retry_after_secs))
            }
            _ => None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let ApiError::Internal(ref err) = self {
            error!("Internal error: {:#}", err);
        }
        let body = ErrorResponse {
            error: self.to_string(),
            code: status.as_u16(),
            detail: self.detail(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = Result<T, ApiError>;
