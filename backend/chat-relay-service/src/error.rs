use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use thiserror::Error;

use crate::models::CallStatus;

pub type AppResult<T> = Result<T, AppError>;

/// Errors surfaced at startup and on the HTTP query routes.
#[derive(Debug, Error, Clone)]
pub enum AppError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("server start failure: {0}")]
    StartServer(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("not found")]
    NotFound,

    #[error("database error: {0}")]
    Database(String),

    #[error("internal server error")]
    Internal,
}

#[derive(Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
    message: String,
}

impl AppError {
    fn code(&self) -> &'static str {
        match self {
            AppError::Config(_) => "config_error",
            AppError::StartServer(_) => "start_failure",
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound => "not_found",
            AppError::Database(_) => "database_error",
            AppError::Internal => "internal_error",
        }
    }
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound => StatusCode::NOT_FOUND,
            AppError::Database(_) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_response(&self) -> HttpResponse {
        // Database details stay in the logs.
        let message = match self {
            AppError::Database(detail) => {
                tracing::error!(error = %detail, "query failed");
                "storage unavailable".to_string()
            }
            other => other.to_string(),
        };

        HttpResponse::build(self.status_code()).json(ErrorBody {
            error: self.code(),
            message,
        })
    }
}

/// Persistence collaborator failures.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] tokio_postgres::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] deadpool_postgres::PoolError),

    #[error("{0} not found")]
    NotFound(String),

    #[error("corrupt row: {0}")]
    Corrupt(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for AppError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(_) => AppError::NotFound,
            other => AppError::Database(other.to_string()),
        }
    }
}

/// Failures while handling one inbound relay event.
///
/// None of these are fatal to the process; they are either reported to the
/// originating connection as an `error` event or only logged.
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("{0}")]
    Validation(String),

    #[error("connection has not registered an identity")]
    UnregisteredSender,

    #[error("invalid participants: {0}")]
    InvalidParticipants(String),

    #[error("{0} is not available")]
    TargetUnavailable(String),

    #[error("persistence failure: {0}")]
    Persistence(String),

    #[error("call {call_id}: cannot move from {from} to {to}")]
    InvalidStateTransition {
        call_id: i64,
        from: CallStatus,
        to: CallStatus,
    },
}

impl RelayError {
    pub fn code(&self) -> &'static str {
        match self {
            RelayError::Validation(_) => "validation_error",
            RelayError::UnregisteredSender => "unregistered_sender",
            RelayError::InvalidParticipants(_) => "invalid_participants",
            RelayError::TargetUnavailable(_) => "target_unavailable",
            RelayError::Persistence(_) => "persistence_failure",
            RelayError::InvalidStateTransition { .. } => "invalid_state_transition",
        }
    }

    /// Text sent to the client. Storage details are never exposed.
    pub fn client_message(&self) -> String {
        match self {
            RelayError::Persistence(_) => "could not save your request, please retry".to_string(),
            other => other.to_string(),
        }
    }

    /// Whether the originator should hear about this error at all.
    pub fn is_reportable(&self) -> bool {
        !matches!(
            self,
            RelayError::InvalidStateTransition { .. } | RelayError::TargetUnavailable(_)
        )
    }
}

impl From<StoreError> for RelayError {
    fn from(e: StoreError) -> Self {
        RelayError::Persistence(e.to_string())
    }
}

impl From<RelayError> for AppError {
    fn from(e: RelayError) -> Self {
        match e {
            RelayError::Persistence(detail) => AppError::Database(detail),
            other => AppError::BadRequest(other.to_string()),
        }
    }
}
