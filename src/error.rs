//! Error types for mailbridge.

use axum::http::StatusCode;

use crate::pipeline::Stage;

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Failed to build HTTP client: {0}")]
    HttpClient(String),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Errors raised while turning an inbound payload into a canonical message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseError {
    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

/// Webhook authentication errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AuthError {
    #[error("Unauthorized: {0}")]
    Unauthorized(&'static str),
}

/// Identity service errors. Never fatal to a request.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    #[error("Identity service request failed: {0}")]
    Transport(String),

    #[error("Identity service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response from identity service: {0}")]
    InvalidResponse(String),
}

/// AI backend errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    #[error("Backend request failed: {0}")]
    Transport(String),

    #[error("Backend API error: {status} - {body}")]
    Status { status: u16, body: String },

    #[error("Invalid response from backend: {0}")]
    InvalidResponse(String),
}

/// Outbound mail errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SendError {
    #[error("Invalid email address format: {0}")]
    InvalidRecipient(String),

    #[error("Subject too long: {len} > {max}")]
    SubjectTooLong { len: usize, max: usize },

    #[error("Reply body is empty")]
    EmptyBody,

    #[error("Mail provider error: {status} - {body}")]
    Provider { status: u16, body: String },

    #[error("Mail provider request failed: {0}")]
    Transport(String),

    #[error("Invalid response from mail provider: {0}")]
    InvalidResponse(String),
}

impl SendError {
    /// Whether the error was raised before any network call.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidRecipient(_) | Self::SubjectTooLong { .. } | Self::EmptyBody
        )
    }
}

/// A terminal pipeline failure, tagged with the stage that failed.
#[derive(Debug, thiserror::Error)]
#[error("{stage} failed: {kind}")]
pub struct PipelineError {
    pub stage: Stage,
    pub kind: PipelineErrorKind,
}

/// The cause of a terminal pipeline failure.
#[derive(Debug, thiserror::Error)]
pub enum PipelineErrorKind {
    #[error(transparent)]
    Unauthorized(#[from] AuthError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("Dispatch failed: {0}")]
    DispatchFailed(#[from] DispatchError),

    #[error("Send failed: {0}")]
    SendFailed(#[from] SendError),
}

impl PipelineError {
    pub fn new(stage: Stage, kind: impl Into<PipelineErrorKind>) -> Self {
        Self {
            stage,
            kind: kind.into(),
        }
    }

    /// HTTP status reported to the webhook caller.
    ///
    /// 4xx tells the relay not to retry; 5xx asks it to redeliver.
    pub fn status_code(&self) -> StatusCode {
        match &self.kind {
            PipelineErrorKind::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            PipelineErrorKind::Parse(_) => StatusCode::BAD_REQUEST,
            PipelineErrorKind::DispatchFailed(_) => StatusCode::BAD_GATEWAY,
            PipelineErrorKind::SendFailed(e) if e.is_validation() => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            PipelineErrorKind::SendFailed(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Whether the original sender should be told that processing failed.
    /// Send validation failures never get one.
    pub fn warrants_failure_notice(&self) -> bool {
        match &self.kind {
            PipelineErrorKind::DispatchFailed(_) => true,
            PipelineErrorKind::SendFailed(e) => !e.is_validation(),
            PipelineErrorKind::Unauthorized(_) | PipelineErrorKind::Parse(_) => false,
        }
    }
}
