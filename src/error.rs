use bytes::Bytes;
use http_body_util::Full;
use hyper::{Response, StatusCode};
use serde_json::json;
use thiserror::Error;

pub type AppResult<T> = Result<T, AppError>;

// ============================================================================
// Event bus errors
// ============================================================================

/// Errors surfaced by the event bus client
#[derive(Error, Debug)]
pub enum BusError {
    /// Envelope failed structural validation; never retried
    #[error("Invalid event envelope: {0}")]
    Validation(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Every publish attempt failed
    #[error("Delivery of event {event_id} to '{topic}' failed after {attempts} attempts: {source}")]
    Delivery {
        topic: String,
        event_id: String,
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    /// Broker resource could not be created or reached
    #[error("Broker error: {0}")]
    Broker(#[source] anyhow::Error),

    #[error("Topic '{0}' already has a subscription in this client")]
    AlreadySubscribed(String),

    #[error("Event bus is closed")]
    Closed,

    /// One entry per writer/reader that failed to close
    #[error("Failed to close {} bus resource(s): {}", .0.len(), .0.join("; "))]
    Close(Vec<String>),
}

// ============================================================================
// Connection hub errors
// ============================================================================

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HubError {
    /// The hub command loop is no longer running
    #[error("Connection hub is not running")]
    Stopped,
}

/// Why a connection session ended. Every variant terminates exactly one
/// session and never affects the hub or other sessions.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("client closed the connection")]
    ClientClosed,

    /// Stopped from outside: superseded, evicted, or shutting down
    #[error("session cancelled")]
    Cancelled,

    #[error("no frame received within {0:?}")]
    IdleTimeout(std::time::Duration),

    #[error("frame of {size} bytes exceeds the {max} byte limit")]
    Oversized { size: usize, max: usize },

    #[error("malformed frame: {0}")]
    Malformed(String),

    #[error("read failed: {0}")]
    Read(String),

    #[error("write failed: {0}")]
    Write(String),

    #[error(transparent)]
    Hub(#[from] HubError),
}

impl SessionError {
    /// Whether the session ended because something went wrong, as opposed to
    /// an orderly close
    pub fn is_failure(&self) -> bool {
        !matches!(self, SessionError::ClientClosed | SessionError::Cancelled)
    }
}

// ============================================================================
// HTTP admin surface errors
// ============================================================================

/// Error type for the admin HTTP endpoints
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Hub(#[from] HubError),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::Json(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Hub(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Validation(_) | AppError::Json(_) => "VALIDATION_ERROR",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::Hub(_) => "HUB_UNAVAILABLE",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to return to the caller
    pub fn user_message(&self) -> String {
        match self {
            AppError::Validation(msg) => format!("Validation error: {}", msg),
            AppError::Json(e) => format!("Invalid JSON body: {}", e),
            AppError::NotFound(what) => format!("{} not found", what),
            AppError::Hub(_) => "Connection hub unavailable".to_string(),
            AppError::Internal(_) => "Internal server error".to_string(),
        }
    }

    pub fn log(&self) {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(
                error = %self,
                error_code = %self.error_code(),
                status = %status.as_u16(),
                "Server error occurred"
            );
        } else {
            tracing::debug!(
                error = %self,
                error_code = %self.error_code(),
                "Client error occurred"
            );
        }
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        AppError::Internal(msg.into())
    }

    /// Convert into a JSON hyper response for the admin listener
    pub fn to_hyper_response(self) -> Response<Full<Bytes>> {
        self.log();

        let status = self.status_code();
        let body = json!({
            "error": self.user_message(),
            "error_code": self.error_code(),
            "status": status.as_u16(),
        });

        let json_bytes = serde_json::to_vec(&body)
            .unwrap_or_else(|_| b"{\"error\":\"Internal server error\"}".to_vec());

        let mut response = Response::new(Full::new(Bytes::from(json_bytes)));
        *response.status_mut() = status;
        if let Ok(content_type) = "application/json".parse() {
            response.headers_mut().insert("content-type", content_type);
        }
        response
    }
}
