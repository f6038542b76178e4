use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Application-specific error types.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    DatabaseError(sqlx::Error),
    /// Referenced user, upload or transaction does not exist.
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Bad request: {0}")]
    BadRequest(String),
    /// Uniqueness violation (email, eth address, telegram, transaction id).
    #[error("Conflict: {0}")]
    Conflict(String),
    /// The user is not in the state the operation requires.
    #[error("Invalid state: {0}")]
    InvalidState(String),
    /// Registration is closed; the optional value is the opening timestamp.
    #[error("Whitelist closed{}", .0.map(|ts| format!(" until {}", ts)).unwrap_or_default())]
    WhitelistClosed(Option<i64>),
    #[error("External API error: {0}")]
    ExternalApiError(String),
    #[error("Internal error: {0}")]
    InternalError(String),
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    /// Error with a context chain, see [`ResultExt`].
    #[error("{context}: {source}")]
    WithContext {
        source: Box<AppError>,
        context: String,
    },
}

impl AppError {
    /// Returns true for uniqueness violations, looking through context wrappers.
    pub fn is_conflict(&self) -> bool {
        match self {
            AppError::Conflict(_) => true,
            AppError::WithContext { source, .. } => source.is_conflict(),
            _ => false,
        }
    }
}

impl IntoResponse for AppError {
    /// JSON body `{"error", "details"}`; server-side failures are logged and
    /// their message withheld.
    fn into_response(self) -> Response {
        let (status, error_message, details) = match &self {
            AppError::DatabaseError(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                    None,
                )
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone(), None),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            AppError::Conflict(msg) => (StatusCode::CONFLICT, msg.clone(), None),
            AppError::InvalidState(state) => (
                StatusCode::NOT_ACCEPTABLE,
                "Invalid state".to_string(),
                Some(json!({ "state": state })),
            ),
            AppError::WhitelistClosed(open_ts) => (
                StatusCode::GONE,
                "Whitelist closed".to_string(),
                open_ts.map(|ts| json!({ "open_ts": ts })),
            ),
            AppError::ExternalApiError(msg) => {
                tracing::error!("External API error: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    "External service error".to_string(),
                    None,
                )
            }
            AppError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                    None,
                )
            }
            AppError::Unauthorized(msg) => {
                tracing::warn!("Unauthorized access: {}", msg);
                (StatusCode::UNAUTHORIZED, "Unauthorized".to_string(), None)
            }
            AppError::WithContext { source, context } => {
                tracing::error!("Error with context: {} -> {}", context, source);
                return source.clone().into_response();
            }
        };

        let body = Json(json!({
            "error": error_message,
            "details": details,
        }));

        (status, body).into_response()
    }
}

// sqlx::Error is not Clone; a cloned DatabaseError degrades to RowNotFound.
impl Clone for AppError {
    fn clone(&self) -> Self {
        match self {
            AppError::DatabaseError(_e) => AppError::DatabaseError(sqlx::Error::RowNotFound),
            AppError::NotFound(msg) => AppError::NotFound(msg.clone()),
            AppError::BadRequest(msg) => AppError::BadRequest(msg.clone()),
            AppError::Conflict(msg) => AppError::Conflict(msg.clone()),
            AppError::InvalidState(state) => AppError::InvalidState(state.clone()),
            AppError::WhitelistClosed(ts) => AppError::WhitelistClosed(*ts),
            AppError::ExternalApiError(msg) => AppError::ExternalApiError(msg.clone()),
            AppError::InternalError(msg) => AppError::InternalError(msg.clone()),
            AppError::Unauthorized(msg) => AppError::Unauthorized(msg.clone()),
            AppError::WithContext { source, context } => AppError::WithContext {
                source: source.clone(),
                context: context.clone(),
            },
        }
    }
}

impl From<sqlx::Error> for AppError {
    /// Unique-constraint violations become `Conflict`.
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.is_unique_violation() {
                let constraint = db_err.constraint().unwrap_or("unique").to_string();
                return AppError::Conflict(format!("duplicate value violates {}", constraint));
            }
        }
        AppError::DatabaseError(err)
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        AppError::ExternalApiError(err.to_string())
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `AppError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, AppError>;

    /// Add context lazily (only evaluated on error).
    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T, AppError> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: f(),
        })
    }
}

/// Extension for sqlx::Error to add context
impl<T> ResultExt<T> for Result<T, sqlx::Error> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::from(e)),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::from(e)),
            context: f(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = vec![
            (AppError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (AppError::BadRequest("x".into()), StatusCode::BAD_REQUEST),
            (AppError::Conflict("x".into()), StatusCode::CONFLICT),
            (AppError::InvalidState("new_user".into()), StatusCode::NOT_ACCEPTABLE),
            (AppError::WhitelistClosed(None), StatusCode::GONE),
            (AppError::ExternalApiError("x".into()), StatusCode::BAD_GATEWAY),
            (AppError::Unauthorized("x".into()), StatusCode::UNAUTHORIZED),
        ];

        for (err, expected) in cases {
            assert_eq!(err.into_response().status(), expected);
        }
    }

    #[test]
    fn test_context_preserves_status_and_conflict() {
        let err: Result<(), AppError> = Err(AppError::Conflict("email".into()));
        let wrapped = err.context("inserting user").unwrap_err();
        assert!(wrapped.is_conflict());
        assert_eq!(wrapped.into_response().status(), StatusCode::CONFLICT);
    }
}
