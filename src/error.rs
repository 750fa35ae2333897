use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};

use crate::utils::{error_codes, error_to_api_response};

/// Domain errors shared by the store and everything built on it.
///
/// Corrupt state at startup is not represented here: loading always succeeds
/// and reports where the graph came from instead.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CoreError {
    /// Malformed input rejected at the boundary.
    #[error("validation failed: {0}")]
    Validation(String),

    /// The operation would break an invariant; state is unchanged.
    #[error("{0}")]
    Conflict(String),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    /// The caller is known but lacks the role or membership required.
    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("unauthorized")]
    Unauthorized,

    /// Writing the snapshot failed. The in-memory graph is still authoritative.
    #[error("persistence failed: {0}")]
    Persistence(String),
}

impl CoreError {
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

/// HTTP-facing wrapper that renders [`CoreError`] as an `ApiResponse` body.
#[derive(Debug)]
pub struct AppError(pub CoreError);

impl From<CoreError> for AppError {
    fn from(err: CoreError) -> Self {
        Self(err)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code) = match &self.0 {
            CoreError::Validation(_) => (StatusCode::BAD_REQUEST, error_codes::VALIDATION_ERROR),
            CoreError::Conflict(_) => (StatusCode::CONFLICT, error_codes::CONFLICT),
            CoreError::NotFound { .. } => (StatusCode::NOT_FOUND, error_codes::NOT_FOUND),
            CoreError::Forbidden(_) => (StatusCode::FORBIDDEN, error_codes::PERMISSION_DENIED),
            CoreError::Unauthorized => (StatusCode::UNAUTHORIZED, error_codes::AUTH_FAILED),
            CoreError::Persistence(msg) => {
                tracing::error!(error = %msg, "Persistence error reached the HTTP layer");
                (StatusCode::INTERNAL_SERVER_ERROR, error_codes::INTERNAL_ERROR)
            }
        };

        (status, error_to_api_response::<()>(code, self.0.to_string())).into_response()
    }
}

pub type AppResult<T> = Result<T, AppError>;
