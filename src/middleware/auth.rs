use axum::{
    body::Body,
    extract::State,
    http::Request,
    middleware::Next,
    response::Response,
};
use axum_extra::{
    TypedHeader,
    headers::{Authorization, authorization::Bearer},
    typed_header::TypedHeaderRejection,
};

use crate::AppState;
use crate::error::{AppError, CoreError};
use crate::utils::verify_token;

/// Verifies the bearer token and makes its [`Claims`](crate::utils::Claims)
/// available to handlers as an `Extension`.
pub async fn auth_middleware(
    State(state): State<AppState>,
    bearer: Result<TypedHeader<Authorization<Bearer>>, TypedHeaderRejection>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, AppError> {
    let TypedHeader(auth) = bearer.map_err(|e| {
        tracing::debug!(error = %e, path = %request.uri().path(), "Missing bearer token");
        AppError(CoreError::Unauthorized)
    })?;

    let claims = verify_token(auth.token(), &state.config).map_err(|e| {
        tracing::debug!(error = %e, "Invalid bearer token");
        AppError(CoreError::Unauthorized)
    })?;

    request.extensions_mut().insert(claims);
    Ok(next.run(request).await)
}
