//! services/api/src/web/middleware.rs
//!
//! Authentication middleware for protecting routes.

use axum::{
    extract::{Request, State},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use std::sync::Arc;
use tracing::warn;

use crate::web::{auth::session_id_from_headers, state::AppState};

/// Middleware that validates the auth session cookie and resolves the principal.
///
/// If valid, inserts the `Principal` into request extensions for handlers to use.
/// If invalid or missing, returns 401 Unauthorized.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    mut req: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    // 1. Parse session ID from the cookie header
    let auth_session_id =
        session_id_from_headers(req.headers()).ok_or(StatusCode::UNAUTHORIZED)?;

    // 2. Validate auth session in database, get the principal
    let principal = state
        .db
        .validate_auth_session(&auth_session_id)
        .await
        .map_err(|e| {
            warn!("Failed to validate auth session: {:?}", e);
            StatusCode::UNAUTHORIZED
        })?;

    // 3. Insert the principal into request extensions
    req.extensions_mut().insert(principal);

    // 4. Continue to the handler
    Ok(next.run(req).await)
}
