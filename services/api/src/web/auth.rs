//! services/api/src/web/auth.rs
//!
//! Authentication endpoints for account signup, login, and logout.

use axum::{
    extract::State,
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use chrono::{Duration, Utc};
use fee_portal_core::ports::PortError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};
use uuid::Uuid;
use utoipa::ToSchema;
use crate::web::state::AppState;

const SESSION_COOKIE: &str = "session";
const MIN_PASSWORD_LEN: usize = 6;

//=========================================================================================
// Request/Response Types
//=========================================================================================

#[derive(Deserialize, ToSchema)]
pub struct SignupRequest {
    pub name: String,
    pub email: String,
    pub password: String,
}

#[derive(Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Serialize, ToSchema)]
pub struct AuthResponse {
    pub user_id: Uuid,
    pub email: String,
}

//=========================================================================================
// Cookie Helpers
//=========================================================================================

/// Extracts the auth session ID from the `Cookie` header, if present.
pub fn session_id_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::COOKIE)
        .and_then(|v| v.to_str().ok())?
        .split(';')
        .find_map(|c| c.trim().strip_prefix("session="))
        .filter(|id| !id.is_empty())
        .map(str::to_string)
}

fn session_cookie(session_id: &str, max_age: Duration) -> String {
    format!(
        "{}={}; HttpOnly; Secure; SameSite=Lax; Path=/; Max-Age={}",
        SESSION_COOKIE,
        session_id,
        max_age.num_seconds()
    )
}

fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Opens a new auth session and returns its cookie.
async fn open_session(state: &AppState, user_id: Uuid) -> Result<String, (StatusCode, String)> {
    let auth_session_id = Uuid::new_v4().to_string();
    let ttl = Duration::days(state.config.session_ttl_days);

    state
        .db
        .create_auth_session(&auth_session_id, user_id, Utc::now() + ttl)
        .await
        .map_err(|e| {
            error!("Failed to create auth session: {:?}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to create session".to_string())
        })?;

    Ok(session_cookie(&auth_session_id, ttl))
}

//=========================================================================================
// Handlers
//=========================================================================================

/// POST /auth/signup - Create a new account and its student record
#[utoipa::path(
    post,
    path = "/auth/signup",
    request_body = SignupRequest,
    responses(
        (status = 201, description = "Account created successfully", body = AuthResponse),
        (status = 400, description = "Invalid request"),
        (status = 409, description = "Email already registered"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn signup_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<SignupRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let email = normalize_email(&req.email);
    if email.is_empty() || !email.contains('@') {
        return Err((StatusCode::BAD_REQUEST, "A valid email is required".to_string()));
    }
    if req.password.chars().count() < MIN_PASSWORD_LEN {
        return Err((
            StatusCode::BAD_REQUEST,
            format!("Password should be at least {} characters", MIN_PASSWORD_LEN),
        ));
    }

    // 1. Hash the password
    let salt = SaltString::generate(&mut OsRng);
    let password_hash = Argon2::default()
        .hash_password(req.password.as_bytes(), &salt)
        .map_err(|e| {
            error!("Failed to hash password: {:?}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to hash password".to_string())
        })?
        .to_string();

    // 2. Create the account
    let principal = state
        .db
        .create_user_with_email(&email, &password_hash)
        .await
        .map_err(|e| match e {
            PortError::Conflict(_) => (StatusCode::CONFLICT, "User already registered".to_string()),
            e => {
                error!("Failed to create user: {:?}", e);
                (StatusCode::INTERNAL_SERVER_ERROR, "Failed to create user".to_string())
            }
        })?;

    // 3. Sign the new account in
    let cookie = open_session(&state, principal.user_id).await?;

    // 4. Provision the student record on this first sign-in
    state
        .provision_student(&principal, Some(req.name.as_str()))
        .await
        .map_err(|e| {
            error!("Failed to provision student record: {:?}", e);
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                "Account created but profile setup failed. Please try logging in.".to_string(),
            )
        })?;
    info!("New account registered: {}", principal.user_id);

    let response = AuthResponse {
        user_id: principal.user_id,
        email: principal.email,
    };

    Ok((
        StatusCode::CREATED,
        [(header::SET_COOKIE, cookie)],
        Json(response),
    ))
}

/// POST /auth/login - Login with existing account
#[utoipa::path(
    post,
    path = "/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = AuthResponse),
        (status = 401, description = "Invalid credentials"),
        (status = 500, description = "Internal server error")
    )
)]
pub async fn login_handler(
    State(state): State<Arc<AppState>>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    // 1. Get user by email
    let user_creds = state
        .db
        .get_user_by_email(&normalize_email(&req.email))
        .await
        .map_err(|e| {
            info!("Login rejected: {:?}", e);
            (StatusCode::UNAUTHORIZED, "Invalid email or password".to_string())
        })?;

    // 2. Verify password
    let parsed_hash = PasswordHash::new(&user_creds.hashed_password).map_err(|e| {
        error!("Failed to parse password hash: {:?}", e);
        (StatusCode::INTERNAL_SERVER_ERROR, "Authentication error".to_string())
    })?;

    let valid = Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .is_ok();

    if !valid {
        return Err((StatusCode::UNAUTHORIZED, "Invalid email or password".to_string()));
    }

    // 3. Create the auth session
    let cookie = open_session(&state, user_creds.user_id).await?;

    let response = AuthResponse {
        user_id: user_creds.user_id,
        email: user_creds.email,
    };

    Ok((
        StatusCode::OK,
        [(header::SET_COOKIE, cookie)],
        Json(response),
    ))
}

/// POST /auth/logout - Logout and invalidate session
#[utoipa::path(
    post,
    path = "/auth/logout",
    responses(
        (status = 200, description = "Logout successful"),
        (status = 401, description = "No active session")
    )
)]
pub async fn logout_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let auth_session_id = session_id_from_headers(&headers)
        .ok_or((StatusCode::UNAUTHORIZED, "No session found".to_string()))?;

    state
        .db
        .delete_auth_session(&auth_session_id)
        .await
        .map_err(|e| {
            error!("Failed to delete auth session: {:?}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "Failed to logout".to_string())
        })?;

    Ok((
        StatusCode::OK,
        [(header::SET_COOKIE, session_cookie("", Duration::zero()))],
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn finds_session_among_other_cookies() {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::COOKIE,
            HeaderValue::from_static("theme=dark; session=abc-123; lang=en"),
        );
        assert_eq!(session_id_from_headers(&headers).as_deref(), Some("abc-123"));
    }

    #[test]
    fn empty_or_missing_session_is_none() {
        let mut headers = HeaderMap::new();
        assert_eq!(session_id_from_headers(&headers), None);
        headers.insert(header::COOKIE, HeaderValue::from_static("session="));
        assert_eq!(session_id_from_headers(&headers), None);
    }

    #[test]
    fn cleared_cookie_expires_immediately() {
        assert!(session_cookie("", Duration::zero()).contains("Max-Age=0"));
    }
}
