pub mod auth;
pub mod middleware;
pub mod profile_task;
pub mod protocol;
pub mod rest;
pub mod roster_task;
pub mod state;
pub mod ws_handler;

use crate::error::ApiError;
use axum::{
    http::{
        header::{ACCEPT, CONTENT_TYPE},
        HeaderValue, Method,
    },
    middleware as axum_middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::CorsLayer;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

pub use middleware::require_auth;
pub use state::AppState;
pub use ws_handler::ws_handler;

/// Builds the full application: public auth and setup routes, session-protected
/// student routes, the live-view socket and the Swagger UI.
pub fn router(app_state: Arc<AppState>) -> Result<Router, ApiError> {
    let origin = HeaderValue::from_str(&app_state.config.cors_origin).map_err(|e| {
        ApiError::Internal(format!(
            "Invalid CORS origin '{}': {}",
            app_state.config.cors_origin, e
        ))
    })?;
    let cors = CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::OPTIONS])
        .allow_headers([CONTENT_TYPE, ACCEPT]);

    // Public routes (no auth required)
    let public_routes = Router::new()
        .route("/auth/signup", post(auth::signup_handler))
        .route("/auth/login", post(auth::login_handler))
        .route("/auth/logout", post(auth::logout_handler))
        .route("/setup/status", get(rest::setup_status_handler));

    // Protected routes (auth required)
    let protected_routes = Router::new()
        .route(
            "/profile",
            get(rest::get_profile_handler).put(rest::update_profile_handler),
        )
        .route("/students", get(rest::list_students_handler))
        .route("/payments", post(rest::submit_payment_handler))
        .route("/ws", get(ws_handler))
        .layer(axum_middleware::from_fn_with_state(
            app_state.clone(),
            require_auth,
        ));

    let api_router = Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .layer(cors)
        .with_state(app_state);

    Ok(Router::new()
        .merge(api_router)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", rest::ApiDoc::openapi())))
}
