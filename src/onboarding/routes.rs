//! REST endpoints for the registration flow.

use std::sync::Arc;

use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router, middleware};
use serde::Deserialize;
use serde_json::json;
use tower::Layer;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::normalize_path::{NormalizePath, NormalizePathLayer};
use tower_http::trace::{DefaultMakeSpan, DefaultOnResponse, TraceLayer};
use tracing::{Level, error};

use super::manager::OnboardingManager;
use crate::error::OnboardingError;
use crate::ratelimit::{RateLimiter, rate_limit};

/// Shared state for onboarding routes.
#[derive(Clone)]
pub struct OnboardingRouteState {
    pub manager: Arc<OnboardingManager>,
    /// Throttle for the registration endpoints; `None` disables it.
    pub limiter: Option<RateLimiter>,
}

/// The complete HTTP service, with trailing slashes trimmed before routing.
pub type ServiceApp = NormalizePath<Router>;

#[derive(Debug, Default, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    email: String,
}

#[derive(Debug, Default, Deserialize)]
struct VerifyRequest {
    #[serde(default)]
    email: String,
    #[serde(default)]
    code: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ProfileRequest {
    #[serde(default)]
    first_name: String,
    #[serde(default)]
    last_name: String,
    #[serde(default)]
    terms_accepted: bool,
}

/// Maps `OnboardingError` onto a status code and JSON body.
#[derive(Debug)]
pub struct ApiError(pub OnboardingError);

impl From<OnboardingError> for ApiError {
    fn from(e: OnboardingError) -> Self {
        Self(e)
    }
}

impl From<JsonRejection> for ApiError {
    fn from(e: JsonRejection) -> Self {
        Self(OnboardingError::InvalidInput(format!("request body ({})", e.body_text())))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        use OnboardingError::*;

        let (status, message) = match &self.0 {
            InvalidInput(_) | InvalidCode | InvalidStep { .. } => {
                (StatusCode::BAD_REQUEST, self.0.to_string())
            }
            Conflict | StepConflict { .. } => (StatusCode::CONFLICT, self.0.to_string()),
            Unauthorized(_) => (StatusCode::UNAUTHORIZED, "Invalid or expired credential".into()),
            NotFound { .. } => {
                error!(error = %self.0, "Inconsistent onboarding state");
                (StatusCode::INTERNAL_SERVER_ERROR, "Error getting user".into())
            }
            NotificationFailure(e) => {
                error!(error = %e, "Notification dispatch failed");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Error sending verification email".into(),
                )
            }
            PersistenceFailure(e) => {
                error!(error = %e, "Store failure");
                (StatusCode::INTERNAL_SERVER_ERROR, "Error updating user".into())
            }
            Credential(e) => {
                error!(error = %e, "Credential issuance failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Error creating token".into())
            }
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}

fn token_response(token: String) -> Response {
    Json(json!({ "token": token })).into_response()
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, OnboardingError> {
    let value = headers
        .get(header::AUTHORIZATION)
        .ok_or_else(|| OnboardingError::Unauthorized("missing Authorization header".into()))?
        .to_str()
        .map_err(|_| OnboardingError::Unauthorized("non-ASCII Authorization header".into()))?;

    match value.split_once(' ') {
        Some((scheme, token)) if scheme.eq_ignore_ascii_case("bearer") && !token.trim().is_empty() => {
            Ok(token.trim())
        }
        _ => Err(OnboardingError::Unauthorized("expected a Bearer token".into())),
    }
}

/// POST /auth/register
async fn register(
    State(state): State<OnboardingRouteState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    state.manager.initiate(&request.email).await?;
    Ok(Json(json!({ "message": "Check email for verification code" })).into_response())
}

/// POST /auth/register/resend
async fn register_resend(
    State(state): State<OnboardingRouteState>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    state.manager.resend_code(&request.email).await?;
    Ok(Json(json!({ "message": "Check email for verification code" })).into_response())
}

/// POST /auth/register/verify
async fn register_verify(
    State(state): State<OnboardingRouteState>,
    body: Result<Json<VerifyRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body?;
    let token = state.manager.verify(&request.email, &request.code).await?;
    Ok(token_response(token))
}

/// POST /auth/register/profile
///
/// Names present → profile step; otherwise `termsAccepted: true` → terms step.
async fn register_profile(
    State(state): State<OnboardingRouteState>,
    headers: HeaderMap,
    body: Result<Json<ProfileRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let claims = state.manager.authenticate(bearer_token(&headers)?)?;
    let Json(request) = body?;

    let has_names = !request.first_name.trim().is_empty() && !request.last_name.trim().is_empty();
    let token = if has_names {
        state
            .manager
            .set_profile(&claims, &request.first_name, &request.last_name)
            .await?
    } else if request.terms_accepted {
        state.manager.accept_terms(&claims, true).await?
    } else {
        return Err(OnboardingError::InvalidInput("firstName, lastName, termsAccepted".into()).into());
    };

    Ok(token_response(token))
}

/// GET /ping
async fn ping() -> &'static str {
    "."
}

async fn not_found(uri: Uri) -> impl IntoResponse {
    (StatusCode::NOT_FOUND, format!("Could not get {}", uri.path()))
}

async fn method_not_allowed() -> impl IntoResponse {
    (StatusCode::METHOD_NOT_ALLOWED, "Not Allowed")
}

fn cors_layer(allowed_origins: &[HeaderValue]) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE]);

    if allowed_origins.is_empty() {
        layer.allow_origin(Any)
    } else {
        layer.allow_origin(AllowOrigin::list(allowed_origins.iter().cloned()))
    }
}

/// Build the onboarding REST routes, throttled per client and endpoint.
pub fn onboarding_routes(state: OnboardingRouteState) -> Router {
    let router = Router::new()
        .route("/auth/register", post(register))
        .route("/auth/register/resend", post(register_resend))
        .route("/auth/register/verify", post(register_verify))
        .route("/auth/register/profile", post(register_profile));

    let router = match state.limiter.clone() {
        Some(limiter) => router.route_layer(middleware::from_fn_with_state(limiter, rate_limit)),
        None => router,
    };
    router.with_state(state)
}

/// Full service: onboarding routes, heartbeat, fallbacks, request tracing,
/// CORS and trailing-slash normalization.
pub fn service_router(state: OnboardingRouteState, allowed_origins: &[HeaderValue]) -> ServiceApp {
    let router = onboarding_routes(state)
        .route("/ping", get(ping))
        .fallback(not_found)
        .method_not_allowed_fallback(method_not_allowed)
        .layer(
            TraceLayer::new_for_http()
                .make_span_with(DefaultMakeSpan::new().level(Level::INFO))
                .on_response(DefaultOnResponse::new().level(Level::INFO)),
        )
        .layer(cors_layer(allowed_origins));

    NormalizePathLayer::trim_trailing_slash().layer(router)
}
