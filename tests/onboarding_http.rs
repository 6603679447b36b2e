//! Integration tests for the registration REST flow.
//!
//! Each test builds the full router over an in-memory libSQL database and a
//! capturing notifier, then drives it request by request.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode, header};
use chrono::Utc;
use secrecy::SecretString;
use serde_json::{Value, json};
use tower::ServiceExt;

use onboarding_service::config::{CredentialConfig, RateLimitConfig};
use onboarding_service::credential::CredentialIssuer;
use onboarding_service::error::NotifyError;
use onboarding_service::notify::Notifier;
use onboarding_service::onboarding::{
    OnboardingManager, OnboardingRouteState, OnboardingStep, ServiceApp, service_router,
};
use onboarding_service::ratelimit::RateLimiter;
use onboarding_service::store::{LibSqlBackend, UserStore};

/// Notifier that keeps every code sent; refuses to send while `failing` is set.
#[derive(Default)]
struct CapturingNotifier {
    sent: Mutex<Vec<(String, String)>>,
    failing: AtomicBool,
}

impl CapturingNotifier {
    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }

    fn code_for(&self, email: &str) -> String {
        let sent = self.sent.lock().unwrap();
        let (_, body) = sent
            .iter()
            .rev()
            .find(|(to, _)| to == email)
            .expect("no code sent");
        let start = body.find("<strong>").unwrap() + "<strong>".len();
        let end = body.find("</strong>").unwrap();
        body[start..end].to_string()
    }
}

#[async_trait]
impl Notifier for CapturingNotifier {
    fn name(&self) -> &str {
        "capturing"
    }

    async fn send(&self, to: &str, _subject: &str, body_html: &str) -> Result<(), NotifyError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(NotifyError::Transport("relay down".into()));
        }
        self.sent
            .lock()
            .unwrap()
            .push((to.to_string(), body_html.to_string()));
        Ok(())
    }
}

struct TestApp {
    router: ServiceApp,
    db: Arc<LibSqlBackend>,
    notifier: Arc<CapturingNotifier>,
    issuer: CredentialIssuer,
}

async fn test_app() -> TestApp {
    build_app(None).await
}

/// An app allowing `requests` calls per client and endpoint each minute.
async fn limited_app(requests: u32) -> TestApp {
    build_app(Some(RateLimiter::new(RateLimitConfig {
        requests,
        window: Duration::from_secs(60),
    })))
    .await
}

async fn build_app(limiter: Option<RateLimiter>) -> TestApp {
    let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
    let notifier = Arc::new(CapturingNotifier::default());
    let issuer = CredentialIssuer::new(&CredentialConfig {
        secret: SecretString::from("integration-secret".to_string()),
        lifetime: Some(Duration::from_secs(1800)),
    });
    let manager = Arc::new(OnboardingManager::new(
        db.clone(),
        db.clone(),
        notifier.clone(),
        issuer.clone(),
        Duration::from_secs(900),
    ));
    let router = service_router(OnboardingRouteState { manager, limiter }, &[]);
    TestApp {
        router,
        db,
        notifier,
        issuer,
    }
}

fn client(last_octet: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, last_octet], 40000))
}

impl TestApp {
    async fn post(&self, path: &str, body: Value, token: Option<&str>) -> (StatusCode, Value) {
        self.post_from(client(1), path, body, token).await
    }

    async fn post_from(
        &self,
        from: SocketAddr,
        path: &str,
        body: Value,
        token: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut request = Request::builder()
            .method("POST")
            .uri(path)
            .header(header::CONTENT_TYPE, "application/json");
        if let Some(token) = token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }
        let mut request = request.body(Body::from(body.to_string())).unwrap();
        request.extensions_mut().insert(ConnectInfo(from));

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn get_text(&self, path: &str) -> (StatusCode, String) {
        let request = Request::builder().uri(path).body(Body::empty()).unwrap();
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    fn step_of(&self, token: &str) -> OnboardingStep {
        self.issuer.decode(token).unwrap().onboarding_step
    }
}

fn token_of(body: &Value) -> String {
    body["token"].as_str().expect("token in response").to_string()
}

#[tokio::test]
async fn full_registration_flow() {
    let app = test_app().await;

    let (status, body) = app
        .post("/auth/register", json!({ "email": "a@b.com" }), None)
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(app.db.count_codes_for_email("a@b.com").await.unwrap(), 1);
    let user = app.db.find_user_by_email("a@b.com").await.unwrap().unwrap();
    assert_eq!(user.onboarding_step, OnboardingStep::Registered);

    let code = app.notifier.code_for("a@b.com");
    assert_eq!(code.len(), 6);
    let (status, body) = app
        .post(
            "/auth/register/verify",
            json!({ "email": "a@b.com", "code": code }),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let token = token_of(&body);
    assert_eq!(app.step_of(&token), OnboardingStep::EmailVerified);

    let (status, body) = app
        .post(
            "/auth/register/profile",
            json!({ "firstName": "Ann", "lastName": "Lee" }),
            Some(&token),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let token = token_of(&body);
    assert_eq!(app.step_of(&token), OnboardingStep::ProfileSet);

    let (status, body) = app
        .post(
            "/auth/register/profile",
            json!({ "termsAccepted": true }),
            Some(&token),
        )
        .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    let claims = app.issuer.decode(&token_of(&body)).unwrap();
    assert_eq!(claims.onboarding_step, OnboardingStep::TermsAccepted);
    assert!(claims.terms_accepted);
    assert_eq!(claims.first_name.as_deref(), Some("Ann"));

    let user = app.db.find_user_by_email("a@b.com").await.unwrap().unwrap();
    assert!(user.terms_accepted);
    assert!(user.terms_accepted_at.is_some());
}

#[tokio::test]
async fn duplicate_registration_conflicts() {
    let app = test_app().await;
    app.post("/auth/register", json!({ "email": "a@b.com" }), None)
        .await;
    let (status, body) = app
        .post("/auth/register", json!({ "email": "a@b.com" }), None)
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["error"], "Email already exists");
}

#[tokio::test]
async fn missing_email_is_bad_request() {
    let app = test_app().await;
    let (status, body) = app.post("/auth/register", json!({}), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("email"));
}

#[tokio::test]
async fn wrong_code_is_rejected() {
    let app = test_app().await;
    app.post("/auth/register", json!({ "email": "a@b.com" }), None)
        .await;

    let (status, body) = app
        .post(
            "/auth/register/verify",
            json!({ "email": "a@b.com", "code": "WRONG1" }),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid code");
    assert_eq!(app.db.count_codes_for_email("a@b.com").await.unwrap(), 1);
}

#[tokio::test]
async fn profile_requires_credential() {
    let app = test_app().await;
    let (status, _) = app
        .post(
            "/auth/register/profile",
            json!({ "firstName": "Ann", "lastName": "Lee" }),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = app
        .post(
            "/auth/register/profile",
            json!({ "firstName": "Ann", "lastName": "Lee" }),
            Some("forged.token.value"),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn terms_before_profile_is_wrong_step() {
    let app = test_app().await;
    app.post("/auth/register", json!({ "email": "a@b.com" }), None)
        .await;
    let code = app.notifier.code_for("a@b.com");
    let (_, body) = app
        .post(
            "/auth/register/verify",
            json!({ "email": "a@b.com", "code": code }),
            None,
        )
        .await;
    let token = token_of(&body);

    let (status, _) = app
        .post(
            "/auth/register/profile",
            json!({ "termsAccepted": true }),
            Some(&token),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .post("/auth/register/profile", json!({}), Some(&token))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("termsAccepted"));
}

#[tokio::test]
async fn stale_credential_replay_conflicts() {
    let app = test_app().await;
    app.post("/auth/register", json!({ "email": "a@b.com" }), None)
        .await;
    let code = app.notifier.code_for("a@b.com");
    let (_, body) = app
        .post(
            "/auth/register/verify",
            json!({ "email": "a@b.com", "code": code }),
            None,
        )
        .await;
    let stale = token_of(&body);

    let profile = json!({ "firstName": "Ann", "lastName": "Lee" });
    let (status, _) = app
        .post("/auth/register/profile", profile.clone(), Some(&stale))
        .await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = app
        .post("/auth/register/profile", profile, Some(&stale))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn resend_issues_new_code() {
    let app = test_app().await;
    app.post("/auth/register", json!({ "email": "a@b.com" }), None)
        .await;

    let (status, _) = app
        .post("/auth/register/resend", json!({ "email": "a@b.com" }), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.db.count_codes_for_email("a@b.com").await.unwrap(), 1);

    let code = app.notifier.code_for("a@b.com");
    let (status, _) = app
        .post(
            "/auth/register/verify",
            json!({ "email": "a@b.com", "code": code }),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn malformed_json_is_bad_request() {
    let app = test_app().await;
    let request = Request::builder()
        .method("POST")
        .uri("/auth/register")
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from("{not json"))
        .unwrap();
    let response = app.router.clone().oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn ping_and_fallbacks() {
    let app = test_app().await;

    let (status, body) = app.get_text("/ping").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, ".");

    let (status, body) = app.get_text("/nowhere").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(body, "Could not get /nowhere");

    let (status, body) = app.get_text("/auth/register").await;
    assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
    assert_eq!(body, "Not Allowed");
}

#[tokio::test]
async fn notification_failure_is_server_error_and_keeps_registration() {
    let app = test_app().await;
    app.notifier.failing.store(true, Ordering::SeqCst);

    let (status, body) = app
        .post("/auth/register", json!({ "email": "a@b.com" }), None)
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body["error"], "Error sending verification email");

    let user = app.db.find_user_by_email("a@b.com").await.unwrap().unwrap();
    assert_eq!(user.onboarding_step, OnboardingStep::Registered);
    assert_eq!(app.db.count_codes_for_email("a@b.com").await.unwrap(), 1);

    app.notifier.failing.store(false, Ordering::SeqCst);
    let (status, _) = app
        .post("/auth/register/resend", json!({ "email": "a@b.com" }), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(app.notifier.sent_count(), 1);
}

#[tokio::test]
async fn expired_credential_is_unauthorized() {
    let app = test_app().await;
    app.post("/auth/register", json!({ "email": "a@b.com" }), None)
        .await;
    let code = app.notifier.code_for("a@b.com");
    app.post(
        "/auth/register/verify",
        json!({ "email": "a@b.com", "code": code }),
        None,
    )
    .await;

    let user = app.db.find_user_by_email("a@b.com").await.unwrap().unwrap();
    let issued = Utc::now() - chrono::Duration::hours(1);
    let expired = app.issuer.issue_at(&user, issued).unwrap();

    let (status, body) = app
        .post(
            "/auth/register/profile",
            json!({ "firstName": "Ann", "lastName": "Lee" }),
            Some(&expired),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "Invalid or expired credential");
    let user = app.db.find_user_by_email("a@b.com").await.unwrap().unwrap();
    assert_eq!(user.onboarding_step, OnboardingStep::EmailVerified);
}

#[tokio::test]
async fn trailing_slash_reaches_route() {
    let app = test_app().await;
    let (status, _) = app
        .post("/auth/register/", json!({ "email": "a@b.com" }), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = app.get_text("/ping/").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, ".");
}

#[tokio::test]
async fn code_guessing_is_throttled_per_client() {
    let app = limited_app(5).await;
    app.post("/auth/register", json!({ "email": "a@b.com" }), None)
        .await;
    let code = app.notifier.code_for("a@b.com");

    for _ in 0..5 {
        let (status, _) = app
            .post(
                "/auth/register/verify",
                json!({ "email": "a@b.com", "code": "WRONG1" }),
                None,
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    // Budget spent: even the right code is refused from this client
    let (status, body) = app
        .post(
            "/auth/register/verify",
            json!({ "email": "a@b.com", "code": code }),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["error"], "Too many requests");
    assert_eq!(app.db.count_codes_for_email("a@b.com").await.unwrap(), 1);

    // Other endpoints and other clients keep their own budget
    let (status, _) = app
        .post("/auth/register/resend", json!({ "email": "a@b.com" }), None)
        .await;
    assert_eq!(status, StatusCode::OK);

    let code = app.notifier.code_for("a@b.com");
    let (status, _) = app
        .post_from(
            client(2),
            "/auth/register/verify",
            json!({ "email": "a@b.com", "code": code }),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn resend_is_throttled() {
    let app = limited_app(5).await;
    app.post("/auth/register", json!({ "email": "a@b.com" }), None)
        .await;

    let mut statuses = Vec::new();
    for _ in 0..8 {
        let (status, _) = app
            .post("/auth/register/resend", json!({ "email": "a@b.com" }), None)
            .await;
        statuses.push(status);
    }

    assert_eq!(statuses.iter().filter(|s| **s == StatusCode::OK).count(), 5);
    assert_eq!(
        statuses.iter().filter(|s| **s == StatusCode::TOO_MANY_REQUESTS).count(),
        3
    );
    assert_eq!(app.notifier.sent_count(), 6);
}

#[tokio::test]
async fn throttled_response_carries_retry_after() {
    let app = limited_app(1).await;
    let send = || {
        let mut request = Request::builder()
            .method("POST")
            .uri("/auth/register")
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json!({ "email": "a@b.com" }).to_string()))
            .unwrap();
        request.extensions_mut().insert(ConnectInfo(client(7)));
        app.router.clone().oneshot(request)
    };

    let first = send().await.unwrap();
    assert_eq!(first.status(), StatusCode::OK);
    assert_eq!(first.headers()["x-ratelimit-remaining"], "0");

    let second = send().await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: u64 = second.headers()[header::RETRY_AFTER]
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!((1..=60).contains(&retry_after));
}
