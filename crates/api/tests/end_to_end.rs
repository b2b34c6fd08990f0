//! End-to-end tests for the account routes, driven through the full router
//! with in-memory backends.

#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

use std::sync::Arc;

use axum::{
    body::{to_bytes, Body},
    extract::Request,
    http::{header, Method, StatusCode},
    Router,
};
use serde_json::Value;
use tenantauth_api::{
    accounts::{Account, User},
    routes::create_router,
    AppState, Config,
};
use tenantauth_shared::{persist, Cipher, EntityKey, MemoryCache, MemoryStore, SystemClock};
use tower::ServiceExt;

fn state_with(vars: &[(&str, &str)]) -> AppState {
    let vars: Vec<(String, String)> = vars
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .chain([("ENCRYPTION_KEY".to_string(), "0123456789abcdef".to_string())])
        .collect();
    let config = Config::from_lookup(|name| {
        vars.iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.clone())
    })
    .unwrap();
    let cipher = Cipher::with_key(&config.encryption_key).unwrap();

    AppState::new(
        config,
        Arc::new(MemoryStore::new()),
        Arc::new(MemoryCache::new()),
        Arc::new(cipher),
        Arc::new(SystemClock),
    )
}

fn request(method: Method, uri: &str, headers: &[(&str, &str)], body: &str) -> Request {
    let mut builder = axum::http::Request::builder().method(method).uri(uri);
    for (name, value) in headers {
        builder = builder.header(*name, *value);
    }
    builder.body(Body::from(body.to_string())).unwrap()
}

async fn send(app: &Router, request: Request) -> (StatusCode, axum::http::HeaderMap, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, headers, body)
}

async fn create_account(app: &Router, name: &str) -> (String, String) {
    let (status, _, body) = send(
        app,
        request(
            Method::POST,
            "/accounts/new",
            &[("Content-Type", "application/x-www-form-urlencoded")],
            &format!("account={}", name.replace(' ', "+")),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["code"], 200);
    (
        body["result"]["slug"].as_str().unwrap().to_string(),
        body["result"]["apikey"].as_str().unwrap().to_string(),
    )
}

async fn authenticate(app: &Router, headers: &[(&str, &str)]) -> String {
    let (status, response_headers, body) =
        send(app, request(Method::POST, "/accounts/authenticate", headers, "")).await;
    assert_eq!(status, StatusCode::OK);
    let token = body["data"]["session"].as_str().unwrap().to_string();
    assert_eq!(response_headers.get("x-session").unwrap(), token.as_str());
    token
}

// =============================================================================
// Account creation
// =============================================================================

#[tokio::test]
async fn test_create_account_from_form() {
    let app = create_router(state_with(&[]));
    let (slug, api_key) = create_account(&app, "Acme Corp").await;

    assert_eq!(slug, "acme-corp");
    assert_eq!(api_key.len(), 32);
    assert!(api_key.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn test_create_account_from_query_and_json() {
    let app = create_router(state_with(&[]));

    let (status, _, body) = send(
        &app,
        request(Method::POST, "/accounts/new?account=Acme", &[], ""),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["slug"], "acme");
    assert_eq!(body["result"]["active"], true);

    let (status, _, body) = send(
        &app,
        request(
            Method::POST,
            "/accounts/new",
            &[("Content-Type", "application/json")],
            r#"{"name": "Acme"}"#,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["slug"], "acme-2");
    assert_eq!(body["result"]["active"], true);
}

#[tokio::test]
async fn test_create_account_requires_name() {
    let app = create_router(state_with(&[]));
    let (status, _, body) = send(&app, request(Method::POST, "/accounts/new", &[], "")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], 400);
    assert_eq!(body["message"], "Account name must be provided");
}

#[tokio::test]
async fn test_create_account_with_taken_slug_fails() {
    let app = create_router(state_with(&[]));
    create_account(&app, "Acme").await;

    let (status, _, body) = send(
        &app,
        request(
            Method::POST,
            "/accounts/new",
            &[("Content-Type", "application/json")],
            r#"{"name": "Other", "slug": "acme"}"#,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["message"]
        .as_str()
        .unwrap()
        .starts_with("Error saving new account: "));
}

#[tokio::test]
async fn test_create_account_cannot_take_over_existing() {
    let app = create_router(state_with(&[]));
    let (slug, api_key) = create_account(&app, "Acme").await;
    let creds = [("X-account", slug.as_str()), ("X-key", api_key.as_str())];

    let (_, _, body) = send(&app, request(Method::GET, "/accounts/me", &creds, "")).await;
    let id = body["result"]["account"]["id"].as_str().unwrap().to_string();

    let takeover = format!(
        r#"{{"id": "{}", "slug": "acme", "name": "pwned", "apikey": "attacker"}}"#,
        id
    );
    let (status, _, body) = send(
        &app,
        request(
            Method::POST,
            "/accounts/new",
            &[("Content-Type", "application/json")],
            &takeover,
        ),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body["message"]
        .as_str()
        .unwrap()
        .starts_with("Error saving new account: "));

    let (status, _, _) = send(
        &app,
        request(
            Method::GET,
            "/accounts/me",
            &[("X-account", "acme"), ("X-key", "attacker")],
            "",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);

    let (status, _, body) = send(&app, request(Method::GET, "/accounts/me", &creds, "")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["account"]["name"], "Acme");
}

// =============================================================================
// Authentication flow
// =============================================================================

#[tokio::test]
async fn test_account_session_lifecycle() {
    let app = create_router(state_with(&[]));
    let (slug, api_key) = create_account(&app, "Acme").await;

    let token = authenticate(
        &app,
        &[("X-account", slug.as_str()), ("X-key", api_key.as_str())],
    )
    .await;

    // The session authenticates protected routes
    let (status, _, body) = send(
        &app,
        request(Method::GET, "/accounts/me", &[("X-session", token.as_str())], ""),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["account"]["slug"], "acme");
    assert!(body["result"]["account"].get("apikey").is_none());
    assert_eq!(body["result"]["user"], Value::Null);

    let (status, _, body) = send(
        &app,
        request(Method::GET, "/accounts/session", &[("X-session", token.as_str())], ""),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["session"], token.as_str());
    assert_eq!(body["data"]["account"], "acme");

    // Logging out ends it
    let (status, _, body) = send(
        &app,
        request(Method::POST, "/accounts/logout", &[("X-session", token.as_str())], ""),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["existed"], true);

    let (status, _, body) = send(
        &app,
        request(Method::GET, "/accounts/me", &[("X-session", token.as_str())], ""),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body, Value::Null);

    let logout_body = format!(r#"{{"session": "{}"}}"#, token);
    let (_, _, body) = send(
        &app,
        request(
            Method::POST,
            "/accounts/logout",
            &[("Content-Type", "application/json")],
            &logout_body,
        ),
    )
    .await;
    assert_eq!(body["data"]["existed"], false);
}

#[tokio::test]
async fn test_authenticate_failure_is_403_envelope() {
    let app = create_router(state_with(&[]));
    let (slug, _) = create_account(&app, "Acme").await;

    let (status, headers, body) = send(
        &app,
        request(
            Method::POST,
            "/accounts/authenticate",
            &[("X-account", slug.as_str()), ("X-key", "wrong")],
            "",
        ),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], 403);
    assert_eq!(body["message"], "API Key does not match account");
    assert!(!headers.contains_key(header::SET_COOKIE));

    let (status, _, body) = send(
        &app,
        request(Method::POST, "/accounts/authenticate", &[], ""),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(
        body["message"],
        "No account has been authenticated for this request"
    );
}

#[tokio::test]
async fn test_user_login_and_profile() {
    let state = state_with(&[]);
    let app = create_router(state.clone());
    let (slug, _) = create_account(&app, "Acme").await;

    let key = EntityKey::named(Account::KIND, slug.as_str());
    let account = persist::load::<Account>(state.auth.store(), &key)
        .await
        .unwrap()
        .unwrap();

    let mut user = User::new("", "hunter2").owned_by(&account);
    user.email = "ada@acme.test".into();
    user.first_name = "Ada".into();
    persist::save(&state.auth.save_context(), &mut user)
        .await
        .unwrap();

    let token = authenticate(
        &app,
        &[("X-username", "ada@acme.test"), ("X-password", "hunter2")],
    )
    .await;

    let (status, _, body) = send(
        &app,
        request(Method::GET, "/accounts/me", &[("X-session", token.as_str())], ""),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["user"]["username"], "ada@acme.test");
    assert_eq!(body["result"]["user"]["firstName"], "Ada");
    assert!(body["result"]["user"].get("encryptedPassword").is_none());
}

// =============================================================================
// Routing
// =============================================================================

#[tokio::test]
async fn test_custom_accounts_path() {
    let app = create_router(state_with(&[("ACCOUNTS_PATH", "tenants")]));

    let (status, _, body) = send(
        &app,
        request(Method::POST, "/tenants/new?account=Acme", &[], ""),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["result"]["slug"], "acme");

    let (status, _, _) = send(
        &app,
        request(Method::POST, "/accounts/new?account=Acme", &[], ""),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_health() {
    let app = create_router(state_with(&[]));
    let (status, _, body) = send(&app, request(Method::GET, "/health", &[], "")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}
