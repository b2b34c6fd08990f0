//! Account routes
//!
//! Mounted under `/<ACCOUNTS_PATH>`:
//! - `POST /new` creates an account
//! - `POST /authenticate` exchanges credentials for a session token
//! - `POST /logout` clears a session
//! - `GET /me` returns the authenticated account and user
//! - `GET /session` returns the session of the authenticated account

use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Query, Request, State},
    http::{
        header::{CONTENT_TYPE, ORIGIN},
        HeaderMap,
    },
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tenantauth_shared::persist;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::{
    accounts::{Account, Session, User},
    auth::{
        credentials::token_prefix, require_auth, send_session, session_token, AuthError,
        AuthService, AuthenticatedFn, Credentials, CurrentIdentity, RequestContext,
    },
    error::{ApiError, ApiResponse, ApiResult},
    state::AppState,
};

pub fn router(state: AppState) -> Router<AppState> {
    let protected = Router::new()
        .route("/me", get(me))
        .route_layer(middleware::from_fn_with_state(
            state.auth_state(),
            require_auth,
        ));

    let auth = state.auth.clone();
    let session = AuthenticatedFn::with_account(state.auth_state(), move |request, account| {
        current_session(auth.clone(), request, account)
    });

    Router::new()
        .route("/new", post(create_account))
        .route("/authenticate", post(authenticate))
        .route("/logout", post(logout))
        .route_service("/session", session)
        .merge(protected)
}

// =============================================================================
// Request/Response Types
// =============================================================================

#[derive(Debug, Default, Deserialize)]
pub struct NewAccountQuery {
    pub account: Option<String>,
}

/// JSON body of `POST /new`. Everything else on the account is server-assigned.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct NewAccountRequest {
    pub name: String,
    pub slug: String,
}

impl NewAccountRequest {
    fn into_account(self) -> Account {
        Account::with_slug(self.name, self.slug)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct LogoutRequest {
    pub session: Option<String>,
}

/// Account as shown to its own authenticated callers (no API key).
#[derive(Debug, Serialize)]
pub struct AccountView {
    pub id: String,
    pub name: String,
    pub slug: String,
    pub active: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub created: Option<OffsetDateTime>,
}

impl From<&Account> for AccountView {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id.clone(),
            name: account.name.clone(),
            slug: account.slug.clone(),
            active: account.active,
            created: account.created,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_login: Option<OffsetDateTime>,
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id,
            username: user.username.clone(),
            email: user.email.clone(),
            first_name: user.first_name.clone(),
            last_name: user.last_name.clone(),
            last_login: user.last_login,
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// Create an account from the `account` form value, or from a JSON body.
async fn create_account(
    State(state): State<AppState>,
    Query(query): Query<NewAccountQuery>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<ApiResponse> {
    let mut account = match form_account_name(&query, &headers, &body) {
        Some(name) => Account::new(name),
        None if is_form(&headers) || is_blank(&body) => {
            return Err(ApiError::Validation(
                "Account name must be provided".to_string(),
            ));
        }
        None => serde_json::from_slice::<NewAccountRequest>(&body)
            .map_err(|e| ApiError::Internal(e.to_string()))?
            .into_account(),
    };

    persist::save(&state.auth.save_context(), &mut account)
        .await
        .map_err(|e| ApiError::Internal(format!("Error saving new account: {}", e)))?;
    tracing::info!(account = %account.slug, "create_account: account created");

    let result = serde_json::to_value(&account).map_err(|e| ApiError::Internal(e.to_string()))?;
    Ok(ApiResponse::ok(result))
}

/// Authenticate the request and answer with its session token.
async fn authenticate(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let auth = &state.auth;
    let guard = auth.begin_request();
    let ctx = guard.context();

    match issue_session(auth, &ctx, &headers).await {
        Ok(session) => {
            let mut data = Map::new();
            data.insert("session".to_string(), Value::String(session.key.clone()));
            let mut response = ApiResponse::with_data(data).into_response();

            let origin = headers.get(ORIGIN).and_then(|h| h.to_str().ok());
            send_session(
                response.headers_mut(),
                &auth.config().headers.session,
                origin,
                &session,
            );
            response
        }
        Err(e) => {
            tracing::warn!(request_id = %ctx.request_id, error = %e, "authenticate: authentication failed");
            ApiError::Forbidden(e.to_string()).into_response()
        }
    }
}

async fn issue_session(
    auth: &AuthService,
    ctx: &RequestContext,
    headers: &HeaderMap,
) -> Result<Session, AuthError> {
    let credentials = Credentials::from_headers(headers, &auth.config().headers)?;
    let identity = auth.authenticate(ctx, &credentials).await?;
    auth.account_session(ctx, &identity.account).await
}

/// Clear the session named in the query, the JSON body, or the request's
/// session credential.
async fn logout(
    State(state): State<AppState>,
    Query(query): Query<LogoutRequest>,
    headers: HeaderMap,
    body: Bytes,
) -> ApiResult<ApiResponse> {
    let from_body = if is_blank(&body) {
        None
    } else {
        serde_json::from_slice::<LogoutRequest>(&body)
            .map_err(|e| ApiError::Validation(e.to_string()))?
            .session
    };

    let token = query
        .session
        .or(from_body)
        .filter(|t| !t.is_empty())
        .or_else(|| session_token(&headers, &state.auth.config().headers))
        .ok_or_else(|| ApiError::Validation("Session token must be provided".to_string()))?;

    let existed = state.auth.clear_session(&token).await?;
    tracing::info!(session = %token_prefix(&token), existed, "logout: session cleared");

    let mut data = Map::new();
    data.insert("existed".to_string(), Value::Bool(existed));
    Ok(ApiResponse::with_data(data))
}

async fn me(CurrentIdentity(identity): CurrentIdentity) -> ApiResult<ApiResponse> {
    let user = identity.user.as_ref().map(UserProfile::from);
    Ok(ApiResponse::ok(json!({
        "account": AccountView::from(&identity.account),
        "user": user,
    })))
}

async fn current_session(
    auth: Arc<AuthService>,
    request: Request,
    account: Account,
) -> ApiResult<ApiResponse> {
    let ctx = request
        .extensions()
        .get::<RequestContext>()
        .cloned()
        .ok_or(ApiError::Unauthorized)?;
    let session = auth.account_session(&ctx, &account).await?;

    let mut data = Map::new();
    data.insert("session".to_string(), Value::String(session.key.clone()));
    data.insert("account".to_string(), Value::String(account.slug.clone()));
    data.insert(
        "expiresAt".to_string(),
        session
            .expires_at()
            .and_then(|t| t.format(&Rfc3339).ok())
            .map(Value::String)
            .unwrap_or(Value::Null),
    );
    Ok(ApiResponse::with_data(data))
}

// =============================================================================
// Helper Functions
// =============================================================================

fn is_form(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|h| h.to_str().ok())
        .is_some_and(|ct| ct.starts_with("application/x-www-form-urlencoded"))
}

fn is_blank(body: &[u8]) -> bool {
    body.iter().all(u8::is_ascii_whitespace)
}

/// The `account` value from the query string or a urlencoded body.
fn form_account_name(query: &NewAccountQuery, headers: &HeaderMap, body: &[u8]) -> Option<String> {
    if let Some(name) = query.account.as_deref().filter(|n| !n.is_empty()) {
        return Some(name.to_string());
    }
    if !is_form(headers) {
        return None;
    }
    url::form_urlencoded::parse(body)
        .find(|(key, _)| key == "account")
        .map(|(_, value)| value.into_owned())
        .filter(|value| !value.is_empty())
}
