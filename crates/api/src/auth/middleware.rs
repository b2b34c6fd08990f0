//! Authentication middleware for Axum
//!
//! Every protected request runs inside an identity scope: credentials are
//! resolved, the identity is recorded for the request, the protected handler
//! runs, and the identity is removed again when the scope ends. The scope is a
//! drop guard, so the removal also happens when the handler panics or the
//! request future is dropped.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::{
    extract::{FromRequestParts, Request, State},
    http::{
        header::{ACCESS_CONTROL_EXPOSE_HEADERS, ORIGIN, SET_COOKIE},
        request::Parts,
        HeaderMap, HeaderName, HeaderValue,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};
use tower::Service;

use super::{
    credentials::{token_prefix, Credentials},
    error::AuthError,
    identity::{Identity, RequestContext},
    resolver::AuthService,
};
use crate::accounts::{Account, Session};

/// State needed for authentication
#[derive(Clone)]
pub struct AuthState {
    pub auth: Arc<AuthService>,
}

/// Middleware that requires authentication
pub async fn require_auth(
    State(auth_state): State<AuthState>,
    request: Request,
    next: Next,
) -> Response {
    authenticated(&auth_state, request, |request, _identity| next.run(request)).await
}

/// Resolve credentials, run `handler` with the identity, then release the
/// request's identity slot.
async fn authenticated<F, Fut>(auth_state: &AuthState, mut request: Request, handler: F) -> Response
where
    F: FnOnce(Request, Identity) -> Fut,
    Fut: Future<Output = Response>,
{
    let auth = &auth_state.auth;
    let path = request.uri().path().to_string();
    let guard = auth.begin_request();
    let ctx = guard.context();

    let credentials = match Credentials::from_headers(request.headers(), &auth.config().headers) {
        Ok(credentials) => credentials,
        Err(err) => {
            tracing::warn!(path = %path, "require_auth: no credentials found (header or cookie)");
            return err.into_response();
        }
    };
    tracing::info!(
        path = %path,
        request_id = %ctx.request_id,
        method = credentials.kind(),
        "require_auth: checking authentication"
    );

    let identity = match auth.authenticate(&ctx, &credentials).await {
        Ok(identity) => identity,
        Err(err) => {
            tracing::warn!(path = %path, error = %err, "require_auth: authentication failed");
            return err.into_response();
        }
    };
    tracing::info!(
        path = %path,
        request_id = %ctx.request_id,
        account = %identity.account.slug,
        "require_auth: authentication successful"
    );

    // Only sessions issued by this request are echoed back
    let issued = match credentials {
        Credentials::Session { .. } => None,
        _ => identity.session.clone(),
    };
    let origin = request
        .headers()
        .get(ORIGIN)
        .and_then(|h| h.to_str().ok())
        .map(String::from);

    request.extensions_mut().insert(ctx);
    request.extensions_mut().insert(identity.clone());

    let mut response = handler(request, identity).await;
    if let Some(session) = issued {
        send_session(
            response.headers_mut(),
            &auth.config().headers.session,
            origin.as_deref(),
            &session,
        );
    }

    drop(guard);
    response
}

/// Echo a session token to the client: as the session header (exposed to
/// CORS callers) and as a cookie scoped to the request origin's host.
pub fn send_session(
    headers: &mut HeaderMap,
    header_name: &str,
    origin: Option<&str>,
    session: &Session,
) {
    let (Ok(name), Ok(token)) = (
        HeaderName::from_bytes(header_name.as_bytes()),
        HeaderValue::from_str(&session.key),
    ) else {
        tracing::error!(header = %header_name, session = %token_prefix(&session.key), "send_session: invalid session header");
        return;
    };

    let mut cookie = format!("{}={}; Path=/", header_name, session.key);
    if let Some(domain) = origin.and_then(cookie_domain) {
        cookie.push_str("; Domain=");
        cookie.push_str(&domain);
    }

    headers.insert(name, token);
    if let Ok(expose) = HeaderValue::from_str(header_name) {
        headers.append(ACCESS_CONTROL_EXPOSE_HEADERS, expose);
    }
    match HeaderValue::from_str(&cookie) {
        Ok(value) => {
            headers.append(SET_COOKIE, value);
        }
        Err(e) => {
            tracing::warn!(error = %e, "send_session: could not build session cookie");
        }
    }
}

/// Host of the request origin without its port.
fn cookie_domain(origin: &str) -> Option<String> {
    url::Url::parse(origin)
        .ok()?
        .host_str()
        .filter(|host| !host.is_empty())
        .map(String::from)
}

type HandlerFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

#[derive(Clone)]
enum Protected {
    Request(Arc<dyn Fn(Request) -> HandlerFuture + Send + Sync>),
    WithAccount(Arc<dyn Fn(Request, Account) -> HandlerFuture + Send + Sync>),
}

/// A handler that only runs for authenticated requests.
///
/// Unauthenticated requests get a bare 401; any other authentication failure
/// is a 500 with the error text.
#[derive(Clone)]
pub struct AuthenticatedFn {
    state: AuthState,
    protected: Protected,
}

impl AuthenticatedFn {
    /// Wrap a handler that only needs the request.
    pub fn new<F, Fut, R>(state: AuthState, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoResponse,
    {
        let handler = Arc::new(move |request: Request| -> HandlerFuture {
            let fut = handler(request);
            Box::pin(async move { fut.await.into_response() })
        });
        Self {
            state,
            protected: Protected::Request(handler),
        }
    }

    /// Wrap a handler that also receives the authenticated account.
    pub fn with_account<F, Fut, R>(state: AuthState, handler: F) -> Self
    where
        F: Fn(Request, Account) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = R> + Send + 'static,
        R: IntoResponse,
    {
        let handler = Arc::new(move |request: Request, account: Account| -> HandlerFuture {
            let fut = handler(request, account);
            Box::pin(async move { fut.await.into_response() })
        });
        Self {
            state,
            protected: Protected::WithAccount(handler),
        }
    }

    pub async fn handle(&self, request: Request) -> Response {
        let protected = self.protected.clone();
        authenticated(&self.state, request, move |request, identity| match protected {
            Protected::Request(handler) => handler(request),
            Protected::WithAccount(handler) => handler(request, identity.account),
        })
        .await
    }
}

impl Service<Request> for AuthenticatedFn {
    type Response = Response;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, request: Request) -> Self::Future {
        let this = self.clone();
        Box::pin(async move { Ok(this.handle(request).await) })
    }
}

/// Identity of an authenticated request, for handlers behind [`require_auth`].
#[derive(Debug, Clone)]
pub struct CurrentIdentity(pub Identity);

impl<S> FromRequestParts<S> for CurrentIdentity
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<Identity>()
            .cloned()
            .map(CurrentIdentity)
            .ok_or(AuthError::Unauthenticated)
    }
}

impl<S> FromRequestParts<S> for RequestContext
where
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<RequestContext>()
            .cloned()
            .ok_or(AuthError::Unauthenticated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tenantauth_shared::EntityKey;
    use time::macros::datetime;

    fn session() -> Session {
        Session {
            key: "abc123".into(),
            account: EntityKey::named("Account", "acme"),
            user: None,
            initialized: datetime!(2024-03-01 09:00:00 UTC),
            last_used: datetime!(2024-03-01 09:00:00 UTC),
            ttl: Duration::from_secs(60),
        }
    }

    #[test]
    fn test_cookie_domain_strips_port() {
        assert_eq!(
            cookie_domain("https://app.example.com:8443").as_deref(),
            Some("app.example.com")
        );
        assert_eq!(
            cookie_domain("http://localhost:3000").as_deref(),
            Some("localhost")
        );
        assert_eq!(cookie_domain("not a url"), None);
    }

    #[test]
    fn test_send_session_sets_header_expose_and_cookie() {
        let mut headers = HeaderMap::new();
        headers.append(
            ACCESS_CONTROL_EXPOSE_HEADERS,
            HeaderValue::from_static("Content-Type"),
        );
        send_session(
            &mut headers,
            "X-session",
            Some("http://app.example.com:3000"),
            &session(),
        );

        assert_eq!(headers.get("x-session").unwrap(), "abc123");
        let exposed: Vec<_> = headers
            .get_all(ACCESS_CONTROL_EXPOSE_HEADERS)
            .iter()
            .map(|v| v.to_str().unwrap().to_string())
            .collect();
        assert_eq!(exposed, vec!["Content-Type", "X-session"]);
        assert_eq!(
            headers.get(SET_COOKIE).unwrap(),
            "X-session=abc123; Path=/; Domain=app.example.com"
        );
    }

    #[test]
    fn test_send_session_without_origin_omits_domain() {
        let mut headers = HeaderMap::new();
        send_session(&mut headers, "X-session", None, &session());
        assert_eq!(headers.get(SET_COOKIE).unwrap(), "X-session=abc123; Path=/");
    }
}
