// API server clippy configuration
#![allow(clippy::single_match)]
#![allow(clippy::needless_borrows_for_generic_args)]
#![cfg_attr(test, allow(clippy::expect_used))]
#![cfg_attr(test, allow(clippy::unwrap_used))]

//! TenantAuth API Server
//!
//! Serves the account routes (account creation, authentication, logout and
//! the authenticated `me` / `session` views) behind the request-scoped
//! authentication middleware.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::{header, HeaderName, HeaderValue, Method};
use tenantauth_api::{routes::create_router, AppState, Config};
use tenantauth_shared::{
    Cipher, Clock, DurableStore, MemoryCache, MemoryStore, PgStore, RedisCache, SharedCache,
    SystemClock,
};
use tower_http::{
    cors::{AllowOrigin, CorsLayer},
    trace::TraceLayer,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tenantauth_api=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting TenantAuth API Server v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration
    let config = Config::from_env()?;
    tracing::info!(?config, "Configuration loaded");

    // Durable store: Postgres when configured, process memory otherwise
    let store: Arc<dyn DurableStore> = match &config.database_url {
        Some(url) => {
            tracing::info!("Connecting to database...");
            let store = PgStore::connect(url).await?;
            store.ensure_schema().await?;
            tracing::info!("Database schema ready");
            Arc::new(store)
        }
        None => {
            tracing::warn!("DATABASE_URL not set - accounts are kept in memory and lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    // Session cache: Redis when configured, process memory otherwise
    let cache: Arc<dyn SharedCache> = match &config.redis_url {
        Some(url) => Arc::new(RedisCache::connect(url).await?),
        None => {
            tracing::warn!("REDIS_URL not set - sessions are not shared between instances");
            Arc::new(MemoryCache::new())
        }
    };

    let cipher = Arc::new(Cipher::with_key(&config.encryption_key)?);
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Create application state
    let state = AppState::new(config.clone(), store, cache, cipher, clock);

    // Build CORS layer - restrict to allowed origins only
    let allowed_origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    tracing::info!(
        allowed_origins = ?allowed_origins,
        "CORS configured with {} allowed origins",
        allowed_origins.len()
    );

    let names = &config.auth_headers;
    let mut allowed_headers = vec![header::CONTENT_TYPE, header::ACCEPT, header::ORIGIN];
    allowed_headers.extend(
        [
            &names.account,
            &names.key,
            &names.session,
            &names.username,
            &names.password,
        ]
        .into_iter()
        .filter_map(|name| HeaderName::from_bytes(name.as_bytes()).ok()),
    );
    let session_header = HeaderName::from_bytes(names.session.as_bytes())?;

    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(allowed_headers)
        .expose_headers([header::CONTENT_TYPE, session_header])
        .allow_credentials(true);

    // Build the router
    let app = create_router(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    // Parse bind address
    let addr: SocketAddr = config.bind_address.parse()?;
    tracing::info!("Starting server on {}", addr);

    // Start the server
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
