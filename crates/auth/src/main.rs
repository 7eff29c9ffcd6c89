use std::{sync::Arc, time::Instant};

use anyhow::{bail, Context};
use axum::{
    body::Body,
    extract::DefaultBodyLimit,
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use earnings_auth::{
    api::{self, ApiState},
    auth::{
        jwt::JwtAccessTokenService,
        oauth::{self, GoogleExchange, OAuthState},
    },
    cache::{CodeCache, MemoryCodeCache, RedisCodeCache},
    clock::SystemClock,
    config::{AuthServiceConfig, LogFormat},
    cors::cors_layer,
    db::{
        migrations::run_migrations,
        pool::{check_pool_health, create_pg_pool, PoolConfig},
    },
    error::{
        attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope,
        ApiError, ErrorCode,
    },
    notify::{LogNotifier, Notifier, SmtpNotifier},
    session::SessionManager,
    store::{CredentialStore, MemoryCredentialStore, PgCredentialStore},
    validation::MAX_REST_BODY_BYTES,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AuthServiceConfig::from_env();
    init_tracing(&config);

    if config.is_dev_jwt_secret() {
        if config.production {
            bail!("EARNINGS_AUTH_JWT_SECRET must be set in production");
        }
        warn!("using development JWT secret; set EARNINGS_AUTH_JWT_SECRET outside local dev");
    }

    let jwt_service = Arc::new(
        JwtAccessTokenService::new(&config.jwt_secret).context("invalid auth JWT secret")?,
    );
    let sessions = Arc::new(SessionManager::new(
        config.session.clone(),
        build_store(&config).await?,
        build_cache(&config).await?,
        build_notifier(&config)?,
        Arc::clone(&jwt_service),
        Arc::new(SystemClock),
    ));

    if config.google.is_none() {
        info!("google oauth not configured; oauth endpoints will return 503");
    }
    let oauth_state = OAuthState::new(
        config.google.clone(),
        Arc::new(GoogleExchange::new().context("failed to build oauth http client")?),
        Arc::clone(&sessions),
        config.cookie_secure,
    );

    let app = build_router(
        api::router(ApiState::new(sessions, config.cookie_secure), jwt_service),
        oauth::router(oauth_state),
    )
    .layer(cors_layer(config.cors_origins.as_deref()));

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind auth listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        production = config.production,
        "starting auth service"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("auth service exited unexpectedly")
}

fn init_tracing(config: &AuthServiceConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn build_store(config: &AuthServiceConfig) -> anyhow::Result<Arc<dyn CredentialStore>> {
    let Some(database_url) = config.database_url.as_deref() else {
        if config.production {
            bail!("EARNINGS_AUTH_DATABASE_URL must be set in production");
        }
        warn!("no database configured; accounts are kept in memory");
        return Ok(Arc::new(MemoryCredentialStore::new()));
    };

    let pool = create_pg_pool(database_url, PoolConfig::from_env()).await?;
    check_pool_health(&pool).await?;
    run_migrations(&pool).await?;
    info!("connected to auth PostgreSQL");
    Ok(Arc::new(PgCredentialStore::new(pool)))
}

async fn build_cache(config: &AuthServiceConfig) -> anyhow::Result<Arc<dyn CodeCache>> {
    let Some(redis_url) = config.redis_url.as_deref() else {
        if config.production {
            bail!("EARNINGS_AUTH_REDIS_URL must be set in production");
        }
        warn!("no redis configured; codes and rate limits are kept in memory");
        return Ok(Arc::new(MemoryCodeCache::new()));
    };

    let cache = RedisCodeCache::connect(redis_url).await?;
    cache.ping().await?;
    info!("connected to redis");
    Ok(Arc::new(cache))
}

fn build_notifier(config: &AuthServiceConfig) -> anyhow::Result<Arc<dyn Notifier>> {
    match &config.smtp {
        Some(settings) => {
            info!(host = %settings.host, port = settings.port, "smtp delivery enabled");
            Ok(Arc::new(SmtpNotifier::new(settings, config.session.code_ttl)?))
        }
        None => {
            warn!("smtp not configured; codes are logged as sent without delivery");
            Ok(Arc::new(LogNotifier))
        }
    }
}

fn build_router(api_router: Router, oauth_router: Router) -> Router {
    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(api_router)
            .merge(oauth_router)
            .fallback(route_not_found),
    )
}

fn apply_middleware(router: Router) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REST_BODY_BYTES))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn route_not_found() -> ApiError {
    ApiError::from_code(ErrorCode::NotFound)
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(?error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(?error, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Tags every request with an id, scoped so error bodies can echo it.
async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;
    attach_request_id_header(&mut response, &request_id);

    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status = response.status().as_u16(),
        latency_ms = started_at.elapsed().as_millis() as u64,
        "request completed"
    );

    response
}
