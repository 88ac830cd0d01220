use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use actix_web::HttpResponse;
use http::StatusCode;
use tracing_subscriber::{fmt, EnvFilter};

use crate::adapter::ChatEngine;
use crate::backend::{BackendClient, FalClient};
use crate::config::Config;
use crate::credentials::{ClientFactory, CredentialPool};

/// Initialize dotenv and structured tracing based on RUST_LOG.
/// - Supports explicit env file paths via ENV_FILE, ENVFILE, DOTENV_PATH
/// - Falls back to the default .env discovery
/// - Logs the source used
pub fn init_tracing() {
    let mut env_source: String = "none".into();
    for key in ["ENV_FILE", "ENVFILE", "DOTENV_PATH"] {
        if let Ok(p) = std::env::var(key) {
            let p = p.trim();
            if !p.is_empty()
                && std::path::Path::new(p).is_file()
                && dotenvy::from_filename(p).is_ok()
            {
                env_source = format!("{p} ({key})");
                break;
            }
        }
    }

    if env_source == "none" {
        if let Ok(path) = dotenvy::dotenv() {
            env_source = path.display().to_string();
        }
    }

    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into());
    let subscriber = fmt().with_env_filter(EnvFilter::new(filter)).finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    tracing::info!("Environment loaded from: {}", env_source);
}

/// Seconds since the Unix epoch.
pub fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Build the backend HTTP client honoring the configured proxy and timeout.
pub fn build_http_client(config: &Config) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();

    if let Some(secs) = config.http_timeout_secs {
        builder = builder.timeout(std::time::Duration::from_secs(secs));
    }

    if let Some(url) = config.proxy.as_deref().map(str::trim).filter(|u| !u.is_empty()) {
        builder = builder.proxy(reqwest::Proxy::all(url)?);
        tracing::info!("Using proxy for backend traffic: {}", url);
    }

    builder = builder.user_agent(format!("falgate/{}", env!("CARGO_PKG_VERSION")));

    Ok(builder.build()?)
}

/// Shared application state used by the HTTP server and handlers.
pub struct AppState {
    pub engine: ChatEngine,
    /// Bearer token required from clients; `None` turns the bearer into a backend credential.
    pub authorization_token: Option<String>,
    pub prompt_char_limit: usize,
}

impl AppState {
    pub fn new(engine: ChatEngine, authorization_token: Option<String>, prompt_char_limit: usize) -> Self {
        Self {
            engine,
            authorization_token,
            prompt_char_limit,
        }
    }

    /// Wire the fal client pool and prompt assembler from configuration.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        config.validate()?;
        let http = build_http_client(config)?;
        let base_url = config.fal_run_host.clone();
        let fallback_key = config.fal_key.clone();

        let factory: ClientFactory = Arc::new(move |key: Option<&str>| {
            let credential = key.map(str::to_string).or_else(|| fallback_key.clone());
            Arc::new(FalClient::new(http.clone(), &base_url, credential)) as Arc<dyn BackendClient>
        });
        let pool = Arc::new(CredentialPool::new(config.credentials(), factory));
        let assembler = config.prompt_strategy.build(config.prompt_char_limit);

        Ok(Self::new(
            ChatEngine::new(pool, assembler),
            config.authorization_token().map(str::to_string),
            config.prompt_char_limit,
        ))
    }
}

/// Build a JSON error response with the given HTTP status and message.
pub fn error_response(status: StatusCode, msg: &str) -> HttpResponse {
    let body = serde_json::json!({ "error": { "message": msg } });
    let status = actix_web::http::StatusCode::from_u16(status.as_u16())
        .unwrap_or(actix_web::http::StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status).json(body)
}

/// Extract the token from an `Authorization: Bearer <token>` header value.
pub fn bearer_token(header: Option<&str>) -> Option<String> {
    let s = header?.trim();
    let scheme = s.get(..6)?;
    let rest = s.get(6..)?;
    if !scheme.eq_ignore_ascii_case("bearer") || !rest.starts_with(char::is_whitespace) {
        return None;
    }
    Some(rest.trim().to_string()).filter(|t| !t.is_empty())
}

fn env_list(key: &str) -> Option<Vec<String>> {
    let raw = std::env::var(key).ok()?;
    Some(
        raw.split(',')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .collect(),
    )
}

/// Build a CORS configuration from environment variables for Actix-web.
///
/// Environment variables:
/// - CORS_ALLOWED_ORIGINS: "*" or comma-separated origins
/// - CORS_ALLOWED_METHODS: "*" or comma-separated methods
/// - CORS_ALLOWED_HEADERS: "*" or comma-separated request header names
/// - CORS_ALLOW_CREDENTIALS: enable with 1,true,yes,on
/// - CORS_MAX_AGE: max age in seconds (usize)
///
/// Unset variables are permissive, which suits browser chat frontends.
pub fn cors_config_from_env() -> actix_cors::Cors {
    let mut cors = actix_cors::Cors::default();

    cors = match env_list("CORS_ALLOWED_ORIGINS") {
        Some(origins) if !origins.is_empty() && origins.iter().all(|o| o != "*") => origins
            .iter()
            .fold(cors, |c, origin| c.allowed_origin(origin)),
        _ => cors.allow_any_origin(),
    };

    cors = match env_list("CORS_ALLOWED_METHODS") {
        Some(methods) if !methods.is_empty() && methods.iter().all(|m| m != "*") => {
            cors.allowed_methods(methods.iter().map(String::as_str))
        }
        _ => cors.allow_any_method(),
    };

    cors = match env_list("CORS_ALLOWED_HEADERS") {
        Some(headers) if !headers.is_empty() && headers.iter().all(|h| h != "*") => headers
            .iter()
            .fold(cors, |c, header| c.allowed_header(header.as_str())),
        _ => cors.allow_any_header(),
    };

    if let Ok(val) = std::env::var("CORS_ALLOW_CREDENTIALS") {
        let v = val.trim().to_ascii_lowercase();
        if v == "1" || v == "true" || v == "yes" || v == "on" {
            cors = cors.supports_credentials();
        }
    }

    if let Ok(secs) = std::env::var("CORS_MAX_AGE") {
        if let Ok(n) = secs.trim().parse::<usize>() {
            cors = cors.max_age(n);
        }
    }

    cors
}
