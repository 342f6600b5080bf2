use crate::config::GatewayConfig;
use crate::error::{AppError, AppResult};
use crate::registry::{AccountStore, ModelRegistry};
use axum::Router;
use axum::routing::{get, post};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub runtime: Arc<RuntimeConfig>,
    pub registry: Arc<ModelRegistry>,
    pub accounts: Arc<AccountStore>,
    pub api_keys: Arc<HashMap<String, String>>,
    pub http: reqwest::Client,
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub listen: String,
    pub config_path: String,
}

impl RuntimeConfig {
    pub fn from_env() -> Self {
        let config_path = std::env::var("TOKENGATE_CONFIG")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "tokengate.json".to_string());
        let listen = std::env::var("TOKENGATE_LISTEN")
            .ok()
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_default();
        Self {
            listen,
            config_path,
        }
    }
}

pub async fn load_state() -> AppResult<AppState> {
    load_state_with_runtime(RuntimeConfig::from_env()).await
}

pub async fn load_state_with_runtime(mut runtime: RuntimeConfig) -> AppResult<AppState> {
    let config = GatewayConfig::load(&runtime.config_path)?;
    if runtime.listen.is_empty() {
        runtime.listen = config.listen.clone();
    }
    Ok(state_from_config(runtime, &config)?)
}

/// Builds state from an already-parsed config. Tests use this directly to
/// avoid the filesystem.
pub fn state_from_config(runtime: RuntimeConfig, config: &GatewayConfig) -> AppResult<AppState> {
    config.validate()?;
    let http = reqwest::Client::builder()
        .user_agent("tokengate/0.1")
        .build()
        .map_err(|err| {
            AppError::new(
                axum::http::StatusCode::BAD_REQUEST,
                "http_client_init_failed",
                err.to_string(),
            )
        })?;

    let api_keys = config
        .api_keys
        .iter()
        .map(|k| (k.key.clone(), k.user.clone()))
        .collect();

    Ok(AppState {
        runtime: Arc::new(runtime),
        registry: Arc::new(ModelRegistry::from_config(config)),
        accounts: Arc::new(AccountStore::from_config(&config.accounts)),
        api_keys: Arc::new(api_keys),
        http,
    })
}

pub fn build_app(state: AppState) -> Router {
    Router::<AppState>::new()
        .route("/v1/models", get(crate::handlers::list_models))
        .route(
            "/v1/chat/completions",
            post(crate::handlers::create_chat_completions),
        )
        .route("/v1/messages", post(crate::handlers::create_messages))
        .with_state(state)
        .layer(SetRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
            MakeRequestUuid,
        ))
        .layer(PropagateRequestIdLayer::new(
            axum::http::header::HeaderName::from_static("x-request-id"),
        ))
        .layer(TraceLayer::new_for_http())
}
