use crate::error::{AppError, AppResult};
use crate::metering::PriceConfig;
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Deserialize;

/// Top-level config file. Everything the gateway serves is declared here:
/// who may call it, what they may spend, which models exist and which
/// upstream credentials back them.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyConfig>,
    #[serde(default)]
    pub accounts: Vec<AccountConfig>,
    #[serde(default)]
    pub models: Vec<ModelConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ApiKeyConfig {
    pub key: String,
    pub user: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AccountConfig {
    pub user: String,
    pub balance: Decimal,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub grants: Vec<GrantConfig>,
}

/// Prepaid allowance for one model, consumed before the money balance.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GrantConfig {
    pub model: String,
    #[serde(default)]
    pub counts: i64,
    #[serde(default)]
    pub tokens: i64,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    /// Name callers use.
    pub name: String,
    /// Name sent upstream.
    pub upstream_model: String,
    #[serde(default)]
    pub price: PriceConfig,
    /// Reclassify inline `<think>` reasoning from the text stream.
    #[serde(default)]
    pub extract_think_tag: bool,
    #[serde(default)]
    pub think_start_tag: Option<String>,
    #[serde(default)]
    pub think_end_tag: Option<String>,
    pub credentials: Vec<CredentialConfig>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CredentialConfig {
    pub base_url: String,
    pub api_key: String,
}

fn default_listen() -> String {
    "0.0.0.0:8080".to_string()
}

impl GatewayConfig {
    pub fn load(path: &str) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "config_read_failed",
                format!("{path}: {err}"),
            )
        })?;
        let config: GatewayConfig = serde_json::from_str(&raw).map_err(|err| {
            AppError::new(
                StatusCode::BAD_REQUEST,
                "config_parse_failed",
                format!("{path}: {err}"),
            )
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> AppResult<()> {
        for model in &self.models {
            if model.credentials.is_empty() {
                return Err(AppError::new(
                    StatusCode::BAD_REQUEST,
                    "config_invalid",
                    format!("model {} has no credentials", model.name),
                ));
            }
        }
        for key in &self.api_keys {
            if !self.accounts.iter().any(|a| a.user == key.user) {
                return Err(AppError::new(
                    StatusCode::BAD_REQUEST,
                    "config_invalid",
                    format!("api key {} references unknown user {}", key.key, key.user),
                ));
            }
        }
        Ok(())
    }
}
