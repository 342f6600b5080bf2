use crate::chat::think_tag::{DEFAULT_END_TAG, DEFAULT_START_TAG, ThinkTagParser};
use crate::config::{AccountConfig, CredentialConfig, GatewayConfig, ModelConfig};
use crate::metering::{CostBreakdown, ModelGrant, PriceConfig};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

/// One servable model: pricing, think-tag policy and the upstream
/// credentials that back it.
#[derive(Debug, Clone)]
pub struct ModelEntry {
    pub name: String,
    pub upstream_model: String,
    pub price: PriceConfig,
    pub extract_think_tag: bool,
    pub think_start_tag: String,
    pub think_end_tag: String,
    pub credentials: Vec<CredentialConfig>,
}

impl ModelEntry {
    fn from_config(config: &ModelConfig) -> Self {
        Self {
            name: config.name.clone(),
            upstream_model: config.upstream_model.clone(),
            price: config.price,
            extract_think_tag: config.extract_think_tag,
            think_start_tag: config
                .think_start_tag
                .clone()
                .unwrap_or_else(|| DEFAULT_START_TAG.to_string()),
            think_end_tag: config
                .think_end_tag
                .clone()
                .unwrap_or_else(|| DEFAULT_END_TAG.to_string()),
            credentials: config.credentials.clone(),
        }
    }

    pub fn think_tag_parser(&self) -> Option<ThinkTagParser> {
        self.extract_think_tag
            .then(|| ThinkTagParser::new(self.think_start_tag.clone(), self.think_end_tag.clone()))
    }
}

/// Immutable model table plus the per-(user, model) round-robin counters
/// used to spread a user's traffic across a model's credentials.
pub struct ModelRegistry {
    models: HashMap<String, ModelEntry>,
    round_robin: DashMap<(String, String), AtomicUsize>,
}

impl ModelRegistry {
    pub fn from_config(config: &GatewayConfig) -> Self {
        let models = config
            .models
            .iter()
            .map(|m| (m.name.clone(), ModelEntry::from_config(m)))
            .collect();
        Self {
            models,
            round_robin: DashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&ModelEntry> {
        self.models.get(name)
    }

    pub fn model_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.models.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }

    /// Picks the next credential for this (user, model) pair. Lock-free:
    /// the counter is a shared atomic, incremented per call.
    pub fn pick_credential<'a>(
        &self,
        user: &str,
        entry: &'a ModelEntry,
    ) -> Option<&'a CredentialConfig> {
        if entry.credentials.is_empty() {
            return None;
        }
        let counter = self
            .round_robin
            .entry((user.to_string(), entry.name.clone()))
            .or_insert_with(|| AtomicUsize::new(0));
        let n = counter.fetch_add(1, Ordering::Relaxed);
        Some(&entry.credentials[n % entry.credentials.len()])
    }
}

#[derive(Debug, Clone)]
struct AccountState {
    balance: Decimal,
    expires_at: Option<DateTime<Utc>>,
    grants: HashMap<String, ModelGrant>,
}

/// Snapshot handed to the balance calculator at request start.
#[derive(Debug, Clone, Copy)]
pub struct AccountSnapshot {
    pub balance: Decimal,
    pub grant: ModelGrant,
    pub expired: bool,
}

/// In-memory ledger. Reads take a snapshot; the single write per request is
/// the debit at finalize, performed under the entry lock.
pub struct AccountStore {
    inner: DashMap<String, AccountState>,
}

impl AccountStore {
    pub fn from_config(accounts: &[AccountConfig]) -> Self {
        let inner = DashMap::new();
        for account in accounts {
            let grants = account
                .grants
                .iter()
                .map(|g| {
                    (
                        g.model.clone(),
                        ModelGrant {
                            counts: g.counts,
                            tokens: g.tokens,
                        },
                    )
                })
                .collect();
            inner.insert(
                account.user.clone(),
                AccountState {
                    balance: account.balance,
                    expires_at: account.expires_at,
                    grants,
                },
            );
        }
        Self { inner }
    }

    pub fn snapshot(&self, user: &str, model: &str) -> Option<AccountSnapshot> {
        let state = self.inner.get(user)?;
        Some(AccountSnapshot {
            balance: state.balance,
            grant: state.grants.get(model).copied().unwrap_or_default(),
            expired: state
                .expires_at
                .map(|at| at <= Utc::now())
                .unwrap_or(false),
        })
    }

    /// Applies one request's final cost. Balance may go negative here: the
    /// sufficiency checks happen during the request, the debit is
    /// unconditional.
    pub fn debit(&self, user: &str, model: &str, cost: &CostBreakdown) {
        let Some(mut state) = self.inner.get_mut(user) else {
            return;
        };
        state.balance -= cost.total_cost();
        if cost.counts_used > 0 || cost.tokens_used > 0 {
            let grant = state.grants.entry(model.to_string()).or_default();
            grant.counts -= cost.counts_used;
            grant.tokens -= cost.tokens_used;
        }
    }

    pub fn balance_of(&self, user: &str) -> Option<Decimal> {
        self.inner.get(user).map(|state| state.balance)
    }
}
