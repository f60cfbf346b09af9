//! Configuration types for llm-relay.
//!
//! Config is loaded once at startup from a TOML file and validated before the
//! server opens any ports. Invalid configs are rejected with a clear error
//! rather than silently falling back to defaults. At runtime the active config
//! lives behind `RwLock<Arc<Config>>` and is swapped atomically on reload —
//! in-flight requests keep the snapshot they captured at dispatch time.
//!
//! # Example
//! ```toml
//! [gateway]
//! listen_port = 8080
//!
//! [providers.main]
//! base_url       = "https://api.anthropic.com"
//! auth_token_env = "RELAY_MAIN_TOKEN"
//! model          = "claude-sonnet-4-5"
//!
//! [profiles.default]
//! providers = ["main"]
//! ```

use std::{collections::HashMap, path::Path};

use anyhow::Context;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::classify::{Scenario, DEFAULT_LONG_CONTEXT_THRESHOLD};

/// Name prefix reserved for volatile in-memory profiles.
pub const TEMP_PROFILE_PREFIX: &str = "_tmp_";

/// Which API dialect a profile's clients speak and a provider's endpoint
/// expects. The relay rewrites only auth and the `model` field, so the tag
/// mostly documents intent — both dialects receive `x-api-key` and a Bearer
/// token on the way out.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum WireFormat {
    /// Anthropic Messages API (`/v1/messages`).
    #[default]
    Anthropic,
    /// OpenAI chat-completions style (`/v1/chat/completions`).
    #[serde(rename = "openai")]
    OpenAI,
}

impl std::fmt::Display for WireFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Anthropic => "anthropic",
            Self::OpenAI => "openai",
        })
    }
}

/// Provider-ordering policy applied per request.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    /// Configured order; unhealthy providers move to the tail.
    #[default]
    Failover,
    /// Rotate the starting provider on every request.
    RoundRobin,
    /// Ascending recent average latency, from the metrics sink.
    LeastLatency,
    /// Ascending `input + output` price for the model each provider would use.
    LeastCost,
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Failover => "failover",
            Self::RoundRobin => "round_robin",
            Self::LeastLatency => "least_latency",
            Self::LeastCost => "least_cost",
        })
    }
}

/// Top-level relay configuration.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct Config {
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// Named upstream accounts.
    #[serde(default)]
    pub providers: HashMap<String, ProviderConfig>,

    /// Named profiles — each an ordered list of provider names.
    #[serde(default)]
    pub profiles: HashMap<String, ProfileConfig>,

    /// Per-model pricing in USD per million tokens.
    #[serde(default)]
    pub pricing: HashMap<String, ModelPricing>,

    /// Optional spend limits, keyed by period.
    #[serde(default)]
    pub budgets: HashMap<BudgetPeriod, BudgetConfig>,
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content =
            std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        let config: Self = toml::from_str(&content).context("parsing config TOML")?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        // Every profile must be non-empty and reference known providers.
        for (name, profile) in &self.profiles {
            anyhow::ensure!(
                is_valid_profile_name(name),
                "profile name `{}` must match [A-Za-z0-9_-]+ and not start with `{}`",
                name,
                TEMP_PROFILE_PREFIX
            );
            anyhow::ensure!(
                !profile.providers.is_empty(),
                "profile `{}` has an empty provider list",
                name
            );
            for provider in &profile.providers {
                anyhow::ensure!(
                    self.providers.contains_key(provider),
                    "profile `{}` references unknown provider `{}`",
                    name,
                    provider
                );
            }
        }

        for (name, provider) in &self.providers {
            anyhow::ensure!(
                !provider.base_url.trim().is_empty(),
                "provider `{}` has an empty base_url",
                name
            );
        }

        for (period, budget) in &self.budgets {
            anyhow::ensure!(
                budget.limit_usd > 0.0,
                "budget `{}` must have a positive limit_usd",
                period
            );
        }

        Ok(())
    }

    /// Look up a statically configured profile.
    pub fn profile(&self, name: &str) -> Option<&ProfileConfig> {
        self.profiles.get(name)
    }

    /// Summed input+output price for one model, the least-cost ranking scalar.
    pub fn price_per_mtok(&self, model: &str) -> Option<f64> {
        self.pricing.get(model).map(|p| p.input + p.output)
    }

    /// Cost in USD for one turn against `model`, when pricing is known.
    pub fn turn_cost(&self, model: &str, input_tokens: u64, output_tokens: u64) -> Option<f64> {
        self.pricing.get(model).map(|p| {
            input_tokens as f64 * p.input / 1_000_000.0
                + output_tokens as f64 * p.output / 1_000_000.0
        })
    }
}

fn is_valid_profile_name(name: &str) -> bool {
    !name.is_empty()
        && !name.starts_with(TEMP_PROFILE_PREFIX)
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

/// Core relay settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GatewayConfig {
    /// Port the single client+admin listener binds (default: 8080).
    #[serde(default = "defaults::listen_port")]
    pub listen_port: u16,

    /// Provider-ordering policy (default: failover).
    #[serde(default)]
    pub strategy: Strategy,

    /// Token threshold at which a request classifies as long-context.
    #[serde(default = "defaults::long_context_threshold")]
    pub long_context_threshold: usize,

    /// Maximum number of tracked sessions (default: 1000).
    #[serde(default = "defaults::session_capacity")]
    pub session_capacity: usize,

    /// Idle age after which the periodic sweep drops a session (default: 1 h).
    #[serde(default = "defaults::session_ttl_secs")]
    pub session_ttl_secs: u64,

    /// Ring-buffer capacity of the in-memory usage/metrics sink (default: 2000).
    #[serde(default = "defaults::sink_capacity")]
    pub sink_capacity: usize,

    /// Log level override (also controlled by `RUST_LOG` env var).
    #[serde(default)]
    pub log_level: Option<String>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            listen_port: defaults::listen_port(),
            strategy: Strategy::default(),
            long_context_threshold: defaults::long_context_threshold(),
            session_capacity: defaults::session_capacity(),
            session_ttl_secs: defaults::session_ttl_secs(),
            sink_capacity: defaults::sink_capacity(),
            log_level: None,
        }
    }
}

/// One upstream account.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ProviderConfig {
    /// Base URL — scheme + host + optional path prefix, no trailing slash needed.
    pub base_url: String,

    /// Bearer token, inline. Prefer `auth_token_env` to keep secrets out of
    /// the config file.
    #[serde(default)]
    pub auth_token: Option<String>,

    /// Environment variable name whose value is the bearer token. Takes
    /// precedence over `auth_token` when both resolve.
    #[serde(default)]
    pub auth_token_env: Option<String>,

    /// Default model injected into forwarded bodies. Leave unset to forward
    /// the client's own `model` field untouched.
    #[serde(default)]
    pub model: Option<String>,

    /// API dialect this endpoint expects.
    #[serde(default)]
    pub format: WireFormat,

    /// Per-scenario model overrides, e.g. `long_context = "claude-sonnet-4-5[1m]"`.
    #[serde(default)]
    pub scenario_models: HashMap<Scenario, String>,
}

impl ProviderConfig {
    /// Resolve the bearer token: environment first, then the inline value.
    pub fn token(&self) -> Option<String> {
        self.auth_token_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok())
            .filter(|t| !t.is_empty())
            .or_else(|| self.auth_token.clone())
            .filter(|t| !t.is_empty())
    }
}

/// A named, ordered list of providers.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProfileConfig {
    /// Provider names in failover order. Must be non-empty.
    pub providers: Vec<String>,

    /// Dialect clients of this profile speak.
    #[serde(default)]
    pub format: WireFormat,
}

/// USD per million tokens.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct ModelPricing {
    pub input: f64,
    pub output: f64,
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BudgetPeriod {
    Daily,
    Weekly,
    Monthly,
}

impl BudgetPeriod {
    pub fn window(&self) -> chrono::Duration {
        match self {
            Self::Daily => chrono::Duration::days(1),
            Self::Weekly => chrono::Duration::days(7),
            Self::Monthly => chrono::Duration::days(30),
        }
    }
}

impl std::fmt::Display for BudgetPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Daily => "daily",
            Self::Weekly => "weekly",
            Self::Monthly => "monthly",
        })
    }
}

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BudgetAction {
    #[default]
    Warn,
    Downgrade,
    Block,
}

/// Spend limit for one period.
#[derive(Debug, Clone, Copy, Deserialize, Serialize)]
pub struct BudgetConfig {
    pub limit_usd: f64,
    #[serde(default)]
    pub action: BudgetAction,
}

/// A volatile profile, created through the admin API and never persisted.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TempProfile {
    /// Provider names in failover order. May be empty — routing then fails
    /// with `no_providers`.
    #[serde(default)]
    pub providers: Vec<String>,

    #[serde(default)]
    pub format: WireFormat,
}

/// In-memory store for `_tmp_` profiles.
#[derive(Default)]
pub struct TempProfileStore {
    profiles: DashMap<String, TempProfile>,
}

impl TempProfileStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store a profile under a fresh `_tmp_<uuid>` id and return the id.
    pub fn create(&self, profile: TempProfile) -> String {
        let id = format!("{}{}", TEMP_PROFILE_PREFIX, uuid::Uuid::new_v4().simple());
        self.profiles.insert(id.clone(), profile);
        id
    }

    /// Store a profile under a caller-chosen id. Test and import hook.
    pub fn insert(&self, id: String, profile: TempProfile) {
        self.profiles.insert(id, profile);
    }

    pub fn get(&self, id: &str) -> Option<TempProfile> {
        self.profiles.get(id).map(|p| p.clone())
    }

    pub fn remove(&self, id: &str) -> Option<TempProfile> {
        self.profiles.remove(id).map(|(_, p)| p)
    }

    pub fn len(&self) -> usize {
        self.profiles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }
}

mod defaults {
    use super::DEFAULT_LONG_CONTEXT_THRESHOLD;

    pub fn listen_port() -> u16 {
        8080
    }
    pub fn long_context_threshold() -> usize {
        DEFAULT_LONG_CONTEXT_THRESHOLD
    }
    pub fn session_capacity() -> usize {
        crate::session::DEFAULT_SESSION_CAPACITY
    }
    pub fn session_ttl_secs() -> u64 {
        3_600
    }
    pub fn sink_capacity() -> usize {
        2_000
    }
}
