//! Upstream provider pool: health tracking, backoff, and ordering policy.
//!
//! Each profile owns one [`UpstreamPool`] holding the runtime [`Provider`]
//! handles built from the active config snapshot. Pools are rebuilt wholesale
//! on config reload, so health state never leaks across snapshots.
//!
//! # Health machine
//!
//! ```text
//! [healthy] ──fail──► [unhealthy, backoff = 60 s]
//!   ▲                      │
//!   │                  backoff elapses
//!   │                      ▼
//!   └── success ──── [half-open trial]
//!        ▲                 │
//!        │             fail: backoff ×2, capped at 300 s
//!        └─────────────────┘
//! ```
//!
//! Recovery is lazy: `is_healthy` flips an expired unhealthy provider back to
//! healthy at read time, so no background timer is needed and the transition
//! stays local to the per-provider lock.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use crate::{
    classify::Scenario,
    config::{ModelPricing, ProviderConfig, Strategy, WireFormat},
    sink::UsageSink,
};

/// Backoff after the first failure.
pub const INITIAL_BACKOFF: Duration = Duration::from_secs(60);

/// Backoff ceiling.
pub const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// How long a fetched metrics snapshot is reused before asking the sink again.
const METRICS_CACHE_TTL: Duration = Duration::from_secs(30);

/// Window passed to the sink when ranking by latency.
const METRICS_WINDOW: Duration = Duration::from_secs(300);

#[derive(Debug)]
struct HealthState {
    consecutive_failures: u32,
    backoff: Duration,
    failed_at: Option<Instant>,
}

impl HealthState {
    fn fresh() -> Self {
        Self {
            consecutive_failures: 0,
            backoff: Duration::ZERO,
            failed_at: None,
        }
    }
}

/// Runtime handle for one upstream account.
pub struct Provider {
    pub name: String,
    /// Base URL with any trailing slash trimmed.
    pub base_url: String,
    token: Option<String>,
    /// Default model override. `None` forwards the client's `model` untouched.
    pub model: Option<String>,
    /// Per-scenario model overrides, beating the default override.
    pub scenario_models: HashMap<Scenario, String>,
    pub format: WireFormat,
    health: Mutex<HealthState>,
}

impl Provider {
    pub fn from_config(name: &str, cfg: &ProviderConfig) -> Self {
        Self {
            name: name.to_string(),
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            token: cfg.token(),
            model: cfg.model.clone(),
            scenario_models: cfg.scenario_models.clone(),
            format: cfg.format,
            health: Mutex::new(HealthState::fresh()),
        }
    }

    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// The model to inject for a request in `scenario`, if any.
    pub fn effective_model(&self, scenario: Scenario) -> Option<&str> {
        self.scenario_models
            .get(&scenario)
            .map(String::as_str)
            .or(self.model.as_deref())
    }

    /// True when the provider may be attempted. An unhealthy provider whose
    /// backoff has elapsed flips to healthy here — the half-open trial.
    pub fn is_healthy(&self) -> bool {
        self.is_healthy_at(Instant::now())
    }

    pub(crate) fn is_healthy_at(&self, now: Instant) -> bool {
        let mut health = self.health.lock().expect("provider health lock poisoned");
        match health.failed_at {
            None => true,
            Some(failed_at) if now.duration_since(failed_at) >= health.backoff => {
                health.failed_at = None;
                true
            }
            Some(_) => false,
        }
    }

    /// Record a failover-eligible failure: first failure starts at 60 s,
    /// consecutive failures double the backoff up to 300 s.
    pub fn mark_failure(&self) {
        self.mark_failure_at(Instant::now());
    }

    pub(crate) fn mark_failure_at(&self, now: Instant) {
        let mut health = self.health.lock().expect("provider health lock poisoned");
        health.backoff = if health.consecutive_failures == 0 {
            INITIAL_BACKOFF
        } else {
            (health.backoff * 2).min(MAX_BACKOFF)
        };
        health.consecutive_failures += 1;
        health.failed_at = Some(now);
        tracing::warn!(
            provider = %self.name,
            failures = health.consecutive_failures,
            backoff_secs = health.backoff.as_secs(),
            "provider marked unhealthy"
        );
    }

    /// Record a terminal response: the provider is fully healthy again and
    /// its backoff resets to zero.
    pub fn mark_success(&self) {
        let mut health = self.health.lock().expect("provider health lock poisoned");
        if health.consecutive_failures > 0 {
            tracing::info!(provider = %self.name, "provider recovered");
        }
        *health = HealthState::fresh();
    }

    pub(crate) fn current_backoff(&self) -> Duration {
        self.health
            .lock()
            .expect("provider health lock poisoned")
            .backoff
    }

    pub(crate) fn consecutive_failures(&self) -> u32 {
        self.health
            .lock()
            .expect("provider health lock poisoned")
            .consecutive_failures
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("name", &self.name)
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("format", &self.format)
            .finish_non_exhaustive()
    }
}

struct MetricsSnapshot {
    fetched_at: Instant,
    latency_by_provider: HashMap<String, f64>,
}

/// The ordered provider set for one profile.
pub struct UpstreamPool {
    providers: Vec<Arc<Provider>>,
    rotation: AtomicUsize,
    metrics_cache: Mutex<Option<MetricsSnapshot>>,
    sink: Arc<dyn UsageSink>,
}

impl UpstreamPool {
    pub fn new(providers: Vec<Arc<Provider>>, sink: Arc<dyn UsageSink>) -> Self {
        Self {
            providers,
            rotation: AtomicUsize::new(0),
            metrics_cache: Mutex::new(None),
            sink,
        }
    }

    pub fn providers(&self) -> &[Arc<Provider>] {
        &self.providers
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Attempt order for one request. All orderings are stable with respect to
    /// the configured order, and all push currently-unhealthy providers to the
    /// tail — the forward loop still re-checks health per attempt, so a
    /// provider whose backoff expires mid-flight gets its half-open trial.
    pub fn ordered(
        &self,
        strategy: Strategy,
        scenario: Scenario,
        pricing: &HashMap<String, ModelPricing>,
    ) -> Vec<Arc<Provider>> {
        if self.providers.len() <= 1 {
            return self.providers.clone();
        }

        // Evaluate health once so sorting sees a consistent view.
        let mut ranked: Vec<(Arc<Provider>, bool)> = self
            .providers
            .iter()
            .map(|p| (Arc::clone(p), p.is_healthy()))
            .collect();

        match strategy {
            Strategy::Failover => {
                ranked.sort_by_key(|(_, healthy)| !*healthy);
            }
            Strategy::RoundRobin => {
                let n = ranked.len();
                let start = self.rotation.fetch_add(1, Ordering::Relaxed) % n;
                ranked.rotate_left(start);
                ranked.sort_by_key(|(_, healthy)| !*healthy);
            }
            Strategy::LeastLatency => {
                let latency = self.cached_latency();
                ranked.sort_by(|(a, a_ok), (b, b_ok)| {
                    let key_a = (!a_ok, latency.get(&a.name).copied().unwrap_or(f64::INFINITY));
                    let key_b = (!b_ok, latency.get(&b.name).copied().unwrap_or(f64::INFINITY));
                    key_a.partial_cmp(&key_b).unwrap_or(std::cmp::Ordering::Equal)
                });
            }
            Strategy::LeastCost => {
                ranked.sort_by(|(a, a_ok), (b, b_ok)| {
                    let key_a = (!a_ok, model_price(a, scenario, pricing));
                    let key_b = (!b_ok, model_price(b, scenario, pricing));
                    key_a.partial_cmp(&key_b).unwrap_or(std::cmp::Ordering::Equal)
                });
            }
        }

        ranked.into_iter().map(|(p, _)| p).collect()
    }

    /// Average upstream latency per provider, refreshed from the sink at most
    /// every 30 s.
    fn cached_latency(&self) -> HashMap<String, f64> {
        let mut cache = self.metrics_cache.lock().expect("metrics cache lock poisoned");
        let stale = cache
            .as_ref()
            .map(|snap| snap.fetched_at.elapsed() > METRICS_CACHE_TTL)
            .unwrap_or(true);
        if stale {
            let latency_by_provider = self
                .sink
                .recent_provider_metrics(METRICS_WINDOW)
                .into_iter()
                .filter(|(_, m)| m.total_requests > 0)
                .map(|(name, m)| (name, m.avg_latency_ms))
                .collect();
            *cache = Some(MetricsSnapshot {
                fetched_at: Instant::now(),
                latency_by_provider,
            });
        }
        cache
            .as_ref()
            .map(|snap| snap.latency_by_provider.clone())
            .unwrap_or_default()
    }
}

/// Least-cost ranking scalar: summed input+output $/M-tok for the model this
/// provider would use. Providers without a model or without pricing rank last.
fn model_price(
    provider: &Provider,
    scenario: Scenario,
    pricing: &HashMap<String, ModelPricing>,
) -> f64 {
    provider
        .effective_model(scenario)
        .and_then(|model| pricing.get(model))
        .map(|p| p.input + p.output)
        .unwrap_or(f64::INFINITY)
}
