//! Per-profile pipeline cache.
//!
//! Building an [`UpstreamPool`] from a config snapshot is cheap but not free,
//! and provider health state must persist across requests — so the first
//! request to touch a profile materializes its pool, and steady-state traffic
//! reuses it. The cache key includes the wire format so a temp profile that
//! reuses a static profile's name-with-different-dialect never aliases it.
//!
//! [`invalidate`][PipelineCache::invalidate] clears the whole map; it is
//! called after every config reload so pools (and their health state) are
//! rebuilt from the fresh snapshot on next touch.

use std::sync::Arc;

use dashmap::DashMap;

use crate::{
    config::{ProviderConfig, WireFormat},
    pool::{Provider, UpstreamPool},
    sink::UsageSink,
};

pub struct PipelineCache {
    pools: DashMap<String, Arc<UpstreamPool>>,
}

impl PipelineCache {
    pub fn new() -> Self {
        Self {
            pools: DashMap::new(),
        }
    }

    /// Fetch the pool for `(profile, format)`, constructing it from the given
    /// provider configs on first touch. Concurrent callers with the same key
    /// get the same instance — the dashmap entry lock makes the first writer
    /// win and construction is idempotent.
    pub fn get_or_create(
        &self,
        profile: &str,
        format: WireFormat,
        providers: &[(String, ProviderConfig)],
        sink: &Arc<dyn UsageSink>,
    ) -> Arc<UpstreamPool> {
        let key = cache_key(profile, format);
        self.pools
            .entry(key)
            .or_insert_with(|| {
                tracing::debug!(profile, %format, providers = providers.len(), "building pipeline");
                let providers = providers
                    .iter()
                    .map(|(name, cfg)| Arc::new(Provider::from_config(name, cfg)))
                    .collect();
                Arc::new(UpstreamPool::new(providers, Arc::clone(sink)))
            })
            .clone()
    }

    /// Drop every cached pool. Called after config reload.
    pub fn invalidate(&self) {
        let dropped = self.pools.len();
        self.pools.clear();
        if dropped > 0 {
            tracing::info!(dropped, "pipeline cache invalidated");
        }
    }

    pub fn len(&self) -> usize {
        self.pools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pools.is_empty()
    }
}

impl Default for PipelineCache {
    fn default() -> Self {
        Self::new()
    }
}

fn cache_key(profile: &str, format: WireFormat) -> String {
    format!("{profile}:{format}")
}
