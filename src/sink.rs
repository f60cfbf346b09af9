//! Usage and metrics sink — the boundary to the persistence layer.
//!
//! The forward engine emits one [`UsageRecord`] per accounted turn and one
//! metric sample per upstream attempt through the [`UsageSink`] trait. The
//! durable store (SQLite, remote collector, …) lives outside this crate;
//! [`MemorySink`] is the in-process implementation wired by default — a pair
//! of fixed-capacity ring buffers, so memory stays bounded regardless of
//! request volume.
//!
//! Sink calls sit on the request path and must never slow it down: writes are
//! best-effort `try_lock` pushes, and a contended push drops the sample.

use std::{
    collections::{HashMap, VecDeque},
    sync::Mutex,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// One accounted request/response exchange.
#[derive(Debug, Clone, Serialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    /// Cache key of the session this turn belongs to (`profile:session-id`).
    pub session: String,
    pub provider: String,
    pub model: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub latency_ms: u64,
    pub project_path: Option<String>,
    pub client_type: Option<String>,
}

/// Aggregated per-provider view over a recent window.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ProviderMetrics {
    pub avg_latency_ms: f64,
    pub total_requests: u64,
    pub error_count: u64,
    pub rate_limited_count: u64,
}

/// Append-mostly sink consumed by the forward engine and the pool's
/// least-latency strategy. Implementations must be cheap: callers cache the
/// aggregate view for 30 s, but `record_*` runs once per upstream attempt.
pub trait UsageSink: Send + Sync {
    fn record_usage(&self, record: UsageRecord);

    fn record_metric(
        &self,
        provider: &str,
        latency_ms: u64,
        status_code: u16,
        is_error: bool,
        is_rate_limit: bool,
    );

    /// Per-provider aggregates over the trailing `window`.
    fn recent_provider_metrics(&self, window: Duration) -> HashMap<String, ProviderMetrics>;
}

#[derive(Debug, Clone)]
struct MetricSample {
    provider: String,
    at: Instant,
    latency_ms: u64,
    is_error: bool,
    is_rate_limit: bool,
}

/// Aggregate totals across every buffered usage record.
#[derive(Debug, Default, Serialize)]
pub struct SinkTotals {
    pub total_requests: usize,
    pub total_input_tokens: u64,
    pub total_output_tokens: u64,
    pub total_cost_usd: f64,
    pub avg_latency_ms: f64,
}

/// Bounded in-memory sink: newest-wins ring buffers for usage and metrics.
pub struct MemorySink {
    capacity: usize,
    usage: Mutex<VecDeque<UsageRecord>>,
    metrics: Mutex<VecDeque<MetricSample>>,
}

impl MemorySink {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            usage: Mutex::new(VecDeque::with_capacity(capacity.min(1_024))),
            metrics: Mutex::new(VecDeque::with_capacity(capacity.min(1_024))),
        }
    }

    /// Up to `limit` recent usage records, newest first.
    pub fn recent_usage(&self, limit: usize) -> Vec<UsageRecord> {
        match self.usage.lock() {
            Ok(records) => records.iter().rev().take(limit).cloned().collect(),
            Err(_) => Vec::new(),
        }
    }

    /// Aggregate totals over every buffered usage record.
    pub fn totals(&self) -> SinkTotals {
        let Ok(records) = self.usage.lock() else {
            return SinkTotals::default();
        };
        let total = records.len();
        let avg_latency_ms = if total == 0 {
            0.0
        } else {
            records.iter().map(|r| r.latency_ms as f64).sum::<f64>() / total as f64
        };
        SinkTotals {
            total_requests: total,
            total_input_tokens: records.iter().map(|r| r.input_tokens).sum(),
            total_output_tokens: records.iter().map(|r| r.output_tokens).sum(),
            total_cost_usd: records.iter().map(|r| r.cost_usd).sum(),
            avg_latency_ms,
        }
    }

    /// Total spend over the trailing `window`, for budget reporting.
    pub fn cost_since(&self, window: chrono::Duration) -> f64 {
        let cutoff = Utc::now() - window;
        match self.usage.lock() {
            Ok(records) => records
                .iter()
                .filter(|r| r.timestamp >= cutoff)
                .map(|r| r.cost_usd)
                .sum(),
            Err(_) => 0.0,
        }
    }
}

impl UsageSink for MemorySink {
    fn record_usage(&self, record: UsageRecord) {
        // Best-effort non-blocking push — drop the record on lock contention.
        if let Ok(mut records) = self.usage.try_lock() {
            if records.len() == self.capacity {
                records.pop_front();
            }
            records.push_back(record);
        }
    }

    fn record_metric(
        &self,
        provider: &str,
        latency_ms: u64,
        _status_code: u16,
        is_error: bool,
        is_rate_limit: bool,
    ) {
        if let Ok(mut samples) = self.metrics.try_lock() {
            if samples.len() == self.capacity {
                samples.pop_front();
            }
            samples.push_back(MetricSample {
                provider: provider.to_string(),
                at: Instant::now(),
                latency_ms,
                is_error,
                is_rate_limit,
            });
        }
    }

    fn recent_provider_metrics(&self, window: Duration) -> HashMap<String, ProviderMetrics> {
        let Ok(samples) = self.metrics.lock() else {
            return HashMap::new();
        };

        let mut sums: HashMap<String, (u64, u64)> = HashMap::new();
        let mut out: HashMap<String, ProviderMetrics> = HashMap::new();

        for sample in samples.iter().filter(|s| s.at.elapsed() <= window) {
            let metrics = out.entry(sample.provider.clone()).or_default();
            metrics.total_requests += 1;
            if sample.is_error {
                metrics.error_count += 1;
            }
            if sample.is_rate_limit {
                metrics.rate_limited_count += 1;
            }
            let (latency_sum, count) = sums.entry(sample.provider.clone()).or_default();
            *latency_sum += sample.latency_ms;
            *count += 1;
        }

        for (provider, metrics) in out.iter_mut() {
            if let Some((latency_sum, count)) = sums.get(provider) {
                if *count > 0 {
                    metrics.avg_latency_ms = *latency_sum as f64 / *count as f64;
                }
            }
        }

        out
    }
}
