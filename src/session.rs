//! Per-session rolling state: token counts, turn history, context warnings.
//!
//! [`SessionCache`] is the process-wide store keyed by `profile:session-id`.
//! The map itself is a concurrent [`DashMap`] so reads never block; a small
//! mutex guards the insertion-order queue used for eviction. Eviction is FIFO
//! over distinct keys — once the cache is at capacity, inserting a new session
//! drops the oldest one. A periodic [`sweep`][SessionCache::sweep] additionally
//! drops sessions idle past a TTL.
//!
//! Counter semantics: `input_tokens` holds the *most recent* request's total
//! input as sent upstream (the live context size), while `output_tokens`,
//! `total_cost_usd`, and `turn_count` accumulate. Concurrent turns of one
//! session are last-writer-wins; the occasional undercount is tolerated.

use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;

/// Default maximum number of tracked sessions.
pub const DEFAULT_SESSION_CAPACITY: usize = 1_000;

/// Turns retained per session.
const TURN_HISTORY_LIMIT: usize = 20;

/// Default context-size limit used by [`SessionCache::context_warning`].
const DEFAULT_CONTEXT_LIMIT: u64 = 100_000;

/// One completed request/response exchange.
#[derive(Debug, Clone, Serialize)]
pub struct TurnRecord {
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost_usd: f64,
    pub timestamp: DateTime<Utc>,
}

/// Rolling state for one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionState {
    pub profile: String,
    pub client_type: Option<String>,
    pub project_path: Option<String>,
    /// Total input of the most recent turn — the live context size, not a sum.
    pub input_tokens: u64,
    /// Cumulative output tokens across all turns.
    pub output_tokens: u64,
    pub total_cost_usd: f64,
    pub turn_count: u64,
    /// Bounded history, oldest first.
    pub turns: VecDeque<TurnRecord>,
    pub started_at: DateTime<Utc>,
    #[serde(skip)]
    first_seen: Instant,
    #[serde(skip)]
    last_activity: Instant,
}

impl SessionState {
    fn new(profile: &str, client_type: Option<String>, project_path: Option<String>) -> Self {
        let now = Instant::now();
        Self {
            profile: profile.to_string(),
            client_type,
            project_path,
            input_tokens: 0,
            output_tokens: 0,
            total_cost_usd: 0.0,
            turn_count: 0,
            turns: VecDeque::with_capacity(TURN_HISTORY_LIMIT),
            started_at: Utc::now(),
            first_seen: now,
            last_activity: now,
        }
    }
}

/// Derived per-session summary for the daemon API.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInsight {
    pub profile: String,
    pub client_type: Option<String>,
    pub project_path: Option<String>,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost_usd: f64,
    pub turn_count: u64,
    pub avg_output_tokens_per_turn: f64,
    pub avg_cost_per_turn_usd: f64,
    pub elapsed_secs: u64,
}

/// Process-wide session store with FIFO eviction.
pub struct SessionCache {
    capacity: usize,
    map: DashMap<String, SessionState>,
    /// Insertion order of distinct keys; guards all map insertions so the
    /// capacity invariant holds under concurrent writers.
    order: Mutex<VecDeque<String>>,
}

impl SessionCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            map: DashMap::new(),
            order: Mutex::new(VecDeque::new()),
        }
    }

    /// Snapshot of one session's state.
    pub fn get(&self, key: &str) -> Option<SessionState> {
        self.map.get(key).map(|entry| entry.clone())
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// Create the session on first sight and refresh its activity timestamp
    /// and identity fields. Called by the router on every inbound request.
    pub fn register(
        &self,
        key: &str,
        profile: &str,
        client_type: Option<String>,
        project_path: Option<String>,
    ) {
        if let Some(mut entry) = self.map.get_mut(key) {
            entry.last_activity = Instant::now();
            if client_type.is_some() {
                entry.client_type = client_type;
            }
            if project_path.is_some() {
                entry.project_path = project_path;
            }
            return;
        }
        self.insert(
            key.to_string(),
            SessionState::new(profile, client_type, project_path),
        );
    }

    /// Atomically replace a session's state, evicting the oldest session first
    /// when the key is new and the cache is full.
    pub fn update(&self, key: &str, state: SessionState) {
        if let Some(mut entry) = self.map.get_mut(key) {
            *entry = state;
            return;
        }
        self.insert(key.to_string(), state);
    }

    /// Record a completed turn: refresh the context size, accumulate output
    /// and cost, and append to the bounded turn history.
    pub fn add_turn(&self, key: &str, input_tokens: u64, output_tokens: u64, cost_usd: f64) {
        let turn = TurnRecord {
            input_tokens,
            output_tokens,
            cost_usd,
            timestamp: Utc::now(),
        };

        if let Some(mut entry) = self.map.get_mut(key) {
            entry.input_tokens = input_tokens;
            entry.output_tokens += output_tokens;
            entry.total_cost_usd += cost_usd;
            entry.turn_count += 1;
            entry.last_activity = Instant::now();
            entry.turns.push_back(turn);
            while entry.turns.len() > TURN_HISTORY_LIMIT {
                entry.turns.pop_front();
            }
            return;
        }

        // Turn for a session the router never registered (e.g. evicted
        // mid-flight) — recreate it rather than lose the accounting.
        let mut state = SessionState::new("", None, None);
        state.input_tokens = input_tokens;
        state.output_tokens = output_tokens;
        state.total_cost_usd = cost_usd;
        state.turn_count = 1;
        state.turns.push_back(turn);
        self.insert(key.to_string(), state);
    }

    /// Drop one session explicitly (context-reset path).
    pub fn clear(&self, key: &str) {
        self.map.remove(key);
        let mut order = self.order.lock().expect("session order lock poisoned");
        order.retain(|k| k != key);
    }

    /// Derive a summary for one session.
    pub fn insight(&self, key: &str) -> Option<SessionInsight> {
        self.map.get(key).map(|entry| insight_of(&entry))
    }

    /// Summaries for every tracked session, keyed for the daemon API.
    pub fn insights(&self) -> Vec<(String, SessionInsight)> {
        self.map
            .iter()
            .map(|entry| (entry.key().clone(), insight_of(&entry)))
            .collect()
    }

    /// Context-fullness warning for a session, if any.
    ///
    /// At ≥95 % of `limit` the context is nearly exhausted; at ≥80 % it is
    /// approaching the limit. `limit` defaults to 100 000 tokens.
    pub fn context_warning(&self, key: &str, limit: Option<u64>) -> Option<&'static str> {
        let limit = limit.unwrap_or(DEFAULT_CONTEXT_LIMIT).max(1);
        let used = self.map.get(key)?.input_tokens;
        let percent = used * 100 / limit;
        if percent >= 95 {
            Some("Context is nearly full")
        } else if percent >= 80 {
            Some("Approaching context limit")
        } else {
            None
        }
    }

    /// Drop sessions idle for longer than `max_age`; returns how many.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let expired: Vec<String> = self
            .map
            .iter()
            .filter(|entry| entry.last_activity.elapsed() > max_age)
            .map(|entry| entry.key().clone())
            .collect();

        if expired.is_empty() {
            return 0;
        }

        let mut order = self.order.lock().expect("session order lock poisoned");
        for key in &expired {
            self.map.remove(key);
        }
        order.retain(|k| !expired.contains(k));
        expired.len()
    }

    /// Sole insertion path: serialized by the order mutex so the map can never
    /// exceed capacity.
    fn insert(&self, key: String, state: SessionState) {
        let mut order = self.order.lock().expect("session order lock poisoned");
        if self.map.contains_key(&key) {
            self.map.insert(key, state);
            return;
        }
        while order.len() >= self.capacity {
            match order.pop_front() {
                Some(oldest) => {
                    tracing::debug!(session = %oldest, "evicting oldest session");
                    self.map.remove(&oldest);
                }
                None => break,
            }
        }
        order.push_back(key.clone());
        self.map.insert(key, state);
    }
}

impl Default for SessionCache {
    fn default() -> Self {
        Self::new(DEFAULT_SESSION_CAPACITY)
    }
}

fn insight_of(state: &SessionState) -> SessionInsight {
    let turns = state.turn_count.max(1) as f64;
    SessionInsight {
        profile: state.profile.clone(),
        client_type: state.client_type.clone(),
        project_path: state.project_path.clone(),
        input_tokens: state.input_tokens,
        output_tokens: state.output_tokens,
        total_cost_usd: state.total_cost_usd,
        turn_count: state.turn_count,
        avg_output_tokens_per_turn: state.output_tokens as f64 / turns,
        avg_cost_per_turn_usd: state.total_cost_usd / turns,
        elapsed_secs: state.first_seen.elapsed().as_secs(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // -----------------------------------------------------------------------
    // Registration and turns
    // -----------------------------------------------------------------------

    #[test]
    fn register_creates_once_and_refreshes_identity() {
        let cache = SessionCache::new(10);
        cache.register("default:a", "default", None, None);
        assert_eq!(cache.len(), 1);

        cache.register(
            "default:a",
            "default",
            Some("claude-cli".into()),
            Some("/src/app".into()),
        );
        assert_eq!(cache.len(), 1);
        let state = cache.get("default:a").unwrap();
        assert_eq!(state.client_type.as_deref(), Some("claude-cli"));
        assert_eq!(state.project_path.as_deref(), Some("/src/app"));
    }

    #[test]
    fn add_turn_accumulates_output_but_replaces_input() {
        let cache = SessionCache::new(10);
        cache.register("p:s", "p", None, None);
        cache.add_turn("p:s", 1_000, 50, 0.01);
        cache.add_turn("p:s", 1_500, 70, 0.02);

        let state = cache.get("p:s").unwrap();
        assert_eq!(state.input_tokens, 1_500, "input tracks the latest turn");
        assert_eq!(state.output_tokens, 120, "output accumulates");
        assert!((state.total_cost_usd - 0.03).abs() < 1e-9);
        assert_eq!(state.turn_count, 2);
        assert_eq!(state.turns.len(), 2);
    }

    #[test]
    fn turn_history_is_bounded_to_twenty() {
        let cache = SessionCache::new(10);
        cache.register("p:s", "p", None, None);
        for i in 0..30 {
            cache.add_turn("p:s", i, 1, 0.0);
        }
        let state = cache.get("p:s").unwrap();
        assert_eq!(state.turns.len(), 20);
        // Oldest turns dropped — the first retained turn is number 10.
        assert_eq!(state.turns.front().unwrap().input_tokens, 10);
        assert_eq!(state.turn_count, 30, "turn counter keeps the true total");
    }

    #[test]
    fn update_replaces_state_atomically() {
        let cache = SessionCache::new(10);
        cache.register("p:s", "p", None, None);
        cache.add_turn("p:s", 100, 10, 0.0);

        let mut replacement = cache.get("p:s").unwrap();
        replacement.input_tokens = 9_999;
        replacement.profile = "other".into();
        cache.update("p:s", replacement);

        let state = cache.get("p:s").unwrap();
        assert_eq!(state.input_tokens, 9_999);
        assert_eq!(state.profile, "other");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn update_with_new_key_respects_capacity() {
        let cache = SessionCache::new(2);
        cache.register("p:1", "p", None, None);
        cache.register("p:2", "p", None, None);

        let state = SessionState::new("p", None, None);
        cache.update("p:3", state);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("p:1").is_none(), "oldest key must be evicted");
    }

    #[test]
    fn add_turn_for_unknown_key_recreates_the_session() {
        let cache = SessionCache::new(10);
        cache.add_turn("p:ghost", 500, 20, 0.001);
        let state = cache.get("p:ghost").unwrap();
        assert_eq!(state.input_tokens, 500);
        assert_eq!(state.turn_count, 1);
    }

    // -----------------------------------------------------------------------
    // Eviction
    // -----------------------------------------------------------------------

    #[test]
    fn capacity_is_never_exceeded_and_eviction_is_fifo() {
        let cache = SessionCache::new(3);
        for key in ["p:1", "p:2", "p:3", "p:4", "p:5"] {
            cache.register(key, "p", None, None);
        }
        assert_eq!(cache.len(), 3);
        assert!(cache.get("p:1").is_none(), "oldest must be evicted first");
        assert!(cache.get("p:2").is_none());
        assert!(cache.get("p:3").is_some());
        assert!(cache.get("p:5").is_some());
    }

    #[test]
    fn re_registering_existing_key_does_not_evict() {
        let cache = SessionCache::new(2);
        cache.register("p:1", "p", None, None);
        cache.register("p:2", "p", None, None);
        cache.register("p:1", "p", None, None);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("p:2").is_some());
    }

    #[test]
    fn clear_removes_session_and_frees_a_slot() {
        let cache = SessionCache::new(2);
        cache.register("p:1", "p", None, None);
        cache.register("p:2", "p", None, None);
        cache.clear("p:1");
        assert!(cache.get("p:1").is_none());

        cache.register("p:3", "p", None, None);
        assert!(cache.get("p:2").is_some(), "p:2 must survive — slot was free");
    }

    // -----------------------------------------------------------------------
    // Insights and warnings
    // -----------------------------------------------------------------------

    #[test]
    fn insight_derives_averages() {
        let cache = SessionCache::new(10);
        cache.register("p:s", "p", Some("claude-cli".into()), None);
        cache.add_turn("p:s", 1_000, 100, 0.02);
        cache.add_turn("p:s", 2_000, 300, 0.04);

        let insight = cache.insight("p:s").unwrap();
        assert_eq!(insight.turn_count, 2);
        assert_eq!(insight.output_tokens, 400);
        assert!((insight.avg_output_tokens_per_turn - 200.0).abs() < f64::EPSILON);
        assert!((insight.avg_cost_per_turn_usd - 0.03).abs() < 1e-9);
        assert_eq!(insight.client_type.as_deref(), Some("claude-cli"));
    }

    #[test]
    fn context_warning_thresholds() {
        let cache = SessionCache::new(10);
        cache.register("p:s", "p", None, None);

        cache.add_turn("p:s", 50_000, 0, 0.0);
        assert_eq!(cache.context_warning("p:s", None), None);

        cache.add_turn("p:s", 81_000, 0, 0.0);
        assert_eq!(
            cache.context_warning("p:s", None),
            Some("Approaching context limit")
        );

        cache.add_turn("p:s", 96_000, 0, 0.0);
        assert_eq!(
            cache.context_warning("p:s", None),
            Some("Context is nearly full")
        );
    }

    #[test]
    fn context_warning_respects_custom_limit() {
        let cache = SessionCache::new(10);
        cache.register("p:s", "p", None, None);
        cache.add_turn("p:s", 190, 0, 0.0);
        assert_eq!(
            cache.context_warning("p:s", Some(200)),
            Some("Context is nearly full")
        );
        assert_eq!(cache.context_warning("p:s", Some(1_000)), None);
    }

    #[test]
    fn context_warning_for_unknown_session_is_none() {
        let cache = SessionCache::new(10);
        assert_eq!(cache.context_warning("p:none", None), None);
    }

    // -----------------------------------------------------------------------
    // Sweep
    // -----------------------------------------------------------------------

    #[test]
    fn sweep_drops_only_idle_sessions() {
        let cache = SessionCache::new(10);
        cache.register("p:old", "p", None, None);
        cache.register("p:new", "p", None, None);

        // Nothing is older than an hour yet.
        assert_eq!(cache.sweep(Duration::from_secs(3_600)), 0);
        assert_eq!(cache.len(), 2);

        // Everything is older than zero.
        assert_eq!(cache.sweep(Duration::ZERO), 2);
        assert!(cache.is_empty());
    }
}
