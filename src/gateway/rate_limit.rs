use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use tokio::sync::Mutex;
use tracing::warn;

use crate::core::storage::{KvStore, get_json, put_json};
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitStrategy {
    FixedWindow,
    SlidingWindow,
    TokenBucket,
}

fn default_strategy() -> RateLimitStrategy {
    RateLimitStrategy::FixedWindow
}

/// One resolved limit. A `limit` or `window_ms` of zero rejects every
/// request; there is no "unlimited" spelling.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RateLimitRule {
    #[serde(default = "default_strategy")]
    pub strategy: RateLimitStrategy,
    pub limit: u32,
    pub window_ms: u64,
    /// Token bucket capacity; defaults to `limit`.
    #[serde(default)]
    pub burst: Option<u32>,
    /// Token bucket refill in tokens/second; defaults to spreading `limit`
    /// evenly across the window.
    #[serde(default)]
    pub refill_rate: Option<f64>,
}

impl RateLimitRule {
    pub fn new(strategy: RateLimitStrategy, limit: u32, window_ms: u64) -> Self {
        Self {
            strategy,
            limit,
            window_ms,
            burst: None,
            refill_rate: None,
        }
    }

    fn bucket_size(&self) -> u32 {
        self.burst.unwrap_or(self.limit)
    }

    fn tokens_per_sec(&self) -> f64 {
        match self.refill_rate {
            Some(rate) if rate > 0.0 => rate,
            _ if self.window_ms > 0 => self.limit as f64 * 1000.0 / self.window_ms as f64,
            _ => 0.0,
        }
    }

    fn denies_everything(&self) -> bool {
        self.limit == 0 || self.window_ms == 0
    }
}

/// Resolution order: identifier-specific, then source-level, then the
/// system default. Resolvers are consulted fresh on every call so operators
/// can change limits without a restart.
pub trait RuleResolver: Send + Sync {
    fn resolve(&self, source: &str, identifier: &str) -> RateLimitRule;
}

#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct RateLimitSettings {
    #[serde(default = "RateLimitSettings::default_rule")]
    pub default: RateLimitRule,
    /// Per-source overrides, keyed by source name.
    #[serde(default)]
    pub sources: HashMap<String, RateLimitRule>,
    /// Per-identifier overrides, keyed `"{source}:{identifier}"`.
    #[serde(default)]
    pub identifiers: HashMap<String, RateLimitRule>,
}

impl RateLimitSettings {
    fn default_rule() -> RateLimitRule {
        // 60 requests per minute, a reasonable webhook default.
        RateLimitRule::new(RateLimitStrategy::FixedWindow, 60, 60_000)
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self {
            default: Self::default_rule(),
            sources: HashMap::new(),
            identifiers: HashMap::new(),
        }
    }
}

impl RuleResolver for RateLimitSettings {
    fn resolve(&self, source: &str, identifier: &str) -> RateLimitRule {
        if let Some(rule) = self.identifiers.get(&format!("{source}:{identifier}")) {
            return rule.clone();
        }
        if let Some(rule) = self.sources.get(source) {
            return rule.clone();
        }
        self.default.clone()
    }
}

/// Settings behind a lock so they can be swapped at runtime.
#[derive(Clone)]
pub struct SharedRules(pub Arc<RwLock<RateLimitSettings>>);

impl SharedRules {
    pub fn new(settings: RateLimitSettings) -> Self {
        Self(Arc::new(RwLock::new(settings)))
    }
}

impl RuleResolver for SharedRules {
    fn resolve(&self, source: &str, identifier: &str) -> RateLimitRule {
        self.0
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .resolve(source, identifier)
    }
}

/// Counter state for one `(source, identifier)` key, tagged by strategy so a
/// config change from one strategy to another discards stale state instead
/// of misreading it.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
enum CounterState {
    FixedWindow {
        count: u32,
        reset_at_ms: i64,
    },
    SlidingWindow {
        timestamps: Vec<i64>,
    },
    TokenBucket {
        tokens: u32,
        last_refill_ms: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Decision {
    allowed: bool,
    retry_after_secs: u64,
}

fn secs_ceil(ms: i64) -> u64 {
    (ms.max(0) as u64).div_ceil(1000).max(1)
}

/// Pure read: what would happen to a request arriving at `now_ms`, given the
/// stored state. Transient resets (elapsed windows, pending refills) are
/// recomputed, not written back.
fn evaluate(rule: &RateLimitRule, state: Option<&CounterState>, now_ms: i64) -> Decision {
    if rule.denies_everything() {
        return Decision {
            allowed: false,
            retry_after_secs: secs_ceil(rule.window_ms.max(1000) as i64),
        };
    }

    match (rule.strategy, state) {
        // A fresh key starts with a full quota.
        (_, None) => Decision {
            allowed: true,
            retry_after_secs: 0,
        },

        (RateLimitStrategy::FixedWindow, Some(CounterState::FixedWindow { count, reset_at_ms })) => {
            if now_ms >= *reset_at_ms {
                return Decision {
                    allowed: true,
                    retry_after_secs: 0,
                };
            }
            if *count < rule.limit {
                Decision {
                    allowed: true,
                    retry_after_secs: 0,
                }
            } else {
                Decision {
                    allowed: false,
                    retry_after_secs: secs_ceil(reset_at_ms - now_ms),
                }
            }
        }

        (RateLimitStrategy::SlidingWindow, Some(CounterState::SlidingWindow { timestamps })) => {
            let cutoff = now_ms - rule.window_ms as i64;
            let recent: Vec<i64> = timestamps.iter().copied().filter(|t| *t > cutoff).collect();
            if (recent.len() as u32) < rule.limit {
                Decision {
                    allowed: true,
                    retry_after_secs: 0,
                }
            } else {
                // Admitted again once the oldest in-window entry ages out.
                let oldest = recent.iter().min().copied().unwrap_or(now_ms);
                Decision {
                    allowed: false,
                    retry_after_secs: secs_ceil(oldest + rule.window_ms as i64 - now_ms),
                }
            }
        }

        (RateLimitStrategy::TokenBucket, Some(CounterState::TokenBucket { tokens, last_refill_ms })) => {
            let (tokens, _) = refill(rule, *tokens, *last_refill_ms, now_ms);
            if tokens >= 1 {
                Decision {
                    allowed: true,
                    retry_after_secs: 0,
                }
            } else {
                let rate = rule.tokens_per_sec();
                let wait_secs = if rate > 0.0 { (1.0 / rate).ceil() as u64 } else { 1 };
                Decision {
                    allowed: false,
                    retry_after_secs: wait_secs.max(1),
                }
            }
        }

        // Strategy changed under the key: treat the stale state as absent.
        (_, Some(_)) => Decision {
            allowed: true,
            retry_after_secs: 0,
        },
    }
}

/// Refill per the bucket formula: `floor(elapsed_secs * rate)` tokens,
/// capped at the bucket size. `last_refill` only advances when whole tokens
/// were added, so slow rates still accumulate.
fn refill(rule: &RateLimitRule, tokens: u32, last_refill_ms: i64, now_ms: i64) -> (u32, i64) {
    let elapsed_ms = (now_ms - last_refill_ms).max(0);
    let added = (elapsed_ms as f64 / 1000.0 * rule.tokens_per_sec()).floor() as u32;
    if added == 0 {
        return (tokens, last_refill_ms);
    }
    (tokens.saturating_add(added).min(rule.bucket_size()), now_ms)
}

/// Consume one admission at `now_ms`, returning the new state and the TTL
/// (seconds) after which the state is dead weight and may expire.
fn advance(rule: &RateLimitRule, state: Option<CounterState>, now_ms: i64) -> (CounterState, u64) {
    match rule.strategy {
        RateLimitStrategy::FixedWindow => {
            let (count, reset_at_ms) = match state {
                Some(CounterState::FixedWindow { count, reset_at_ms })
                    if now_ms < reset_at_ms =>
                {
                    (count + 1, reset_at_ms)
                }
                _ => (1, now_ms + rule.window_ms as i64),
            };
            let ttl = secs_ceil(reset_at_ms - now_ms);
            (CounterState::FixedWindow { count, reset_at_ms }, ttl)
        }
        RateLimitStrategy::SlidingWindow => {
            let cutoff = now_ms - rule.window_ms as i64;
            let mut timestamps = match state {
                Some(CounterState::SlidingWindow { timestamps }) => timestamps,
                _ => Vec::new(),
            };
            timestamps.retain(|t| *t > cutoff);
            timestamps.push(now_ms);
            (
                CounterState::SlidingWindow { timestamps },
                secs_ceil(rule.window_ms as i64),
            )
        }
        RateLimitStrategy::TokenBucket => {
            let (tokens, last_refill_ms) = match state {
                Some(CounterState::TokenBucket { tokens, last_refill_ms }) => {
                    refill(rule, tokens, last_refill_ms, now_ms)
                }
                // Fresh bucket starts full; spend from there.
                _ => (rule.bucket_size(), now_ms),
            };
            let tokens = tokens.saturating_sub(1);
            let rate = rule.tokens_per_sec();
            let refill_all_secs = if rate > 0.0 {
                ((rule.bucket_size().saturating_sub(tokens)) as f64 / rate).ceil() as u64
            } else {
                1
            };
            (
                CounterState::TokenBucket { tokens, last_refill_ms },
                refill_all_secs.max(1),
            )
        }
    }
}

fn counter_key(source: &str, identifier: &str) -> String {
    format!("ratelimit:{source}:{identifier}")
}

fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Rate limiter over `(source, identifier)` keys. Counter state lives in the
/// KV store with a TTL tied to its reset time, so abandoned keys expire on
/// their own.
///
/// Mutations against one key are serialized through a per-key mutex so the
/// read-modify-write of the counter is atomic. Distinct keys never contend.
pub struct RateLimiter {
    store: Arc<dyn KvStore>,
    rules: Arc<dyn RuleResolver>,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn KvStore>, rules: Arc<dyn RuleResolver>) -> Self {
        Self {
            store,
            rules,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn key_lock(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Pure probe: would a request be admitted right now? Never advances a
    /// counter, so callers can check without committing.
    pub async fn check(&self, source: &str, identifier: &str) -> Result<bool> {
        let rule = self.rules.resolve(source, identifier);
        let state: Option<CounterState> =
            get_json(self.store.as_ref(), &counter_key(source, identifier)).await?;
        Ok(evaluate(&rule, state.as_ref(), now_ms()).allowed)
    }

    /// Record one admission against the key.
    pub async fn increment(&self, source: &str, identifier: &str) -> Result<()> {
        let rule = self.rules.resolve(source, identifier);
        let key = counter_key(source, identifier);
        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;

        let state: Option<CounterState> = get_json(self.store.as_ref(), &key).await?;
        let (next, ttl_secs) = advance(&rule, state, now_ms());
        put_json(self.store.as_ref(), &key, &next, Some(ttl_secs)).await
    }

    /// Check-and-commit. Raises `RateLimitExceeded` with a retry hint when
    /// the key is over its limit. The key's mutex is held across the read
    /// and the write-back, so two concurrent calls can never both spend the
    /// last admission.
    pub async fn enforce(&self, source: &str, identifier: &str) -> Result<()> {
        let rule = self.rules.resolve(source, identifier);
        let key = counter_key(source, identifier);
        let lock = self.key_lock(&key).await;
        let _guard = lock.lock().await;

        let now = now_ms();
        let state: Option<CounterState> = get_json(self.store.as_ref(), &key).await?;

        let decision = evaluate(&rule, state.as_ref(), now);
        if !decision.allowed {
            warn!(
                "Rate limit exceeded for {}:{} (limit {} per {}ms)",
                source, identifier, rule.limit, rule.window_ms
            );
            return Err(Error::RateLimitExceeded {
                retry_after_secs: decision.retry_after_secs,
            });
        }

        let (next, ttl_secs) = advance(&rule, state, now);
        put_json(self.store.as_ref(), &key, &next, Some(ttl_secs)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::storage::MemoryStore;

    fn limiter(settings: RateLimitSettings) -> RateLimiter {
        RateLimiter::new(Arc::new(MemoryStore::new()), Arc::new(settings))
    }

    fn settings_with_default(rule: RateLimitRule) -> RateLimitSettings {
        RateLimitSettings {
            default: rule,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn fixed_window_boundary_three_then_reject() {
        let limiter = limiter(settings_with_default(RateLimitRule::new(
            RateLimitStrategy::FixedWindow,
            3,
            60_000,
        )));

        for _ in 0..3 {
            limiter.enforce("github", "install-1").await.unwrap();
        }
        let err = limiter.enforce("github", "install-1").await.unwrap_err();
        match err {
            Error::RateLimitExceeded { retry_after_secs } => {
                assert!(retry_after_secs >= 1 && retry_after_secs <= 60);
            }
            other => panic!("expected RateLimitExceeded, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn keys_are_tracked_separately() {
        let limiter = limiter(settings_with_default(RateLimitRule::new(
            RateLimitStrategy::FixedWindow,
            1,
            60_000,
        )));

        limiter.enforce("github", "a").await.unwrap();
        assert!(limiter.enforce("github", "a").await.is_err());
        // Different identifier and different source both have full quotas.
        limiter.enforce("github", "b").await.unwrap();
        limiter.enforce("linear", "a").await.unwrap();
    }

    #[tokio::test]
    async fn check_is_side_effect_free() {
        let limiter = limiter(settings_with_default(RateLimitRule::new(
            RateLimitStrategy::FixedWindow,
            2,
            60_000,
        )));

        for _ in 0..10 {
            assert!(limiter.check("github", "a").await.unwrap());
        }
        // Probing burned nothing: both admissions still available.
        limiter.enforce("github", "a").await.unwrap();
        limiter.enforce("github", "a").await.unwrap();
        assert!(!limiter.check("github", "a").await.unwrap());
    }

    #[tokio::test]
    async fn zero_limit_or_window_rejects_everything() {
        let zero_limit = limiter(settings_with_default(RateLimitRule::new(
            RateLimitStrategy::FixedWindow,
            0,
            60_000,
        )));
        assert!(!zero_limit.check("github", "a").await.unwrap());
        assert!(zero_limit.enforce("github", "a").await.is_err());

        let zero_window = limiter(settings_with_default(RateLimitRule::new(
            RateLimitStrategy::SlidingWindow,
            5,
            0,
        )));
        assert!(zero_window.enforce("github", "a").await.is_err());
    }

    #[tokio::test]
    async fn sliding_window_admits_at_most_limit_per_window() {
        let limiter = limiter(settings_with_default(RateLimitRule::new(
            RateLimitStrategy::SlidingWindow,
            4,
            60_000,
        )));

        for _ in 0..4 {
            limiter.enforce("slack", "team-1").await.unwrap();
        }
        assert!(limiter.enforce("slack", "team-1").await.is_err());
    }

    #[tokio::test]
    async fn token_bucket_conserves_tokens() {
        let rule = RateLimitRule {
            strategy: RateLimitStrategy::TokenBucket,
            limit: 5,
            window_ms: 60_000,
            burst: Some(5),
            // Slow refill so the test can't be rescued by elapsed time.
            refill_rate: Some(0.001),
        };
        let limiter = limiter(settings_with_default(rule));

        for _ in 0..5 {
            limiter.enforce("github", "a").await.unwrap();
        }
        // Empty bucket: rejected, and rejection consumes nothing.
        for _ in 0..3 {
            assert!(limiter.enforce("github", "a").await.is_err());
        }
        assert!(!limiter.check("github", "a").await.unwrap());
    }

    #[test]
    fn token_bucket_refill_caps_at_bucket_size() {
        let rule = RateLimitRule {
            strategy: RateLimitStrategy::TokenBucket,
            limit: 5,
            window_ms: 1_000,
            burst: Some(5),
            refill_rate: Some(100.0),
        };
        // A long idle period refills far more than the cap.
        let (tokens, last) = refill(&rule, 0, 0, 3_600_000);
        assert_eq!(tokens, 5);
        assert_eq!(last, 3_600_000);
    }

    #[test]
    fn token_bucket_slow_refill_accumulates() {
        let rule = RateLimitRule {
            strategy: RateLimitStrategy::TokenBucket,
            limit: 10,
            window_ms: 10_000,
            burst: None,
            refill_rate: None,
        };
        // Default rate is 1 token/sec. 400ms adds nothing and must not
        // reset the accrual clock.
        let (tokens, last) = refill(&rule, 2, 1_000, 1_400);
        assert_eq!((tokens, last), (2, 1_000));
        // Another 700ms on the same clock crosses a whole token.
        let (tokens, last) = refill(&rule, 2, 1_000, 2_100);
        assert_eq!((tokens, last), (3, 2_100));
    }

    #[test]
    fn fixed_window_evaluate_resets_after_deadline() {
        let rule = RateLimitRule::new(RateLimitStrategy::FixedWindow, 2, 1_000);
        let state = CounterState::FixedWindow {
            count: 2,
            reset_at_ms: 5_000,
        };
        assert!(!evaluate(&rule, Some(&state), 4_999).allowed);
        assert!(evaluate(&rule, Some(&state), 5_000).allowed);
    }

    #[test]
    fn sliding_window_evaluate_discards_aged_timestamps() {
        let rule = RateLimitRule::new(RateLimitStrategy::SlidingWindow, 2, 1_000);
        let state = CounterState::SlidingWindow {
            timestamps: vec![100, 200, 900],
        };
        // At t=1150 only 200 and 900 are in window: full.
        assert!(!evaluate(&rule, Some(&state), 1_150).allowed);
        // At t=1250 only 900 remains: one slot free.
        assert!(evaluate(&rule, Some(&state), 1_250).allowed);
    }

    #[test]
    fn strategy_change_discards_stale_state() {
        let rule = RateLimitRule::new(RateLimitStrategy::FixedWindow, 1, 1_000);
        let state = CounterState::SlidingWindow {
            timestamps: vec![1, 2, 3],
        };
        assert!(evaluate(&rule, Some(&state), 10).allowed);
    }

    #[test]
    fn resolution_prefers_identifier_then_source_then_default() {
        let mut settings = settings_with_default(RateLimitRule::new(
            RateLimitStrategy::FixedWindow,
            60,
            60_000,
        ));
        settings.sources.insert(
            "github".into(),
            RateLimitRule::new(RateLimitStrategy::FixedWindow, 10, 60_000),
        );
        settings.identifiers.insert(
            "github:install-1".into(),
            RateLimitRule::new(RateLimitStrategy::TokenBucket, 3, 60_000),
        );

        assert_eq!(settings.resolve("github", "install-1").limit, 3);
        assert_eq!(settings.resolve("github", "other").limit, 10);
        assert_eq!(settings.resolve("linear", "x").limit, 60);
    }

    #[tokio::test]
    async fn shared_rules_are_read_fresh_each_call() {
        let shared = SharedRules::new(settings_with_default(RateLimitRule::new(
            RateLimitStrategy::FixedWindow,
            1,
            60_000,
        )));
        let limiter = RateLimiter::new(Arc::new(MemoryStore::new()), Arc::new(shared.clone()));

        limiter.enforce("github", "a").await.unwrap();
        assert!(limiter.enforce("github", "a").await.is_err());

        // Operator raises the limit at runtime; next call sees it.
        shared
            .0
            .write()
            .unwrap()
            .default = RateLimitRule::new(RateLimitStrategy::FixedWindow, 10, 60_000);
        limiter.enforce("github", "a").await.unwrap();
    }

    #[tokio::test]
    async fn concurrent_enforce_admits_at_most_limit() {
        let limiter = Arc::new(limiter(settings_with_default(RateLimitRule::new(
            RateLimitStrategy::FixedWindow,
            3,
            60_000,
        ))));

        // All tasks released at once so their read-modify-write sequences
        // overlap; without per-key serialization two of them can read the
        // same counter and both be admitted.
        let barrier = Arc::new(tokio::sync::Barrier::new(16));
        let mut joins = tokio::task::JoinSet::new();
        for _ in 0..16 {
            let limiter = limiter.clone();
            let barrier = barrier.clone();
            joins.spawn(async move {
                barrier.wait().await;
                limiter.enforce("github", "install-1").await
            });
        }

        let mut admitted = 0;
        let mut rejected = 0;
        while let Some(res) = joins.join_next().await {
            match res.unwrap() {
                Ok(()) => admitted += 1,
                Err(Error::RateLimitExceeded { .. }) => rejected += 1,
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(admitted, 3);
        assert_eq!(rejected, 13);
    }

    #[tokio::test]
    async fn concurrent_increments_are_not_lost() {
        let limiter = Arc::new(limiter(settings_with_default(RateLimitRule::new(
            RateLimitStrategy::FixedWindow,
            100,
            60_000,
        ))));

        let mut joins = tokio::task::JoinSet::new();
        for _ in 0..20 {
            let limiter = limiter.clone();
            joins.spawn(async move { limiter.increment("github", "a").await });
        }
        while let Some(res) = joins.join_next().await {
            res.unwrap().unwrap();
        }

        // Every one of the 20 admissions was counted.
        let state: CounterState = get_json(limiter.store.as_ref(), "ratelimit:github:a")
            .await
            .unwrap()
            .unwrap();
        match state {
            CounterState::FixedWindow { count, .. } => assert_eq!(count, 20),
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[tokio::test]
    async fn counter_state_carries_a_ttl() {
        let store = Arc::new(MemoryStore::new());
        let limiter = RateLimiter::new(
            store.clone(),
            Arc::new(settings_with_default(RateLimitRule::new(
                RateLimitStrategy::FixedWindow,
                5,
                60_000,
            ))),
        );
        limiter.enforce("github", "a").await.unwrap();
        // State exists now and is scheduled to expire with the window.
        assert!(store.get("ratelimit:github:a").await.unwrap().is_some());
    }
}
