use std::collections::HashMap;
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::warn;

use crate::classify::{self, ApiPattern};
use crate::model::RateLimitRule;
use crate::queue::RequestQueue;

const FREQUENCY_WINDOW: Duration = Duration::from_secs(60);
const FREQUENCY_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Outcome of `check`/`incrementAndCheckFrequency`. Carries a short human
/// message so the HTTP layer never has to re-derive one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Allowed,
    QueueRequired,
    UserLimitExceeded,
    ApiLimitExceeded,
    GlobalLimitExceeded,
}

impl Decision {
    pub fn is_allowed(self) -> bool {
        matches!(self, Decision::Allowed)
    }

    pub fn message(self) -> &'static str {
        match self {
            Decision::Allowed => "allowed",
            Decision::QueueRequired => "global capacity full, queued",
            Decision::UserLimitExceeded => "user request rate or concurrency limit exceeded",
            Decision::ApiLimitExceeded => "API request rate or concurrency limit exceeded",
            Decision::GlobalLimitExceeded => "global request rate or concurrency limit exceeded",
        }
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.message())
    }
}

/// Exact-match plus ordered pattern-match rule table, alongside the global and
/// default-user rules.
pub struct RateLimitConfig {
    pub global: RateLimitRule,
    pub default_user: RateLimitRule,
    pub apis: HashMap<String, RateLimitRule>,
    pub api_patterns: Vec<ApiPattern>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global: RateLimitRule::new(Some(50), Some(500), Some(20)),
            default_user: RateLimitRule::new(Some(4), Some(60), Some(2)),
            apis: HashMap::new(),
            api_patterns: Vec::new(),
        }
    }
}

/// A rolling 60-second frequency counter. Reading resets the window if stale;
/// writes only increment and never touch the window on their own.
#[derive(Debug, Clone, Copy)]
struct Counter {
    count: u32,
    window_start: Instant,
}

impl Counter {
    fn new() -> Self {
        Self { count: 0, window_start: Instant::now() }
    }

    fn reset_if_stale(&mut self) {
        if self.window_start.elapsed() >= FREQUENCY_WINDOW {
            self.count = 0;
            self.window_start = Instant::now();
        }
    }
}

impl Default for Counter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Default)]
struct LimiterState {
    global_concurrent: u32,
    global_sse_connections: u32,
    global_requests: Counter,
    user_concurrent: HashMap<String, u32>,
    user_sse: HashMap<String, u32>,
    user_requests: HashMap<String, Counter>,
    api_concurrent: HashMap<String, u32>,
    api_sse: HashMap<String, u32>,
    api_requests: HashMap<String, Counter>,
    user_rule_cache: HashMap<String, RateLimitRule>,
}

fn decrement_floored(map: &mut HashMap<String, u32>, key: &str) {
    if let Some(v) = map.get_mut(key) {
        *v = v.saturating_sub(1);
    }
}

/// Resolves a credential's effective rate-limit override. Implemented by the
/// credential store; returning `None` means "no override, use the default".
#[async_trait]
pub trait UserRuleLoader: Send + Sync {
    async fn load_rule(&self, user_id: &str) -> anyhow::Result<Option<RateLimitRule>>;
}

/// Per-user/per-API/global counters behind one lock, plus the collaborators
/// needed to resolve dynamic per-user overrides and to hand off saturated
/// non-SSE requests to the priority queue.
pub struct RateLimiter {
    config: RateLimitConfig,
    queue_configured: bool,
    state: Mutex<LimiterState>,
    user_rule_loader: Box<dyn UserRuleLoader>,
    queue: OnceLock<std::sync::Arc<RequestQueue>>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct UserStatsEntry {
    pub user_id: String,
    pub concurrent: u32,
    pub sse_connections: u32,
    pub requests_this_minute: u32,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Stats {
    pub global_concurrent: u32,
    pub global_sse_connections: u32,
    pub global_requests_this_minute: u32,
    pub queue_size: usize,
    pub queue_by_priority: HashMap<String, usize>,
    pub user_stats: Vec<UserStatsEntry>,
}

impl RateLimiter {
    pub fn new(
        config: RateLimitConfig,
        queue_configured: bool,
        user_rule_loader: Box<dyn UserRuleLoader>,
    ) -> std::sync::Arc<Self> {
        std::sync::Arc::new(Self {
            config,
            queue_configured,
            state: Mutex::new(LimiterState::default()),
            user_rule_loader,
            queue: OnceLock::new(),
        })
    }

    /// Wires the priority queue in after construction, since the queue itself
    /// needs a handle back to this limiter for its slot-probe callback.
    pub fn attach_queue(&self, queue: std::sync::Arc<RequestQueue>) {
        let _ = self.queue.set(queue);
    }

    pub fn queue(&self) -> Option<&std::sync::Arc<RequestQueue>> {
        self.queue.get()
    }

    pub async fn invalidate_user_rule(&self, user_id: &str) {
        self.state.lock().await.user_rule_cache.remove(user_id);
    }

    /// Resolves the cache without ever holding `state` across the loader's
    /// `.await` — a cold cache falls through to an unlocked database round
    /// trip, then re-takes the lock only to record the result.
    async fn resolve_user_rule(&self, user_id: &str) -> RateLimitRule {
        {
            let state = self.state.lock().await;
            if let Some(cached) = state.user_rule_cache.get(user_id) {
                return *cached;
            }
        }
        let loaded = match self.user_rule_loader.load_rule(user_id).await {
            Ok(rule) => rule,
            Err(err) => {
                warn!(user_id, error = %err, "user rule loader failed, falling back to default");
                None
            }
        };
        let resolved = match loaded {
            Some(over) => self.config.default_user.merged_with(&over),
            None => self.config.default_user,
        };
        let mut state = self.state.lock().await;
        state.user_rule_cache.insert(user_id.to_string(), resolved);
        resolved
    }

    /// Evaluates a request against every layer without mutating any counter,
    /// in the strict order described in the design: user frequency, user
    /// concurrency/SSE, API rule, global frequency, global concurrency/SSE.
    pub async fn check(&self, user_id: &str, api_id: &str, is_sse: bool) -> Decision {
        self.check_with_path(user_id, api_id, "", "", is_sse).await
    }

    pub async fn check_with_path(
        &self,
        user_id: &str,
        api_id: &str,
        method: &str,
        path: &str,
        is_sse: bool,
    ) -> Decision {
        let user_rule = self.resolve_user_rule(user_id).await;
        let mut state = self.state.lock().await;

        let user_requests = state.user_requests.entry(user_id.to_string()).or_default();
        user_requests.reset_if_stale();
        if let Some(max) = user_rule.max_requests_per_minute {
            if user_requests.count >= max {
                return Decision::UserLimitExceeded;
            }
        }

        if is_sse {
            let current = *state.user_sse.get(user_id).unwrap_or(&0);
            if let Some(max) = user_rule.max_sse_connections {
                if current >= max {
                    return Decision::UserLimitExceeded;
                }
            }
        } else {
            let current = *state.user_concurrent.get(user_id).unwrap_or(&0);
            if let Some(max) = user_rule.max_concurrent {
                if current >= max {
                    return Decision::UserLimitExceeded;
                }
            }
        }

        if let Some(api_rule) =
            classify::resolve_api_rule(method, path, &self.config.apis, api_id, &self.config.api_patterns)
        {
            let api_requests = state.api_requests.entry(api_id.to_string()).or_default();
            api_requests.reset_if_stale();
            if let Some(max) = api_rule.max_requests_per_minute {
                if api_requests.count >= max {
                    return Decision::ApiLimitExceeded;
                }
            }
            if is_sse {
                let current = *state.api_sse.get(api_id).unwrap_or(&0);
                if let Some(max) = api_rule.max_sse_connections {
                    if current >= max {
                        return Decision::ApiLimitExceeded;
                    }
                }
            } else {
                let current = *state.api_concurrent.get(api_id).unwrap_or(&0);
                if let Some(max) = api_rule.max_concurrent {
                    if current >= max {
                        return Decision::ApiLimitExceeded;
                    }
                }
            }
        }

        state.global_requests.reset_if_stale();
        if let Some(max) = self.config.global.max_requests_per_minute {
            if state.global_requests.count >= max {
                return Decision::GlobalLimitExceeded;
            }
        }

        if is_sse {
            if let Some(max) = self.config.global.max_sse_connections {
                if state.global_sse_connections >= max {
                    return Decision::GlobalLimitExceeded;
                }
            }
        } else if let Some(max) = self.config.global.max_concurrent {
            if state.global_concurrent >= max {
                return if self.queue_configured {
                    Decision::QueueRequired
                } else {
                    Decision::GlobalLimitExceeded
                };
            }
        }

        Decision::Allowed
    }

    /// Bumps the concurrency/SSE counters at every layer with a configured
    /// ceiling, then bumps all three frequency counters by one.
    pub async fn acquire(&self, user_id: &str, api_id: &str, is_sse: bool, skip_global_concurrent: bool) {
        let mut state = self.state.lock().await;
        self.acquire_locked(&mut state, user_id, api_id, is_sse, skip_global_concurrent);
    }

    fn acquire_locked(
        &self,
        state: &mut LimiterState,
        user_id: &str,
        api_id: &str,
        is_sse: bool,
        skip_global_concurrent: bool,
    ) {
        if is_sse {
            *state.user_sse.entry(user_id.to_string()).or_insert(0) += 1;
            *state.api_sse.entry(api_id.to_string()).or_insert(0) += 1;
            state.global_sse_connections += 1;
        } else {
            *state.user_concurrent.entry(user_id.to_string()).or_insert(0) += 1;
            *state.api_concurrent.entry(api_id.to_string()).or_insert(0) += 1;
            if !skip_global_concurrent {
                state.global_concurrent += 1;
            }
        }

        let user_requests = state.user_requests.entry(user_id.to_string()).or_default();
        user_requests.reset_if_stale();
        user_requests.count += 1;

        let api_requests = state.api_requests.entry(api_id.to_string()).or_default();
        api_requests.reset_if_stale();
        api_requests.count += 1;

        state.global_requests.reset_if_stale();
        state.global_requests.count += 1;
    }

    /// Decrements concurrency/SSE counters, flooring at zero, and notifies the
    /// queue that a global slot may now be free for non-SSE releases.
    pub async fn release(&self, user_id: &str, api_id: &str, is_sse: bool) {
        {
            let mut state = self.state.lock().await;
            if is_sse {
                decrement_floored(&mut state.user_sse, user_id);
                decrement_floored(&mut state.api_sse, api_id);
                state.global_sse_connections = state.global_sse_connections.saturating_sub(1);
            } else {
                decrement_floored(&mut state.user_concurrent, user_id);
                decrement_floored(&mut state.api_concurrent, api_id);
                state.global_concurrent = state.global_concurrent.saturating_sub(1);
            }
        }
        if !is_sse {
            if let Some(queue) = self.queue.get() {
                queue.notify_slot_available().await;
            }
        }
    }

    /// Atomically checks all three frequency ceilings and, only if every one
    /// passes, bumps all three. Used once per relayed SSE data event.
    pub async fn increment_and_check_frequency(&self, user_id: &str, api_id: &str) -> Decision {
        let user_rule = self.resolve_user_rule(user_id).await;
        let mut state = self.state.lock().await;

        {
            let c = state.user_requests.entry(user_id.to_string()).or_default();
            c.reset_if_stale();
            if let Some(max) = user_rule.max_requests_per_minute {
                if c.count >= max {
                    return Decision::UserLimitExceeded;
                }
            }
        }
        let (method, path) = classify::split_api_identifier(api_id);
        if let Some(api_rule) =
            classify::resolve_api_rule(method, path, &self.config.apis, api_id, &self.config.api_patterns)
        {
            let c = state.api_requests.entry(api_id.to_string()).or_default();
            c.reset_if_stale();
            if let Some(max) = api_rule.max_requests_per_minute {
                if c.count >= max {
                    return Decision::ApiLimitExceeded;
                }
            }
        }
        {
            state.global_requests.reset_if_stale();
            if let Some(max) = self.config.global.max_requests_per_minute {
                if state.global_requests.count >= max {
                    return Decision::GlobalLimitExceeded;
                }
            }
        }

        state.user_requests.entry(user_id.to_string()).or_default().count += 1;
        state.api_requests.entry(api_id.to_string()).or_default().count += 1;
        state.global_requests.count += 1;
        Decision::Allowed
    }

    /// Polls `increment_and_check_frequency` at 100ms granularity until it
    /// succeeds or `timeout` elapses.
    pub async fn wait_for_frequency_slot(
        &self,
        user_id: &str,
        api_id: &str,
        timeout: Duration,
    ) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.increment_and_check_frequency(user_id, api_id).await.is_allowed() {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(FREQUENCY_POLL_INTERVAL).await;
        }
    }

    /// Probe used by the priority queue's driver loop: atomically tests and
    /// increments `globalConcurrent` under the limiter lock. This is the only
    /// permitted case of the limiter lock being taken while the queue lock is
    /// already held by the caller.
    pub async fn try_take_global_slot(&self) -> bool {
        let mut state = self.state.lock().await;
        let max = self.config.global.max_concurrent.unwrap_or(u32::MAX);
        if state.global_concurrent < max {
            state.global_concurrent += 1;
            true
        } else {
            false
        }
    }

    pub async fn stats(&self) -> Stats {
        let state = self.state.lock().await;
        let mut user_stats = Vec::new();
        let user_ids: std::collections::HashSet<&String> = state
            .user_concurrent
            .keys()
            .chain(state.user_sse.keys())
            .chain(state.user_requests.keys())
            .collect();
        for user_id in user_ids {
            let concurrent = *state.user_concurrent.get(user_id).unwrap_or(&0);
            let sse = *state.user_sse.get(user_id).unwrap_or(&0);
            let requests = state.user_requests.get(user_id).map(|c| c.count).unwrap_or(0);
            if concurrent == 0 && sse == 0 && requests == 0 {
                continue;
            }
            user_stats.push(UserStatsEntry {
                user_id: user_id.clone(),
                concurrent,
                sse_connections: sse,
                requests_this_minute: requests,
            });
        }

        let (queue_size, queue_by_priority) = match self.queue.get() {
            Some(q) => q.stats().await,
            None => (0, HashMap::new()),
        };

        Stats {
            global_concurrent: state.global_concurrent,
            global_sse_connections: state.global_sse_connections,
            global_requests_this_minute: state.global_requests.count,
            queue_size,
            queue_by_priority,
            user_stats,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    struct NoOverrideLoader;

    #[async_trait]
    impl UserRuleLoader for NoOverrideLoader {
        async fn load_rule(&self, _user_id: &str) -> anyhow::Result<Option<RateLimitRule>> {
            Ok(None)
        }
    }

    fn limiter_with(config: RateLimitConfig, queue_configured: bool) -> Arc<RateLimiter> {
        RateLimiter::new(config, queue_configured, Box::new(NoOverrideLoader))
    }

    #[tokio::test]
    async fn happy_path_counters_return_to_zero_after_release() {
        let mut config = RateLimitConfig::default();
        config.global = RateLimitRule::new(Some(2), Some(60), Some(2));
        config.default_user = RateLimitRule::new(Some(1), Some(60), Some(1));
        let limiter = limiter_with(config, false);

        let decision = limiter.check("K", "GET /ping", false).await;
        assert_eq!(decision, Decision::Allowed);
        limiter.acquire("K", "GET /ping", false, false).await;
        limiter.release("K", "GET /ping", false).await;

        let stats = limiter.stats().await;
        assert_eq!(stats.global_concurrent, 0);
        assert_eq!(stats.user_stats.iter().find(|u| u.user_id == "K").unwrap().requests_this_minute, 1);
    }

    #[tokio::test]
    async fn user_frequency_blocks_after_limit_reached() {
        let mut config = RateLimitConfig::default();
        config.global = RateLimitRule::new(Some(2), Some(6000), Some(2));
        config.default_user = RateLimitRule::new(Some(1), Some(60), Some(1));
        let limiter = limiter_with(config, false);

        for _ in 0..60 {
            assert_eq!(limiter.check("K", "GET /ping", false).await, Decision::Allowed);
            limiter.acquire("K", "GET /ping", false, false).await;
            limiter.release("K", "GET /ping", false).await;
        }
        assert_eq!(limiter.check("K", "GET /ping", false).await, Decision::UserLimitExceeded);
    }

    #[tokio::test]
    async fn global_saturation_without_queue_is_global_limit_exceeded() {
        let mut config = RateLimitConfig::default();
        config.global = RateLimitRule::new(Some(1), Some(100), Some(1));
        config.default_user = RateLimitRule::new(Some(5), Some(100), Some(5));
        let limiter = limiter_with(config, false);

        limiter.acquire("A", "GET /x", false, false).await;
        assert_eq!(limiter.check("B", "GET /x", false).await, Decision::GlobalLimitExceeded);
    }

    #[tokio::test]
    async fn global_saturation_with_queue_requires_queueing() {
        let mut config = RateLimitConfig::default();
        config.global = RateLimitRule::new(Some(1), Some(100), Some(1));
        config.default_user = RateLimitRule::new(Some(5), Some(100), Some(5));
        let limiter = limiter_with(config, true);

        limiter.acquire("A", "GET /x", false, false).await;
        assert_eq!(limiter.check("B", "GET /x", false).await, Decision::QueueRequired);
    }

    #[tokio::test]
    async fn increment_and_check_frequency_is_atomic_across_layers() {
        let mut config = RateLimitConfig::default();
        config.default_user = RateLimitRule::new(Some(5), Some(2), Some(5));
        let limiter = limiter_with(config, false);

        assert!(limiter.increment_and_check_frequency("K", "GET /x").await.is_allowed());
        assert!(limiter.increment_and_check_frequency("K", "GET /x").await.is_allowed());
        assert_eq!(
            limiter.increment_and_check_frequency("K", "GET /x").await,
            Decision::UserLimitExceeded
        );
        // Failed attempt must not have bumped the counter further.
        let stats = limiter.stats().await;
        assert_eq!(stats.user_stats.iter().find(|u| u.user_id == "K").unwrap().requests_this_minute, 2);
    }

    #[tokio::test]
    async fn wait_for_frequency_slot_times_out_when_never_admitted() {
        let mut config = RateLimitConfig::default();
        config.default_user = RateLimitRule::new(Some(5), Some(0), Some(5));
        let limiter = limiter_with(config, false);

        let waited = limiter
            .wait_for_frequency_slot("K", "GET /x", Duration::from_millis(250))
            .await;
        assert!(!waited);
    }

    #[tokio::test]
    async fn release_floors_at_zero_without_underflow() {
        let limiter = limiter_with(RateLimitConfig::default(), false);
        limiter.release("never-acquired", "GET /x", false).await;
        let stats = limiter.stats().await;
        assert_eq!(stats.global_concurrent, 0);
    }
}
