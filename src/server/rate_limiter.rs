//! Rate limiting.
//!
//! Two limiters protect the C2S surface:
//!
//! - [`TokenBucket`]: per-stream inbound byte budget (bytes/sec with
//!   burst), applied on the transport read path.
//! - [`AuthRateLimiter`]: per-IP exponential backoff on SASL failures,
//!   applied at the listener before a connection is even accepted.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::ReadRateConfig;

/// Token-bucket byte budget for a stream's read path.
#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    tokens: f64,
    refilled_at: Instant,
}

impl TokenBucket {
    pub fn new(cfg: &ReadRateConfig) -> Self {
        Self {
            rate: cfg.bytes_per_sec.max(1) as f64,
            capacity: cfg.burst.max(1) as f64,
            tokens: cfg.burst.max(1) as f64,
            refilled_at: Instant::now(),
        }
    }

    /// Account for `n` consumed bytes, sleeping until the budget allows
    /// them. Backpressure propagates naturally: the reader task stalls,
    /// the kernel buffer fills, the peer's sends block.
    pub async fn consume(&mut self, n: usize) {
        self.refill();
        let n = n as f64;
        if self.tokens >= n {
            self.tokens -= n;
            return;
        }
        let deficit = n - self.tokens;
        self.tokens = 0.0;
        tokio::time::sleep(Duration::from_secs_f64(deficit / self.rate)).await;
        self.refilled_at = Instant::now();
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.refilled_at).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate).min(self.capacity);
        self.refilled_at = now;
    }
}

/// Configuration for auth failure rate limiting.
#[derive(Debug, Clone)]
pub struct AuthRateLimiterConfig {
    /// Number of failures before lockouts kick in.
    pub failure_threshold: u32,
    /// Base lockout duration after the threshold is reached.
    pub base_lockout_duration: Duration,
    /// Cap on the exponential backoff.
    pub max_lockout_duration: Duration,
    /// Window after which an IP's failure count resets.
    pub failure_window: Duration,
    /// Bound on tracked IPs.
    pub max_tracked_ips: usize,
}

impl Default for AuthRateLimiterConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            base_lockout_duration: Duration::from_secs(1),
            max_lockout_duration: Duration::from_secs(300),
            failure_window: Duration::from_secs(600),
            max_tracked_ips: 10_000,
        }
    }
}

#[derive(Debug, Clone)]
struct IpState {
    failure_count: u32,
    first_failure: Instant,
    last_failure: Instant,
    lockout_until: Option<Instant>,
}

impl IpState {
    fn new() -> Self {
        let now = Instant::now();
        Self {
            failure_count: 1,
            first_failure: now,
            last_failure: now,
            lockout_until: None,
        }
    }
}

/// Per-IP exponential backoff on authentication failures.
pub struct AuthRateLimiter {
    state: Arc<RwLock<HashMap<IpAddr, IpState>>>,
    config: AuthRateLimiterConfig,
}

impl AuthRateLimiter {
    pub fn new() -> Self {
        Self::with_config(AuthRateLimiterConfig::default())
    }

    pub fn with_config(config: AuthRateLimiterConfig) -> Self {
        Self {
            state: Arc::new(RwLock::new(HashMap::new())),
            config,
        }
    }

    /// `Some(remaining)` if the IP is locked out.
    pub async fn check_rate_limit(&self, ip: IpAddr) -> Option<Duration> {
        let state = self.state.read().await;
        if let Some(ip_state) = state.get(&ip)
            && let Some(lockout_until) = ip_state.lockout_until
        {
            let now = Instant::now();
            if now < lockout_until {
                return Some(lockout_until - now);
            }
        }
        None
    }

    /// Record a SASL failure; may trigger a lockout.
    pub async fn record_failure(&self, ip: IpAddr) {
        let mut state = self.state.write().await;
        let now = Instant::now();

        if state.len() >= self.config.max_tracked_ips {
            self.cleanup_old_entries(&mut state, now);
        }

        let is_new = !state.contains_key(&ip);
        let ip_state = state.entry(ip).or_insert_with(IpState::new);

        if is_new {
            if ip_state.failure_count >= self.config.failure_threshold {
                ip_state.lockout_until = Some(now + self.config.base_lockout_duration);
            }
            return;
        }

        if now.duration_since(ip_state.first_failure) > self.config.failure_window {
            ip_state.failure_count = 1;
            ip_state.first_failure = now;
            ip_state.last_failure = now;
            ip_state.lockout_until = None;
            return;
        }

        ip_state.failure_count += 1;
        ip_state.last_failure = now;

        if ip_state.failure_count >= self.config.failure_threshold {
            let excess = ip_state.failure_count - self.config.failure_threshold;
            let multiplier = 2u64.saturating_pow(excess);
            let lockout = self
                .config
                .base_lockout_duration
                .saturating_mul(multiplier.min(u32::MAX as u64) as u32)
                .min(self.config.max_lockout_duration);
            ip_state.lockout_until = Some(now + lockout);

            tracing::warn!(
                ip = %ip,
                failure_count = ip_state.failure_count,
                lockout_secs = lockout.as_secs(),
                "IP rate-limited due to auth failures"
            );
        }
    }

    /// A successful authentication clears the IP's failure history.
    pub async fn record_success(&self, ip: IpAddr) {
        let mut state = self.state.write().await;
        state.remove(&ip);
    }

    fn cleanup_old_entries(&self, state: &mut HashMap<IpAddr, IpState>, now: Instant) {
        state.retain(|_, ip_state| {
            now.duration_since(ip_state.last_failure) < self.config.failure_window
        });
        if state.len() >= self.config.max_tracked_ips {
            let oldest = state
                .iter()
                .min_by_key(|(_, s)| s.last_failure)
                .map(|(ip, _)| *ip);
            if let Some(ip) = oldest {
                state.remove(&ip);
            }
        }
    }
}

impl Default for AuthRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}
