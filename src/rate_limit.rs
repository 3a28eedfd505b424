use crate::config::RateLimitConfig;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::{debug, info};
use url::Url;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RateLimitStats {
    pub total_requests: u64,
    pub total_wait_secs: f64,
    pub rejections: u64,
    pub avg_wait_secs: f64,
    pub requests_last_minute: usize,
    pub requests_last_hour: usize,
    pub current_tokens: f64,
}

#[derive(Debug)]
struct LimiterState {
    tokens: f64,
    last_refill: Instant,
    minute: VecDeque<Instant>,
    hour: VecDeque<Instant>,
    total_requests: u64,
    total_wait: Duration,
    rejections: u64,
}

impl LimiterState {
    fn fresh(config: &RateLimitConfig) -> Self {
        Self {
            tokens: f64::from(config.burst_size),
            last_refill: Instant::now(),
            minute: VecDeque::new(),
            hour: VecDeque::new(),
            total_requests: 0,
            total_wait: Duration::ZERO,
            rejections: 0,
        }
    }
}

/// Token bucket for bursts, plus per-minute and per-hour request windows.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    state: Mutex<LimiterState>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let state = Mutex::new(LimiterState::fresh(&config));
        Self { config, state }
    }

    /// Blocks until a request may be sent and records it. With `wait` false
    /// a request that would have to wait is rejected instead.
    pub fn acquire(&self, wait: bool) -> bool {
        let mut state = self.lock();
        self.refill(&mut state);
        prune(&mut state, Instant::now());

        let wait_for = self.required_wait(&state);
        if !wait_for.is_zero() {
            if !wait {
                state.rejections += 1;
                debug!(wait_secs = wait_for.as_secs_f64(), "rate limit would require a wait");
                return false;
            }

            debug!(wait_secs = wait_for.as_secs_f64(), "rate limiting");
            state.total_wait += wait_for;
            std::thread::sleep(wait_for);
            self.refill(&mut state);
        }

        state.tokens -= 1.0;
        let now = Instant::now();
        state.minute.push_back(now);
        state.hour.push_back(now);
        state.total_requests += 1;
        true
    }

    pub fn stats(&self) -> RateLimitStats {
        let mut state = self.lock();
        prune(&mut state, Instant::now());
        let total_wait_secs = state.total_wait.as_secs_f64();
        RateLimitStats {
            total_requests: state.total_requests,
            total_wait_secs,
            rejections: state.rejections,
            avg_wait_secs: if state.total_requests > 0 {
                total_wait_secs / state.total_requests as f64
            } else {
                0.0
            },
            requests_last_minute: state.minute.len(),
            requests_last_hour: state.hour.len(),
            current_tokens: state.tokens,
        }
    }

    pub fn reset(&self) {
        *self.lock() = LimiterState::fresh(&self.config);
        info!("rate limiter reset");
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn refill(&self, state: &mut LimiterState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.config.requests_per_second)
            .min(f64::from(self.config.burst_size));
        state.last_refill = now;
    }

    fn required_wait(&self, state: &LimiterState) -> Duration {
        let mut wait = Duration::ZERO;

        if state.tokens < 1.0 {
            let deficit = 1.0 - state.tokens;
            // A zero or negative rate never refills; wait out a full window.
            let refill = Duration::try_from_secs_f64(deficit / self.config.requests_per_second)
                .unwrap_or(HOUR);
            wait = wait.max(refill.min(HOUR));
        }

        wait = wait.max(window_wait(&state.minute, self.config.requests_per_minute, MINUTE));
        wait = wait.max(window_wait(&state.hour, self.config.requests_per_hour, HOUR));
        wait.max(self.config.min_delay())
    }
}

fn prune(state: &mut LimiterState, now: Instant) {
    while state
        .minute
        .front()
        .is_some_and(|t| now.duration_since(*t) > MINUTE)
    {
        state.minute.pop_front();
    }
    while state
        .hour
        .front()
        .is_some_and(|t| now.duration_since(*t) > HOUR)
    {
        state.hour.pop_front();
    }
}

fn window_wait(window: &VecDeque<Instant>, limit: usize, span: Duration) -> Duration {
    if window.len() < limit {
        return Duration::ZERO;
    }
    window
        .front()
        .map(|oldest| span.saturating_sub(oldest.elapsed()))
        .unwrap_or(Duration::ZERO)
}

/// One [`RateLimiter`] per host, created lazily from a shared config.
#[derive(Debug)]
pub struct DomainRateLimiter {
    default_config: RateLimitConfig,
    limiters: Mutex<HashMap<String, Arc<RateLimiter>>>,
}

impl DomainRateLimiter {
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            default_config,
            limiters: Mutex::new(HashMap::new()),
        }
    }

    pub fn acquire(&self, url: &str, wait: bool) -> bool {
        let domain = domain_of(url);
        let limiter = {
            let mut limiters = self
                .limiters
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            limiters
                .entry(domain.clone())
                .or_insert_with(|| {
                    info!(%domain, "created rate limiter");
                    Arc::new(RateLimiter::new(self.default_config.clone()))
                })
                .clone()
        };
        limiter.acquire(wait)
    }

    pub fn stats(&self, domain: &str) -> Option<RateLimitStats> {
        self.limiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(domain)
            .map(|limiter| limiter.stats())
    }

    pub fn all_stats(&self) -> BTreeMap<String, RateLimitStats> {
        self.limiters
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(domain, limiter)| (domain.clone(), limiter.stats()))
            .collect()
    }
}

fn domain_of(url: &str) -> String {
    Url::parse(url)
        .ok()
        .and_then(|u| {
            u.host_str().map(|host| match u.port() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            })
        })
        .unwrap_or_default()
}
