use crate::errors::ProxyError;
use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RateLimitAlgorithm {
	FixedWindow,
	SlidingWindow,
	TokenBucket,
	LeakyBucket,
}

impl Default for RateLimitAlgorithm {
	fn default() -> Self {
		RateLimitAlgorithm::FixedWindow
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RateLimitConfig {
	pub key: String,
	pub limit: u64,
	pub window_seconds: u64,
	#[serde(default)]
	pub algorithm: RateLimitAlgorithm,
}

/// Global limiter defaults used when a key has no explicit configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RateLimitSettings {
	#[serde(default = "default_limit")]
	pub default_limit: u64,
	#[serde(default = "default_window")]
	pub default_window_seconds: u64,
	#[serde(default)]
	pub default_algorithm: RateLimitAlgorithm,
	/// Seconds between state eviction sweeps.
	#[serde(default = "default_cleanup_interval")]
	pub cleanup_interval: u64,
}

fn default_limit() -> u64 {
	100
}

fn default_window() -> u64 {
	60
}

fn default_cleanup_interval() -> u64 {
	3600
}

impl Default for RateLimitSettings {
	fn default() -> Self {
		Self {
			default_limit: default_limit(),
			default_window_seconds: default_window(),
			default_algorithm: RateLimitAlgorithm::default(),
			cleanup_interval: default_cleanup_interval(),
		}
	}
}

#[derive(Clone, Debug)]
struct KeyState {
	current_count: u64,
	window_start: DateTime<Utc>,
	last_request: DateTime<Utc>,
	/// Token balance (token bucket) or fill level (leaky bucket).
	level: f64,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyStatistics {
	pub total_requests: u64,
	pub allowed_requests: u64,
	pub blocked_requests: u64,
	pub total_cost: u64,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
	pub allowed: bool,
	pub remaining: u64,
	pub reset_time: DateTime<Utc>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub retry_after: Option<u64>,
	pub limit: u64,
	pub window_seconds: u64,
}

impl RateLimitDecision {
	pub fn into_result(self) -> Result<RateLimitDecision, ProxyError> {
		if self.allowed {
			Ok(self)
		} else {
			Err(ProxyError::RateLimitExceeded {
				limit: self.limit,
				remaining: self.remaining,
				reset_time: self.reset_time,
				retry_after: self.retry_after,
			})
		}
	}
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitStatus {
	pub key: String,
	pub limit: u64,
	pub window_seconds: u64,
	pub algorithm: RateLimitAlgorithm,
	pub current_count: u64,
	pub level: f64,
	pub window_start: DateTime<Utc>,
	pub last_request: DateTime<Utc>,
	pub statistics: KeyStatistics,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimiterStatistics {
	pub total_rate_limits: usize,
	pub total_requests: u64,
	pub allowed_requests: u64,
	pub blocked_requests: u64,
	pub success_rate: f64,
}

#[derive(Default)]
struct Inner {
	configs: HashMap<String, RateLimitConfig>,
	states: HashMap<String, KeyState>,
	stats: HashMap<String, KeyStatistics>,
}

/// Per-key rate limiting with four interchangeable algorithms and a
/// background sweep that drops state idle for a day.
pub struct RateLimiter {
	settings: RateLimitSettings,
	inner: Mutex<Inner>,
	ct: CancellationToken,
}

impl RateLimiter {
	pub fn new(settings: RateLimitSettings) -> Self {
		Self {
			settings,
			inner: Mutex::new(Inner::default()),
			ct: CancellationToken::new(),
		}
	}

	pub fn add(&self, config: RateLimitConfig) {
		let mut inner = self.inner.lock().unwrap();
		Self::ensure_key(&mut inner, config.clone(), Utc::now());
		inner.configs.insert(config.key.clone(), config.clone());
		info!(key = %config.key, limit = config.limit, window = config.window_seconds, "added rate limit");
	}

	pub fn remove(&self, key: &str) -> bool {
		let mut inner = self.inner.lock().unwrap();
		let known = inner.configs.remove(key).is_some();
		inner.states.remove(key);
		inner.stats.remove(key);
		if known {
			info!(%key, "removed rate limit");
		}
		known
	}

	pub fn check(&self, key: &str, cost: u64) -> RateLimitDecision {
		self.check_at(key, cost, Utc::now())
	}

	fn ensure_key(inner: &mut Inner, config: RateLimitConfig, now: DateTime<Utc>) {
		if !inner.states.contains_key(&config.key) {
			inner.states.insert(
				config.key.clone(),
				KeyState {
					current_count: 0,
					window_start: now,
					last_request: now,
					level: match config.algorithm {
						RateLimitAlgorithm::TokenBucket => config.limit as f64,
						_ => 0.0,
					},
				},
			);
		}
		inner.stats.entry(config.key.clone()).or_default();
		inner.configs.entry(config.key.clone()).or_insert(config);
	}

	fn default_config(&self, key: &str) -> RateLimitConfig {
		RateLimitConfig {
			key: key.to_string(),
			limit: self.settings.default_limit,
			window_seconds: self.settings.default_window_seconds,
			algorithm: self.settings.default_algorithm,
		}
	}

	fn check_at(&self, key: &str, cost: u64, now: DateTime<Utc>) -> RateLimitDecision {
		let mut inner = self.inner.lock().unwrap();
		if !inner.configs.contains_key(key) {
			let config = self.default_config(key);
			Self::ensure_key(&mut inner, config, now);
		}
		let config = inner.configs.get(key).cloned().unwrap();
		Self::ensure_key(&mut inner, config.clone(), now);

		let stats = inner.stats.entry(key.to_string()).or_default();
		stats.total_requests += 1;
		stats.total_cost += cost;

		let state = inner.states.get_mut(key).unwrap();
		let decision = match config.algorithm {
			RateLimitAlgorithm::FixedWindow => check_fixed_window(&config, state, cost, now),
			RateLimitAlgorithm::SlidingWindow => check_sliding_window(&config, state, cost, now),
			RateLimitAlgorithm::TokenBucket => check_token_bucket(&config, state, cost, now),
			RateLimitAlgorithm::LeakyBucket => check_leaky_bucket(&config, state, cost, now),
		};
		state.last_request = now;

		let stats = inner.stats.get_mut(key).unwrap();
		if decision.allowed {
			stats.allowed_requests += 1;
		} else {
			stats.blocked_requests += 1;
			debug!(%key, "rate limit exceeded");
		}
		decision
	}

	pub fn reset(&self, key: &str) -> bool {
		let mut inner = self.inner.lock().unwrap();
		match inner.states.get_mut(key) {
			Some(state) => {
				state.current_count = 0;
				state.level = 0.0;
				state.window_start = Utc::now();
				state.last_request = Utc::now();
				info!(%key, "reset rate limit");
				true
			},
			None => false,
		}
	}

	pub fn status(&self, key: &str) -> Option<RateLimitStatus> {
		let inner = self.inner.lock().unwrap();
		let config = inner.configs.get(key)?;
		let state = inner.states.get(key)?;
		Some(RateLimitStatus {
			key: key.to_string(),
			limit: config.limit,
			window_seconds: config.window_seconds,
			algorithm: config.algorithm,
			current_count: state.current_count,
			level: state.level,
			window_start: state.window_start,
			last_request: state.last_request,
			statistics: inner.stats.get(key).cloned().unwrap_or_default(),
		})
	}

	pub fn list(&self) -> Vec<RateLimitStatus> {
		let keys: Vec<String> = {
			let inner = self.inner.lock().unwrap();
			inner.configs.keys().cloned().collect()
		};
		let mut statuses: Vec<RateLimitStatus> =
			keys.iter().filter_map(|key| self.status(key)).collect();
		statuses.sort_by(|a, b| a.key.cmp(&b.key));
		statuses
	}

	pub fn statistics(&self) -> LimiterStatistics {
		let inner = self.inner.lock().unwrap();
		let total: u64 = inner.stats.values().map(|s| s.total_requests).sum();
		let allowed: u64 = inner.stats.values().map(|s| s.allowed_requests).sum();
		let blocked: u64 = inner.stats.values().map(|s| s.blocked_requests).sum();
		LimiterStatistics {
			total_rate_limits: inner.configs.len(),
			total_requests: total,
			allowed_requests: allowed,
			blocked_requests: blocked,
			success_rate: if total > 0 {
				allowed as f64 / total as f64 * 100.0
			} else {
				0.0
			},
		}
	}

	/// Evict state whose last request is older than a day.
	pub fn sweep(&self) -> usize {
		let cutoff = Utc::now() - Duration::hours(24);
		let expired: Vec<String> = {
			let inner = self.inner.lock().unwrap();
			inner
				.states
				.iter()
				.filter(|(_, state)| state.last_request < cutoff)
				.map(|(key, _)| key.clone())
				.collect()
		};
		for key in &expired {
			self.remove(key);
		}
		if !expired.is_empty() {
			info!(count = expired.len(), "evicted idle rate limit state");
		}
		expired.len()
	}

	pub fn spawn_gc(self: &Arc<Self>) {
		let limiter = self.clone();
		let ct = self.ct.clone();
		let period = std::time::Duration::from_secs(self.settings.cleanup_interval.max(1));
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(period);
			ticker.tick().await;
			loop {
				tokio::select! {
					_ = ticker.tick() => {
						limiter.sweep();
					}
					_ = ct.cancelled() => break,
				}
			}
		});
	}

	pub fn shutdown(&self) {
		self.ct.cancel();
	}
}

fn seconds(window_seconds: u64) -> Duration {
	Duration::seconds(window_seconds as i64)
}

/// Window aligned to the minute boundary; the counter resets when the
/// boundary rolls over.
fn check_fixed_window(
	config: &RateLimitConfig,
	state: &mut KeyState,
	cost: u64,
	now: DateTime<Utc>,
) -> RateLimitDecision {
	let boundary = now
		.with_second(0)
		.and_then(|t| t.with_nanosecond(0))
		.unwrap_or(now);
	if state.window_start < boundary {
		state.current_count = 0;
		state.window_start = boundary;
	}
	let reset_time = state.window_start + seconds(config.window_seconds);
	if state.current_count + cost <= config.limit {
		state.current_count += cost;
		RateLimitDecision {
			allowed: true,
			remaining: config.limit - state.current_count,
			reset_time,
			retry_after: None,
			limit: config.limit,
			window_seconds: config.window_seconds,
		}
	} else {
		RateLimitDecision {
			allowed: false,
			remaining: config.limit.saturating_sub(state.current_count),
			reset_time,
			retry_after: Some((reset_time - now).num_seconds().max(0) as u64),
			limit: config.limit,
			window_seconds: config.window_seconds,
		}
	}
}

/// Approximate sliding window: any request after a full idle window resets
/// the count. A production-grade ring of sub-windows would tighten this.
fn check_sliding_window(
	config: &RateLimitConfig,
	state: &mut KeyState,
	cost: u64,
	now: DateTime<Utc>,
) -> RateLimitDecision {
	if state.last_request < now - seconds(config.window_seconds) {
		state.current_count = 0;
	}
	let reset_time = now + seconds(config.window_seconds);
	if state.current_count + cost <= config.limit {
		state.current_count += cost;
		RateLimitDecision {
			allowed: true,
			remaining: config.limit - state.current_count,
			reset_time,
			retry_after: None,
			limit: config.limit,
			window_seconds: config.window_seconds,
		}
	} else {
		RateLimitDecision {
			allowed: false,
			remaining: config.limit.saturating_sub(state.current_count),
			reset_time,
			retry_after: Some(config.window_seconds),
			limit: config.limit,
			window_seconds: config.window_seconds,
		}
	}
}

fn check_token_bucket(
	config: &RateLimitConfig,
	state: &mut KeyState,
	cost: u64,
	now: DateTime<Utc>,
) -> RateLimitDecision {
	let rate = config.limit as f64 / config.window_seconds as f64;
	let elapsed = (now - state.last_request).num_milliseconds().max(0) as f64 / 1000.0;
	state.level = (state.level + elapsed * rate).min(config.limit as f64);

	let reset_time = now + seconds(config.window_seconds);
	if state.level >= cost as f64 {
		state.level -= cost as f64;
		RateLimitDecision {
			allowed: true,
			remaining: state.level as u64,
			reset_time,
			retry_after: None,
			limit: config.limit,
			window_seconds: config.window_seconds,
		}
	} else {
		RateLimitDecision {
			allowed: false,
			remaining: state.level as u64,
			reset_time,
			retry_after: Some(((cost as f64 - state.level) / rate).ceil() as u64),
			limit: config.limit,
			window_seconds: config.window_seconds,
		}
	}
}

fn check_leaky_bucket(
	config: &RateLimitConfig,
	state: &mut KeyState,
	cost: u64,
	now: DateTime<Utc>,
) -> RateLimitDecision {
	let rate = config.limit as f64 / config.window_seconds as f64;
	let elapsed = (now - state.last_request).num_milliseconds().max(0) as f64 / 1000.0;
	state.level = (state.level - elapsed * rate).max(0.0);

	let reset_time = now + seconds(config.window_seconds);
	if state.level + cost as f64 <= config.limit as f64 {
		state.level += cost as f64;
		RateLimitDecision {
			allowed: true,
			remaining: (config.limit as f64 - state.level) as u64,
			reset_time,
			retry_after: None,
			limit: config.limit,
			window_seconds: config.window_seconds,
		}
	} else {
		let headroom = config.limit as f64 - state.level;
		RateLimitDecision {
			allowed: false,
			remaining: headroom.max(0.0) as u64,
			reset_time,
			retry_after: Some(((cost as f64 - headroom) / rate).ceil().max(0.0) as u64),
			limit: config.limit,
			window_seconds: config.window_seconds,
		}
	}
}

/// Identity a request is rate limited under at the edge: the presented api
/// key when there is one, otherwise the client address. The middleware runs
/// before any identity resolution, so user-scoped keys come from the call
/// pipeline instead, where caller identities are resolved.
pub fn request_rate_key(request: &Request) -> String {
	if let Some(key) = request
		.headers()
		.get("x-api-key")
		.and_then(|v| v.to_str().ok())
	{
		return format!("api_key:{}", key);
	}
	match request.extensions().get::<ConnectInfo<SocketAddr>>() {
		Some(ConnectInfo(addr)) => format!("ip:{}", addr.ip()),
		None => "ip:unknown".to_string(),
	}
}

pub async fn rate_limit_middleware(
	State(limiter): State<Arc<RateLimiter>>,
	request: Request,
	next: Next,
) -> Response {
	let key = request_rate_key(&request);
	let decision = limiter.check(&key, 1);
	if !decision.allowed {
		warn!(%key, "request rejected by rate limiter");
		return ProxyError::RateLimitExceeded {
			limit: decision.limit,
			remaining: decision.remaining,
			reset_time: decision.reset_time,
			retry_after: decision.retry_after,
		}
		.into_response();
	}
	let mut response = next.run(request).await;
	let headers = response.headers_mut();
	if let Ok(value) = http::HeaderValue::from_str(&decision.limit.to_string()) {
		headers.insert("x-ratelimit-limit", value);
	}
	if let Ok(value) = http::HeaderValue::from_str(&decision.remaining.to_string()) {
		headers.insert("x-ratelimit-remaining", value);
	}
	if let Ok(value) = http::HeaderValue::from_str(&decision.reset_time.to_rfc3339()) {
		headers.insert("x-ratelimit-reset", value);
	}
	response
}
