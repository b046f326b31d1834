use crate::config::UpstreamConfig;
use crate::transport::TransportKind;
use crate::transport::websocket::WebSocketTransport;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServerStatus {
	Healthy,
	Degraded,
	Unhealthy,
	Offline,
	Maintenance,
}

/// Health counters for one upstream. Written only by the upstream's own
/// checker task; everyone else reads snapshots.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthState {
	pub server_id: String,
	pub status: ServerStatus,
	pub last_check: Option<DateTime<Utc>>,
	/// Seconds taken by the most recent probe.
	pub response_time: f64,
	pub error_count: u64,
	pub success_count: u64,
	pub consecutive_failures: u32,
	pub consecutive_successes: u32,
	pub total_requests: u64,
	pub active_connections: u32,
}

impl HealthState {
	fn new(server_id: String) -> Self {
		Self {
			server_id,
			status: ServerStatus::Offline,
			last_check: None,
			response_time: 0.0,
			error_count: 0,
			success_count: 0,
			consecutive_failures: 0,
			consecutive_successes: 0,
			total_requests: 0,
			active_connections: 0,
		}
	}
}

/// Transport-appropriate liveness probe. Stdio upstreams are observed
/// through the liveness flag owned by their pooled child process.
#[derive(Clone)]
pub enum Probe {
	Http { url: String, timeout: Duration },
	WebSocket { url: String, timeout: Duration },
	Stdio { alive: Arc<AtomicBool> },
}

impl Probe {
	pub fn for_upstream(config: &UpstreamConfig, stdio_liveness: Option<Arc<AtomicBool>>) -> Self {
		match config.transport {
			TransportKind::Http => Probe::Http {
				url: format!("{}/health", config.endpoint),
				timeout: config.health_timeout(),
			},
			TransportKind::Websocket => Probe::WebSocket {
				url: config.endpoint.clone(),
				timeout: config.health_timeout(),
			},
			TransportKind::Stdio => Probe::Stdio {
				alive: stdio_liveness.unwrap_or_else(|| Arc::new(AtomicBool::new(false))),
			},
		}
	}

	async fn run(&self) -> bool {
		match self {
			Probe::Http { url, timeout } => {
				let client = match reqwest::Client::builder().timeout(*timeout).build() {
					Ok(client) => client,
					Err(_) => return false,
				};
				match client.get(url).send().await {
					Ok(response) => response.status() == reqwest::StatusCode::OK,
					Err(e) => {
						debug!(%url, "http health probe failed: {}", e);
						false
					},
				}
			},
			Probe::WebSocket { url, timeout } => WebSocketTransport::probe(url, *timeout).await,
			Probe::Stdio { alive } => alive.load(Ordering::Relaxed),
		}
	}
}

/// Periodic health checking for one upstream. Exactly one probe task per
/// upstream; stop is cooperative within one probe period.
pub struct HealthChecker {
	config: UpstreamConfig,
	state: Arc<RwLock<HealthState>>,
	probe: Probe,
	ct: CancellationToken,
	task: Option<JoinHandle<()>>,
}

impl HealthChecker {
	pub fn new(config: UpstreamConfig, probe: Probe) -> Self {
		let state = Arc::new(RwLock::new(HealthState::new(config.id.clone())));
		Self {
			config,
			state,
			probe,
			ct: CancellationToken::new(),
			task: None,
		}
	}

	pub fn start(&mut self) {
		if self.task.is_some() {
			return;
		}
		let config = self.config.clone();
		let state = self.state.clone();
		let probe = self.probe.clone();
		let ct = self.ct.clone();
		self.task = Some(tokio::spawn(async move {
			let mut ticker = tokio::time::interval(config.health_interval());
			ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
			loop {
				tokio::select! {
					_ = ticker.tick() => {
						let started = Instant::now();
						let ok = tokio::select! {
							ok = probe.run() => ok,
							_ = ct.cancelled() => break,
						};
						record_probe(&config, &state, ok, started.elapsed());
					}
					_ = ct.cancelled() => break,
				}
			}
			debug!(upstream = %config.id, "health checker stopped");
		}));
		info!(upstream = %self.config.id, "started health checker");
	}

	pub fn stop(&mut self) {
		self.ct.cancel();
		if let Some(task) = self.task.take() {
			task.abort();
		}
		info!(upstream = %self.config.id, "stopped health checker");
	}

	pub fn snapshot(&self) -> HealthState {
		self.state.read().unwrap().clone()
	}

	pub fn set_connection_count(&self, count: u32) {
		self.state.write().unwrap().active_connections = count;
	}

	pub fn record_request(&self) {
		self.state.write().unwrap().total_requests += 1;
	}

	pub fn config(&self) -> &UpstreamConfig {
		&self.config
	}

	#[cfg(test)]
	pub fn state_handle(&self) -> Arc<RwLock<HealthState>> {
		self.state.clone()
	}
}

impl Drop for HealthChecker {
	fn drop(&mut self) {
		self.ct.cancel();
		if let Some(task) = self.task.take() {
			task.abort();
		}
	}
}

fn record_probe(
	config: &UpstreamConfig,
	state: &Arc<RwLock<HealthState>>,
	ok: bool,
	elapsed: Duration,
) {
	let mut state = state.write().unwrap();
	state.last_check = Some(Utc::now());
	state.response_time = elapsed.as_secs_f64();
	if ok {
		state.success_count += 1;
		state.consecutive_successes += 1;
		state.consecutive_failures = 0;
		if state.status != ServerStatus::Healthy
			&& state.consecutive_successes >= config.recovery_threshold
		{
			state.status = ServerStatus::Healthy;
			info!(upstream = %config.id, "upstream is now healthy");
		}
	} else {
		state.error_count += 1;
		state.consecutive_failures += 1;
		state.consecutive_successes = 0;
		if state.status != ServerStatus::Unhealthy
			&& state.consecutive_failures >= config.failover_threshold
		{
			state.status = ServerStatus::Unhealthy;
			warn!(upstream = %config.id, "upstream is now unhealthy");
		}
	}
}
