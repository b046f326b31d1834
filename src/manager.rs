use crate::balancer::LoadBalancer;
use crate::config::{LocalConfig, SecurityLevel, UpstreamConfig};
use crate::discovery::Discovery;
use crate::errors::ProxyError;
use crate::health::{Probe, ServerStatus};
use crate::limits::ResourceLimitManager;
use crate::policy::PolicyEngine;
use crate::ratelimit::RateLimiter;
use crate::relay::{Relay, metrics::Metrics};
use crate::transport::{PluginRegistry, TransportKind};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

const HEALTH_ROLLUP_PERIOD: std::time::Duration = std::time::Duration::from_secs(30);

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerInfo {
	pub id: String,
	pub name: String,
	pub endpoint: String,
	pub transport: TransportKind,
	pub status: ServerStatus,
	pub last_seen: DateTime<Utc>,
	pub tool_count: usize,
	pub categories: Vec<String>,
	pub security_level: SecurityLevel,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthSummary {
	pub status: ServerStatus,
	pub last_seen: Option<DateTime<Utc>>,
	pub healthy: bool,
}

/// Composition root: owns the relay, the load balancer and the discovery
/// client, and drives upstream lifecycle.
pub struct ProxyManager {
	relay: Arc<Relay>,
	balancer: Arc<LoadBalancer>,
	policy: Arc<PolicyEngine>,
	rate_limiter: Arc<RateLimiter>,
	limits: Arc<ResourceLimitManager>,
	discovery: Option<Discovery>,
	last_seen: RwLock<HashMap<String, DateTime<Utc>>>,
	ct: CancellationToken,
}

impl ProxyManager {
	pub fn new(config: &LocalConfig, registry: Arc<PluginRegistry>, metrics: Arc<Metrics>) -> Self {
		let policy = Arc::new(PolicyEngine::new(config.policy.clone()));
		let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
		let limits = Arc::new(ResourceLimitManager::default());
		let balancer = Arc::new(LoadBalancer::new(config.strategy));
		let relay = Arc::new(Relay::new(
			registry,
			policy.clone(),
			rate_limiter.clone(),
			limits.clone(),
			metrics,
			Some(balancer.clone()),
		));
		Self {
			relay,
			balancer,
			policy,
			rate_limiter,
			limits,
			discovery: config.discovery.clone().map(Discovery::new),
			last_seen: RwLock::new(HashMap::new()),
			ct: CancellationToken::new(),
		}
	}

	/// Load configured upstreams, start background enforcement and health
	/// checking, and kick off the periodic health roll-up.
	pub async fn initialize(self: &Arc<Self>, configured: Vec<UpstreamConfig>) -> Result<(), ProxyError> {
		self.policy.initialize().await?;
		self.rate_limiter.spawn_gc();
		self.limits.spawn_monitor();

		for upstream in configured {
			let name = upstream.name.clone();
			if let Err(e) = self.register(upstream).await {
				warn!(upstream = %name, "failed to register configured upstream: {}", e);
			}
		}
		self.balancer.start().await;

		let manager = self.clone();
		let ct = self.ct.clone();
		tokio::spawn(async move {
			let mut ticker = tokio::time::interval(HEALTH_ROLLUP_PERIOD);
			ticker.tick().await;
			loop {
				tokio::select! {
					_ = ticker.tick() => {
						manager.health_check().await;
					}
					_ = ct.cancelled() => break,
				}
			}
		});
		info!("proxy manager initialized");
		Ok(())
	}

	/// Register one upstream with the relay and schedule its health checker.
	pub async fn register(&self, config: UpstreamConfig) -> Result<String, ProxyError> {
		let id = self.relay.register(config).await?;
		let config = self
			.relay
			.get_upstream(&id)
			.await
			.ok_or_else(|| ProxyError::Internal(format!("upstream {} vanished", id)))?;
		let stdio_liveness = self.relay.stdio_liveness(&id).await;
		let probe = Probe::for_upstream(&config, stdio_liveness);
		if let Err(e) = self.balancer.add_server(config, probe).await {
			// Keep relay and balancer membership in lockstep.
			let _ = self.relay.unregister(&id).await;
			return Err(e);
		}
		self.last_seen.write().await.insert(id.clone(), Utc::now());
		Ok(id)
	}

	/// Unregister an upstream: stop its health checker and close its pooled
	/// connection.
	pub async fn unregister(&self, id: &str) -> Result<(), ProxyError> {
		self.balancer.remove_server(id).await;
		self.relay.unregister(id).await?;
		self.last_seen.write().await.remove(id);
		Ok(())
	}

	/// Run discovery and register candidates in the background; individual
	/// failures are logged, never fatal.
	pub async fn discover(self: &Arc<Self>) -> Vec<UpstreamConfig> {
		let Some(discovery) = &self.discovery else {
			return Vec::new();
		};
		let known: Vec<String> = self
			.relay
			.list_upstreams()
			.await
			.into_iter()
			.map(|u| u.endpoint)
			.collect();
		let candidates: Vec<UpstreamConfig> = discovery
			.discover()
			.await
			.into_iter()
			.filter(|candidate| !known.contains(&candidate.endpoint))
			.collect();

		let manager = self.clone();
		let to_register = candidates.clone();
		tokio::spawn(async move {
			for candidate in to_register {
				let endpoint = candidate.endpoint.clone();
				match manager.register(candidate).await {
					Ok(id) => info!(upstream = %id, %endpoint, "registered discovered upstream"),
					Err(e) => warn!(%endpoint, "discovered upstream not registered: {}", e),
				}
			}
		});
		candidates
	}

	pub async fn server_info(&self, id: &str) -> Option<ServerInfo> {
		let config = self.relay.get_upstream(id).await?;
		let health = self.balancer.get_server_health(id).await;
		let status = health
			.as_ref()
			.map(|h| h.status)
			.unwrap_or(ServerStatus::Offline);
		let last_seen = self
			.last_seen
			.read()
			.await
			.get(id)
			.copied()
			.unwrap_or_else(Utc::now);
		Some(ServerInfo {
			id: config.id.clone(),
			name: config.name.clone(),
			endpoint: config.endpoint.clone(),
			transport: config.transport,
			status,
			last_seen,
			tool_count: self.relay.tool_count(id).await,
			categories: config.categories.clone(),
			security_level: config.security_level,
		})
	}

	pub async fn list_servers(&self) -> Vec<ServerInfo> {
		let mut servers = Vec::new();
		for upstream in self.relay.list_upstreams().await {
			if let Some(info) = self.server_info(&upstream.id).await {
				servers.push(info);
			}
		}
		servers
	}

	/// Per-upstream health roll-up.
	pub async fn health_check(&self) -> HashMap<String, HealthSummary> {
		let mut results = HashMap::new();
		let mut last_seen = self.last_seen.write().await;
		for (id, health) in self.balancer.all_health().await {
			let healthy = health.status == ServerStatus::Healthy;
			if healthy {
				last_seen.insert(id.clone(), Utc::now());
			}
			results.insert(
				id.clone(),
				HealthSummary {
					status: health.status,
					last_seen: last_seen.get(&id).copied(),
					healthy,
				},
			);
		}
		results
	}

	pub fn relay(&self) -> Arc<Relay> {
		self.relay.clone()
	}

	pub fn balancer(&self) -> Arc<LoadBalancer> {
		self.balancer.clone()
	}

	pub fn policy(&self) -> Arc<PolicyEngine> {
		self.policy.clone()
	}

	pub fn rate_limiter(&self) -> Arc<RateLimiter> {
		self.rate_limiter.clone()
	}

	pub fn limits(&self) -> Arc<ResourceLimitManager> {
		self.limits.clone()
	}

	pub async fn shutdown(&self) {
		self.ct.cancel();
		self.balancer.stop().await;
		self.rate_limiter.shutdown();
		self.limits.shutdown();
		for upstream in self.relay.list_upstreams().await {
			let _ = self.relay.unregister(&upstream.id).await;
		}
		info!("proxy manager shut down");
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::discovery::DiscoveryConfig;
	use prometheus_client::registry::Registry;
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	async fn mock_upstream() -> MockServer {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/health"))
			.respond_with(ResponseTemplate::new(200))
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.and(path("/tools/list"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"tools": [{"name": "query", "inputSchema": {}}],
			})))
			.mount(&server)
			.await;
		server
	}

	fn manager_for(config: &LocalConfig) -> Arc<ProxyManager> {
		let mut registry = Registry::default();
		Arc::new(ProxyManager::new(
			config,
			Arc::new(PluginRegistry::new()),
			Arc::new(Metrics::new(&mut registry)),
		))
	}

	#[tokio::test]
	async fn initialize_registers_configured_upstreams_and_survives_failures() {
		let server = mock_upstream().await;
		let mut good = UpstreamConfig::new("good", server.uri(), TransportKind::Http);
		good.health_check_interval = 1;
		let mut bad = UpstreamConfig::new("bad", "http://127.0.0.1:1", TransportKind::Http);
		bad.timeout = 1;

		let config = LocalConfig::default();
		let manager = manager_for(&config);
		manager.initialize(vec![good, bad]).await.unwrap();

		let servers = manager.list_servers().await;
		assert_eq!(servers.len(), 1);
		assert_eq!(servers[0].id, "good");
		assert_eq!(servers[0].tool_count, 1);
		manager.shutdown().await;
	}

	#[tokio::test]
	async fn health_check_returns_a_per_upstream_summary() {
		let server = mock_upstream().await;
		let mut upstream = UpstreamConfig::new("srv", server.uri(), TransportKind::Http);
		upstream.health_check_interval = 1;
		upstream.recovery_threshold = 1;

		let config = LocalConfig::default();
		let manager = manager_for(&config);
		manager.initialize(vec![upstream]).await.unwrap();

		// Give the checker time for its first probe.
		tokio::time::sleep(std::time::Duration::from_millis(400)).await;
		let health = manager.health_check().await;
		let summary = health.get("srv").unwrap();
		assert!(summary.healthy);
		assert_eq!(summary.status, ServerStatus::Healthy);
		assert!(summary.last_seen.is_some());
		manager.shutdown().await;
	}

	#[tokio::test]
	async fn unregister_tears_down_checker_and_tools() {
		let server = mock_upstream().await;
		let upstream = UpstreamConfig::new("srv", server.uri(), TransportKind::Http);
		let config = LocalConfig::default();
		let manager = manager_for(&config);
		manager.initialize(vec![upstream]).await.unwrap();

		manager.unregister("srv").await.unwrap();
		assert!(manager.server_info("srv").await.is_none());
		assert!(manager.health_check().await.is_empty());
		assert!(manager.relay().list_tools().await.is_empty());
		manager.shutdown().await;
	}

	#[tokio::test]
	async fn discovery_skips_known_endpoints_and_registers_new_ones() {
		let server = mock_upstream().await;
		let uri = url::Url::parse(&server.uri()).unwrap();

		let mut config = LocalConfig::default();
		config.discovery = Some(DiscoveryConfig {
			network_discovery: true,
			file_discovery: false,
			base_urls: vec![format!("{}://{}", uri.scheme(), uri.host_str().unwrap())],
			ports: vec![uri.port().unwrap()],
			timeout: 2,
			..DiscoveryConfig::default()
		});
		let manager = manager_for(&config);
		manager.initialize(vec![]).await.unwrap();

		let candidates = manager.discover().await;
		assert_eq!(candidates.len(), 1);

		// Wait for the background registration to land.
		tokio::time::sleep(std::time::Duration::from_millis(500)).await;
		assert_eq!(manager.list_servers().await.len(), 1);

		// A second sweep sees the endpoint as known.
		assert!(manager.discover().await.is_empty());
		manager.shutdown().await;
	}
}
