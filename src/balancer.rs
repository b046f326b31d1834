use crate::config::UpstreamConfig;
use crate::errors::ProxyError;
use crate::health::{HealthChecker, HealthState, Probe, ServerStatus};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadBalancingStrategy {
	RoundRobin,
	LeastConnections,
	WeightedRoundRobin,
	LeastResponseTime,
	IpHash,
	ConsistentHash,
}

impl Default for LoadBalancingStrategy {
	fn default() -> Self {
		LoadBalancingStrategy::RoundRobin
	}
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalancerStatistics {
	pub strategy: LoadBalancingStrategy,
	pub total_servers: usize,
	pub healthy_servers: usize,
	pub unhealthy_servers: usize,
	pub total_connections: u64,
	pub total_requests: u64,
}

struct ServerEntry {
	config: UpstreamConfig,
	checker: HealthChecker,
}

struct Inner {
	// Insertion order is the tie-break for every strategy, so entries live
	// in a Vec rather than a map.
	servers: Vec<ServerEntry>,
	current_index: u64,
	running: bool,
}

/// Strategy-based selection over healthy upstreams. Owns the per-upstream
/// health checkers exclusively.
pub struct LoadBalancer {
	strategy: LoadBalancingStrategy,
	inner: RwLock<Inner>,
}

impl LoadBalancer {
	pub fn new(strategy: LoadBalancingStrategy) -> Self {
		Self {
			strategy,
			inner: RwLock::new(Inner {
				servers: Vec::new(),
				current_index: 0,
				running: false,
			}),
		}
	}

	pub fn strategy(&self) -> LoadBalancingStrategy {
		self.strategy
	}

	pub async fn add_server(&self, config: UpstreamConfig, probe: Probe) -> Result<(), ProxyError> {
		config.validate()?;
		let mut inner = self.inner.write().await;
		if inner.servers.iter().any(|s| s.config.id == config.id) {
			return Err(ProxyError::Validation(format!(
				"upstream {} already registered",
				config.id
			)));
		}
		let mut checker = HealthChecker::new(config.clone(), probe);
		if inner.running {
			checker.start();
		}
		info!(upstream = %config.id, "added server to load balancer");
		inner.servers.push(ServerEntry { config, checker });
		Ok(())
	}

	pub async fn remove_server(&self, id: &str) -> bool {
		let mut inner = self.inner.write().await;
		match inner.servers.iter().position(|s| s.config.id == id) {
			Some(index) => {
				let mut entry = inner.servers.remove(index);
				entry.checker.stop();
				info!(upstream = %id, "removed server from load balancer");
				true
			},
			None => false,
		}
	}

	pub async fn start(&self) {
		let mut inner = self.inner.write().await;
		if inner.running {
			return;
		}
		inner.running = true;
		for entry in inner.servers.iter_mut() {
			entry.checker.start();
		}
		info!("load balancer started");
	}

	pub async fn stop(&self) {
		let mut inner = self.inner.write().await;
		if !inner.running {
			return;
		}
		inner.running = false;
		for entry in inner.servers.iter_mut() {
			entry.checker.stop();
		}
		info!("load balancer stopped");
	}

	/// Pick an upstream among the enabled + healthy set, or `None` when the
	/// set is empty.
	pub async fn get_server(&self, client_key: Option<&str>) -> Option<UpstreamConfig> {
		let mut inner = self.inner.write().await;
		let healthy: Vec<(usize, UpstreamConfig, HealthState)> = inner
			.servers
			.iter()
			.enumerate()
			.filter(|(_, s)| s.config.enabled)
			.map(|(i, s)| (i, s.config.clone(), s.checker.snapshot()))
			.filter(|(_, _, health)| health.status == ServerStatus::Healthy)
			.collect();
		if healthy.is_empty() {
			warn!("no healthy upstreams available");
			return None;
		}

		let selected = match self.strategy {
			LoadBalancingStrategy::RoundRobin => {
				let index = (inner.current_index as usize) % healthy.len();
				inner.current_index += 1;
				healthy[index].1.clone()
			},
			LoadBalancingStrategy::WeightedRoundRobin => {
				let total_weight: u64 = healthy.iter().map(|(_, c, _)| c.weight as u64).sum();
				let mut remaining = (inner.current_index % total_weight) as i64;
				inner.current_index += 1;
				let mut pick = &healthy[0].1;
				for (_, config, _) in &healthy {
					remaining -= config.weight as i64;
					if remaining < 0 {
						pick = config;
						break;
					}
				}
				pick.clone()
			},
			LoadBalancingStrategy::LeastConnections => {
				healthy
					.iter()
					.min_by_key(|(_, _, health)| health.active_connections)
					.map(|(_, config, _)| config.clone())
					.unwrap()
			},
			LoadBalancingStrategy::LeastResponseTime => {
				healthy
					.iter()
					.min_by(|(_, _, a), (_, _, b)| {
						a.response_time
							.partial_cmp(&b.response_time)
							.unwrap_or(std::cmp::Ordering::Equal)
					})
					.map(|(_, config, _)| config.clone())
					.unwrap()
			},
			LoadBalancingStrategy::IpHash => {
				let key = match client_key {
					Some(key) => key,
					None => return Some(healthy[0].1.clone()),
				};
				let index = (stable_hash(key) as usize) % healthy.len();
				healthy[index].1.clone()
			},
			LoadBalancingStrategy::ConsistentHash => {
				let key = match client_key {
					Some(key) => key,
					None => return Some(healthy[0].1.clone()),
				};
				consistent_hash_select(&healthy, key)
			},
		};
		Some(selected)
	}

	pub async fn get_server_health(&self, id: &str) -> Option<HealthState> {
		let inner = self.inner.read().await;
		inner
			.servers
			.iter()
			.find(|s| s.config.id == id)
			.map(|s| s.checker.snapshot())
	}

	pub async fn all_health(&self) -> HashMap<String, HealthState> {
		let inner = self.inner.read().await;
		inner
			.servers
			.iter()
			.map(|s| (s.config.id.clone(), s.checker.snapshot()))
			.collect()
	}

	pub async fn update_server_connection_count(&self, id: &str, count: u32) {
		let inner = self.inner.read().await;
		if let Some(entry) = inner.servers.iter().find(|s| s.config.id == id) {
			entry.checker.set_connection_count(count);
		}
	}

	pub async fn record_request(&self, id: &str) {
		let inner = self.inner.read().await;
		if let Some(entry) = inner.servers.iter().find(|s| s.config.id == id) {
			entry.checker.record_request();
		}
	}

	pub async fn statistics(&self) -> BalancerStatistics {
		let inner = self.inner.read().await;
		let mut healthy = 0;
		let mut connections = 0u64;
		let mut requests = 0u64;
		for entry in &inner.servers {
			let health = entry.checker.snapshot();
			if entry.config.enabled && health.status == ServerStatus::Healthy {
				healthy += 1;
			}
			connections += health.active_connections as u64;
			requests += health.total_requests;
		}
		BalancerStatistics {
			strategy: self.strategy,
			total_servers: inner.servers.len(),
			healthy_servers: healthy,
			unhealthy_servers: inner.servers.len() - healthy,
			total_connections: connections,
			total_requests: requests,
		}
	}

	#[cfg(test)]
	pub async fn force_status(&self, id: &str, status: ServerStatus) {
		let inner = self.inner.read().await;
		if let Some(entry) = inner.servers.iter().find(|s| s.config.id == id) {
			entry.checker.state_handle().write().unwrap().status = status;
		}
	}
}

fn stable_hash(key: &str) -> u64 {
	let mut hasher = DefaultHasher::new();
	key.hash(&mut hasher);
	hasher.finish()
}

/// Three virtual nodes per upstream; the first virtual hash at or past the
/// client hash wins, wrapping around the ring.
fn consistent_hash_select(
	healthy: &[(usize, UpstreamConfig, HealthState)],
	key: &str,
) -> UpstreamConfig {
	let client_hash = stable_hash(key);
	let mut ring: Vec<(u64, &UpstreamConfig)> = healthy
		.iter()
		.flat_map(|(_, config, _)| {
			(0..3).map(move |i| (stable_hash(&format!("{}-{}", config.id, i)), config))
		})
		.collect();
	ring.sort_by_key(|(hash, _)| *hash);
	for (hash, config) in &ring {
		if *hash >= client_hash {
			return (*config).clone();
		}
	}
	ring[0].1.clone()
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::transport::TransportKind;
	use std::collections::HashSet;

	fn upstream(id: &str, weight: u32) -> UpstreamConfig {
		let mut cfg = UpstreamConfig::new(
			id,
			format!("http://localhost:8{}", id.len()),
			TransportKind::Http,
		);
		cfg.weight = weight;
		cfg
	}

	fn probe() -> Probe {
		Probe::Stdio {
			alive: std::sync::Arc::new(std::sync::atomic::AtomicBool::new(true)),
		}
	}

	async fn balancer_with(
		strategy: LoadBalancingStrategy,
		servers: &[(&str, u32)],
	) -> LoadBalancer {
		let balancer = LoadBalancer::new(strategy);
		for (id, weight) in servers {
			balancer.add_server(upstream(id, *weight), probe()).await.unwrap();
			balancer.force_status(id, ServerStatus::Healthy).await;
		}
		balancer
	}

	#[tokio::test]
	async fn duplicate_registration_is_rejected() {
		let balancer = LoadBalancer::new(LoadBalancingStrategy::RoundRobin);
		balancer.add_server(upstream("a", 1), probe()).await.unwrap();
		let err = balancer.add_server(upstream("a", 1), probe()).await.err().unwrap();
		assert!(matches!(err, ProxyError::Validation(_)));
	}

	#[tokio::test]
	async fn no_healthy_upstream_returns_none() {
		let balancer = LoadBalancer::new(LoadBalancingStrategy::RoundRobin);
		balancer.add_server(upstream("a", 1), probe()).await.unwrap();
		// Initial status is offline, so nothing is eligible.
		assert!(balancer.get_server(None).await.is_none());
	}

	#[tokio::test]
	async fn round_robin_visits_each_server_once_per_cycle() {
		let balancer = balancer_with(
			LoadBalancingStrategy::RoundRobin,
			&[("a", 1), ("b", 1), ("c", 1)],
		)
		.await;
		for _ in 0..4 {
			let mut seen = HashSet::new();
			for _ in 0..3 {
				seen.insert(balancer.get_server(None).await.unwrap().id);
			}
			assert_eq!(seen.len(), 3);
		}
	}

	#[tokio::test]
	async fn weighted_round_robin_distributes_by_weight() {
		let balancer = balancer_with(
			LoadBalancingStrategy::WeightedRoundRobin,
			&[("a", 1), ("b", 3)],
		)
		.await;
		let mut counts: HashMap<String, u32> = HashMap::new();
		for _ in 0..400 {
			let server = balancer.get_server(None).await.unwrap();
			*counts.entry(server.id).or_default() += 1;
		}
		let a = *counts.get("a").unwrap() as f64;
		let b = *counts.get("b").unwrap() as f64;
		// 1:3 split within five percent of total.
		assert!((a - 100.0).abs() <= 20.0, "a={}", a);
		assert!((b - 300.0).abs() <= 20.0, "b={}", b);
	}

	#[tokio::test]
	async fn least_connections_prefers_the_idle_server() {
		let balancer = balancer_with(
			LoadBalancingStrategy::LeastConnections,
			&[("a", 1), ("b", 1)],
		)
		.await;
		balancer.update_server_connection_count("a", 5).await;
		balancer.update_server_connection_count("b", 1).await;
		assert_eq!(balancer.get_server(None).await.unwrap().id, "b");

		balancer.update_server_connection_count("b", 9).await;
		assert_eq!(balancer.get_server(None).await.unwrap().id, "a");
	}

	#[tokio::test]
	async fn least_connections_tie_breaks_by_insertion_order() {
		let balancer = balancer_with(
			LoadBalancingStrategy::LeastConnections,
			&[("a", 1), ("b", 1)],
		)
		.await;
		assert_eq!(balancer.get_server(None).await.unwrap().id, "a");
	}

	#[tokio::test]
	async fn ip_hash_is_stable_for_a_client() {
		let balancer = balancer_with(LoadBalancingStrategy::IpHash, &[("a", 1), ("b", 1), ("c", 1)])
			.await;
		let first = balancer.get_server(Some("10.0.0.7")).await.unwrap().id;
		for _ in 0..10 {
			assert_eq!(balancer.get_server(Some("10.0.0.7")).await.unwrap().id, first);
		}
	}

	#[tokio::test]
	async fn consistent_hash_survives_unrelated_membership_changes() {
		let balancer = balancer_with(
			LoadBalancingStrategy::ConsistentHash,
			&[("a", 1), ("b", 1), ("c", 1)],
		)
		.await;
		let key = "client-42";
		let selected = balancer.get_server(Some(key)).await.unwrap().id;

		// Removing a server the key does not map to must not move the key.
		let victim = ["a", "b", "c"]
			.iter()
			.find(|id| **id != selected)
			.unwrap()
			.to_string();
		balancer.remove_server(&victim).await;
		assert_eq!(balancer.get_server(Some(key)).await.unwrap().id, selected);
	}

	#[tokio::test]
	async fn unhealthy_server_is_skipped_until_recovery() {
		let balancer = balancer_with(LoadBalancingStrategy::RoundRobin, &[("a", 1), ("b", 1)])
			.await;
		balancer.force_status("a", ServerStatus::Unhealthy).await;
		for _ in 0..5 {
			assert_eq!(balancer.get_server(None).await.unwrap().id, "b");
		}
		balancer.force_status("a", ServerStatus::Healthy).await;
		let mut seen = HashSet::new();
		for _ in 0..2 {
			seen.insert(balancer.get_server(None).await.unwrap().id);
		}
		assert_eq!(seen.len(), 2);
	}

	#[tokio::test]
	async fn statistics_aggregate_health_and_counts() {
		let balancer = balancer_with(LoadBalancingStrategy::RoundRobin, &[("a", 1), ("b", 1)])
			.await;
		balancer.force_status("b", ServerStatus::Unhealthy).await;
		balancer.update_server_connection_count("a", 4).await;
		balancer.record_request("a").await;
		balancer.record_request("a").await;

		let stats = balancer.statistics().await;
		assert_eq!(stats.total_servers, 2);
		assert_eq!(stats.healthy_servers, 1);
		assert_eq!(stats.unhealthy_servers, 1);
		assert_eq!(stats.total_connections, 4);
		assert_eq!(stats.total_requests, 2);
	}

	#[tokio::test]
	async fn register_then_unregister_restores_registry_state() {
		let balancer = balancer_with(LoadBalancingStrategy::RoundRobin, &[("a", 1)]).await;
		let before = balancer.statistics().await.total_servers;
		balancer.add_server(upstream("temp", 1), probe()).await.unwrap();
		assert!(balancer.remove_server("temp").await);
		assert_eq!(balancer.statistics().await.total_servers, before);
		assert!(balancer.get_server_health("temp").await.is_none());
	}
}
