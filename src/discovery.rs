use crate::config::{SecurityLevel, UpstreamConfig};
use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

// Token accepted as proof that a probed endpoint speaks the tool protocol.
const IDENTIFYING_TOKEN: &str = "mcp";

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DiscoveryConfig {
	#[serde(default = "default_true")]
	pub network_discovery: bool,
	#[serde(default)]
	pub service_discovery: bool,
	#[serde(default = "default_true")]
	pub file_discovery: bool,
	#[serde(default = "default_ports")]
	pub ports: Vec<u16>,
	#[serde(default = "default_base_urls")]
	pub base_urls: Vec<String>,
	#[serde(default = "default_config_paths")]
	pub config_paths: Vec<PathBuf>,
	#[serde(default)]
	pub service_endpoints: Vec<String>,
	/// Seconds before a probe is abandoned.
	#[serde(default = "default_probe_timeout")]
	pub timeout: u64,
	/// Probe parallelism for the network scan.
	#[serde(default = "default_max_concurrent")]
	pub max_concurrent: usize,
}

fn default_true() -> bool {
	true
}

fn default_ports() -> Vec<u16> {
	vec![8001, 8002, 8003, 8004, 8005]
}

fn default_base_urls() -> Vec<String> {
	vec![
		"http://localhost".to_string(),
		"http://127.0.0.1".to_string(),
	]
}

fn default_config_paths() -> Vec<PathBuf> {
	vec![
		PathBuf::from("./mcp-servers.json"),
		PathBuf::from("./config/mcp-servers.json"),
	]
}

fn default_probe_timeout() -> u64 {
	5
}

fn default_max_concurrent() -> usize {
	10
}

impl Default for DiscoveryConfig {
	fn default() -> Self {
		Self {
			network_discovery: default_true(),
			service_discovery: false,
			file_discovery: default_true(),
			ports: default_ports(),
			base_urls: default_base_urls(),
			config_paths: default_config_paths(),
			service_endpoints: Vec::new(),
			timeout: default_probe_timeout(),
			max_concurrent: default_max_concurrent(),
		}
	}
}

/// Candidate-endpoint discovery: network scan, service endpoints and file
/// configs. Results are de-duplicated by endpoint.
pub struct Discovery {
	config: DiscoveryConfig,
	client: reqwest::Client,
}

impl Discovery {
	pub fn new(config: DiscoveryConfig) -> Self {
		let client = reqwest::Client::builder()
			.timeout(std::time::Duration::from_secs(config.timeout.max(1)))
			.build()
			.unwrap_or_default();
		Self { config, client }
	}

	pub async fn discover(&self) -> Vec<UpstreamConfig> {
		let mut candidates = Vec::new();
		if self.config.network_discovery {
			candidates.extend(self.discover_network().await);
		}
		if self.config.service_discovery {
			candidates.extend(self.discover_services().await);
		}
		if self.config.file_discovery {
			candidates.extend(self.discover_files());
		}

		let mut seen = HashSet::new();
		let mut unique = Vec::new();
		for candidate in candidates {
			if seen.insert(candidate.endpoint.clone()) {
				unique.push(candidate);
			}
		}
		info!(count = unique.len(), "discovery produced candidate upstreams");
		unique
	}

	/// Cartesian product of base urls and ports, probed under a semaphore.
	async fn discover_network(&self) -> Vec<UpstreamConfig> {
		let semaphore = Arc::new(Semaphore::new(self.config.max_concurrent.max(1)));
		let mut probes = Vec::new();
		for base in &self.config.base_urls {
			for port in &self.config.ports {
				let endpoint = format!("{}:{}", base, port);
				let semaphore = semaphore.clone();
				let port = *port;
				probes.push(async move {
					let _permit = semaphore.acquire().await.ok()?;
					if self.probe_endpoint(&endpoint).await {
						let mut config = UpstreamConfig::new(
							format!("discovered-{}", port),
							endpoint,
							TransportKind::Http,
						);
						config.description = format!("Discovered tool server on port {}", port);
						config.categories = vec!["discovered".to_string()];
						config.security_level = SecurityLevel::Unknown;
						Some(config)
					} else {
						None
					}
				});
			}
		}
		futures::future::join_all(probes)
			.await
			.into_iter()
			.flatten()
			.collect()
	}

	async fn discover_services(&self) -> Vec<UpstreamConfig> {
		let mut discovered = Vec::new();
		for (index, endpoint) in self.config.service_endpoints.iter().enumerate() {
			if self.probe_endpoint(endpoint).await {
				let mut config = UpstreamConfig::new(
					format!("service-{}", index),
					endpoint.clone(),
					TransportKind::Http,
				);
				config.categories = vec!["service".to_string()];
				config.security_level = SecurityLevel::Unknown;
				discovered.push(config);
			}
		}
		discovered
	}

	/// Parse JSON arrays of upstream configs. Missing files and malformed
	/// entries are skipped, never fatal.
	fn discover_files(&self) -> Vec<UpstreamConfig> {
		let mut discovered = Vec::new();
		for path in &self.config.config_paths {
			let raw = match std::fs::read_to_string(path) {
				Ok(raw) => raw,
				Err(_) => continue,
			};
			match serde_json::from_str::<Vec<UpstreamConfig>>(&raw) {
				Ok(configs) => {
					debug!(path = %path.display(), count = configs.len(), "loaded upstream config file");
					discovered.extend(configs);
				},
				Err(e) => {
					warn!(path = %path.display(), "skipping upstream config file: {}", e);
				},
			}
		}
		discovered
	}

	/// An endpoint qualifies when `POST /tools/list` or `GET /health`
	/// succeeds, or when the health body carries the identifying token.
	pub async fn probe_endpoint(&self, endpoint: &str) -> bool {
		if let Ok(response) = self
			.client
			.post(format!("{}/tools/list", endpoint))
			.json(&serde_json::json!({}))
			.send()
			.await
		{
			if response.status() == reqwest::StatusCode::OK {
				return true;
			}
		}
		if let Ok(response) = self.client.get(format!("{}/health", endpoint)).send().await {
			if response.status() == reqwest::StatusCode::OK {
				return true;
			}
			if let Ok(body) = response.text().await {
				if body.to_lowercase().contains(IDENTIFYING_TOKEN) {
					return true;
				}
			}
		}
		false
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	fn config_with(paths: Vec<PathBuf>) -> DiscoveryConfig {
		DiscoveryConfig {
			network_discovery: false,
			service_discovery: false,
			file_discovery: true,
			config_paths: paths,
			..DiscoveryConfig::default()
		}
	}

	#[tokio::test]
	async fn file_discovery_parses_and_deduplicates() {
		let dir = std::env::temp_dir().join(format!("relay-discovery-{}", uuid::Uuid::new_v4()));
		std::fs::create_dir_all(&dir).unwrap();
		let file_a = dir.join("a.json");
		let file_b = dir.join("b.json");
		std::fs::write(
			&file_a,
			r#"[{"endpoint": "http://localhost:8001", "name": "db"},
			   {"endpoint": "ws://localhost:8002", "transport": "websocket"}]"#,
		)
		.unwrap();
		// Same endpoint again plus a malformed file entry elsewhere.
		std::fs::write(&file_b, r#"[{"endpoint": "http://localhost:8001"}]"#).unwrap();

		let discovery = Discovery::new(config_with(vec![file_a, file_b, dir.join("missing.json")]));
		let candidates = discovery.discover().await;
		assert_eq!(candidates.len(), 2);
		assert_eq!(candidates[0].endpoint, "http://localhost:8001");
		assert_eq!(candidates[1].transport, TransportKind::Websocket);
		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[tokio::test]
	async fn malformed_config_files_are_skipped() {
		let dir = std::env::temp_dir().join(format!("relay-discovery-{}", uuid::Uuid::new_v4()));
		std::fs::create_dir_all(&dir).unwrap();
		let file = dir.join("broken.json");
		std::fs::write(&file, "{not an array").unwrap();
		let discovery = Discovery::new(config_with(vec![file]));
		assert!(discovery.discover().await.is_empty());
		std::fs::remove_dir_all(&dir).unwrap();
	}

	#[tokio::test]
	async fn probe_accepts_tools_list_health_or_token() {
		let by_tools = MockServer::start().await;
		Mock::given(method("POST"))
			.and(path("/tools/list"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"tools": []})))
			.mount(&by_tools)
			.await;

		let by_health = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/health"))
			.respond_with(ResponseTemplate::new(200))
			.mount(&by_health)
			.await;

		let by_token = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/health"))
			.respond_with(ResponseTemplate::new(503).set_body_string("mcp tool server starting"))
			.mount(&by_token)
			.await;

		let neither = MockServer::start().await;

		let discovery = Discovery::new(DiscoveryConfig::default());
		assert!(discovery.probe_endpoint(&by_tools.uri()).await);
		assert!(discovery.probe_endpoint(&by_health.uri()).await);
		assert!(discovery.probe_endpoint(&by_token.uri()).await);
		assert!(!discovery.probe_endpoint(&neither.uri()).await);
	}

	#[tokio::test]
	async fn network_scan_finds_a_live_port() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/health"))
			.respond_with(ResponseTemplate::new(200))
			.mount(&server)
			.await;
		let uri = url::Url::parse(&server.uri()).unwrap();

		let config = DiscoveryConfig {
			network_discovery: true,
			file_discovery: false,
			base_urls: vec![format!("{}://{}", uri.scheme(), uri.host_str().unwrap())],
			ports: vec![uri.port().unwrap(), 1],
			timeout: 2,
			..DiscoveryConfig::default()
		};
		let discovery = Discovery::new(config);
		let candidates = discovery.discover().await;
		assert_eq!(candidates.len(), 1);
		assert!(candidates[0].id.starts_with("discovered-"));
		assert_eq!(candidates[0].categories, vec!["discovered".to_string()]);
	}
}
