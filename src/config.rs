use crate::balancer::LoadBalancingStrategy;
use crate::discovery::DiscoveryConfig;
use crate::errors::ProxyError;
use crate::policy::PolicyConfig;
use crate::ratelimit::RateLimitSettings;
use crate::transport::TransportKind;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SecurityLevel {
	Low,
	Medium,
	High,
	Unknown,
}

impl Default for SecurityLevel {
	fn default() -> Self {
		SecurityLevel::Unknown
	}
}

/// One upstream tool server fronted by the proxy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UpstreamConfig {
	/// Unique id; assigned at registration when empty.
	#[serde(default)]
	pub id: String,
	#[serde(default)]
	pub name: String,
	pub endpoint: String,
	#[serde(default)]
	pub transport: TransportKind,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub auth_token: Option<String>,
	#[serde(default)]
	pub security_level: SecurityLevel,
	#[serde(default)]
	pub categories: Vec<String>,
	#[serde(default)]
	pub description: String,
	#[serde(default = "default_enabled")]
	pub enabled: bool,
	#[serde(default = "default_weight")]
	pub weight: u32,
	#[serde(default = "default_max_connections")]
	pub max_connections: u32,
	/// Seconds between health probes.
	#[serde(default = "default_health_check_interval")]
	pub health_check_interval: u64,
	/// Seconds before a health probe is abandoned.
	#[serde(default = "default_health_check_timeout")]
	pub health_check_timeout: u64,
	/// Consecutive probe failures before the upstream turns unhealthy.
	#[serde(default = "default_failover_threshold")]
	pub failover_threshold: u32,
	/// Consecutive probe successes before the upstream recovers.
	#[serde(default = "default_recovery_threshold")]
	pub recovery_threshold: u32,
	/// Seconds before an outbound call is abandoned.
	#[serde(default = "default_timeout")]
	pub timeout: u64,
	#[serde(default = "default_retry_attempts")]
	pub retry_attempts: u32,
	#[serde(default)]
	pub metadata: HashMap<String, serde_json::Value>,
}

fn default_enabled() -> bool {
	true
}

fn default_weight() -> u32 {
	100
}

fn default_max_connections() -> u32 {
	1000
}

fn default_health_check_interval() -> u64 {
	30
}

fn default_health_check_timeout() -> u64 {
	5
}

fn default_failover_threshold() -> u32 {
	3
}

fn default_recovery_threshold() -> u32 {
	2
}

fn default_timeout() -> u64 {
	30
}

fn default_retry_attempts() -> u32 {
	3
}

impl UpstreamConfig {
	pub fn new(id: impl Into<String>, endpoint: impl Into<String>, transport: TransportKind) -> Self {
		let id = id.into();
		Self {
			name: id.clone(),
			id,
			endpoint: endpoint.into(),
			transport,
			auth_token: None,
			security_level: SecurityLevel::default(),
			categories: Vec::new(),
			description: String::new(),
			enabled: true,
			weight: default_weight(),
			max_connections: default_max_connections(),
			health_check_interval: default_health_check_interval(),
			health_check_timeout: default_health_check_timeout(),
			failover_threshold: default_failover_threshold(),
			recovery_threshold: default_recovery_threshold(),
			timeout: default_timeout(),
			retry_attempts: default_retry_attempts(),
			metadata: HashMap::new(),
		}
	}

	pub fn validate(&self) -> Result<(), ProxyError> {
		if self.endpoint.trim().is_empty() {
			return Err(ProxyError::Validation("endpoint must not be empty".to_string()));
		}
		if matches!(
			self.transport,
			TransportKind::Http | TransportKind::Websocket
		) && url::Url::parse(&self.endpoint).is_err()
		{
			return Err(ProxyError::Validation(format!(
				"endpoint {} is not a valid url",
				self.endpoint
			)));
		}
		if self.weight == 0 {
			return Err(ProxyError::Validation("weight must be positive".to_string()));
		}
		if self.failover_threshold == 0 || self.recovery_threshold == 0 {
			return Err(ProxyError::Validation(
				"health thresholds must be positive".to_string(),
			));
		}
		Ok(())
	}

	pub fn request_timeout(&self) -> Duration {
		Duration::from_secs(self.timeout)
	}

	pub fn health_timeout(&self) -> Duration {
		Duration::from_secs(self.health_check_timeout)
	}

	pub fn health_interval(&self) -> Duration {
		Duration::from_secs(self.health_check_interval)
	}
}

/// Top-level file configuration for the proxy.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct LocalConfig {
	#[serde(default)]
	pub upstreams: Vec<UpstreamConfig>,
	#[serde(default)]
	pub strategy: LoadBalancingStrategy,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub discovery: Option<DiscoveryConfig>,
	#[serde(default)]
	pub policy: PolicyConfig,
	#[serde(default)]
	pub rate_limit: RateLimitSettings,
	#[serde(default = "default_listen_addr")]
	pub listen_addr: String,
	#[serde(default = "default_metrics_addr")]
	pub metrics_addr: String,
	/// Directory of transport plugin manifests to load at startup.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub plugin_dir: Option<PathBuf>,
}

fn default_listen_addr() -> String {
	"0.0.0.0:3000".to_string()
}

fn default_metrics_addr() -> String {
	"0.0.0.0:19000".to_string()
}

impl Default for LocalConfig {
	fn default() -> Self {
		Self {
			upstreams: Vec::new(),
			strategy: LoadBalancingStrategy::default(),
			discovery: None,
			policy: PolicyConfig::default(),
			rate_limit: RateLimitSettings::default(),
			listen_addr: default_listen_addr(),
			metrics_addr: default_metrics_addr(),
			plugin_dir: None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn upstream_defaults_follow_operational_model() {
		let cfg: UpstreamConfig =
			serde_json::from_str(r#"{"id": "a", "endpoint": "http://localhost:8001"}"#).unwrap();
		assert_eq!(cfg.transport, TransportKind::Http);
		assert_eq!(cfg.weight, 100);
		assert_eq!(cfg.failover_threshold, 3);
		assert_eq!(cfg.recovery_threshold, 2);
		assert_eq!(cfg.timeout, 30);
		assert!(cfg.enabled);
		cfg.validate().unwrap();
	}

	#[test]
	fn validation_rejects_bad_invariants() {
		let mut cfg = UpstreamConfig::new("a", "http://localhost:8001", TransportKind::Http);
		cfg.weight = 0;
		assert!(cfg.validate().is_err());

		let mut cfg = UpstreamConfig::new("a", "http://localhost:8001", TransportKind::Http);
		cfg.endpoint = "  ".to_string();
		assert!(cfg.validate().is_err());

		let mut cfg = UpstreamConfig::new("a", "http://localhost:8001", TransportKind::Http);
		cfg.failover_threshold = 0;
		assert!(cfg.validate().is_err());
	}

	#[test]
	fn local_config_rejects_unknown_fields() {
		let err = serde_json::from_str::<LocalConfig>(r#"{"upstrems": []}"#);
		assert!(err.is_err());
	}

	#[test]
	fn upstream_file_entries_only_need_an_endpoint() {
		let cfg: LocalConfig = serde_json::from_str(
			r#"{"upstreams": [{"endpoint": "ws://localhost:8002", "transport": "websocket"}]}"#,
		)
		.unwrap();
		assert_eq!(cfg.upstreams.len(), 1);
		assert_eq!(cfg.upstreams[0].transport, TransportKind::Websocket);
		assert!(cfg.upstreams[0].id.is_empty());
	}
}
