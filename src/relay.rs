use crate::balancer::LoadBalancer;
use crate::config::UpstreamConfig;
use crate::errors::ProxyError;
use crate::limits::{ExecutionStatus, ResourceLimitManager};
use crate::policy::PolicyEngine;
use crate::ratelimit::RateLimiter;
use crate::transport::PluginRegistry;
use futures::future::join_all;
use itertools::Itertools;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{info, instrument, warn};

pub mod metrics;
mod pool;

use pool::ConnectionPool;

/// A discovered tool, addressed by its fully qualified name
/// `{upstream-id}.{local-name}`. Schemas pass through opaquely.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolDescriptor {
	pub name: String,
	pub upstream_id: String,
	pub local_name: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub description: Option<String>,
	pub input_schema: Value,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub output_schema: Option<Value>,
}

/// Caller identity threaded through the call pipeline.
#[derive(Clone, Debug, Default)]
pub struct CallContext {
	pub user_id: String,
	pub api_key: Option<String>,
	pub client_ip: Option<String>,
}

impl CallContext {
	pub fn for_user(user_id: impl Into<String>) -> Self {
		Self {
			user_id: user_id.into(),
			api_key: None,
			client_ip: None,
		}
	}

	/// Rate-limit identity: api key first, then user id.
	pub fn rate_key(&self) -> String {
		match &self.api_key {
			Some(key) => format!("api_key:{}", key),
			None => format!("user:{}", self.user_id),
		}
	}

	fn policy_context(&self) -> Option<Map<String, Value>> {
		self.client_ip.as_ref().map(|ip| {
			let mut context = Map::new();
			context.insert("client_ip".to_string(), json!(ip));
			context
		})
	}
}

/// The proxy wrapper: upstream registry, tool cache, pooled connections and
/// the call interception pipeline (policy, rate limit, resource limits,
/// dispatch, telemetry).
pub struct Relay {
	upstreams: RwLock<HashMap<String, UpstreamConfig>>,
	tools: RwLock<HashMap<String, ToolDescriptor>>,
	pool: Mutex<ConnectionPool>,
	policy: Arc<PolicyEngine>,
	rate_limiter: Arc<RateLimiter>,
	limits: Arc<ResourceLimitManager>,
	metrics: Arc<metrics::Metrics>,
	balancer: Option<Arc<LoadBalancer>>,
	active_counts: RwLock<HashMap<String, Arc<AtomicU32>>>,
	registered: std::sync::atomic::AtomicU64,
}

/// Releases the caller's connection slot when the call settles, error and
/// cancellation paths included.
struct ConnectionLease<'a> {
	relay: &'a Relay,
	upstream_id: String,
}

impl Drop for ConnectionLease<'_> {
	fn drop(&mut self) {
		self.relay.release_connection(&self.upstream_id);
	}
}

impl Relay {
	pub fn new(
		registry: Arc<PluginRegistry>,
		policy: Arc<PolicyEngine>,
		rate_limiter: Arc<RateLimiter>,
		limits: Arc<ResourceLimitManager>,
		metrics: Arc<metrics::Metrics>,
		balancer: Option<Arc<LoadBalancer>>,
	) -> Self {
		Self {
			upstreams: RwLock::new(HashMap::new()),
			tools: RwLock::new(HashMap::new()),
			pool: Mutex::new(ConnectionPool::new(registry)),
			policy,
			rate_limiter,
			limits,
			metrics,
			balancer,
			active_counts: RwLock::new(HashMap::new()),
			registered: std::sync::atomic::AtomicU64::new(0),
		}
	}

	/// Register an upstream: validate the config, probe connectivity,
	/// discover its tools and memoize them under qualified names.
	#[instrument(level = "info", skip_all, fields(name = %config.name))]
	pub async fn register(&self, mut config: UpstreamConfig) -> Result<String, ProxyError> {
		config.validate()?;
		if config.id.is_empty() {
			let seq = self.registered.fetch_add(1, Ordering::Relaxed);
			let base = if config.name.is_empty() {
				"upstream"
			} else {
				config.name.as_str()
			};
			config.id = format!("{}_{}", base, seq);
		}
		if config.name.is_empty() {
			config.name = config.id.clone();
		}
		if self.upstreams.read().await.contains_key(&config.id) {
			return Err(ProxyError::Validation(format!(
				"upstream {} already registered",
				config.id
			)));
		}

		// Connectivity probe and discovery share the pooled connection.
		let connection = {
			let mut pool = self.pool.lock().await;
			pool.get_or_create(&config).await
		};
		let connection = match connection {
			Ok(connection) => connection,
			Err(e) => {
				warn!(upstream = %config.id, "registration failed: {}", e);
				return Err(e);
			},
		};
		let raw_tools = connection.list_tools().await?;

		let descriptors: Vec<ToolDescriptor> = raw_tools
			.iter()
			.filter_map(|tool| descriptor_from(&config.id, tool))
			.collect();
		info!(
			upstream = %config.id,
			tools = descriptors.len(),
			"registered upstream"
		);
		self
			.metrics
			.record_registration(&config.id, &config.transport.to_string());

		let id = config.id.clone();
		{
			let mut tools = self.tools.write().await;
			for descriptor in descriptors {
				tools.insert(descriptor.name.clone(), descriptor);
			}
		}
		self.upstreams.write().await.insert(id.clone(), config);
		Ok(id)
	}

	/// Unregister an upstream, dropping its cached tools and closing its
	/// pooled connection.
	pub async fn unregister(&self, id: &str) -> Result<(), ProxyError> {
		let removed = self.upstreams.write().await.remove(id);
		if removed.is_none() {
			return Err(ProxyError::UnknownUpstream(id.to_string()));
		}
		self
			.tools
			.write()
			.await
			.retain(|_, descriptor| descriptor.upstream_id != id);
		self.active_counts.write().await.remove(id);
		let connection = self.pool.lock().await.remove(id);
		if let Some(connection) = connection {
			connection.close().await;
		}
		info!(upstream = %id, "unregistered upstream");
		Ok(())
	}

	pub async fn get_upstream(&self, id: &str) -> Option<UpstreamConfig> {
		self.upstreams.read().await.get(id).cloned()
	}

	pub async fn list_upstreams(&self) -> Vec<UpstreamConfig> {
		let mut upstreams: Vec<UpstreamConfig> =
			self.upstreams.read().await.values().cloned().collect();
		upstreams.sort_by(|a, b| a.id.cmp(&b.id));
		upstreams
	}

	pub async fn tool_count(&self, id: &str) -> usize {
		self
			.tools
			.read()
			.await
			.values()
			.filter(|t| t.upstream_id == id)
			.count()
	}

	/// Aggregated tool surface from the discovery cache.
	pub async fn list_tools(&self) -> Vec<ToolDescriptor> {
		self.metrics.record_list_call("tool");
		let mut tools: Vec<ToolDescriptor> = self.tools.read().await.values().cloned().collect();
		tools.sort_by(|a, b| a.name.cmp(&b.name));
		tools
	}

	/// Re-discover one upstream's tools, replacing its cache entries.
	pub async fn refresh_tools(&self, id: &str) -> Result<usize, ProxyError> {
		let config = self
			.get_upstream(id)
			.await
			.ok_or_else(|| ProxyError::UnknownUpstream(id.to_string()))?;
		let connection = {
			let mut pool = self.pool.lock().await;
			pool.get_or_create(&config).await?
		};
		let raw_tools = connection.list_tools().await?;
		let descriptors: Vec<ToolDescriptor> = raw_tools
			.iter()
			.filter_map(|tool| descriptor_from(id, tool))
			.collect();
		let count = descriptors.len();
		let mut tools = self.tools.write().await;
		tools.retain(|_, descriptor| descriptor.upstream_id != id);
		for descriptor in descriptors {
			tools.insert(descriptor.name.clone(), descriptor);
		}
		Ok(count)
	}

	/// Refresh every upstream. Per-upstream failures are logged and skipped.
	pub async fn refresh_all(&self) -> usize {
		let ids: Vec<String> = self.upstreams.read().await.keys().cloned().collect();
		let refreshes = ids.iter().map(|id| async move {
			self
				.refresh_tools(id)
				.await
				.map_err(|e| (id.clone(), e))
		});
		let (ok, errors): (Vec<_>, Vec<_>) = join_all(refreshes).await.into_iter().partition_result();
		for (id, error) in errors {
			warn!(upstream = %id, "tool refresh failed: {}", error);
		}
		ok.into_iter().sum()
	}

	/// The call pipeline. Order matters: policy, then rate limit, then
	/// resource accounting, then dispatch. Post-hooks always run.
	#[instrument(level = "debug", skip_all, fields(name = %qualified_name))]
	pub async fn call_tool(
		&self,
		qualified_name: &str,
		arguments: Value,
		ctx: &CallContext,
	) -> Result<Value, ProxyError> {
		let (upstream_id, local_name) = qualified_name.split_once('.').ok_or_else(|| {
			ProxyError::Validation(format!(
				"tool name {} is not of the form upstream.tool",
				qualified_name
			))
		})?;
		let config = self
			.get_upstream(upstream_id)
			.await
			.ok_or_else(|| ProxyError::UnknownUpstream(upstream_id.to_string()))?;
		if !self.tools.read().await.contains_key(qualified_name) {
			return Err(ProxyError::ToolNotFound(qualified_name.to_string()));
		}

		let allowed = self
			.policy
			.check_access(
				&ctx.user_id,
				&format!("tool:{}", local_name),
				"execute",
				ctx.policy_context().as_ref(),
			)
			.await;
		if !allowed {
			return Err(ProxyError::Authorization(format!(
				"user {} may not execute {}",
				ctx.user_id, qualified_name
			)));
		}

		let rate_key = ctx.rate_key();
		let decision = self.rate_limiter.check(&rate_key, 1);
		if !decision.allowed {
			self.metrics.record_rate_limit_denial(&rate_key);
		}
		decision.into_result()?;

		let execution_id =
			self
				.limits
				.start_execution(qualified_name, &ctx.user_id, None, None);
		// The start hook denies when the caller is already over their hard
		// concurrency ceiling.
		let over_concurrency = self
			.limits
			.check_hard_limits(&execution_id)
			.get(&crate::limits::LimitKind::ConcurrentExecutions)
			.copied()
			.unwrap_or(false);
		if over_concurrency {
			self.limits.end_execution(
				&execution_id,
				ExecutionStatus::LimitExceeded,
				Some("concurrent execution limit exceeded".to_string()),
			);
			return Err(ProxyError::ResourceLimitExceeded(format!(
				"user {} exceeded the concurrent execution limit",
				ctx.user_id
			)));
		}

		self.metrics.record_tool_call(upstream_id, local_name);

		// Connection accounting brackets the dispatch, error paths included.
		self.acquire_connection(upstream_id).await;
		let _lease = ConnectionLease {
			relay: self,
			upstream_id: upstream_id.to_string(),
		};

		let result = self.dispatch(&config, local_name, arguments).await;

		match &result {
			Ok(_) => {
				self
					.limits
					.end_execution(&execution_id, ExecutionStatus::Completed, None);
			},
			Err(e) => {
				self.limits.end_execution(
					&execution_id,
					ExecutionStatus::Failed,
					Some(e.to_string()),
				);
				self
					.metrics
					.record_tool_call_error(upstream_id, local_name, e.code());
			},
		}
		result
	}

	/// Dispatch with bounded retries; only connectivity errors are retried.
	async fn dispatch(
		&self,
		config: &UpstreamConfig,
		local_name: &str,
		arguments: Value,
	) -> Result<Value, ProxyError> {
		let mut attempt: u32 = 0;
		loop {
			let outcome = {
				let connection = {
					let mut pool = self.pool.lock().await;
					pool.get_or_create(config).await
				};
				match connection {
					Ok(connection) => connection.call_tool(local_name, arguments.clone()).await,
					Err(e) => Err(e),
				}
			};
			match outcome {
				Ok(value) => {
					if let Some(balancer) = &self.balancer {
						balancer.record_request(&config.id).await;
					}
					return Ok(value);
				},
				Err(e) if e.is_retryable() && attempt + 1 < config.retry_attempts.max(1) => {
					attempt += 1;
					// A dead pooled connection is dropped so the retry dials fresh.
					self.pool.lock().await.remove(&config.id);
					let backoff = Duration::from_millis(100u64 << (attempt - 1));
					warn!(
						upstream = %config.id,
						attempt,
						"dispatch failed, retrying in {:?}: {}",
						backoff,
						e
					);
					tokio::time::sleep(backoff).await;
				},
				Err(e) => return Err(e),
			}
		}
	}

	/// Liveness flag of an upstream's pooled stdio child, if any.
	pub async fn stdio_liveness(&self, id: &str) -> Option<Arc<AtomicBool>> {
		let pool = self.pool.lock().await;
		pool.get(id).and_then(|connection| connection.stdio_liveness())
	}

	async fn acquire_connection(&self, id: &str) {
		let counter = {
			let mut counts = self.active_counts.write().await;
			counts
				.entry(id.to_string())
				.or_insert_with(|| Arc::new(AtomicU32::new(0)))
				.clone()
		};
		let current = counter.fetch_add(1, Ordering::SeqCst) + 1;
		if let Some(balancer) = &self.balancer {
			balancer.update_server_connection_count(id, current).await;
		}
	}

	fn release_connection(&self, id: &str) {
		let counter = match self.active_counts.try_read() {
			Ok(counts) => counts.get(id).cloned(),
			Err(_) => None,
		};
		let Some(counter) = counter else { return };
		let previous = counter.fetch_sub(1, Ordering::SeqCst);
		let current = previous.saturating_sub(1);
		if let Some(balancer) = self.balancer.clone() {
			let id = id.to_string();
			tokio::spawn(async move {
				balancer.update_server_connection_count(&id, current).await;
			});
		}
	}

	pub async fn active_connections(&self, id: &str) -> u32 {
		let counts = self.active_counts.read().await;
		counts
			.get(id)
			.map(|counter| counter.load(Ordering::SeqCst))
			.unwrap_or(0)
	}
}

fn descriptor_from(upstream_id: &str, tool: &Value) -> Option<ToolDescriptor> {
	let local_name = tool.get("name").and_then(Value::as_str)?;
	Some(ToolDescriptor {
		name: format!("{}.{}", upstream_id, local_name),
		upstream_id: upstream_id.to_string(),
		local_name: local_name.to_string(),
		description: tool
			.get("description")
			.and_then(Value::as_str)
			.map(str::to_string),
		input_schema: tool.get("inputSchema").cloned().unwrap_or(json!({})),
		output_schema: tool.get("outputSchema").cloned(),
	})
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::policy::PolicyConfig;
	use crate::ratelimit::{RateLimitAlgorithm, RateLimitConfig, RateLimitSettings};
	use crate::transport::TransportKind;
	use prometheus_client::registry::Registry;
	use wiremock::matchers::{body_partial_json, method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	async fn relay() -> Relay {
		let policy = Arc::new(PolicyEngine::new(PolicyConfig::default()));
		policy.initialize().await.unwrap();
		let mut registry = Registry::default();
		Relay::new(
			Arc::new(PluginRegistry::new()),
			policy,
			Arc::new(RateLimiter::new(RateLimitSettings::default())),
			Arc::new(ResourceLimitManager::default()),
			Arc::new(metrics::Metrics::new(&mut registry)),
			None,
		)
	}

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
				"tools": [
					{"name": "echo", "description": "echo input", "inputSchema": {"type": "object"}},
					{"name": "sum", "inputSchema": {"type": "object"}},
				],
			})))
			.mount(&server)
			.await;
		server
	}

	fn upstream_config(server: &MockServer, id: &str) -> UpstreamConfig {
		UpstreamConfig::new(id, server.uri(), TransportKind::Http)
	}

	#[tokio::test]
	async fn register_discovers_and_qualifies_tools() {
		let relay = relay().await;
		let server = mock_upstream().await;
		let id = relay.register(upstream_config(&server, "srv")).await.unwrap();
		assert_eq!(id, "srv");

		let tools = relay.list_tools().await;
		let names: Vec<&str> = tools.iter().map(|t| t.name.as_str()).collect();
		assert_eq!(names, vec!["srv.echo", "srv.sum"]);
		assert_eq!(relay.tool_count("srv").await, 2);
	}

	#[tokio::test]
	async fn register_assigns_ids_when_missing() {
		let relay = relay().await;
		let server = mock_upstream().await;
		let mut config = upstream_config(&server, "");
		config.id = String::new();
		config.name = "files".to_string();
		let id = relay.register(config).await.unwrap();
		assert!(id.starts_with("files_"));
	}

	#[tokio::test]
	async fn register_rejects_duplicates_and_unreachable_upstreams() {
		let relay = relay().await;
		let server = mock_upstream().await;
		relay.register(upstream_config(&server, "srv")).await.unwrap();
		let err = relay
			.register(upstream_config(&server, "srv"))
			.await
			.err()
			.unwrap();
		assert!(matches!(err, ProxyError::Validation(_)));

		let mut config = UpstreamConfig::new("dead", "http://127.0.0.1:1", TransportKind::Http);
		config.timeout = 1;
		let err = relay.register(config).await.err().unwrap();
		assert!(matches!(err, ProxyError::UpstreamUnavailable(_)));
	}

	#[tokio::test]
	async fn unregister_restores_the_registry_state() {
		let relay = relay().await;
		let server = mock_upstream().await;
		relay.register(upstream_config(&server, "srv")).await.unwrap();
		relay.unregister("srv").await.unwrap();
		assert!(relay.list_upstreams().await.is_empty());
		assert!(relay.list_tools().await.is_empty());
		assert!(matches!(
			relay.unregister("srv").await,
			Err(ProxyError::UnknownUpstream(_))
		));
	}

	#[tokio::test]
	async fn call_tool_dispatches_through_the_pipeline() {
		let relay = relay().await;
		let server = mock_upstream().await;
		Mock::given(method("POST"))
			.and(path("/tools/call"))
			.and(body_partial_json(serde_json::json!({"name": "echo"})))
			.respond_with(
				ResponseTemplate::new(200)
					.set_body_json(serde_json::json!({"result": {"echoed": "hi"}})),
			)
			.mount(&server)
			.await;
		relay.register(upstream_config(&server, "srv")).await.unwrap();

		let result = relay
			.call_tool(
				"srv.echo",
				serde_json::json!({"text": "hi"}),
				&CallContext::for_user("user"),
			)
			.await
			.unwrap();
		assert_eq!(result["echoed"], "hi");
		// Connection slot released after the call.
		assert_eq!(relay.active_connections("srv").await, 0);
	}

	#[tokio::test]
	async fn call_tool_rejects_unknown_upstreams_and_tools() {
		let relay = relay().await;
		let server = mock_upstream().await;
		relay.register(upstream_config(&server, "srv")).await.unwrap();

		let ctx = CallContext::for_user("user");
		assert!(matches!(
			relay.call_tool("ghost.echo", serde_json::json!({}), &ctx).await,
			Err(ProxyError::UnknownUpstream(_))
		));
		assert!(matches!(
			relay.call_tool("srv.missing", serde_json::json!({}), &ctx).await,
			Err(ProxyError::ToolNotFound(_))
		));
		assert!(matches!(
			relay.call_tool("unqualified", serde_json::json!({}), &ctx).await,
			Err(ProxyError::Validation(_))
		));
	}

	#[tokio::test]
	async fn policy_denial_stops_the_pipeline() {
		let relay = relay().await;
		let server = mock_upstream().await;
		relay.register(upstream_config(&server, "srv")).await.unwrap();

		let err = relay
			.call_tool(
				"srv.echo",
				serde_json::json!({}),
				&CallContext::for_user("3fa11c9a"),
			)
			.await
			.err()
			.unwrap();
		assert!(matches!(err, ProxyError::Authorization(_)));
	}

	#[tokio::test]
	async fn rate_limit_denial_carries_retry_metadata() {
		let relay = relay().await;
		let server = mock_upstream().await;
		Mock::given(method("POST"))
			.and(path("/tools/call"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": {}})))
			.mount(&server)
			.await;
		relay.register(upstream_config(&server, "srv")).await.unwrap();
		relay.rate_limiter.add(RateLimitConfig {
			key: "user:user".to_string(),
			limit: 1,
			window_seconds: 60,
			algorithm: RateLimitAlgorithm::FixedWindow,
		});

		let ctx = CallContext::for_user("user");
		relay
			.call_tool("srv.echo", serde_json::json!({}), &ctx)
			.await
			.unwrap();
		let err = relay
			.call_tool("srv.echo", serde_json::json!({}), &ctx)
			.await
			.err()
			.unwrap();
		match err {
			ProxyError::RateLimitExceeded { limit, retry_after, .. } => {
				assert_eq!(limit, 1);
				assert!(retry_after.unwrap_or(0) <= 60);
			},
			other => panic!("expected rate limit error, got {:?}", other),
		}
	}

	#[tokio::test]
	async fn protocol_errors_are_not_retried() {
		let relay = relay().await;
		let server = mock_upstream().await;
		Mock::given(method("POST"))
			.and(path("/tools/call"))
			.respond_with(ResponseTemplate::new(500))
			.expect(1)
			.mount(&server)
			.await;
		relay.register(upstream_config(&server, "srv")).await.unwrap();

		let err = relay
			.call_tool(
				"srv.echo",
				serde_json::json!({}),
				&CallContext::for_user("user"),
			)
			.await
			.err()
			.unwrap();
		assert!(matches!(err, ProxyError::ToolExecution(_)));
		assert_eq!(err.code(), "INTERNAL_ERROR");
	}

	#[tokio::test]
	async fn failed_calls_still_settle_resource_accounting() {
		let relay = relay().await;
		let server = mock_upstream().await;
		Mock::given(method("POST"))
			.and(path("/tools/call"))
			.respond_with(ResponseTemplate::new(500))
			.mount(&server)
			.await;
		relay.register(upstream_config(&server, "srv")).await.unwrap();

		let _ = relay
			.call_tool(
				"srv.echo",
				serde_json::json!({}),
				&CallContext::for_user("user"),
			)
			.await;
		assert_eq!(relay.limits.status().active_executions, 0);
		let history = relay.limits.list_history(Some("user"), 10);
		assert_eq!(history.len(), 1);
		assert_eq!(history[0].status, ExecutionStatus::Failed);
		assert_eq!(relay.active_connections("srv").await, 0);
	}

	#[tokio::test]
	async fn concurrency_ceiling_denies_at_execution_start() {
		let relay = relay().await;
		let server = mock_upstream().await;
		Mock::given(method("POST"))
			.and(path("/tools/call"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"result": {}})))
			.mount(&server)
			.await;
		relay.register(upstream_config(&server, "srv")).await.unwrap();

		// Saturate the caller's hard concurrency ceiling.
		let hard = crate::limits::ResourceLimits::default().concurrent_executions_hard;
		for _ in 0..hard {
			relay.limits.start_execution("srv.echo", "user", None, None);
		}
		let err = relay
			.call_tool(
				"srv.echo",
				serde_json::json!({}),
				&CallContext::for_user("user"),
			)
			.await
			.err()
			.unwrap();
		assert!(matches!(err, ProxyError::ResourceLimitExceeded(_)));
		assert_eq!(err.code(), "RESOURCE_LIMIT_EXCEEDED");
		// The denied attempt is recorded in history, not left active.
		assert_eq!(relay.limits.status().active_executions, hard as usize);
		let history = relay.limits.list_history(Some("user"), 10);
		assert_eq!(history[0].status, ExecutionStatus::LimitExceeded);
	}

	#[tokio::test]
	async fn stdio_upstreams_round_trip_via_the_pool() {
		let relay = relay().await;
		// `cat` echoes our JSON-RPC request line back; the response carries
		// the same id, so discovery sees an empty tool list.
		let config = UpstreamConfig::new("echo", "cat", TransportKind::Stdio);
		let id = relay.register(config).await.unwrap();
		assert_eq!(relay.tool_count(&id).await, 0);
		assert!(relay.stdio_liveness(&id).await.is_some());
		relay.unregister(&id).await.unwrap();
	}

	#[tokio::test]
	async fn refresh_replaces_the_tool_cache() {
		let relay = relay().await;
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/health"))
			.respond_with(ResponseTemplate::new(200))
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.and(path("/tools/list"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"tools": [{"name": "old", "inputSchema": {}}],
			})))
			.expect(1)
			.mount(&server)
			.await;
		relay.register(upstream_config(&server, "srv")).await.unwrap();
		assert_eq!(relay.list_tools().await[0].name, "srv.old");

		server.reset().await;
		Mock::given(method("GET"))
			.and(path("/health"))
			.respond_with(ResponseTemplate::new(200))
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.and(path("/tools/list"))
			.respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
				"tools": [{"name": "new", "inputSchema": {}}],
			})))
			.mount(&server)
			.await;
		assert_eq!(relay.refresh_all().await, 1);
		assert_eq!(relay.list_tools().await[0].name, "srv.new");
	}
}
