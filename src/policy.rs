use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::collections::{HashMap, HashSet};
use std::sync::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PolicyMode {
	Internal,
	External,
}

impl Default for PolicyMode {
	fn default() -> Self {
		PolicyMode::Internal
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct PolicyConfig {
	#[serde(default)]
	pub mode: PolicyMode,
	/// Base url of the external policy service (external mode only).
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub external_url: Option<String>,
	/// Data path queried for allow/deny decisions in external mode.
	#[serde(default = "default_decision_path")]
	pub decision_path: String,
}

fn default_decision_path() -> String {
	"proxy/allow".to_string()
}

impl Default for PolicyConfig {
	fn default() -> Self {
		Self {
			mode: PolicyMode::default(),
			external_url: None,
			decision_path: default_decision_path(),
		}
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleRules {
	pub resources: HashSet<String>,
	pub actions: HashSet<String>,
}

impl RoleRules {
	fn new(resources: &[&str], actions: &[&str]) -> Self {
		Self {
			resources: resources.iter().map(|s| s.to_string()).collect(),
			actions: actions.iter().map(|s| s.to_string()).collect(),
		}
	}
}

lazy_static::lazy_static! {
	// Bootstrap role table. The anonymous role deliberately carries no
	// grants; access requires at least the user role.
	static ref BUILTIN_RULES: HashMap<String, RoleRules> = {
		let mut rules = HashMap::new();
		rules.insert("admin".to_string(), RoleRules::new(&["*"], &["*"]));
		rules.insert(
			"user".to_string(),
			RoleRules::new(&["tool:*"], &["read", "execute"]),
		);
		rules.insert("anonymous".to_string(), RoleRules::new(&[], &[]));
		rules
	};
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyVersion {
	pub version: String,
	pub content: String,
	pub description: String,
	pub author: String,
	pub created_at: DateTime<Utc>,
	pub active: bool,
}

#[derive(Clone, Debug, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IpLists {
	pub allow: Vec<String>,
	pub deny: Vec<String>,
}

#[derive(Default)]
struct PolicyState {
	rules: HashMap<String, RoleRules>,
	roles: HashMap<String, String>,
	allow_ips: HashSet<String>,
	deny_ips: HashSet<String>,
	versions: HashMap<String, Vec<PolicyVersion>>,
}

/// Predicate evaluation over internal role rules or an external
/// OPA-style service. An uninitialized engine denies everything.
pub struct PolicyEngine {
	config: PolicyConfig,
	client: reqwest::Client,
	state: RwLock<PolicyState>,
	initialized: AtomicBool,
}

impl PolicyEngine {
	pub fn new(config: PolicyConfig) -> Self {
		Self {
			config,
			client: reqwest::Client::builder()
				.timeout(std::time::Duration::from_secs(10))
				.build()
				.unwrap_or_default(),
			state: RwLock::new(PolicyState::default()),
			initialized: AtomicBool::new(false),
		}
	}

	pub async fn initialize(&self) -> Result<(), crate::errors::ProxyError> {
		if self.config.mode == PolicyMode::External {
			let base = self.config.external_url.as_deref().ok_or_else(|| {
				crate::errors::ProxyError::Validation(
					"external policy mode requires externalUrl".to_string(),
				)
			})?;
			let response = self
				.client
				.get(format!("{}/health", base))
				.send()
				.await
				.map_err(|e| {
					crate::errors::ProxyError::UpstreamUnavailable(format!(
						"policy service unreachable: {}",
						e
					))
				})?;
			if response.status() != reqwest::StatusCode::OK {
				return Err(crate::errors::ProxyError::UpstreamUnavailable(format!(
					"policy service returned {}",
					response.status()
				)));
			}
		}
		{
			let mut state = self.state.write().unwrap();
			state.rules = BUILTIN_RULES.clone();
			state.roles.insert("admin".to_string(), "admin".to_string());
			state.roles.insert("user".to_string(), "user".to_string());
		}
		self.initialized.store(true, Ordering::SeqCst);
		info!(mode = ?self.config.mode, "policy engine initialized");
		Ok(())
	}

	pub fn is_initialized(&self) -> bool {
		self.initialized.load(Ordering::SeqCst)
	}

	pub fn assign_role(&self, user_id: &str, role: &str) {
		let mut state = self.state.write().unwrap();
		state.roles.insert(user_id.to_string(), role.to_string());
	}

	pub fn set_role_rules(&self, role: &str, rules: RoleRules) {
		let mut state = self.state.write().unwrap();
		state.rules.insert(role.to_string(), rules);
	}

	fn role_of(&self, user_id: &str) -> String {
		let state = self.state.read().unwrap();
		state
			.roles
			.get(user_id)
			.cloned()
			.unwrap_or_else(|| "anonymous".to_string())
	}

	/// Allow/deny decision for one (user, resource, action) triple. Denies
	/// when uninitialized and on transient external-service errors.
	pub async fn check_access(
		&self,
		user_id: &str,
		resource: &str,
		action: &str,
		context: Option<&Map<String, Value>>,
	) -> bool {
		if !self.is_initialized() {
			warn!("policy engine not initialized, denying access");
			return false;
		}
		if let Some(ip) = context
			.and_then(|ctx| ctx.get("client_ip"))
			.and_then(|v| v.as_str())
		{
			if !self.check_ip_access(ip) {
				debug!(%ip, "denied by ip list");
				return false;
			}
		}
		match self.config.mode {
			PolicyMode::Internal => self.check_access_internal(user_id, resource, action),
			PolicyMode::External => {
				self
					.check_access_external(user_id, resource, action, context)
					.await
			},
		}
	}

	fn check_access_internal(&self, user_id: &str, resource: &str, action: &str) -> bool {
		let role = self.role_of(user_id);
		let state = self.state.read().unwrap();
		let Some(rules) = state.rules.get(&role) else {
			return false;
		};
		rules.resources.iter().any(|p| pattern_matches(p, resource))
			&& rules.actions.iter().any(|p| pattern_matches(p, action))
	}

	async fn check_access_external(
		&self,
		user_id: &str,
		resource: &str,
		action: &str,
		context: Option<&Map<String, Value>>,
	) -> bool {
		let mut input = Map::new();
		input.insert("user".to_string(), json!(user_id));
		input.insert("resource".to_string(), json!(resource));
		input.insert("action".to_string(), json!(action));
		if let Some(context) = context {
			for (key, value) in context {
				input.insert(key.clone(), value.clone());
			}
		}
		match self
			.evaluate_policy(&self.config.decision_path, Value::Object(input))
			.await
		{
			Ok(result) => result
				.get("result")
				.and_then(|v| v.as_bool())
				.unwrap_or(false),
			Err(e) => {
				warn!("external policy check failed, denying: {}", e);
				false
			},
		}
	}

	pub async fn check_permission(&self, user_id: &str, permission: &str) -> bool {
		if !self.is_initialized() {
			return false;
		}
		let role = self.role_of(user_id);
		let state = self.state.read().unwrap();
		match state.rules.get(&role) {
			Some(rules) => rules.actions.iter().any(|p| pattern_matches(p, permission)),
			None => false,
		}
	}

	/// Evaluate a named policy document against input data. In internal mode
	/// this is a pass-through acknowledgement for operators.
	pub async fn evaluate_policy(
		&self,
		policy: &str,
		input: Value,
	) -> Result<Value, crate::errors::ProxyError> {
		match self.config.mode {
			PolicyMode::Internal => Ok(json!({"result": true, "policy": policy})),
			PolicyMode::External => {
				let base = self.config.external_url.as_deref().ok_or_else(|| {
					crate::errors::ProxyError::Validation("externalUrl not configured".to_string())
				})?;
				let response = self
					.client
					.post(format!("{}/v1/data/{}", base, policy))
					.json(&json!({"input": input}))
					.send()
					.await
					.map_err(|e| {
						crate::errors::ProxyError::UpstreamUnavailable(format!(
							"policy evaluation failed: {}",
							e
						))
					})?;
				if !response.status().is_success() {
					return Err(crate::errors::ProxyError::Internal(format!(
						"policy service returned {}",
						response.status()
					)));
				}
				response.json().await.map_err(|e| {
					crate::errors::ProxyError::Internal(format!("invalid policy response: {}", e))
				})
			},
		}
	}

	// IP lists: a non-empty allow list wins; otherwise the deny list is
	// consulted.
	pub fn check_ip_access(&self, ip: &str) -> bool {
		let state = self.state.read().unwrap();
		if !state.allow_ips.is_empty() {
			return state.allow_ips.contains(ip);
		}
		!state.deny_ips.contains(ip)
	}

	pub fn add_allowed_ip(&self, ip: &str) {
		self.state.write().unwrap().allow_ips.insert(ip.to_string());
	}

	pub fn remove_allowed_ip(&self, ip: &str) -> bool {
		self.state.write().unwrap().allow_ips.remove(ip)
	}

	pub fn add_denied_ip(&self, ip: &str) {
		self.state.write().unwrap().deny_ips.insert(ip.to_string());
	}

	pub fn remove_denied_ip(&self, ip: &str) -> bool {
		self.state.write().unwrap().deny_ips.remove(ip)
	}

	pub fn ip_lists(&self) -> IpLists {
		let state = self.state.read().unwrap();
		let mut allow: Vec<String> = state.allow_ips.iter().cloned().collect();
		let mut deny: Vec<String> = state.deny_ips.iter().cloned().collect();
		allow.sort();
		deny.sort();
		IpLists { allow, deny }
	}

	/// Append a new version of a policy document. Versions start inactive;
	/// activation is a separate, atomic step.
	pub fn create_policy(
		&self,
		name: &str,
		content: &str,
		description: &str,
		author: &str,
	) -> String {
		let version = PolicyVersion {
			version: uuid::Uuid::new_v4().simple().to_string(),
			content: content.to_string(),
			description: description.to_string(),
			author: author.to_string(),
			created_at: Utc::now(),
			active: false,
		};
		let id = version.version.clone();
		let mut state = self.state.write().unwrap();
		state
			.versions
			.entry(name.to_string())
			.or_default()
			.push(version);
		info!(policy = %name, version = %id, "created policy version");
		id
	}

	pub fn update_policy(
		&self,
		name: &str,
		content: &str,
		description: &str,
		author: &str,
	) -> Result<String, crate::errors::ProxyError> {
		{
			let state = self.state.read().unwrap();
			if !state.versions.contains_key(name) {
				return Err(crate::errors::ProxyError::Validation(format!(
					"unknown policy {}",
					name
				)));
			}
		}
		Ok(self.create_policy(name, content, description, author))
	}

	pub fn policy_versions(&self, name: &str) -> Vec<PolicyVersion> {
		let state = self.state.read().unwrap();
		state.versions.get(name).cloned().unwrap_or_default()
	}

	/// Make exactly one version of the policy active, atomically.
	pub fn activate_policy_version(&self, name: &str, version: &str) -> bool {
		let mut state = self.state.write().unwrap();
		let Some(versions) = state.versions.get_mut(name) else {
			return false;
		};
		if !versions.iter().any(|v| v.version == version) {
			return false;
		}
		for v in versions.iter_mut() {
			v.active = v.version == version;
		}
		info!(policy = %name, %version, "activated policy version");
		true
	}

	pub fn active_policy(&self, name: &str) -> Option<PolicyVersion> {
		let state = self.state.read().unwrap();
		state
			.versions
			.get(name)
			.and_then(|versions| versions.iter().find(|v| v.active).cloned())
	}
}

fn pattern_matches(pattern: &str, value: &str) -> bool {
	if pattern == "*" || pattern == value {
		return true;
	}
	match pattern.strip_suffix('*') {
		Some(prefix) => value.starts_with(prefix),
		None => false,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	async fn engine() -> PolicyEngine {
		let engine = PolicyEngine::new(PolicyConfig::default());
		engine.initialize().await.unwrap();
		engine
	}

	#[tokio::test]
	async fn uninitialized_engine_denies() {
		let engine = PolicyEngine::new(PolicyConfig::default());
		assert!(!engine.check_access("admin", "tool:public", "read", None).await);
		assert!(!engine.check_permission("admin", "read").await);
	}

	#[tokio::test]
	async fn anonymous_users_have_no_grants() {
		let engine = engine().await;
		assert!(
			!engine
				.check_access("5f2c9e0a", "tool:public", "read", None)
				.await
		);
	}

	#[tokio::test]
	async fn user_role_reaches_tools_through_the_wildcard() {
		let engine = engine().await;
		assert!(engine.check_access("user", "tool:public", "read", None).await);
		assert!(engine.check_access("user", "tool:calculator", "execute", None).await);
		assert!(!engine.check_access("user", "data:secrets", "read", None).await);
		assert!(!engine.check_access("user", "tool:public", "delete", None).await);
	}

	#[tokio::test]
	async fn admin_role_matches_everything() {
		let engine = engine().await;
		assert!(engine.check_access("admin", "data:secrets", "delete", None).await);
	}

	#[tokio::test]
	async fn assigned_roles_override_the_anonymous_fallback() {
		let engine = engine().await;
		engine.assign_role("carol", "user");
		assert!(engine.check_access("carol", "tool:public", "read", None).await);
	}

	#[tokio::test]
	async fn allow_list_wins_when_non_empty() {
		let engine = engine().await;
		engine.add_allowed_ip("192.168.1.100");
		engine.add_denied_ip("10.0.0.50");
		assert!(engine.check_ip_access("192.168.1.100"));
		assert!(!engine.check_ip_access("192.168.1.101"));
		assert!(!engine.check_ip_access("10.0.0.50"));

		engine.remove_allowed_ip("192.168.1.100");
		// With the allow list empty only the deny list applies.
		assert!(engine.check_ip_access("172.16.0.1"));
		assert!(!engine.check_ip_access("10.0.0.50"));
		engine.remove_denied_ip("10.0.0.50");
		assert!(engine.check_ip_access("10.0.0.50"));
	}

	#[tokio::test]
	async fn context_ip_is_enforced_in_check_access() {
		let engine = engine().await;
		engine.add_denied_ip("10.0.0.50");
		let mut context = Map::new();
		context.insert("client_ip".to_string(), json!("10.0.0.50"));
		assert!(
			!engine
				.check_access("admin", "tool:public", "read", Some(&context))
				.await
		);
	}

	#[tokio::test]
	async fn versions_append_and_activate_atomically() {
		let engine = engine().await;
		let v1 = engine.create_policy("quota", "allow = false", "v1", "ops");
		let v2 = engine.create_policy("quota", "allow = true", "v2", "ops");
		assert_ne!(v1, v2);
		assert_eq!(engine.policy_versions("quota").len(), 2);
		assert!(engine.active_policy("quota").is_none());

		assert!(engine.activate_policy_version("quota", &v1));
		assert_eq!(engine.active_policy("quota").unwrap().version, v1);
		assert!(engine.activate_policy_version("quota", &v2));
		let versions = engine.policy_versions("quota");
		assert_eq!(versions.iter().filter(|v| v.active).count(), 1);
		assert_eq!(engine.active_policy("quota").unwrap().version, v2);
	}

	#[tokio::test]
	async fn update_requires_an_existing_policy() {
		let engine = engine().await;
		assert!(engine.update_policy("ghost", "x", "d", "a").is_err());
		engine.create_policy("real", "x", "d", "a");
		assert!(engine.update_policy("real", "y", "d", "a").is_ok());
	}

	#[tokio::test]
	async fn external_mode_parses_the_result_field() {
		use wiremock::matchers::{body_partial_json, method, path};
		use wiremock::{Mock, MockServer, ResponseTemplate};

		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/health"))
			.respond_with(ResponseTemplate::new(200))
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.and(path("/v1/data/proxy/allow"))
			.and(body_partial_json(json!({"input": {"user": "alice"}})))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": true})))
			.mount(&server)
			.await;

		let engine = PolicyEngine::new(PolicyConfig {
			mode: PolicyMode::External,
			external_url: Some(server.uri()),
			decision_path: default_decision_path(),
		});
		engine.initialize().await.unwrap();
		assert!(engine.check_access("alice", "tool:x", "read", None).await);
	}

	#[tokio::test]
	async fn external_errors_deny_and_do_not_propagate() {
		use wiremock::matchers::{method, path};
		use wiremock::{Mock, MockServer, ResponseTemplate};

		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/health"))
			.respond_with(ResponseTemplate::new(200))
			.mount(&server)
			.await;
		Mock::given(method("POST"))
			.and(path("/v1/data/proxy/allow"))
			.respond_with(ResponseTemplate::new(500))
			.mount(&server)
			.await;

		let engine = PolicyEngine::new(PolicyConfig {
			mode: PolicyMode::External,
			external_url: Some(server.uri()),
			decision_path: default_decision_path(),
		});
		engine.initialize().await.unwrap();
		assert!(!engine.check_access("alice", "tool:x", "read", None).await);
	}
}
