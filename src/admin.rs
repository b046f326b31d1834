use crate::apikey::ApiKeyStore;
use crate::config::UpstreamConfig;
use crate::errors::ProxyError;
use crate::limits::{ExecutionStatus, ResourceLimits};
use crate::manager::ProxyManager;
use crate::ratelimit::{RateLimitConfig, rate_limit_middleware};
use crate::relay::CallContext;
use axum::extract::{Path, Query, State};
use axum::http::HeaderMap;
use axum::routing::{delete, get, post, put};
use axum::{Json, Router, middleware};
use serde::Deserialize;
use serde_json::{Value, json};
use std::sync::Arc;

/// Thin management facade over the core. Handlers translate HTTP shapes
/// into core calls and map `ProxyError` to the boundary vocabulary.
#[derive(Clone)]
pub struct App {
	manager: Arc<ProxyManager>,
	api_keys: Arc<ApiKeyStore>,
}

impl App {
	pub fn new(manager: Arc<ProxyManager>, api_keys: Arc<ApiKeyStore>) -> Self {
		Self { manager, api_keys }
	}

	pub fn router(&self) -> Router {
		// The tool surface is governed by the call pipeline's own rate-limit
		// hook; the management surface gets the edge middleware.
		let management = Router::new()
			.route("/upstreams", post(register_upstream).get(list_upstreams))
			.route("/upstreams/discover", post(discover_upstreams))
			.route("/upstreams/health", get(upstream_health))
			.route("/upstreams/select", get(select_upstream))
			.route("/upstreams/statistics", get(upstream_statistics))
			.route("/upstreams/{id}", get(describe_upstream).delete(unregister_upstream))
			.route("/executions", post(start_execution).get(list_active_executions))
			.route("/executions/history", get(list_execution_history))
			.route("/executions/status", get(executions_status))
			.route("/executions/{id}", get(get_execution))
			.route("/executions/{id}/end", post(end_execution))
			.route("/executions/{id}/metrics", post(update_execution_metrics))
			.route("/executions/{id}/interrupt", post(interrupt_execution))
			.route("/executions/{id}/soft-limits", get(check_soft_limits))
			.route("/executions/{id}/hard-limits", get(check_hard_limits))
			.route("/apikeys", post(generate_api_key).get(list_api_keys))
			.route("/apikeys/validate", post(validate_api_key))
			.route("/apikeys/{id}", delete(revoke_api_key))
			.route("/policies", post(create_policy))
			.route("/policies/evaluate", post(evaluate_policy))
			.route("/policies/check-access", post(check_access))
			.route("/policies/ip-lists", get(get_ip_lists).post(add_ip).delete(remove_ip))
			.route("/policies/{name}", put(update_policy))
			.route("/policies/{name}/versions", get(policy_versions))
			.route("/policies/{name}/activate", post(activate_policy))
			.route("/ratelimits", post(add_rate_limit).get(list_rate_limits))
			.route("/ratelimits/statistics", get(rate_limit_statistics))
			.route("/ratelimits/{key}", get(rate_limit_status).delete(remove_rate_limit))
			.route("/ratelimits/{key}/reset", post(reset_rate_limit))
			.layer(middleware::from_fn_with_state(
				self.manager.rate_limiter(),
				rate_limit_middleware,
			))
			.with_state(self.clone());

		let tools = Router::new()
			.route("/tools", get(list_tools))
			.route("/tools/call", post(call_tool))
			.with_state(self.clone());

		management.merge(tools)
	}
}

// Upstreams

async fn register_upstream(
	State(app): State<App>,
	Json(config): Json<UpstreamConfig>,
) -> Result<Json<Value>, ProxyError> {
	let id = app.manager.register(config).await?;
	Ok(Json(json!({"id": id})))
}

async fn list_upstreams(State(app): State<App>) -> Json<Value> {
	Json(json!({"upstreams": app.manager.list_servers().await}))
}

async fn describe_upstream(
	State(app): State<App>,
	Path(id): Path<String>,
) -> Result<Json<Value>, ProxyError> {
	match app.manager.server_info(&id).await {
		Some(info) => Ok(Json(json!(info))),
		None => Err(ProxyError::UnknownUpstream(id)),
	}
}

async fn unregister_upstream(
	State(app): State<App>,
	Path(id): Path<String>,
) -> Result<Json<Value>, ProxyError> {
	app.manager.unregister(&id).await?;
	Ok(Json(json!({"unregistered": id})))
}

async fn discover_upstreams(State(app): State<App>) -> Json<Value> {
	let candidates = app.manager.discover().await;
	Json(json!({"candidates": candidates}))
}

async fn upstream_health(State(app): State<App>) -> Json<Value> {
	Json(json!(app.manager.health_check().await))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SelectQuery {
	#[serde(default)]
	client_key: Option<String>,
}

/// Strategy-based selection over the healthy set.
async fn select_upstream(
	State(app): State<App>,
	Query(query): Query<SelectQuery>,
) -> Result<Json<Value>, ProxyError> {
	match app
		.manager
		.balancer()
		.get_server(query.client_key.as_deref())
		.await
	{
		Some(upstream) => Ok(Json(json!({"id": upstream.id, "endpoint": upstream.endpoint}))),
		None => Err(ProxyError::NoHealthyUpstream),
	}
}

async fn upstream_statistics(State(app): State<App>) -> Json<Value> {
	Json(json!(app.manager.balancer().statistics().await))
}

// Tools

async fn list_tools(State(app): State<App>) -> Json<Value> {
	Json(json!({"tools": app.manager.relay().list_tools().await}))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CallToolRequest {
	name: String,
	#[serde(default)]
	arguments: Value,
}

async fn call_tool(
	State(app): State<App>,
	headers: HeaderMap,
	Json(request): Json<CallToolRequest>,
) -> Result<Json<Value>, ProxyError> {
	let ctx = call_context(&app, &headers).await?;
	let result = app
		.manager
		.relay()
		.call_tool(&request.name, request.arguments, &ctx)
		.await?;
	Ok(Json(json!({"result": result})))
}

/// Resolve the caller identity. A presented api key must validate; absent
/// keys fall back to the anonymous identity.
async fn call_context(app: &App, headers: &HeaderMap) -> Result<CallContext, ProxyError> {
	let client_ip = headers
		.get("x-forwarded-for")
		.and_then(|v| v.to_str().ok())
		.and_then(|v| v.split(',').next())
		.map(|v| v.trim().to_string());
	match headers.get("x-api-key").and_then(|v| v.to_str().ok()) {
		Some(key) => {
			let record = app
				.api_keys
				.validate(key)
				.await
				.ok_or_else(|| ProxyError::Authentication("invalid api key".to_string()))?;
			Ok(CallContext {
				user_id: record.owner,
				api_key: Some(key.to_string()),
				client_ip,
			})
		},
		None => Ok(CallContext {
			user_id: "anonymous".to_string(),
			api_key: None,
			client_ip,
		}),
	}
}

// Executions

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartExecutionRequest {
	tool_id: String,
	user_id: String,
	#[serde(default)]
	limits: Option<ResourceLimits>,
}

async fn start_execution(
	State(app): State<App>,
	Json(request): Json<StartExecutionRequest>,
) -> Json<Value> {
	let id = app
		.manager
		.limits()
		.start_execution(&request.tool_id, &request.user_id, request.limits, None);
	Json(json!({"executionId": id}))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EndExecutionRequest {
	status: ExecutionStatus,
	#[serde(default)]
	error: Option<String>,
}

async fn end_execution(
	State(app): State<App>,
	Path(id): Path<String>,
	Json(request): Json<EndExecutionRequest>,
) -> Result<Json<Value>, ProxyError> {
	if app
		.manager
		.limits()
		.end_execution(&id, request.status, request.error)
	{
		Ok(Json(json!({"ended": id})))
	} else {
		Err(ProxyError::Validation(format!("unknown execution {}", id)))
	}
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateMetricsRequest {
	#[serde(default)]
	cpu_time: Option<f64>,
	#[serde(default)]
	memory_usage: Option<f64>,
	#[serde(default)]
	api_calls: Option<u64>,
}

async fn update_execution_metrics(
	State(app): State<App>,
	Path(id): Path<String>,
	Json(request): Json<UpdateMetricsRequest>,
) -> Result<Json<Value>, ProxyError> {
	if app.manager.limits().update_metrics(
		&id,
		request.cpu_time,
		request.memory_usage,
		request.api_calls,
	) {
		Ok(Json(json!({"updated": id})))
	} else {
		Err(ProxyError::Validation(format!("unknown execution {}", id)))
	}
}

async fn get_execution(
	State(app): State<App>,
	Path(id): Path<String>,
) -> Result<Json<Value>, ProxyError> {
	match app.manager.limits().get(&id) {
		Some(info) => Ok(Json(json!(info))),
		None => Err(ProxyError::Validation(format!("unknown execution {}", id))),
	}
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExecutionListQuery {
	#[serde(default)]
	user_id: Option<String>,
	#[serde(default)]
	limit: Option<usize>,
}

async fn list_active_executions(
	State(app): State<App>,
	Query(query): Query<ExecutionListQuery>,
) -> Json<Value> {
	let executions = app.manager.limits().list_active(query.user_id.as_deref());
	Json(json!({"executions": executions}))
}

async fn list_execution_history(
	State(app): State<App>,
	Query(query): Query<ExecutionListQuery>,
) -> Json<Value> {
	let executions = app
		.manager
		.limits()
		.list_history(query.user_id.as_deref(), query.limit.unwrap_or(100));
	Json(json!({"executions": executions}))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct InterruptRequest {
	#[serde(default = "default_interrupt_reason")]
	reason: String,
}

fn default_interrupt_reason() -> String {
	"manual interruption".to_string()
}

async fn interrupt_execution(
	State(app): State<App>,
	Path(id): Path<String>,
	Json(request): Json<InterruptRequest>,
) -> Result<Json<Value>, ProxyError> {
	if app.manager.limits().interrupt(&id, &request.reason) {
		Ok(Json(json!({"interrupted": id})))
	} else {
		Err(ProxyError::Validation(format!("unknown execution {}", id)))
	}
}

async fn check_soft_limits(State(app): State<App>, Path(id): Path<String>) -> Json<Value> {
	Json(json!(app.manager.limits().check_soft_limits(&id)))
}

async fn check_hard_limits(State(app): State<App>, Path(id): Path<String>) -> Json<Value> {
	Json(json!(app.manager.limits().check_hard_limits(&id)))
}

async fn executions_status(State(app): State<App>) -> Json<Value> {
	Json(json!(app.manager.limits().status()))
}

// API keys

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateKeyRequest {
	name: String,
	owner: String,
	#[serde(default)]
	permissions: Vec<String>,
	#[serde(default)]
	expires_in_days: Option<i64>,
}

async fn generate_api_key(
	State(app): State<App>,
	Json(request): Json<GenerateKeyRequest>,
) -> Result<Json<Value>, ProxyError> {
	let (api_key, record) = app
		.api_keys
		.generate(
			&request.name,
			&request.owner,
			request.permissions,
			request.expires_in_days,
		)
		.await?;
	// The plaintext appears in this response and nowhere else.
	Ok(Json(json!({"apiKey": api_key, "record": record})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ValidateKeyRequest {
	api_key: String,
}

async fn validate_api_key(
	State(app): State<App>,
	Json(request): Json<ValidateKeyRequest>,
) -> Result<Json<Value>, ProxyError> {
	match app.api_keys.validate(&request.api_key).await {
		Some(record) => Ok(Json(json!(record))),
		None => Err(ProxyError::Authentication("invalid api key".to_string())),
	}
}

async fn revoke_api_key(
	State(app): State<App>,
	Path(id): Path<String>,
) -> Result<Json<Value>, ProxyError> {
	if app.api_keys.revoke(&id).await {
		Ok(Json(json!({"revoked": id})))
	} else {
		Err(ProxyError::Validation(format!("unknown key {}", id)))
	}
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct KeyListQuery {
	#[serde(default)]
	owner: Option<String>,
}

async fn list_api_keys(State(app): State<App>, Query(query): Query<KeyListQuery>) -> Json<Value> {
	Json(json!({"keys": app.api_keys.list(query.owner.as_deref()).await}))
}

// Policies

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolicyRequest {
	name: String,
	content: String,
	#[serde(default)]
	description: String,
	#[serde(default = "default_author")]
	author: String,
}

fn default_author() -> String {
	"system".to_string()
}

async fn create_policy(State(app): State<App>, Json(request): Json<PolicyRequest>) -> Json<Value> {
	let version = app.manager.policy().create_policy(
		&request.name,
		&request.content,
		&request.description,
		&request.author,
	);
	Json(json!({"name": request.name, "version": version}))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PolicyUpdateRequest {
	content: String,
	#[serde(default)]
	description: String,
	#[serde(default = "default_author")]
	author: String,
}

async fn update_policy(
	State(app): State<App>,
	Path(name): Path<String>,
	Json(request): Json<PolicyUpdateRequest>,
) -> Result<Json<Value>, ProxyError> {
	let version = app.manager.policy().update_policy(
		&name,
		&request.content,
		&request.description,
		&request.author,
	)?;
	Ok(Json(json!({"name": name, "version": version})))
}

async fn policy_versions(State(app): State<App>, Path(name): Path<String>) -> Json<Value> {
	Json(json!({"versions": app.manager.policy().policy_versions(&name)}))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ActivatePolicyRequest {
	version: String,
}

async fn activate_policy(
	State(app): State<App>,
	Path(name): Path<String>,
	Json(request): Json<ActivatePolicyRequest>,
) -> Result<Json<Value>, ProxyError> {
	if app
		.manager
		.policy()
		.activate_policy_version(&name, &request.version)
	{
		Ok(Json(json!({"name": name, "active": request.version})))
	} else {
		Err(ProxyError::Validation(format!(
			"unknown policy version {}/{}",
			name, request.version
		)))
	}
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct EvaluatePolicyRequest {
	policy: String,
	#[serde(default)]
	input: Value,
}

async fn evaluate_policy(
	State(app): State<App>,
	Json(request): Json<EvaluatePolicyRequest>,
) -> Result<Json<Value>, ProxyError> {
	let result = app
		.manager
		.policy()
		.evaluate_policy(&request.policy, request.input)
		.await?;
	Ok(Json(result))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckAccessRequest {
	user_id: String,
	resource: String,
	action: String,
	#[serde(default)]
	context: Option<serde_json::Map<String, Value>>,
}

async fn check_access(
	State(app): State<App>,
	Json(request): Json<CheckAccessRequest>,
) -> Json<Value> {
	let allowed = app
		.manager
		.policy()
		.check_access(
			&request.user_id,
			&request.resource,
			&request.action,
			request.context.as_ref(),
		)
		.await;
	Json(json!({"allowed": allowed}))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct IpListRequest {
	list: String,
	ip: String,
}

async fn get_ip_lists(State(app): State<App>) -> Json<Value> {
	Json(json!(app.manager.policy().ip_lists()))
}

async fn add_ip(
	State(app): State<App>,
	Json(request): Json<IpListRequest>,
) -> Result<Json<Value>, ProxyError> {
	match request.list.as_str() {
		"allow" => app.manager.policy().add_allowed_ip(&request.ip),
		"deny" => app.manager.policy().add_denied_ip(&request.ip),
		other => {
			return Err(ProxyError::Validation(format!(
				"unknown ip list {}, expected allow or deny",
				other
			)));
		},
	}
	Ok(Json(json!({"added": request.ip, "list": request.list})))
}

async fn remove_ip(
	State(app): State<App>,
	Json(request): Json<IpListRequest>,
) -> Result<Json<Value>, ProxyError> {
	let removed = match request.list.as_str() {
		"allow" => app.manager.policy().remove_allowed_ip(&request.ip),
		"deny" => app.manager.policy().remove_denied_ip(&request.ip),
		other => {
			return Err(ProxyError::Validation(format!(
				"unknown ip list {}, expected allow or deny",
				other
			)));
		},
	};
	Ok(Json(json!({"removed": removed})))
}

// Rate limits

async fn add_rate_limit(
	State(app): State<App>,
	Json(config): Json<RateLimitConfig>,
) -> Json<Value> {
	let key = config.key.clone();
	app.manager.rate_limiter().add(config);
	Json(json!({"added": key}))
}

async fn remove_rate_limit(
	State(app): State<App>,
	Path(key): Path<String>,
) -> Result<Json<Value>, ProxyError> {
	if app.manager.rate_limiter().remove(&key) {
		Ok(Json(json!({"removed": key})))
	} else {
		Err(ProxyError::Validation(format!("unknown rate limit {}", key)))
	}
}

async fn rate_limit_status(
	State(app): State<App>,
	Path(key): Path<String>,
) -> Result<Json<Value>, ProxyError> {
	match app.manager.rate_limiter().status(&key) {
		Some(status) => Ok(Json(json!(status))),
		None => Err(ProxyError::Validation(format!("unknown rate limit {}", key))),
	}
}

async fn list_rate_limits(State(app): State<App>) -> Json<Value> {
	Json(json!({"rateLimits": app.manager.rate_limiter().list()}))
}

async fn rate_limit_statistics(State(app): State<App>) -> Json<Value> {
	Json(json!(app.manager.rate_limiter().statistics()))
}

async fn reset_rate_limit(
	State(app): State<App>,
	Path(key): Path<String>,
) -> Result<Json<Value>, ProxyError> {
	if app.manager.rate_limiter().reset(&key) {
		Ok(Json(json!({"reset": key})))
	} else {
		Err(ProxyError::Validation(format!("unknown rate limit {}", key)))
	}
}
