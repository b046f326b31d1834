use crate::config::UpstreamConfig;
use crate::errors::ProxyError;
use crate::transport::http::HttpTransport;
use crate::transport::{PluginRegistry, Transport, TransportError, TransportKind};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use tokio::sync::Mutex;
use tracing::{debug, instrument};

const PROTOCOL_VERSION: &str = "2024-11-05";
// Unrelated frames tolerated while waiting for a response id.
const MAX_RESPONSE_SKEW: usize = 32;

/// One pooled connection slot per upstream.
pub(crate) struct ConnectionPool {
	registry: Arc<PluginRegistry>,
	by_id: HashMap<String, Arc<UpstreamConnection>>,
}

impl ConnectionPool {
	pub(crate) fn new(registry: Arc<PluginRegistry>) -> Self {
		Self {
			registry,
			by_id: HashMap::new(),
		}
	}

	pub(crate) async fn get_or_create(
		&mut self,
		config: &UpstreamConfig,
	) -> Result<Arc<UpstreamConnection>, ProxyError> {
		if !self.by_id.contains_key(&config.id) {
			self.connect(config).await?;
		}
		self
			.by_id
			.get(&config.id)
			.cloned()
			.ok_or_else(|| ProxyError::UnknownUpstream(config.id.clone()))
	}

	pub(crate) fn get(&self, id: &str) -> Option<Arc<UpstreamConnection>> {
		self.by_id.get(id).cloned()
	}

	pub(crate) fn remove(&mut self, id: &str) -> Option<Arc<UpstreamConnection>> {
		self.by_id.remove(id)
	}

	#[instrument(level = "debug", skip_all, fields(upstream = %config.id))]
	async fn connect(&mut self, config: &UpstreamConfig) -> Result<(), ProxyError> {
		debug!("connecting to upstream");
		let connection = match config.transport {
			TransportKind::Http => {
				// The HTTP dialect dispatches request/response RPC directly,
				// so the pool holds the concrete transport.
				let mut transport = HttpTransport::new(config.endpoint.clone(), config.request_timeout())
					.with_auth_token(config.auth_token.clone());
				transport.initialize().await.map_err(connectivity)?;
				transport.connect().await.map_err(connectivity)?;
				UpstreamConnection::Http(transport)
			},
			TransportKind::Websocket => {
				let overrides = json!({
					"url": config.endpoint,
					"timeout": config.timeout as f64,
				});
				let transport = self
					.registry
					.create_connection(TransportKind::Websocket, &overrides)
					.await
					.map_err(connectivity)?;
				let connection = UpstreamConnection::Framed {
					kind: TransportKind::Websocket,
					transport: Mutex::new(transport),
					next_id: AtomicU64::new(1),
				};
				// WebSocket upstreams expect an initialize exchange first.
				connection
					.rpc(
						"initialize",
						json!({
							"protocolVersion": PROTOCOL_VERSION,
							"clientInfo": {
								"name": env!("CARGO_PKG_NAME"),
								"version": env!("CARGO_PKG_VERSION"),
							},
						}),
					)
					.await?;
				connection
			},
			TransportKind::Stdio => {
				let overrides = json!({
					"command": config.endpoint,
					"timeout": config.timeout as f64,
				});
				let transport = self
					.registry
					.create_connection(TransportKind::Stdio, &overrides)
					.await
					.map_err(connectivity)?;
				UpstreamConnection::Framed {
					kind: TransportKind::Stdio,
					transport: Mutex::new(transport),
					next_id: AtomicU64::new(1),
				}
			},
		};
		self.by_id.insert(config.id.clone(), Arc::new(connection));
		Ok(())
	}
}

/// A live upstream connection. HTTP is request/response; websocket and stdio
/// speak framed JSON-RPC with send and receive paired under one lock.
pub(crate) enum UpstreamConnection {
	Http(HttpTransport),
	Framed {
		kind: TransportKind,
		transport: Mutex<Box<dyn Transport>>,
		next_id: AtomicU64,
	},
}

impl UpstreamConnection {
	pub(crate) async fn list_tools(&self) -> Result<Vec<Value>, ProxyError> {
		match self {
			UpstreamConnection::Http(transport) => {
				let body = transport
					.post_json("/tools/list", &json!({}))
					.await
					.map_err(classify)?;
				Ok(extract_tools(&body))
			},
			UpstreamConnection::Framed { .. } => {
				let result = self.rpc("tools/list", json!({})).await?;
				Ok(extract_tools(&result))
			},
		}
	}

	pub(crate) async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, ProxyError> {
		match self {
			UpstreamConnection::Http(transport) => {
				let body = transport
					.post_json("/tools/call", &json!({"name": name, "arguments": arguments}))
					.await
					.map_err(classify)?;
				Ok(body.get("result").cloned().unwrap_or(body))
			},
			UpstreamConnection::Framed { .. } => {
				self
					.rpc("tools/call", json!({"name": name, "arguments": arguments}))
					.await
			},
		}
	}

	/// One JSON-RPC round trip. The transport lock is held across the send
	/// and the receive so request/response pairing survives concurrency.
	async fn rpc(&self, method: &str, params: Value) -> Result<Value, ProxyError> {
		let UpstreamConnection::Framed {
			transport, next_id, ..
		} = self
		else {
			return Err(ProxyError::Internal(
				"rpc is only defined for framed transports".to_string(),
			));
		};
		let id = next_id.fetch_add(1, Ordering::Relaxed);
		let request = json!({
			"jsonrpc": "2.0",
			"id": id,
			"method": method,
			"params": params,
		});
		let mut transport = transport.lock().await;
		transport.send(&request).await.map_err(classify)?;
		for _ in 0..MAX_RESPONSE_SKEW {
			let message = transport
				.receive()
				.await
				.map_err(classify)?
				.ok_or_else(|| ProxyError::UpstreamUnavailable("connection closed".to_string()))?;
			if message.get("id").and_then(Value::as_u64) != Some(id) {
				// Notification or a stale response; keep reading.
				continue;
			}
			if let Some(error) = message.get("error") {
				let detail = error
					.get("message")
					.and_then(Value::as_str)
					.unwrap_or("upstream error");
				return Err(ProxyError::ToolExecution(detail.to_string()));
			}
			return Ok(message.get("result").cloned().unwrap_or(Value::Null));
		}
		Err(ProxyError::ToolExecution(
			"no response for request id".to_string(),
		))
	}

	pub(crate) async fn close(&self) {
		if let UpstreamConnection::Framed { transport, .. } = self {
			let mut transport = transport.lock().await;
			if let Err(e) = transport.disconnect().await {
				debug!("error closing upstream connection: {}", e);
			}
		}
	}

	pub(crate) fn stdio_liveness(&self) -> Option<Arc<AtomicBool>> {
		match self {
			UpstreamConnection::Framed {
				kind: TransportKind::Stdio,
				transport,
				..
			} => transport.try_lock().ok().and_then(|t| t.liveness()),
			_ => None,
		}
	}
}

fn extract_tools(body: &Value) -> Vec<Value> {
	body
		.get("result")
		.and_then(|r| r.get("tools"))
		.or_else(|| body.get("tools"))
		.and_then(Value::as_array)
		.cloned()
		.unwrap_or_default()
}

/// Protocol-level failures (upstream said no) stay as tool-execution errors;
/// everything else is connectivity and eligible for retry.
fn classify(error: TransportError) -> ProxyError {
	match error {
		TransportError::Status { code, url } => {
			ProxyError::ToolExecution(format!("HTTP {} from {}", code, url))
		},
		TransportError::Serde(e) => ProxyError::ToolExecution(format!("invalid payload: {}", e)),
		other => connectivity(other),
	}
}

fn connectivity(error: TransportError) -> ProxyError {
	ProxyError::UpstreamUnavailable(error.to_string())
}
