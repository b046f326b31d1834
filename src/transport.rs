use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use tracing::{info, warn};

pub mod http;
pub mod stdio;
pub mod websocket;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
	Http,
	Websocket,
	Stdio,
}

impl Default for TransportKind {
	fn default() -> Self {
		TransportKind::Http
	}
}

impl std::fmt::Display for TransportKind {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			TransportKind::Http => write!(f, "http"),
			TransportKind::Websocket => write!(f, "websocket"),
			TransportKind::Stdio => write!(f, "stdio"),
		}
	}
}

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
	#[error("transport not connected")]
	NotConnected,

	#[error("no compatible plugin for transport kind {0}")]
	NoCompatiblePlugin(TransportKind),

	#[error("invalid transport config: {0}")]
	InvalidConfig(String),

	#[error("{url} returned {code}")]
	Status { code: u16, url: String },

	#[error("request timed out")]
	Timeout,

	#[error("i/o error: {0}")]
	Io(#[from] std::io::Error),

	#[error("http error: {0}")]
	Http(#[from] reqwest::Error),

	#[error("websocket error: {0}")]
	WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

	#[error("invalid payload: {0}")]
	Serde(#[from] serde_json::Error),
}

/// Point-in-time view of a transport, shaped for the management surface.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStatus {
	pub name: String,
	pub kind: TransportKind,
	pub initialized: bool,
	pub connected: bool,
}

/// Uniform send/receive contract over heterogeneous protocols. Messages are
/// JSON values; `receive` may block (websocket, stdio) or poll (http).
#[async_trait::async_trait]
pub trait Transport: Send + Sync {
	async fn initialize(&mut self) -> Result<(), TransportError>;
	async fn connect(&mut self) -> Result<(), TransportError>;
	async fn disconnect(&mut self) -> Result<(), TransportError>;
	async fn send(&mut self, message: &Value) -> Result<(), TransportError>;
	async fn receive(&mut self) -> Result<Option<Value>, TransportError>;
	fn is_connected(&self) -> bool;
	fn status(&self) -> TransportStatus;

	/// Liveness handle for transports that own a child process. The health
	/// checker observes the flag instead of scanning the process table.
	fn liveness(&self) -> Option<Arc<AtomicBool>> {
		None
	}
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PluginConfig {
	pub name: String,
	pub kind: TransportKind,
	#[serde(default = "default_version")]
	pub version: String,
	#[serde(default)]
	pub description: String,
	#[serde(default)]
	pub config_schema: Value,
	#[serde(default)]
	pub default_config: Value,
	#[serde(default = "default_true")]
	pub enabled: bool,
	#[serde(default = "default_priority")]
	pub priority: i32,
}

fn default_version() -> String {
	"1.0.0".to_string()
}

fn default_true() -> bool {
	true
}

fn default_priority() -> i32 {
	100
}

pub type TransportConstructor =
	Arc<dyn Fn(&Value) -> Result<Box<dyn Transport>, TransportError> + Send + Sync>;

struct RegisteredPlugin {
	config: PluginConfig,
	construct: TransportConstructor,
}

/// Named transport plugins with priorities. `create_connection` picks the
/// highest-priority enabled plugin of the requested kind and returns a
/// connected instance.
pub struct PluginRegistry {
	plugins: HashMap<String, RegisteredPlugin>,
}

impl Default for PluginRegistry {
	fn default() -> Self {
		Self::new()
	}
}

impl PluginRegistry {
	/// Registry with the three built-in transports registered.
	pub fn new() -> Self {
		let mut registry = Self {
			plugins: HashMap::new(),
		};
		registry.register(
			PluginConfig {
				name: "http".to_string(),
				kind: TransportKind::Http,
				version: default_version(),
				description: "HTTP transport".to_string(),
				config_schema: json!({
					"type": "object",
					"properties": {
						"baseUrl": {"type": "string"},
						"timeout": {"type": "number"},
					},
					"required": ["baseUrl"],
				}),
				default_config: json!({"baseUrl": "http://localhost:8000", "timeout": 30.0}),
				enabled: true,
				priority: default_priority(),
			},
			Arc::new(|config: &Value| Ok(Box::new(http::HttpTransport::from_config(config)?) as Box<dyn Transport>)),
		);
		registry.register(
			PluginConfig {
				name: "websocket".to_string(),
				kind: TransportKind::Websocket,
				version: default_version(),
				description: "WebSocket transport".to_string(),
				config_schema: json!({
					"type": "object",
					"properties": {
						"url": {"type": "string"},
						"timeout": {"type": "number"},
					},
					"required": ["url"],
				}),
				default_config: json!({"url": "ws://localhost:8080", "timeout": 30.0}),
				enabled: true,
				priority: default_priority(),
			},
			Arc::new(|config: &Value| {
				Ok(Box::new(websocket::WebSocketTransport::from_config(config)?) as Box<dyn Transport>)
			}),
		);
		registry.register(
			PluginConfig {
				name: "stdio".to_string(),
				kind: TransportKind::Stdio,
				version: default_version(),
				description: "Child process stdio transport".to_string(),
				config_schema: json!({
					"type": "object",
					"properties": {
						"command": {"type": "string"},
						"timeout": {"type": "number"},
					},
					"required": ["command"],
				}),
				default_config: json!({"timeout": 30.0}),
				enabled: true,
				priority: default_priority(),
			},
			Arc::new(|config: &Value| Ok(Box::new(stdio::StdioTransport::from_config(config)?) as Box<dyn Transport>)),
		);
		registry
	}

	pub fn register(&mut self, config: PluginConfig, construct: TransportConstructor) {
		info!(name = %config.name, kind = %config.kind, "registered transport plugin");
		self.plugins.insert(
			config.name.clone(),
			RegisteredPlugin { config, construct },
		);
	}

	pub fn get(&self, name: &str) -> Option<&PluginConfig> {
		self.plugins.get(name).map(|p| &p.config)
	}

	pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
		match self.plugins.get_mut(name) {
			Some(plugin) => {
				plugin.config.enabled = enabled;
				true
			},
			None => false,
		}
	}

	pub fn list(&self) -> Vec<PluginConfig> {
		let mut configs: Vec<PluginConfig> =
			self.plugins.values().map(|p| p.config.clone()).collect();
		configs.sort_by(|a, b| a.name.cmp(&b.name));
		configs
	}

	/// Build a transport for the requested kind without connecting it. The
	/// plugin's default config is merged with the caller's overrides.
	pub fn build(&self, kind: TransportKind, overrides: &Value) -> Result<Box<dyn Transport>, TransportError> {
		let plugin = self
			.plugins
			.values()
			.filter(|p| p.config.kind == kind && p.config.enabled)
			.max_by_key(|p| p.config.priority)
			.ok_or(TransportError::NoCompatiblePlugin(kind))?;
		let config = merge_config(&plugin.config.default_config, overrides);
		(plugin.construct)(&config)
	}

	/// Build and connect in one step.
	pub async fn create_connection(
		&self,
		kind: TransportKind,
		overrides: &Value,
	) -> Result<Box<dyn Transport>, TransportError> {
		let mut transport = self.build(kind, overrides)?;
		transport.initialize().await?;
		transport.connect().await?;
		Ok(transport)
	}

	/// Load plugin manifests from a directory. Each `*.json` file declares a
	/// plugin config plus the name of a built-in constructor to bind it to.
	/// Malformed manifests are logged and skipped.
	pub fn load_manifest_dir(&mut self, dir: &Path) -> usize {
		let entries = match std::fs::read_dir(dir) {
			Ok(entries) => entries,
			Err(e) => {
				warn!(dir = %dir.display(), "failed to read plugin directory: {}", e);
				return 0;
			},
		};
		let mut loaded = 0;
		for entry in entries.flatten() {
			let path = entry.path();
			if path.extension().and_then(|e| e.to_str()) != Some("json") {
				continue;
			}
			match self.load_manifest(&path) {
				Ok(name) => {
					info!(plugin = %name, path = %path.display(), "loaded plugin manifest");
					loaded += 1;
				},
				Err(e) => {
					warn!(path = %path.display(), "skipping plugin manifest: {}", e);
				},
			}
		}
		loaded
	}

	fn load_manifest(&mut self, path: &Path) -> Result<String, TransportError> {
		let raw = std::fs::read_to_string(path)?;
		let manifest: PluginManifest = serde_json::from_str(&raw)?;
		let construct = self
			.plugins
			.get(&manifest.builtin)
			.map(|p| p.construct.clone())
			.ok_or_else(|| {
				TransportError::InvalidConfig(format!("unknown builtin {}", manifest.builtin))
			})?;
		let name = manifest.config.name.clone();
		self.register(manifest.config, construct);
		Ok(name)
	}
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PluginManifest {
	/// Name of the built-in constructor this manifest binds to.
	builtin: String,
	#[serde(flatten)]
	config: PluginConfig,
}

fn merge_config(defaults: &Value, overrides: &Value) -> Value {
	match (defaults, overrides) {
		(Value::Object(base), Value::Object(extra)) => {
			let mut merged = base.clone();
			for (key, value) in extra {
				merged.insert(key.clone(), value.clone());
			}
			Value::Object(merged)
		},
		(_, Value::Null) => defaults.clone(),
		_ => overrides.clone(),
	}
}
