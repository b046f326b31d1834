use super::{Transport, TransportError, TransportKind, TransportStatus};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

/// HTTP transport. `send` posts to `{base}/mcp/message`, `receive` polls
/// `{base}/mcp/messages`. Connectivity is a `/health` probe.
pub struct HttpTransport {
	name: String,
	base_url: String,
	timeout: Duration,
	auth_token: Option<String>,
	client: Option<reqwest::Client>,
	connected: bool,
}

impl HttpTransport {
	pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
		Self {
			name: "http".to_string(),
			base_url: base_url.into(),
			timeout,
			auth_token: None,
			client: None,
			connected: false,
		}
	}

	pub fn from_config(config: &Value) -> Result<Self, TransportError> {
		let base_url = config
			.get("baseUrl")
			.and_then(|v| v.as_str())
			.ok_or_else(|| TransportError::InvalidConfig("baseUrl is required".to_string()))?;
		let timeout = config
			.get("timeout")
			.and_then(|v| v.as_f64())
			.unwrap_or(30.0);
		let mut transport = Self::new(base_url, Duration::from_secs_f64(timeout));
		if let Some(token) = config.get("authToken").and_then(|v| v.as_str()) {
			transport.auth_token = Some(token.to_string());
		}
		Ok(transport)
	}

	pub fn with_auth_token(mut self, token: Option<String>) -> Self {
		self.auth_token = token;
		self
	}

	fn client(&self) -> Result<&reqwest::Client, TransportError> {
		self.client.as_ref().ok_or(TransportError::NotConnected)
	}

	fn request(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
		match &self.auth_token {
			Some(token) => builder.bearer_auth(token),
			None => builder,
		}
	}

	/// POST a JSON body to a path under the base url and parse the response.
	/// Used both by the transport contract and by the relay's RPC dispatch.
	pub async fn post_json(&self, path: &str, body: &Value) -> Result<Value, TransportError> {
		let client = self.client()?;
		let url = format!("{}{}", self.base_url, path);
		let response = self.request(client.post(&url)).json(body).send().await?;
		let status = response.status();
		if !status.is_success() {
			return Err(TransportError::Status {
				code: status.as_u16(),
				url,
			});
		}
		Ok(response.json().await?)
	}

	pub async fn get_json(&self, path: &str) -> Result<Value, TransportError> {
		let client = self.client()?;
		let url = format!("{}{}", self.base_url, path);
		let response = self.request(client.get(&url)).send().await?;
		let status = response.status();
		if !status.is_success() {
			return Err(TransportError::Status {
				code: status.as_u16(),
				url,
			});
		}
		Ok(response.json().await?)
	}

	pub fn base_url(&self) -> &str {
		&self.base_url
	}
}

#[async_trait::async_trait]
impl Transport for HttpTransport {
	async fn initialize(&mut self) -> Result<(), TransportError> {
		self.client = Some(
			reqwest::Client::builder()
				.timeout(self.timeout)
				.build()?,
		);
		Ok(())
	}

	async fn connect(&mut self) -> Result<(), TransportError> {
		let client = self.client()?;
		let url = format!("{}/health", self.base_url);
		let response = self.request(client.get(&url)).send().await?;
		if response.status() != reqwest::StatusCode::OK {
			return Err(TransportError::Status {
				code: response.status().as_u16(),
				url,
			});
		}
		self.connected = true;
		debug!(base_url = %self.base_url, "http transport connected");
		Ok(())
	}

	async fn disconnect(&mut self) -> Result<(), TransportError> {
		self.client = None;
		self.connected = false;
		Ok(())
	}

	async fn send(&mut self, message: &Value) -> Result<(), TransportError> {
		if !self.connected {
			return Err(TransportError::NotConnected);
		}
		self.post_json("/mcp/message", message).await?;
		Ok(())
	}

	async fn receive(&mut self) -> Result<Option<Value>, TransportError> {
		if !self.connected {
			return Ok(None);
		}
		match self.get_json("/mcp/messages").await {
			Ok(Value::Null) => Ok(None),
			Ok(message) => Ok(Some(message)),
			Err(e) => {
				debug!("http receive poll failed: {}", e);
				Ok(None)
			},
		}
	}

	fn is_connected(&self) -> bool {
		self.connected && self.client.is_some()
	}

	fn status(&self) -> TransportStatus {
		TransportStatus {
			name: self.name.clone(),
			kind: TransportKind::Http,
			initialized: self.client.is_some(),
			connected: self.connected,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;
	use wiremock::matchers::{body_json, method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	async fn connected_transport(server: &MockServer) -> HttpTransport {
		Mock::given(method("GET"))
			.and(path("/health"))
			.respond_with(ResponseTemplate::new(200))
			.mount(server)
			.await;
		let mut transport = HttpTransport::new(server.uri(), Duration::from_secs(5));
		transport.initialize().await.unwrap();
		transport.connect().await.unwrap();
		transport
	}

	#[tokio::test]
	async fn connect_requires_healthy_probe() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/health"))
			.respond_with(ResponseTemplate::new(503))
			.mount(&server)
			.await;
		let mut transport = HttpTransport::new(server.uri(), Duration::from_secs(5));
		transport.initialize().await.unwrap();
		assert!(transport.connect().await.is_err());
		assert!(!transport.is_connected());
	}

	#[tokio::test]
	async fn send_posts_to_message_endpoint() {
		let server = MockServer::start().await;
		let mut transport = connected_transport(&server).await;
		Mock::given(method("POST"))
			.and(path("/mcp/message"))
			.and(body_json(json!({"jsonrpc": "2.0", "id": 1, "method": "ping"})))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
			.expect(1)
			.mount(&server)
			.await;
		transport
			.send(&json!({"jsonrpc": "2.0", "id": 1, "method": "ping"}))
			.await
			.unwrap();
	}

	#[tokio::test]
	async fn receive_polls_messages_endpoint() {
		let server = MockServer::start().await;
		let mut transport = connected_transport(&server).await;
		Mock::given(method("GET"))
			.and(path("/mcp/messages"))
			.respond_with(ResponseTemplate::new(200).set_body_json(json!({"id": 7, "result": {}})))
			.mount(&server)
			.await;
		let message = transport.receive().await.unwrap().unwrap();
		assert_eq!(message["id"], 7);
	}

	#[tokio::test]
	async fn send_without_connect_is_rejected() {
		let mut transport = HttpTransport::new("http://localhost:1", Duration::from_secs(1));
		transport.initialize().await.unwrap();
		let err = transport.send(&json!({})).await.err().unwrap();
		assert!(matches!(err, TransportError::NotConnected));
	}
}
