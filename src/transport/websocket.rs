use super::{Transport, TransportError, TransportKind, TransportStatus};
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::debug;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// WebSocket transport: framed JSON text messages.
pub struct WebSocketTransport {
	name: String,
	url: String,
	timeout: Duration,
	stream: Option<WsStream>,
	initialized: bool,
}

impl WebSocketTransport {
	pub fn new(url: impl Into<String>, timeout: Duration) -> Self {
		Self {
			name: "websocket".to_string(),
			url: url.into(),
			timeout,
			stream: None,
			initialized: false,
		}
	}

	pub fn from_config(config: &Value) -> Result<Self, TransportError> {
		let url = config
			.get("url")
			.and_then(|v| v.as_str())
			.ok_or_else(|| TransportError::InvalidConfig("url is required".to_string()))?;
		let timeout = config
			.get("timeout")
			.and_then(|v| v.as_f64())
			.unwrap_or(30.0);
		Ok(Self::new(url, Duration::from_secs_f64(timeout)))
	}

	/// Open a connection and exchange a ping/pong. This is the liveness probe
	/// the health checker uses for websocket upstreams.
	pub async fn probe(url: &str, timeout: Duration) -> bool {
		let connect = tokio::time::timeout(timeout, connect_async(url));
		let (mut stream, _) = match connect.await {
			Ok(Ok(conn)) => conn,
			_ => return false,
		};
		if stream.send(Message::Ping(Vec::new())).await.is_err() {
			return false;
		}
		let pong = tokio::time::timeout(timeout, async {
			while let Some(message) = stream.next().await {
				match message {
					Ok(Message::Pong(_)) => return true,
					Ok(_) => continue,
					Err(_) => return false,
				}
			}
			false
		});
		let alive = matches!(pong.await, Ok(true));
		let _ = stream.close(None).await;
		alive
	}
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
	async fn initialize(&mut self) -> Result<(), TransportError> {
		self.initialized = true;
		Ok(())
	}

	async fn connect(&mut self) -> Result<(), TransportError> {
		let connect = tokio::time::timeout(self.timeout, connect_async(self.url.as_str()));
		let (stream, _) = connect.await.map_err(|_| TransportError::Timeout)??;
		self.stream = Some(stream);
		debug!(url = %self.url, "websocket transport connected");
		Ok(())
	}

	async fn disconnect(&mut self) -> Result<(), TransportError> {
		if let Some(mut stream) = self.stream.take() {
			let _ = stream.close(None).await;
		}
		Ok(())
	}

	async fn send(&mut self, message: &Value) -> Result<(), TransportError> {
		let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
		let text = serde_json::to_string(message)?;
		stream.send(Message::Text(text.into())).await?;
		Ok(())
	}

	async fn receive(&mut self) -> Result<Option<Value>, TransportError> {
		let outcome = {
			let stream = self.stream.as_mut().ok_or(TransportError::NotConnected)?;
			tokio::time::timeout(self.timeout, async {
				while let Some(message) = stream.next().await {
					match message? {
						Message::Text(text) => {
							return Ok(Some(serde_json::from_str(text.as_ref())?));
						},
						Message::Binary(data) => {
							return Ok(Some(serde_json::from_slice(&data)?));
						},
						Message::Close(_) => return Ok(None),
						// Ping/pong frames are control traffic, keep reading.
						_ => continue,
					}
				}
				Ok(None)
			})
			.await
		};
		let result: Result<Option<Value>, TransportError> = match outcome {
			Ok(result) => result,
			Err(_) => return Err(TransportError::Timeout),
		};
		if matches!(result, Ok(None)) {
			// Peer closed the stream.
			self.stream = None;
		}
		result
	}

	fn is_connected(&self) -> bool {
		self.stream.is_some()
	}

	fn status(&self) -> TransportStatus {
		TransportStatus {
			name: self.name.clone(),
			kind: TransportKind::Websocket,
			initialized: self.initialized,
			connected: self.stream.is_some(),
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[test]
	fn from_config_requires_url() {
		assert!(WebSocketTransport::from_config(&json!({})).is_err());
		let transport =
			WebSocketTransport::from_config(&json!({"url": "ws://localhost:9000", "timeout": 2.0}))
				.unwrap();
		assert_eq!(transport.status().kind, TransportKind::Websocket);
		assert!(!transport.is_connected());
	}

	#[tokio::test]
	async fn send_without_connect_is_rejected() {
		let mut transport = WebSocketTransport::new("ws://localhost:1", Duration::from_millis(100));
		let err = transport.send(&json!({})).await.err().unwrap();
		assert!(matches!(err, TransportError::NotConnected));
	}

	#[tokio::test]
	async fn probe_of_unreachable_endpoint_is_false() {
		assert!(!WebSocketTransport::probe("ws://127.0.0.1:1", Duration::from_millis(200)).await);
	}
}
