use super::{Transport, TransportError, TransportKind, TransportStatus};
use serde_json::Value;
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tracing::{debug, warn};

/// Line-delimited JSON over a child process's standard streams. Writes are
/// `json + "\n"` to stdin, reads are one line from stdout.
pub struct StdioTransport {
	name: String,
	command: String,
	timeout: Duration,
	child: Option<Child>,
	stdin: Option<ChildStdin>,
	stdout: Option<Lines<BufReader<ChildStdout>>>,
	alive: Arc<AtomicBool>,
	initialized: bool,
}

impl StdioTransport {
	pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
		Self {
			name: "stdio".to_string(),
			command: command.into(),
			timeout,
			child: None,
			stdin: None,
			stdout: None,
			alive: Arc::new(AtomicBool::new(false)),
			initialized: false,
		}
	}

	pub fn from_config(config: &Value) -> Result<Self, TransportError> {
		let command = config
			.get("command")
			.and_then(|v| v.as_str())
			.ok_or_else(|| TransportError::InvalidConfig("command is required".to_string()))?;
		let timeout = config
			.get("timeout")
			.and_then(|v| v.as_f64())
			.unwrap_or(30.0);
		Ok(Self::new(command, Duration::from_secs_f64(timeout)))
	}

	fn mark_dead(&mut self) {
		self.alive.store(false, Ordering::Relaxed);
		self.stdin = None;
		self.stdout = None;
	}

	/// Observe child liveness without blocking. Reaps the exit status when
	/// the process has already terminated.
	fn child_alive(&mut self) -> bool {
		match self.child.as_mut() {
			Some(child) => match child.try_wait() {
				Ok(None) => true,
				Ok(Some(status)) => {
					debug!(command = %self.command, %status, "stdio child exited");
					self.mark_dead();
					false
				},
				Err(e) => {
					warn!(command = %self.command, "stdio child wait failed: {}", e);
					self.mark_dead();
					false
				},
			},
			None => false,
		}
	}
}

#[async_trait::async_trait]
impl Transport for StdioTransport {
	async fn initialize(&mut self) -> Result<(), TransportError> {
		if self.command.trim().is_empty() {
			return Err(TransportError::InvalidConfig(
				"command must not be empty".to_string(),
			));
		}
		self.initialized = true;
		Ok(())
	}

	async fn connect(&mut self) -> Result<(), TransportError> {
		let mut parts = self.command.split_whitespace();
		let program = parts
			.next()
			.ok_or_else(|| TransportError::InvalidConfig("command must not be empty".to_string()))?;
		let mut child = Command::new(program)
			.args(parts)
			.stdin(Stdio::piped())
			.stdout(Stdio::piped())
			.stderr(Stdio::null())
			.spawn()?;
		self.stdin = child.stdin.take();
		self.stdout = child
			.stdout
			.take()
			.map(|out| BufReader::new(out).lines());
		self.child = Some(child);
		self.alive.store(true, Ordering::Relaxed);
		debug!(command = %self.command, "stdio transport connected");
		Ok(())
	}

	async fn disconnect(&mut self) -> Result<(), TransportError> {
		// Closing stdin asks the child to exit; kill after a bounded wait.
		self.stdin = None;
		self.stdout = None;
		if let Some(mut child) = self.child.take() {
			match tokio::time::timeout(Duration::from_secs(5), child.wait()).await {
				Ok(_) => {},
				Err(_) => {
					warn!(command = %self.command, "stdio child did not exit, killing");
					let _ = child.kill().await;
				},
			}
		}
		self.alive.store(false, Ordering::Relaxed);
		Ok(())
	}

	async fn send(&mut self, message: &Value) -> Result<(), TransportError> {
		if !self.child_alive() {
			return Err(TransportError::NotConnected);
		}
		let stdin = self.stdin.as_mut().ok_or(TransportError::NotConnected)?;
		let mut line = serde_json::to_vec(message)?;
		line.push(b'\n');
		stdin.write_all(&line).await?;
		stdin.flush().await?;
		Ok(())
	}

	async fn receive(&mut self) -> Result<Option<Value>, TransportError> {
		if !self.child_alive() {
			return Ok(None);
		}
		let stdout = self.stdout.as_mut().ok_or(TransportError::NotConnected)?;
		let line = tokio::time::timeout(self.timeout, stdout.next_line())
			.await
			.map_err(|_| TransportError::Timeout)??;
		match line {
			Some(line) if !line.trim().is_empty() => Ok(Some(serde_json::from_str(line.trim())?)),
			Some(_) => Ok(None),
			None => {
				// EOF: the child closed stdout.
				self.mark_dead();
				Ok(None)
			},
		}
	}

	fn is_connected(&self) -> bool {
		self.alive.load(Ordering::Relaxed)
	}

	fn status(&self) -> TransportStatus {
		TransportStatus {
			name: self.name.clone(),
			kind: TransportKind::Stdio,
			initialized: self.initialized,
			connected: self.is_connected(),
		}
	}

	fn liveness(&self) -> Option<Arc<AtomicBool>> {
		Some(self.alive.clone())
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde_json::json;

	#[tokio::test]
	async fn round_trips_one_line_through_cat() {
		let mut transport = StdioTransport::new("cat", Duration::from_secs(5));
		transport.initialize().await.unwrap();
		transport.connect().await.unwrap();
		assert!(transport.is_connected());

		let request = json!({"jsonrpc": "2.0", "id": 1, "method": "tools/list", "params": {}});
		transport.send(&request).await.unwrap();
		let echoed = transport.receive().await.unwrap().unwrap();
		assert_eq!(echoed, request);

		transport.disconnect().await.unwrap();
		assert!(!transport.is_connected());
	}

	#[tokio::test]
	async fn liveness_flag_tracks_child_exit() {
		let mut transport = StdioTransport::new("true", Duration::from_secs(5));
		transport.initialize().await.unwrap();
		transport.connect().await.unwrap();
		let alive = transport.liveness().unwrap();
		assert!(alive.load(Ordering::Relaxed));

		// `true` exits immediately; the next send observes the dead child.
		tokio::time::sleep(Duration::from_millis(200)).await;
		let err = transport.send(&json!({})).await.err().unwrap();
		assert!(matches!(err, TransportError::NotConnected));
		assert!(!alive.load(Ordering::Relaxed));
	}

	#[tokio::test]
	async fn connect_fails_for_missing_program() {
		let mut transport = StdioTransport::new("definitely-not-a-real-binary", Duration::from_secs(1));
		transport.initialize().await.unwrap();
		assert!(transport.connect().await.is_err());
	}
}
