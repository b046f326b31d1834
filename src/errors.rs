use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde_json::json;

/// Error taxonomy for the proxy core. Connectivity errors are retried by the
/// call pipeline and converted to `UpstreamUnavailable` on exhaustion; every
/// other variant propagates unchanged to the boundary.
#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error("validation failed: {0}")]
	Validation(String),

	#[error("authentication failed: {0}")]
	Authentication(String),

	#[error("not authorized: {0}")]
	Authorization(String),

	#[error("tool not found: {0}")]
	ToolNotFound(String),

	#[error("unknown upstream: {0}")]
	UnknownUpstream(String),

	#[error("no healthy upstream available")]
	NoHealthyUpstream,

	#[error("upstream unavailable: {0}")]
	UpstreamUnavailable(String),

	#[error("rate limit exceeded")]
	RateLimitExceeded {
		limit: u64,
		remaining: u64,
		reset_time: DateTime<Utc>,
		retry_after: Option<u64>,
	},

	#[error("resource limit exceeded: {0}")]
	ResourceLimitExceeded(String),

	#[error("tool execution failed: {0}")]
	ToolExecution(String),

	#[error("internal error: {0}")]
	Internal(String),
}

impl ProxyError {
	/// Boundary error code. `ToolExecution` is internal vocabulary and maps
	/// to `INTERNAL_ERROR` at the edge; unknown upstream ids are an invariant
	/// violation and map to `VALIDATION_ERROR`.
	pub fn code(&self) -> &'static str {
		match self {
			ProxyError::Validation(_) | ProxyError::UnknownUpstream(_) => "VALIDATION_ERROR",
			ProxyError::Authentication(_) => "AUTHENTICATION_ERROR",
			ProxyError::Authorization(_) => "AUTHORIZATION_ERROR",
			ProxyError::ToolNotFound(_) => "TOOL_NOT_FOUND",
			ProxyError::NoHealthyUpstream | ProxyError::UpstreamUnavailable(_) => {
				"UPSTREAM_UNAVAILABLE"
			},
			ProxyError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
			ProxyError::ResourceLimitExceeded(_) => "RESOURCE_LIMIT_EXCEEDED",
			ProxyError::ToolExecution(_) | ProxyError::Internal(_) => "INTERNAL_ERROR",
		}
	}

	pub fn status(&self) -> StatusCode {
		match self {
			ProxyError::Validation(_) | ProxyError::UnknownUpstream(_) => StatusCode::BAD_REQUEST,
			ProxyError::Authentication(_) => StatusCode::UNAUTHORIZED,
			ProxyError::Authorization(_) => StatusCode::FORBIDDEN,
			ProxyError::ToolNotFound(_) => StatusCode::NOT_FOUND,
			ProxyError::NoHealthyUpstream | ProxyError::UpstreamUnavailable(_) => {
				StatusCode::SERVICE_UNAVAILABLE
			},
			ProxyError::RateLimitExceeded { .. } | ProxyError::ResourceLimitExceeded(_) => {
				StatusCode::TOO_MANY_REQUESTS
			},
			ProxyError::ToolExecution(_) | ProxyError::Internal(_) => {
				StatusCode::INTERNAL_SERVER_ERROR
			},
		}
	}

	/// Connectivity errors are the only retryable class.
	pub fn is_retryable(&self) -> bool {
		matches!(self, ProxyError::UpstreamUnavailable(_))
	}
}

impl IntoResponse for ProxyError {
	fn into_response(self) -> Response {
		let mut body = json!({
			"error": self.code(),
			"detail": self.to_string(),
		});
		if let ProxyError::RateLimitExceeded {
			limit,
			remaining,
			reset_time,
			retry_after,
		} = &self
		{
			body["limit"] = json!(limit);
			body["remaining"] = json!(remaining);
			body["reset_time"] = json!(reset_time.to_rfc3339());
			if let Some(retry_after) = retry_after {
				body["retry_after"] = json!(retry_after);
			}
			let mut response = (self.status(), Json(body)).into_response();
			let headers = response.headers_mut();
			headers.insert("x-ratelimit-limit", header_value(limit.to_string()));
			headers.insert("x-ratelimit-remaining", header_value(remaining.to_string()));
			headers.insert("x-ratelimit-reset", header_value(reset_time.to_rfc3339()));
			if let Some(retry_after) = retry_after {
				headers.insert("retry-after", header_value(retry_after.to_string()));
			}
			return response;
		}
		(self.status(), Json(body)).into_response()
	}
}

fn header_value(value: String) -> http::HeaderValue {
	http::HeaderValue::from_str(&value)
		.unwrap_or_else(|_| http::HeaderValue::from_static("invalid"))
}
