use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use prometheus_client::encoding::text::encode;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tracing::error;

/// Prometheus text exporter for the proxy's metric registry.
pub fn router(registry: Arc<Registry>) -> Router {
	Router::new()
		.route("/metrics", get(export_metrics))
		.with_state(registry)
}

async fn export_metrics(State(registry): State<Arc<Registry>>) -> Result<String, StatusCode> {
	let mut body = String::new();
	encode(&mut body, &registry).map_err(|e| {
		error!("failed to encode metrics: {}", e);
		StatusCode::INTERNAL_SERVER_ERROR
	})?;
	Ok(body)
}

#[cfg(test)]
mod tests {
	use super::*;
	use axum::body::Body;
	use axum::http::Request;
	use tower::ServiceExt as _;

	#[tokio::test]
	async fn exports_recorded_counters_as_prometheus_text() {
		let mut registry = Registry::default();
		let metrics = crate::relay::metrics::Metrics::new(&mut registry);
		metrics.record_tool_call("srv", "echo");

		let router = router(Arc::new(registry));
		let response = router
			.oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
			.await
			.unwrap();
		assert_eq!(response.status(), StatusCode::OK);
		let body = axum::body::to_bytes(response.into_body(), usize::MAX)
			.await
			.unwrap();
		let text = String::from_utf8(body.to_vec()).unwrap();
		assert!(text.contains("mcp_relay_tool_calls_total"));
		assert!(text.contains("upstream=\"srv\""));
	}
}
