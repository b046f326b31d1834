use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CallLabels {
	upstream: String,
	tool: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct CallErrorLabels {
	upstream: String,
	tool: String,
	code: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct ListLabels {
	resource: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct UpstreamLabels {
	upstream: String,
	transport: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
struct KeyLabels {
	key: String,
}

/// Counters for the relay's call surface. All families live under the
/// proxy's metric prefix.
pub struct Metrics {
	tool_calls: Family<CallLabels, Counter>,
	tool_call_errors: Family<CallErrorLabels, Counter>,
	list_calls: Family<ListLabels, Counter>,
	upstream_registrations: Family<UpstreamLabels, Counter>,
	rate_limit_denials: Family<KeyLabels, Counter>,
}

impl Metrics {
	pub fn new(registry: &mut Registry) -> Self {
		let registry = registry.sub_registry_with_prefix("mcp_relay");

		let tool_calls = Family::default();
		registry.register(
			"tool_calls",
			"Tool calls dispatched to upstreams",
			tool_calls.clone(),
		);

		let tool_call_errors = Family::default();
		registry.register(
			"tool_call_errors",
			"Tool calls that settled with an error, by boundary code",
			tool_call_errors.clone(),
		);

		let list_calls = Family::default();
		registry.register(
			"list_calls",
			"Aggregated list operations served from the tool cache",
			list_calls.clone(),
		);

		let upstream_registrations = Family::default();
		registry.register(
			"upstream_registrations",
			"Upstreams registered with the relay",
			upstream_registrations.clone(),
		);

		let rate_limit_denials = Family::default();
		registry.register(
			"rate_limit_denials",
			"Calls denied by the rate limiter, by limited key",
			rate_limit_denials.clone(),
		);

		Self {
			tool_calls,
			tool_call_errors,
			list_calls,
			upstream_registrations,
			rate_limit_denials,
		}
	}

	pub fn record_tool_call(&self, upstream: &str, tool: &str) {
		self
			.tool_calls
			.get_or_create(&CallLabels {
				upstream: upstream.to_string(),
				tool: tool.to_string(),
			})
			.inc();
	}

	pub fn record_tool_call_error(&self, upstream: &str, tool: &str, code: &str) {
		self
			.tool_call_errors
			.get_or_create(&CallErrorLabels {
				upstream: upstream.to_string(),
				tool: tool.to_string(),
				code: code.to_string(),
			})
			.inc();
	}

	pub fn record_list_call(&self, resource: &str) {
		self
			.list_calls
			.get_or_create(&ListLabels {
				resource: resource.to_string(),
			})
			.inc();
	}

	pub fn record_registration(&self, upstream: &str, transport: &str) {
		self
			.upstream_registrations
			.get_or_create(&UpstreamLabels {
				upstream: upstream.to_string(),
				transport: transport.to_string(),
			})
			.inc();
	}

	pub fn record_rate_limit_denial(&self, key: &str) {
		self
			.rate_limit_denials
			.get_or_create(&KeyLabels {
				key: key.to_string(),
			})
			.inc();
	}
}
