use prometheus_client::metrics::counter::Counter;
use prometheus_client::registry::Registry;

/// Counters for the ingress plane. The host process owns the registry and
/// whatever serves it; this module only populates it.
#[derive(Debug, Default, Clone)]
pub struct Metrics {
	pub requests: Counter,
	pub request_errors: Counter,
	pub packets_routed: Counter,
	pub packets_dropped: Counter,
	pub ttl_exceeded: Counter,
	pub icmp_requests: Counter,
	pub icmp_replies: Counter,
}

impl Metrics {
	pub fn register(registry: &mut Registry) -> Self {
		let m = Metrics::default();
		registry.register(
			"proxied_requests",
			"Requests routed through the ingress matcher",
			m.requests.clone(),
		);
		registry.register(
			"proxied_request_errors",
			"Requests answered with a synthesized error",
			m.request_errors.clone(),
		);
		registry.register(
			"routed_packets",
			"Raw IP datagrams pulled off the tunnel",
			m.packets_routed.clone(),
		);
		registry.register(
			"dropped_packets",
			"Datagrams dropped before reaching the icmp proxy",
			m.packets_dropped.clone(),
		);
		registry.register(
			"ttl_exceeded_replies",
			"Time-exceeded replies synthesized by the router",
			m.ttl_exceeded.clone(),
		);
		registry.register(
			"icmp_echo_requests",
			"Echo requests forwarded to the platform proxy",
			m.icmp_requests.clone(),
		);
		registry.register(
			"icmp_echo_replies",
			"Echo replies returned to the tunnel",
			m.icmp_replies.clone(),
		);
		m
	}
}
