use std::env;

use tracing_subscriber::prelude::*;
use tracing_subscriber::{EnvFilter, fmt};

/// Install the global tracing subscriber. The filter comes from RUST_LOG
/// (default `info`); TUNNEL_LOG_FORMAT=json switches to structured output for
/// log collectors.
pub fn setup_logging() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let json = env::var("TUNNEL_LOG_FORMAT")
		.map(|v| v.eq_ignore_ascii_case("json"))
		.unwrap_or(false);

	if json {
		tracing_subscriber::registry()
			.with(filter)
			.with(fmt::layer().json().flatten_event(true))
			.init();
	} else {
		tracing_subscriber::registry()
			.with(filter)
			.with(fmt::layer())
			.init();
	}
}

/// Like `setup_logging`, but tolerant of an already-installed subscriber.
/// Tests call this from multiple entry points.
pub fn try_setup_logging() {
	let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
	let _ = tracing_subscriber::registry()
		.with(filter)
		.with(fmt::layer())
		.try_init();
}
