use serde::{Deserialize, Serialize};

use crate::config::opt_duration;
use crate::ingress::ip_rules::IpRule;
use crate::*;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TLS_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_TCP_KEEPALIVE: Duration = Duration::from_secs(30);
pub const DEFAULT_KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(90);
pub const DEFAULT_KEEPALIVE_CONNECTIONS: usize = 100;
pub const DEFAULT_PROXY_ADDRESS: &str = "127.0.0.1";

/// Fully-resolved per-rule proxy parameters. Values cascade: per-rule
/// override > global override > built-in default. Immutable once the ingress
/// is constructed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OriginRequestConfig {
	pub connect_timeout: Duration,
	pub tls_timeout: Duration,
	pub tcp_keepalive: Duration,
	pub no_happy_eyeballs: bool,
	pub keepalive_connections: usize,
	pub keepalive_timeout: Duration,
	pub http_host_header: Option<Strng>,
	pub origin_server_name: Option<Strng>,
	pub ca_pool: Option<Strng>,
	pub no_tls_verify: bool,
	pub disable_chunked_encoding: bool,
	pub bastion_mode: bool,
	pub proxy_address: Strng,
	pub proxy_port: u16,
	pub proxy_type: ProxyType,
	pub ip_rules: Vec<IpRule>,
	pub http2_origin: bool,
	pub access: AccessConfig,
}

impl Default for OriginRequestConfig {
	fn default() -> Self {
		OriginRequestConfig {
			connect_timeout: DEFAULT_CONNECT_TIMEOUT,
			tls_timeout: DEFAULT_TLS_TIMEOUT,
			tcp_keepalive: DEFAULT_TCP_KEEPALIVE,
			no_happy_eyeballs: false,
			keepalive_connections: DEFAULT_KEEPALIVE_CONNECTIONS,
			keepalive_timeout: DEFAULT_KEEPALIVE_TIMEOUT,
			http_host_header: None,
			origin_server_name: None,
			ca_pool: None,
			no_tls_verify: false,
			disable_chunked_encoding: false,
			bastion_mode: false,
			proxy_address: strng::literal!("127.0.0.1"),
			proxy_port: 0,
			proxy_type: ProxyType::Direct,
			ip_rules: Vec::new(),
			http2_origin: false,
			access: AccessConfig::default(),
		}
	}
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProxyType {
	#[default]
	#[serde(rename = "")]
	Direct,
	#[serde(rename = "socks")]
	Socks,
}

/// Access (JWT) enforcement parameters for a rule.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AccessConfig {
	#[serde(default)]
	pub required: bool,
	#[serde(default)]
	pub team_name: Strng,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub aud_tag: Vec<Strng>,
}

/// The wire form of OriginRequestConfig: every field optional, absent meaning
/// "inherit". Durations are human strings ("30s", "2m").
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields, default)]
pub struct RawOriginRequest {
	#[serde(with = "opt_duration", skip_serializing_if = "Option::is_none")]
	pub connect_timeout: Option<Duration>,
	#[serde(with = "opt_duration", skip_serializing_if = "Option::is_none")]
	pub tls_timeout: Option<Duration>,
	#[serde(with = "opt_duration", skip_serializing_if = "Option::is_none")]
	pub tcp_keep_alive: Option<Duration>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub no_happy_eyeballs: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub keep_alive_connections: Option<usize>,
	#[serde(with = "opt_duration", skip_serializing_if = "Option::is_none")]
	pub keep_alive_timeout: Option<Duration>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub http_host_header: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub origin_server_name: Option<Strng>,
	#[serde(rename = "caPool", skip_serializing_if = "Option::is_none")]
	pub ca_pool: Option<Strng>,
	#[serde(rename = "noTLSVerify", skip_serializing_if = "Option::is_none")]
	pub no_tls_verify: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub disable_chunked_encoding: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub bastion_mode: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub proxy_address: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub proxy_port: Option<u16>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub proxy_type: Option<ProxyType>,
	#[serde(rename = "ipRules", skip_serializing_if = "Option::is_none")]
	pub ip_rules: Option<Vec<IpRule>>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub http2_origin: Option<bool>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub access: Option<AccessConfig>,
}

impl OriginRequestConfig {
	/// Resolve a single raw layer against the built-in defaults.
	pub fn from_raw(raw: &RawOriginRequest) -> Self {
		Self::default().apply(raw)
	}

	/// Cascade resolution: rule-level values override global ones, which
	/// override the built-in defaults.
	pub fn cascade(global: &RawOriginRequest, rule: &RawOriginRequest) -> Self {
		Self::default().apply(global).apply(rule)
	}

	fn apply(mut self, raw: &RawOriginRequest) -> Self {
		if let Some(v) = raw.connect_timeout {
			self.connect_timeout = v;
		}
		if let Some(v) = raw.tls_timeout {
			self.tls_timeout = v;
		}
		if let Some(v) = raw.tcp_keep_alive {
			self.tcp_keepalive = v;
		}
		if let Some(v) = raw.no_happy_eyeballs {
			self.no_happy_eyeballs = v;
		}
		if let Some(v) = raw.keep_alive_connections {
			self.keepalive_connections = v;
		}
		if let Some(v) = raw.keep_alive_timeout {
			self.keepalive_timeout = v;
		}
		if let Some(v) = &raw.http_host_header {
			self.http_host_header = Some(v.clone());
		}
		if let Some(v) = &raw.origin_server_name {
			self.origin_server_name = Some(v.clone());
		}
		if let Some(v) = &raw.ca_pool {
			self.ca_pool = Some(v.clone());
		}
		if let Some(v) = raw.no_tls_verify {
			self.no_tls_verify = v;
		}
		if let Some(v) = raw.disable_chunked_encoding {
			self.disable_chunked_encoding = v;
		}
		if let Some(v) = raw.bastion_mode {
			self.bastion_mode = v;
		}
		if let Some(v) = &raw.proxy_address {
			self.proxy_address = v.clone();
		}
		if let Some(v) = raw.proxy_port {
			self.proxy_port = v;
		}
		if let Some(v) = raw.proxy_type {
			self.proxy_type = v;
		}
		if let Some(v) = &raw.ip_rules {
			self.ip_rules = v.clone();
		}
		if let Some(v) = raw.http2_origin {
			self.http2_origin = v;
		}
		if let Some(v) = &raw.access {
			self.access = v.clone();
		}
		self
	}

	/// Serialize back to the wire form. Fields still holding their built-in
	/// default become absent, so a config round-trips to the minimal document.
	pub fn to_raw(&self) -> RawOriginRequest {
		let defaults = Self::default();
		RawOriginRequest {
			connect_timeout: (self.connect_timeout != defaults.connect_timeout)
				.then_some(self.connect_timeout),
			tls_timeout: (self.tls_timeout != defaults.tls_timeout).then_some(self.tls_timeout),
			tcp_keep_alive: (self.tcp_keepalive != defaults.tcp_keepalive)
				.then_some(self.tcp_keepalive),
			no_happy_eyeballs: (self.no_happy_eyeballs != defaults.no_happy_eyeballs)
				.then_some(self.no_happy_eyeballs),
			keep_alive_connections: (self.keepalive_connections != defaults.keepalive_connections)
				.then_some(self.keepalive_connections),
			keep_alive_timeout: (self.keepalive_timeout != defaults.keepalive_timeout)
				.then_some(self.keepalive_timeout),
			http_host_header: self.http_host_header.clone(),
			origin_server_name: self.origin_server_name.clone(),
			ca_pool: self.ca_pool.clone(),
			no_tls_verify: (self.no_tls_verify != defaults.no_tls_verify).then_some(self.no_tls_verify),
			disable_chunked_encoding: (self.disable_chunked_encoding
				!= defaults.disable_chunked_encoding)
				.then_some(self.disable_chunked_encoding),
			bastion_mode: (self.bastion_mode != defaults.bastion_mode).then_some(self.bastion_mode),
			proxy_address: (self.proxy_address != defaults.proxy_address)
				.then(|| self.proxy_address.clone()),
			proxy_port: (self.proxy_port != defaults.proxy_port).then_some(self.proxy_port),
			proxy_type: (self.proxy_type != defaults.proxy_type).then_some(self.proxy_type),
			ip_rules: (!self.ip_rules.is_empty()).then(|| self.ip_rules.clone()),
			http2_origin: (self.http2_origin != defaults.http2_origin).then_some(self.http2_origin),
			access: (self.access != defaults.access).then(|| self.access.clone()),
		}
	}
}

#[cfg(test)]
#[path = "origin_request_test.rs"]
mod tests;
