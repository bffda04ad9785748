//! The ingress rule set: an ordered list of (hostname, path) matchers, each
//! bound to an origin service. Rules are validated and frozen at construction;
//! lookups are read-only and lock-free.

pub mod ip_rules;
pub mod origin_request;

use std::path::PathBuf;

use regex::Regex;
use url::Url;

use crate::access::JwtValidator;
use crate::config::UnvalidatedIngressRule;
use crate::http::Middleware;
use crate::origin::Origin;
use crate::*;
pub use origin_request::{OriginRequestConfig, ProxyType, RawOriginRequest};

#[derive(thiserror::Error, Debug)]
pub enum IngressError {
	#[error("ingress must have at least one rule")]
	Empty,
	#[error("the last ingress rule must be a catch-all (no hostname or path)")]
	LastRuleNotCatchAll,
	#[error("rule {0}: only the last ingress rule may be a catch-all")]
	CatchAllNotLast(usize),
	#[error("rule {0}: hostname may only contain a wildcard as its leading character")]
	StrayWildcard(usize),
	#[error("rule {0}: hostname must not contain a port")]
	HostnameHasPort(usize),
	#[error("rule {0}: invalid path regex: {1}")]
	InvalidPathRegex(usize, regex::Error),
	#[error("rule {0}: {1}")]
	Service(usize, ServiceError),
	#[error("rule {0}: access enforcement requires a team name")]
	AccessTeamMissing(usize),
}

#[derive(thiserror::Error, Debug)]
pub enum ServiceError {
	#[error("invalid url: {0}")]
	InvalidUrl(url::ParseError),
	#[error("service url must include a scheme and hostname, e.g. https://localhost:8000")]
	MissingHost,
	#[error("service url must not include a path")]
	PathNotAllowed,
	#[error("service {0}:// requires an explicit port")]
	MissingPort(Strng),
	#[error("invalid http status code: {0}")]
	InvalidStatusCode(String),
	#[error("{0}")]
	Unsupported(&'static str),
}

/// A parsed, validated service destination. Construction of the live origin
/// happens separately so the matcher stays free of IO.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Service {
	/// http, https, ws, or wss URL.
	Http { url: Url },
	Unix { path: PathBuf, tls: bool },
	/// Arbitrary TCP carried over WebSocket framing to the edge.
	TcpOverWs { scheme: Strng, dest: Strng },
	/// TCP-over-WS whose destination arrives per request in a header.
	Bastion,
	SocksProxy,
	HelloWorld,
	Status { code: u16, is_default: bool },
}

impl Display for Service {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		match self {
			Service::Http { url } => write!(f, "{url}"),
			Service::Unix { path, tls } => {
				write!(f, "unix{}:{}", if *tls { "+tls" } else { "" }, path.display())
			},
			Service::TcpOverWs { scheme, dest } => write!(f, "{scheme}://{dest}"),
			Service::Bastion => write!(f, "bastion"),
			Service::SocksProxy => write!(f, "socks-proxy"),
			Service::HelloWorld => write!(f, "hello-world"),
			Service::Status { code, .. } => write!(f, "http_status:{code}"),
		}
	}
}

// Schemes whose TCP destinations have well-known defaults injected when the
// URL omits the port.
const TCP_DEFAULT_PORTS: &[(&str, u16)] = &[("ssh", 22), ("rdp", 3389), ("smb", 445), ("tcp", 7864)];

pub fn parse_service(service: &str) -> Result<Service, ServiceError> {
	if let Some(path) = service.strip_prefix("unix+tls:") {
		if cfg!(not(unix)) {
			return Err(ServiceError::Unsupported(
				"unix socket services are not supported on this platform",
			));
		}
		return Ok(Service::Unix {
			path: PathBuf::from(path),
			tls: true,
		});
	}
	if let Some(path) = service.strip_prefix("unix:") {
		if cfg!(not(unix)) {
			return Err(ServiceError::Unsupported(
				"unix socket services are not supported on this platform",
			));
		}
		return Ok(Service::Unix {
			path: PathBuf::from(path),
			tls: false,
		});
	}
	if let Some(code) = service.strip_prefix("http_status:") {
		let parsed: u16 = code
			.parse()
			.map_err(|_| ServiceError::InvalidStatusCode(code.to_string()))?;
		if parsed > 999 {
			return Err(ServiceError::InvalidStatusCode(code.to_string()));
		}
		return Ok(Service::Status {
			code: parsed,
			is_default: false,
		});
	}
	match service {
		"hello-world" | "hello_world" => return Ok(Service::HelloWorld),
		"bastion" => return Ok(Service::Bastion),
		"socks-proxy" => return Ok(Service::SocksProxy),
		_ => {},
	}

	let url = Url::parse(service).map_err(ServiceError::InvalidUrl)?;
	let host = url.host_str().ok_or(ServiceError::MissingHost)?;
	if !matches!(url.path(), "" | "/") {
		return Err(ServiceError::PathNotAllowed);
	}
	match url.scheme() {
		"http" | "https" | "ws" | "wss" => Ok(Service::Http { url }),
		scheme => {
			let port = match url.port() {
				Some(p) => p,
				None => TCP_DEFAULT_PORTS
					.iter()
					.find(|(s, _)| *s == scheme)
					.map(|(_, p)| *p)
					.ok_or_else(|| ServiceError::MissingPort(scheme.into()))?,
			};
			Ok(Service::TcpOverWs {
				scheme: scheme.into(),
				dest: strng::format!("{host}:{port}"),
			})
		},
	}
}

pub struct Rule {
	pub hostname: Strng,
	/// Derived ASCII alias for Unicode hostnames, compared like the primary.
	pub punycode_hostname: Option<Strng>,
	pub path: Option<Regex>,
	pub service: Service,
	pub handlers: Vec<Arc<dyn Middleware>>,
	pub config: OriginRequestConfig,
	pub origin: Arc<Origin>,
}

impl Debug for Rule {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Rule")
			.field("hostname", &self.hostname)
			.field("path", &self.path.as_ref().map(|r| r.as_str()))
			.field("service", &self.service)
			.finish()
	}
}

impl Rule {
	pub fn matches(&self, hostname: &str, path: &str) -> bool {
		let host_ok = hostname_match(&self.hostname, hostname)
			|| self
				.punycode_hostname
				.as_deref()
				.map(|alias| hostname_match(alias, hostname))
				.unwrap_or(false);
		let path_ok = self
			.path
			.as_ref()
			.map(|re| re.is_match(path))
			.unwrap_or(true);
		host_ok && path_ok
	}

	fn is_catch_all(&self) -> bool {
		(self.hostname.is_empty() || self.hostname == "*") && self.path.is_none()
	}
}

/// Wildcard rules match any request hostname that ends with the characters
/// after the `*` (so `*.example.com` covers `a.example.com` but not the bare
/// apex `example.com`).
fn hostname_match(rule: &str, host: &str) -> bool {
	if rule.is_empty() || rule == "*" {
		return true;
	}
	if let Some(suffix) = rule.strip_prefix('*') {
		return host.ends_with(suffix);
	}
	rule == host
}

/// Drop a trailing `:port` from a request hostname. Bracketed IPv6 literals
/// keep their brackets.
pub fn strip_port(hostname: &str) -> &str {
	if let Some(end) = hostname.find(']') {
		return &hostname[..=end];
	}
	match hostname.rsplit_once(':') {
		Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => host,
		_ => hostname,
	}
}

fn punycode_alias(hostname: &str) -> Option<Strng> {
	if hostname.is_ascii() {
		return None;
	}
	let (prefix, bare) = match hostname.strip_prefix("*.") {
		Some(rest) => ("*.", rest),
		None => ("", hostname),
	};
	// The url crate normalizes Unicode hosts to their punycode form.
	let url = Url::parse(&format!("http://{bare}")).ok()?;
	let ascii = url.host_str()?;
	if ascii == bare {
		return None;
	}
	Some(strng::format!("{prefix}{ascii}"))
}

#[derive(Debug)]
pub struct Ingress {
	/// Matched before user rules; lookup reports them with negative indices.
	pub internal_rules: Vec<Rule>,
	pub rules: Vec<Rule>,
	pub defaults: OriginRequestConfig,
}

impl Ingress {
	/// Validate and freeze a rule list. The final rule must be a catch-all and
	/// no earlier rule may be.
	pub fn parse(
		rules: &[UnvalidatedIngressRule],
		global: &RawOriginRequest,
	) -> Result<Ingress, IngressError> {
		if rules.is_empty() {
			return Err(IngressError::Empty);
		}
		let mut parsed = Vec::with_capacity(rules.len());
		for (index, raw) in rules.iter().enumerate() {
			parsed.push(Self::parse_rule(index, raw, global)?);
		}
		for (index, rule) in parsed.iter().enumerate() {
			let last = index == parsed.len() - 1;
			if last && !rule.is_catch_all() {
				return Err(IngressError::LastRuleNotCatchAll);
			}
			if !last && rule.is_catch_all() {
				return Err(IngressError::CatchAllNotLast(index));
			}
		}
		Ok(Ingress {
			internal_rules: Vec::new(),
			rules: parsed,
			defaults: OriginRequestConfig::from_raw(global),
		})
	}

	fn parse_rule(
		index: usize,
		raw: &UnvalidatedIngressRule,
		global: &RawOriginRequest,
	) -> Result<Rule, IngressError> {
		let hostname: Strng = raw.hostname.clone().unwrap_or_default();
		if hostname.len() > 1 && hostname.as_str()[1..].contains('*') {
			return Err(IngressError::StrayWildcard(index));
		}
		if hostname.contains(':') {
			return Err(IngressError::HostnameHasPort(index));
		}
		let path = raw
			.path
			.as_deref()
			.map(Regex::new)
			.transpose()
			.map_err(|e| IngressError::InvalidPathRegex(index, e))?;
		let config = OriginRequestConfig::cascade(global, &raw.origin_request);
		let mut service =
			parse_service(&raw.service).map_err(|e| IngressError::Service(index, e))?;
		if config.bastion_mode {
			service = Service::Bastion;
		}
		let mut handlers: Vec<Arc<dyn Middleware>> = Vec::new();
		if config.access.required {
			if config.access.team_name.is_empty() {
				return Err(IngressError::AccessTeamMissing(index));
			}
			handlers.push(Arc::new(JwtValidator::new(
				config.access.team_name.clone(),
				config.access.aud_tag.clone(),
			)));
		}
		let origin = Arc::new(Origin::new(&service, &config));
		Ok(Rule {
			punycode_hostname: punycode_alias(&hostname),
			hostname,
			path,
			service,
			handlers,
			config,
			origin,
		})
	}

	/// An ingress for configurations with no rules at all: a catch-all that
	/// answers with the given status and warns once that nothing is configured.
	pub fn default_with_status(code: u16) -> Ingress {
		let service = Service::Status {
			code,
			is_default: true,
		};
		let config = OriginRequestConfig::default();
		let origin = Arc::new(Origin::new(&service, &config));
		Ingress {
			internal_rules: Vec::new(),
			rules: vec![Rule {
				hostname: Strng::default(),
				punycode_hostname: None,
				path: None,
				service,
				handlers: Vec::new(),
				config: config.clone(),
				origin,
			}],
			defaults: config,
		}
	}

	pub fn with_internal_rules(mut self, rules: Vec<Rule>) -> Ingress {
		self.internal_rules = rules;
		self
	}

	pub fn is_empty(&self) -> bool {
		self.rules.is_empty()
	}

	/// Map a request to a rule. Internal rules are reported with negative
	/// indices; user rules with their position. Validation guarantees the last
	/// user rule matches anything, so lookup cannot fail.
	pub fn find_matching_rule(&self, hostname: &str, path: &str) -> (&Rule, isize) {
		let host = strip_port(hostname);
		for (i, rule) in self.internal_rules.iter().enumerate() {
			if rule.matches(host, path) {
				return (rule, -((i + 1) as isize));
			}
		}
		for (i, rule) in self.rules.iter().enumerate() {
			if rule.matches(host, path) {
				return (rule, i as isize);
			}
		}
		let last = self.rules.len() - 1;
		(&self.rules[last], last as isize)
	}

	/// Start every origin (bind hello-world listeners, warm HTTP transports).
	pub async fn start_origins(
		&self,
		shutdown: tokio_util::sync::CancellationToken,
	) -> anyhow::Result<()> {
		for rule in self.internal_rules.iter().chain(self.rules.iter()) {
			rule.origin.start(shutdown.clone()).await?;
		}
		Ok(())
	}
}

#[cfg(test)]
#[path = "ingress_test.rs"]
mod tests;
