use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::ingress::origin_request::RawOriginRequest;
use crate::*;

/// The on-disk configuration. YAML in local files; the remotely-managed
/// variant delivers the same schema as JSON.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TunnelConfig {
	#[serde(default)]
	pub origin_request: RawOriginRequest,
	#[serde(default)]
	pub ingress: Vec<UnvalidatedIngressRule>,
	#[serde(default, rename = "warp-routing")]
	pub warp_routing: WarpRouting,
}

/// One entry of the `ingress` list, before validation.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct UnvalidatedIngressRule {
	#[serde(default)]
	pub hostname: Option<Strng>,
	#[serde(default)]
	pub path: Option<String>,
	pub service: String,
	#[serde(default)]
	pub origin_request: RawOriginRequest,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct WarpRouting {
	#[serde(default)]
	pub enabled: bool,
	#[serde(default, with = "opt_duration")]
	pub connect_timeout: Option<Duration>,
	#[serde(default, with = "opt_duration")]
	pub tcp_keep_alive: Option<Duration>,
}

pub fn parse_config(contents: &str) -> anyhow::Result<TunnelConfig> {
	// serde_yaml handles JSON documents as well; the remote config path hands
	// us JSON bytes through the same entry point.
	let cfg: TunnelConfig = serde_yaml::from_str(contents)?;
	Ok(cfg)
}

pub fn load_config(path: &PathBuf) -> anyhow::Result<TunnelConfig> {
	let contents = fs_err::read_to_string(path)?;
	parse_config(&contents).with_context(|| format!("parsing {}", path.display()))
}

/// Env-var override helper: absent vars are None, unparseable values are
/// startup errors.
pub fn parse<T: FromStr>(var: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: ToString,
{
	match env::var(var) {
		Ok(val) => val
			.parse()
			.map(Some)
			.map_err(|e: <T as FromStr>::Err| {
				anyhow::anyhow!("invalid env var {}={} ({})", var, val, e.to_string())
			}),
		Err(_) => Ok(None),
	}
}

pub fn parse_duration(var: &str) -> anyhow::Result<Option<Duration>> {
	parse::<String>(var)?
		.map(|ds| {
			duration_str::parse(&ds).map_err(|e| anyhow::anyhow!("invalid env var {}={} ({})", var, ds, e))
		})
		.transpose()
}

/// Serde adapter for optional human-form durations ("3s", "2m", "1500ms").
pub(crate) mod opt_duration {
	use std::time::Duration;

	use serde::de::Error as _;
	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S>(v: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		match v {
			Some(d) => serializer.serialize_str(&format_duration(d)),
			None => serializer.serialize_none(),
		}
	}

	pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
	where
		D: Deserializer<'de>,
	{
		let raw = Option::<String>::deserialize(deserializer)?;
		raw
			.map(|s| duration_str::parse(&s).map_err(|e| D::Error::custom(format!("{e}"))))
			.transpose()
	}

	pub(crate) fn format_duration(d: &Duration) -> String {
		if d.subsec_nanos() == 0 {
			format!("{}s", d.as_secs())
		} else {
			format!("{}ms", d.as_millis())
		}
	}
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IcmpConfig {
	/// Source address for synthesized replies and the bind address for echo
	/// sockets.
	pub bind_v4: Ipv4Addr,
	pub bind_v6: Ipv6Addr,
	/// Funnels idle longer than this are closed.
	#[serde(with = "opt_duration", default)]
	pub idle_timeout: Option<Duration>,
}

impl Default for IcmpConfig {
	fn default() -> Self {
		IcmpConfig {
			bind_v4: Ipv4Addr::LOCALHOST,
			bind_v6: Ipv6Addr::LOCALHOST,
			idle_timeout: None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn parses_full_document() {
		let cfg = parse_config(
			r#"
originRequest:
  connectTimeout: 10s
ingress:
  - hostname: app.example.com
    path: ^/api/.*
    service: http://127.0.0.1:8000
    originRequest:
      httpHostHeader: app.internal
  - service: http_status:404
warp-routing:
  enabled: true
  connectTimeout: 2s
"#,
		)
		.unwrap();
		assert_eq!(
			cfg.origin_request.connect_timeout,
			Some(Duration::from_secs(10))
		);
		assert_eq!(cfg.ingress.len(), 2);
		assert_eq!(
			cfg.ingress[0].hostname.as_deref(),
			Some("app.example.com")
		);
		assert!(cfg.warp_routing.enabled);
		assert_eq!(
			cfg.warp_routing.connect_timeout,
			Some(Duration::from_secs(2))
		);
	}

	#[test]
	fn json_documents_share_the_schema() {
		let cfg = parse_config(
			r#"{"ingress": [{"service": "http_status:503"}], "warp-routing": {"enabled": false}}"#,
		)
		.unwrap();
		assert_eq!(cfg.ingress.len(), 1);
		assert!(!cfg.warp_routing.enabled);
	}

	#[test]
	fn rejects_unknown_keys() {
		assert!(parse_config("ingress: []\nunknownKey: true\n").is_err());
	}
}
