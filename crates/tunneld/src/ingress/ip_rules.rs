use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::*;

/// A single allow/deny entry for the SOCKS origin. Empty `ports` means the
/// rule applies to every port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IpRule {
	pub prefix: IpNet,
	#[serde(default, skip_serializing_if = "Vec::is_empty")]
	pub ports: Vec<u16>,
	#[serde(default)]
	pub allow: bool,
}

/// Ordered rule list with a default verdict. The first rule whose prefix and
/// port set cover the destination decides.
#[derive(Debug, Clone, Default)]
pub struct AccessPolicy {
	rules: Vec<IpRule>,
	default_allow: bool,
}

impl AccessPolicy {
	pub fn new(default_allow: bool, rules: Vec<IpRule>) -> Self {
		AccessPolicy {
			rules,
			default_allow,
		}
	}

	pub fn allowed(&self, ip: IpAddr, port: u16) -> bool {
		for rule in &self.rules {
			if rule.prefix.contains(&ip) && (rule.ports.is_empty() || rule.ports.contains(&port)) {
				return rule.allow;
			}
		}
		self.default_allow
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	fn rule(prefix: &str, ports: &[u16], allow: bool) -> IpRule {
		IpRule {
			prefix: prefix.parse().unwrap(),
			ports: ports.to_vec(),
			allow,
		}
	}

	#[test]
	fn first_match_wins() {
		let policy = AccessPolicy::new(
			false,
			vec![
				rule("10.0.0.0/8", &[443], false),
				rule("10.0.0.0/8", &[], true),
			],
		);
		assert!(!policy.allowed("10.1.2.3".parse().unwrap(), 443));
		assert!(policy.allowed("10.1.2.3".parse().unwrap(), 80));
		assert!(!policy.allowed("192.168.0.1".parse().unwrap(), 80));
	}

	#[test]
	fn default_verdict_applies_when_no_rule_matches() {
		let policy = AccessPolicy::new(true, vec![rule("192.168.1.0/24", &[], false)]);
		assert!(!policy.allowed("192.168.1.9".parse().unwrap(), 22));
		assert!(policy.allowed("8.8.8.8".parse().unwrap(), 22));
	}

	#[test]
	fn ipv6_prefixes() {
		let policy = AccessPolicy::new(false, vec![rule("fd00::/8", &[8080], true)]);
		assert!(policy.allowed("fd12::1".parse().unwrap(), 8080));
		assert!(!policy.allowed("fd12::1".parse().unwrap(), 8081));
		assert!(!policy.allowed("2001:db8::1".parse().unwrap(), 8080));
	}
}
