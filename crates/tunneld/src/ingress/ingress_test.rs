use assert_matches::assert_matches;

use super::*;
use crate::config::UnvalidatedIngressRule;

fn rule(hostname: Option<&str>, path: Option<&str>, service: &str) -> UnvalidatedIngressRule {
	UnvalidatedIngressRule {
		hostname: hostname.map(|h| h.into()),
		path: path.map(|p| p.to_string()),
		service: service.to_string(),
		origin_request: RawOriginRequest::default(),
	}
}

fn ingress(rules: &[UnvalidatedIngressRule]) -> Ingress {
	Ingress::parse(rules, &RawOriginRequest::default()).unwrap()
}

#[test]
fn single_catch_all_matches_everything() {
	let ing = ingress(&[rule(None, None, "http://127.0.0.1:8000")]);
	struct TestCase {
		host: &'static str,
		path: &'static str,
	}
	let cases = [
		TestCase {
			host: "any.example",
			path: "/",
		},
		TestCase {
			host: "any.example:443",
			path: "/deep/path",
		},
		TestCase {
			host: "",
			path: "/",
		},
	];
	for tc in cases {
		let (_, idx) = ing.find_matching_rule(tc.host, tc.path);
		assert_eq!(idx, 0, "host={} path={}", tc.host, tc.path);
	}
}

#[test]
fn hostname_and_path_specificity() {
	// Two specific rules and a catch-all.
	let ing = ingress(&[
		rule(Some("tunnel-a.example.com"), None, "http://localhost:8000"),
		rule(
			Some("tunnel-b.example.com"),
			Some("/health"),
			"http://localhost:8001",
		),
		rule(Some("*"), None, "http_status:404"),
	]);
	struct TestCase {
		host: &'static str,
		path: &'static str,
		want: isize,
	}
	let cases = [
		TestCase {
			host: "tunnel-a.example.com",
			path: "/pages",
			want: 0,
		},
		TestCase {
			host: "tunnel-a.example.com:443",
			path: "/pages",
			want: 0,
		},
		TestCase {
			host: "tunnel-b.example.com",
			path: "/health",
			want: 1,
		},
		TestCase {
			host: "tunnel-b.example.com",
			path: "/index.html",
			want: 2,
		},
		TestCase {
			host: "other.example.com",
			path: "/",
			want: 2,
		},
	];
	for tc in cases {
		let (_, idx) = ing.find_matching_rule(tc.host, tc.path);
		assert_eq!(idx, tc.want, "host={} path={}", tc.host, tc.path);
	}
}

#[test]
fn wildcard_hostnames_are_suffix_matches() {
	let ing = ingress(&[
		rule(Some("*.example.com"), None, "http://localhost:8000"),
		rule(None, None, "http_status:404"),
	]);
	struct TestCase {
		host: &'static str,
		want: isize,
	}
	let cases = [
		TestCase {
			host: "foo.example.com",
			want: 0,
		},
		TestCase {
			host: "deep.foo.example.com",
			want: 0,
		},
		// The bare apex does not end with ".example.com".
		TestCase {
			host: "example.com",
			want: 1,
		},
		TestCase {
			host: "notexample.com",
			want: 1,
		},
	];
	for tc in cases {
		let (_, idx) = ing.find_matching_rule(tc.host, "/");
		assert_eq!(idx, tc.want, "host={}", tc.host);
	}
}

#[test]
fn unicode_hostnames_get_punycode_aliases() {
	let ing = ingress(&[
		rule(Some("müller.example.com"), None, "http://localhost:8000"),
		rule(None, None, "http_status:404"),
	]);
	assert_eq!(
		ing.rules[0].punycode_hostname.as_deref(),
		Some("xn--mller-kva.example.com")
	);
	let (_, idx) = ing.find_matching_rule("xn--mller-kva.example.com", "/");
	assert_eq!(idx, 0);
	let (_, idx) = ing.find_matching_rule("müller.example.com", "/");
	assert_eq!(idx, 0);
}

#[test]
fn every_lookup_returns_a_rule_in_range() {
	let ing = ingress(&[
		rule(Some("a.example"), Some("^/x"), "http://localhost:1"),
		rule(Some("*.b.example"), None, "http://localhost:2"),
		rule(None, None, "http_status:503"),
	]);
	let hosts = ["a.example", "b.example", "c.b.example", "", "zzz", "[::1]:443"];
	let paths = ["/", "/x", "/x/y", ""];
	for host in hosts {
		for path in paths {
			let (_, idx) = ing.find_matching_rule(host, path);
			assert!(
				(idx as usize) < ing.rules.len(),
				"host={host} path={path} idx={idx}"
			);
		}
	}
}

#[test]
fn internal_rules_match_first_with_negative_index() {
	let mut internal = ingress(&[rule(
		Some("management.argotunnel.example"),
		None,
		"http_status:200",
	)]);
	// Steal the parsed rule to use as an internal rule.
	let internal_rule = internal.rules.remove(0);
	let ing = ingress(&[rule(None, None, "http://localhost:8000")])
		.with_internal_rules(vec![internal_rule]);

	let (_, idx) = ing.find_matching_rule("management.argotunnel.example", "/");
	assert_eq!(idx, -1);
	let (_, idx) = ing.find_matching_rule("user.example", "/");
	assert_eq!(idx, 0);
}

#[test]
fn validation_rejects_bad_rule_sets() {
	// Last rule not catch-all.
	assert_matches!(
		Ingress::parse(
			&[rule(Some("a.example"), None, "http://localhost:8000")],
			&RawOriginRequest::default()
		),
		Err(IngressError::LastRuleNotCatchAll)
	);
	// Catch-all before the end.
	assert_matches!(
		Ingress::parse(
			&[
				rule(None, None, "http://localhost:8000"),
				rule(None, None, "http_status:404"),
			],
			&RawOriginRequest::default()
		),
		Err(IngressError::CatchAllNotLast(0))
	);
	// Wildcard beyond the leading character.
	assert_matches!(
		Ingress::parse(
			&[
				rule(Some("a.*.example"), None, "http://localhost:8000"),
				rule(None, None, "http_status:404"),
			],
			&RawOriginRequest::default()
		),
		Err(IngressError::StrayWildcard(0))
	);
	// Hostname carrying a port.
	assert_matches!(
		Ingress::parse(
			&[
				rule(Some("a.example:8443"), None, "http://localhost:8000"),
				rule(None, None, "http_status:404"),
			],
			&RawOriginRequest::default()
		),
		Err(IngressError::HostnameHasPort(0))
	);
	// Broken path regex.
	assert_matches!(
		Ingress::parse(
			&[
				rule(Some("a.example"), Some("([unclosed"), "http://localhost:8000"),
				rule(None, None, "http_status:404"),
			],
			&RawOriginRequest::default()
		),
		Err(IngressError::InvalidPathRegex(0, _))
	);
	// No rules at all.
	assert_matches!(
		Ingress::parse(&[], &RawOriginRequest::default()),
		Err(IngressError::Empty)
	);
}

#[test]
fn service_parsing() {
	struct TestCase {
		input: &'static str,
		want: Service,
	}
	let cases = [
		TestCase {
			input: "http://127.0.0.1:8000",
			want: Service::Http {
				url: Url::parse("http://127.0.0.1:8000").unwrap(),
			},
		},
		TestCase {
			input: "wss://localhost:9443",
			want: Service::Http {
				url: Url::parse("wss://localhost:9443").unwrap(),
			},
		},
		TestCase {
			input: "unix:/var/run/app.sock",
			want: Service::Unix {
				path: "/var/run/app.sock".into(),
				tls: false,
			},
		},
		TestCase {
			input: "unix+tls:/var/run/app.sock",
			want: Service::Unix {
				path: "/var/run/app.sock".into(),
				tls: true,
			},
		},
		TestCase {
			input: "http_status:404",
			want: Service::Status {
				code: 404,
				is_default: false,
			},
		},
		TestCase {
			input: "hello-world",
			want: Service::HelloWorld,
		},
		TestCase {
			input: "hello_world",
			want: Service::HelloWorld,
		},
		TestCase {
			input: "bastion",
			want: Service::Bastion,
		},
		TestCase {
			input: "socks-proxy",
			want: Service::SocksProxy,
		},
		TestCase {
			input: "ssh://localhost",
			want: Service::TcpOverWs {
				scheme: "ssh".into(),
				dest: "localhost:22".into(),
			},
		},
		TestCase {
			input: "rdp://desktop.internal",
			want: Service::TcpOverWs {
				scheme: "rdp".into(),
				dest: "desktop.internal:3389".into(),
			},
		},
		TestCase {
			input: "smb://files.internal",
			want: Service::TcpOverWs {
				scheme: "smb".into(),
				dest: "files.internal:445".into(),
			},
		},
		TestCase {
			input: "tcp://localhost",
			want: Service::TcpOverWs {
				scheme: "tcp".into(),
				dest: "localhost:7864".into(),
			},
		},
		TestCase {
			input: "tcp://localhost:9000",
			want: Service::TcpOverWs {
				scheme: "tcp".into(),
				dest: "localhost:9000".into(),
			},
		},
		// Unknown schemes route as TCP-over-WS when they carry a port.
		TestCase {
			input: "postgres://db.internal:5432",
			want: Service::TcpOverWs {
				scheme: "postgres".into(),
				dest: "db.internal:5432".into(),
			},
		},
	];
	for tc in cases {
		let got = parse_service(tc.input).unwrap_or_else(|e| panic!("{}: {e}", tc.input));
		assert_eq!(got, tc.want, "{}", tc.input);
	}
}

#[test]
fn service_parsing_failures() {
	assert_matches!(
		parse_service("http_status:1000"),
		Err(ServiceError::InvalidStatusCode(_))
	);
	assert_matches!(
		parse_service("http_status:abc"),
		Err(ServiceError::InvalidStatusCode(_))
	);
	assert_matches!(
		parse_service("http://localhost/path"),
		Err(ServiceError::PathNotAllowed)
	);
	assert_matches!(
		parse_service("postgres://db.internal"),
		Err(ServiceError::MissingPort(_))
	);
	assert_matches!(parse_service("://nope"), Err(ServiceError::InvalidUrl(_)));
}

#[test]
fn bastion_mode_overrides_service() {
	let mut raw = rule(None, None, "tcp://localhost:22");
	raw.origin_request.bastion_mode = Some(true);
	let ing = ingress(&[raw]);
	assert_eq!(ing.rules[0].service, Service::Bastion);
}

#[test]
fn strip_port_cases() {
	assert_eq!(strip_port("example.com"), "example.com");
	assert_eq!(strip_port("example.com:443"), "example.com");
	assert_eq!(strip_port("[::1]:443"), "[::1]");
	assert_eq!(strip_port("[::1]"), "[::1]");
	assert_eq!(strip_port("localhost:notaport"), "localhost:notaport");
}
