use super::*;

#[test]
fn defaults() {
	let cfg = OriginRequestConfig::default();
	assert_eq!(cfg.connect_timeout, Duration::from_secs(30));
	assert_eq!(cfg.tls_timeout, Duration::from_secs(10));
	assert_eq!(cfg.tcp_keepalive, Duration::from_secs(30));
	assert!(!cfg.no_happy_eyeballs);
	assert_eq!(cfg.keepalive_connections, 100);
	assert_eq!(cfg.keepalive_timeout, Duration::from_secs(90));
	assert_eq!(cfg.proxy_address.as_str(), "127.0.0.1");
	assert_eq!(cfg.proxy_port, 0);
	assert_eq!(cfg.proxy_type, ProxyType::Direct);
}

#[test]
fn cascade_rule_beats_global_beats_default() {
	let global = RawOriginRequest {
		connect_timeout: Some(Duration::from_secs(5)),
		http_host_header: Some("global.example".into()),
		..Default::default()
	};
	let rule = RawOriginRequest {
		connect_timeout: Some(Duration::from_secs(1)),
		no_tls_verify: Some(true),
		..Default::default()
	};
	let cfg = OriginRequestConfig::cascade(&global, &rule);
	// Rule wins over global.
	assert_eq!(cfg.connect_timeout, Duration::from_secs(1));
	// Global applies where the rule is silent.
	assert_eq!(cfg.http_host_header.as_deref(), Some("global.example"));
	assert!(cfg.no_tls_verify);
	// Default applies where both are silent.
	assert_eq!(cfg.tls_timeout, Duration::from_secs(10));
}

#[test]
fn raw_round_trip_preserves_overrides() {
	let cfg = OriginRequestConfig {
		connect_timeout: Duration::from_secs(2),
		http_host_header: Some("origin.internal".into()),
		no_tls_verify: true,
		proxy_type: ProxyType::Socks,
		keepalive_connections: 7,
		access: AccessConfig {
			required: true,
			team_name: "acme".into(),
			aud_tag: vec!["tag1".into()],
		},
		..Default::default()
	};
	let raw = cfg.to_raw();
	assert_eq!(OriginRequestConfig::from_raw(&raw), cfg);
}

#[test]
fn raw_round_trip_defaults_serialize_to_nothing() {
	let raw = OriginRequestConfig::default().to_raw();
	assert_eq!(raw, RawOriginRequest::default());
	let yaml = serde_yaml::to_string(&raw).unwrap();
	let reparsed: RawOriginRequest = serde_yaml::from_str(&yaml).unwrap();
	assert_eq!(reparsed, RawOriginRequest::default());
}

#[test]
fn yaml_durations_accept_human_form() {
	let raw: RawOriginRequest = serde_yaml::from_str(
		r#"
connectTimeout: 3s
tlsTimeout: 2m
keepAliveTimeout: 1500ms
"#,
	)
	.unwrap();
	assert_eq!(raw.connect_timeout, Some(Duration::from_secs(3)));
	assert_eq!(raw.tls_timeout, Some(Duration::from_secs(120)));
	assert_eq!(raw.keep_alive_timeout, Some(Duration::from_millis(1500)));
}

#[test]
fn yaml_field_names_match_wire_format() {
	let raw: RawOriginRequest = serde_yaml::from_str(
		r#"
httpHostHeader: app.internal
originServerName: sni.example
caPool: /etc/ssl/origin.pem
noTLSVerify: true
disableChunkedEncoding: true
bastionMode: true
proxyAddress: 127.0.0.2
proxyPort: 9000
proxyType: socks
http2Origin: true
ipRules:
  - prefix: 10.0.0.0/8
    ports: [443]
    allow: true
access:
  required: true
  teamName: acme
  audTag: [aud1, aud2]
"#,
	)
	.unwrap();
	let cfg = OriginRequestConfig::from_raw(&raw);
	assert_eq!(cfg.http_host_header.as_deref(), Some("app.internal"));
	assert_eq!(cfg.origin_server_name.as_deref(), Some("sni.example"));
	assert_eq!(cfg.ca_pool.as_deref(), Some("/etc/ssl/origin.pem"));
	assert!(cfg.no_tls_verify);
	assert!(cfg.disable_chunked_encoding);
	assert!(cfg.bastion_mode);
	assert_eq!(cfg.proxy_address.as_str(), "127.0.0.2");
	assert_eq!(cfg.proxy_port, 9000);
	assert_eq!(cfg.proxy_type, ProxyType::Socks);
	assert!(cfg.http2_origin);
	assert_eq!(cfg.ip_rules.len(), 1);
	assert!(cfg.access.required);
	assert_eq!(cfg.access.team_name.as_str(), "acme");
	assert_eq!(cfg.access.aud_tag.len(), 2);
}

#[test]
fn unknown_fields_rejected() {
	let res: Result<RawOriginRequest, _> = serde_yaml::from_str("connectTimeoutSeconds: 3\n");
	assert!(res.is_err());
}
