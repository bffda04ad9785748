use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tunnel_core::{signal, telemetry, version};
use tunneld::carrier;
use tunneld::config::{self, IcmpConfig, TunnelConfig, UnvalidatedIngressRule};
use tunneld::http::HeaderMap;
use tunneld::icmp;
use tunneld::ingress::{Ingress, RawOriginRequest};
use tunneld::token::TokenStore;

#[derive(Parser, Debug)]
#[command(name = "tunneld", about = "Edge tunnel client: ingress plane", long_about = None)]
struct Args {
	/// Load ingress and proxy settings from a YAML file
	#[arg(short, long, value_name = "file")]
	config: Option<PathBuf>,

	/// Validate the configuration and exit
	#[arg(long)]
	validate_only: bool,

	/// Print version and exit
	#[arg(short = 'V', long = "version")]
	version: bool,

	/// Proxy all traffic to this origin (catch-all rule)
	#[arg(long, group = "origin", value_name = "url")]
	url: Option<String>,

	/// Serve the built-in hello-world origin
	#[arg(long, group = "origin")]
	hello_world: bool,

	/// Proxy to an HTTP origin on a unix socket
	#[arg(long, group = "origin", value_name = "path")]
	unix_socket: Option<PathBuf>,

	/// Jump-host mode: destinations arrive per request in a header
	#[arg(long, group = "origin")]
	bastion: bool,

	/// Run carrier mode: accept TCP here and relay over WebSocket to --url
	#[arg(long, value_name = "addr")]
	carrier_listen: Option<SocketAddr>,

	// Per-rule proxy tunables; each mirrors an originRequest field.
	#[arg(long, value_name = "duration")]
	connect_timeout: Option<String>,
	#[arg(long, value_name = "duration")]
	tls_timeout: Option<String>,
	#[arg(long, value_name = "duration")]
	tcp_keepalive: Option<String>,
	#[arg(long)]
	no_happy_eyeballs: bool,
	#[arg(long, value_name = "count")]
	keepalive_connections: Option<usize>,
	#[arg(long, value_name = "duration")]
	keepalive_timeout: Option<String>,
	#[arg(long, value_name = "host")]
	http_host_header: Option<String>,
	#[arg(long, value_name = "name")]
	origin_server_name: Option<String>,
	#[arg(long, value_name = "path")]
	origin_ca_pool: Option<String>,
	#[arg(long)]
	no_tls_verify: bool,
	#[arg(long)]
	no_chunked_encoding: bool,
	#[arg(long, value_name = "addr")]
	proxy_address: Option<String>,
	#[arg(long, value_name = "port")]
	proxy_port: Option<u16>,
	#[arg(long, value_name = "type")]
	proxy_type: Option<String>,
	#[arg(long)]
	http2_origin: bool,
}

fn main() -> anyhow::Result<()> {
	telemetry::setup_logging();
	let args = Args::parse();
	if args.version {
		println!("{}", version::BuildInfo::new());
		return Ok(());
	}
	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()
		.expect("failed to build runtime")
		.block_on(run(args))
}

async fn run(args: Args) -> anyhow::Result<()> {
	let file_config = match &args.config {
		Some(path) => config::load_config(path)?,
		None => TunnelConfig::default(),
	};
	let overrides = flag_overrides(&args)?;
	let global = merge_raw(&file_config.origin_request, &overrides);

	let ingress = build_ingress(&args, &file_config, &global)?;
	info!(rules = ingress.rules.len(), "ingress validated");
	if args.validate_only {
		return Ok(());
	}

	let shutdown = signal::Shutdown::new();
	let ctx = CancellationToken::new();
	let ingress = Arc::new(ingress);
	ingress.start_origins(ctx.clone()).await?;

	if file_config.warp_routing.enabled {
		match icmp::new_icmp_proxy(&IcmpConfig::default()) {
			Ok(proxy) => {
				let ctx = ctx.clone();
				tokio::spawn(async move {
					if let Err(e) = proxy.serve(ctx).await {
						warn!(err=%e, "icmp proxy stopped");
					}
				});
				info!("icmp proxying enabled");
			},
			Err(e) => warn!(err=%e, "warp routing requested but icmp is unavailable"),
		}
	}

	if let Some(listen) = args.carrier_listen {
		let url = args
			.url
			.clone()
			.ok_or_else(|| anyhow::anyhow!("--carrier-listen requires --url"))?;
		let listener = tokio::net::TcpListener::bind(listen).await?;
		let opts = carrier::CarrierOptions {
			ws_url: url.as_str().into(),
			headers: HeaderMap::new(),
			app_url: url.as_str().into(),
			token_store: TokenStore::new().ok().map(Arc::new),
		};
		let ctx = ctx.clone();
		tokio::spawn(async move {
			if let Err(e) = carrier::serve(listener, opts, ctx).await {
				warn!(err=%e, "carrier stopped");
			}
		});
	}

	shutdown.wait().await;
	ctx.cancel();
	// Give long-lived tasks one beat to observe cancellation.
	tokio::time::sleep(Duration::from_millis(100)).await;
	info!("shutdown complete");
	Ok(())
}

fn build_ingress(
	args: &Args,
	file_config: &TunnelConfig,
	global: &RawOriginRequest,
) -> anyhow::Result<Ingress> {
	let cli_service = if args.hello_world {
		Some("hello-world".to_string())
	} else if args.bastion {
		Some("bastion".to_string())
	} else if let Some(path) = &args.unix_socket {
		Some(format!("unix:{}", path.display()))
	} else if args.carrier_listen.is_none() {
		args.url.clone()
	} else {
		// In carrier mode --url names the edge endpoint, not an origin.
		None
	};
	if let Some(service) = cli_service {
		let rules = vec![UnvalidatedIngressRule {
			hostname: None,
			path: None,
			service,
			origin_request: RawOriginRequest::default(),
		}];
		return Ok(Ingress::parse(&rules, global)?);
	}
	if !file_config.ingress.is_empty() {
		return Ok(Ingress::parse(&file_config.ingress, global)?);
	}
	Ok(Ingress::default_with_status(503))
}

fn flag_overrides(args: &Args) -> anyhow::Result<RawOriginRequest> {
	let duration = |flag: &Option<String>, name: &str| -> anyhow::Result<Option<Duration>> {
		flag
			.as_deref()
			.map(|v| duration_str::parse(v).map_err(|e| anyhow::anyhow!("invalid --{name}: {e}")))
			.transpose()
	};
	let proxy_type = match args.proxy_type.as_deref() {
		None | Some("") => None,
		Some("socks") => Some(tunneld::ingress::ProxyType::Socks),
		Some(other) => anyhow::bail!("invalid --proxy-type {other:?}; expected \"\" or \"socks\""),
	};
	Ok(RawOriginRequest {
		connect_timeout: duration(&args.connect_timeout, "connect-timeout")?,
		tls_timeout: duration(&args.tls_timeout, "tls-timeout")?,
		tcp_keep_alive: duration(&args.tcp_keepalive, "tcp-keepalive")?,
		no_happy_eyeballs: args.no_happy_eyeballs.then_some(true),
		keep_alive_connections: args.keepalive_connections,
		keep_alive_timeout: duration(&args.keepalive_timeout, "keepalive-timeout")?,
		http_host_header: args.http_host_header.as_deref().map(Into::into),
		origin_server_name: args.origin_server_name.as_deref().map(Into::into),
		ca_pool: args.origin_ca_pool.as_deref().map(Into::into),
		no_tls_verify: args.no_tls_verify.then_some(true),
		disable_chunked_encoding: args.no_chunked_encoding.then_some(true),
		bastion_mode: args.bastion.then_some(true),
		proxy_address: args.proxy_address.as_deref().map(Into::into),
		proxy_port: args.proxy_port,
		proxy_type,
		ip_rules: None,
		http2_origin: args.http2_origin.then_some(true),
		access: None,
	})
}

/// CLI flags override file-level settings field by field.
fn merge_raw(file: &RawOriginRequest, flags: &RawOriginRequest) -> RawOriginRequest {
	macro_rules! pick {
		($field:ident) => {
			flags.$field.clone().or_else(|| file.$field.clone())
		};
	}
	RawOriginRequest {
		connect_timeout: pick!(connect_timeout),
		tls_timeout: pick!(tls_timeout),
		tcp_keep_alive: pick!(tcp_keep_alive),
		no_happy_eyeballs: pick!(no_happy_eyeballs),
		keep_alive_connections: pick!(keep_alive_connections),
		keep_alive_timeout: pick!(keep_alive_timeout),
		http_host_header: pick!(http_host_header),
		origin_server_name: pick!(origin_server_name),
		ca_pool: pick!(ca_pool),
		no_tls_verify: pick!(no_tls_verify),
		disable_chunked_encoding: pick!(disable_chunked_encoding),
		bastion_mode: pick!(bastion_mode),
		proxy_address: pick!(proxy_address),
		proxy_port: pick!(proxy_port),
		proxy_type: pick!(proxy_type),
		ip_rules: pick!(ip_rules),
		http2_origin: pick!(http2_origin),
		access: pick!(access),
	}
}
