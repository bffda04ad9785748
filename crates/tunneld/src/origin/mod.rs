//! Typed origin services. Each variant implements one of two capability
//! contracts: an HTTP round-trip, or establishment of a bidirectional byte
//! stream that is then relayed against the tunnel.

pub mod bastion;
mod hello;
mod http_origin;
mod socks;
mod status;
mod tcp;
#[cfg(unix)]
mod unix;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

pub use hello::HelloWorldOrigin;
pub use http_origin::HttpOrigin;
pub use socks::SocksOrigin;
pub use status::StatusOrigin;
pub use tcp::{RawTcpOrigin, TcpOverWsOrigin};
#[cfg(unix)]
pub use unix::UnixOrigin;

use crate::http::{Request, Response};
use crate::ingress::origin_request::{OriginRequestConfig, ProxyType};
use crate::ingress::Service;
use crate::*;

#[derive(thiserror::Error, Debug)]
pub enum OriginError {
	#[error("failed to resolve {0}")]
	Resolve(Strng),
	#[error("failed to connect to {0}: {1}")]
	Connect(Strng, std::io::Error),
	#[error("connect to {0} timed out")]
	ConnectTimeout(Strng),
	#[error("tls handshake with {0} failed: {1}")]
	Tls(Strng, std::io::Error),
	#[error("tls handshake with {0} timed out")]
	TlsTimeout(Strng),
	#[error("http round trip failed: {0}")]
	RoundTrip(String),
	#[error("origin has not been started")]
	NotStarted,
	#[error("no destination available for this service")]
	MissingDestination,
	#[error("invalid request: {0}")]
	InvalidRequest(String),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("relay failed: {0}")]
	Relay(#[from] tunnel_core::copy::RelayError),
	#[error("socks protocol error: {0}")]
	Socks(String),
	#[error(transparent)]
	Internal(#[from] anyhow::Error),
}

/// The tunnel-facing side of a proxied stream.
pub trait TunnelStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> TunnelStream for T {}

#[async_trait::async_trait]
pub trait HttpRoundTripper: Send + Sync {
	async fn round_trip(&self, req: Request) -> Result<Response, OriginError>;
}

#[async_trait::async_trait]
pub trait StreamEstablisher: Send + Sync {
	/// Open the origin side of a stream. `dest` carries the per-request
	/// destination for bastion-style services and is ignored otherwise.
	async fn establish(&self, dest: Option<&str>) -> Result<Box<dyn OriginConnection>, OriginError>;
}

/// An established origin stream, ready to be relayed against the tunnel side.
/// Consumed by `stream`; both endpoints are torn down when it returns.
#[async_trait::async_trait]
pub trait OriginConnection: Send {
	async fn stream(self: Box<Self>, tunnel: Box<dyn TunnelStream>) -> Result<(), OriginError>;
}

pub enum Origin {
	Http(HttpOrigin),
	#[cfg(unix)]
	Unix(UnixOrigin),
	RawTcp(RawTcpOrigin),
	TcpOverWs(TcpOverWsOrigin),
	SocksOverWs(SocksOrigin),
	HelloWorld(HelloWorldOrigin),
	Status(StatusOrigin),
}

impl Origin {
	pub fn new(service: &Service, cfg: &OriginRequestConfig) -> Origin {
		match service {
			Service::Http { url } => Origin::Http(HttpOrigin::new(url.clone(), cfg)),
			#[cfg(unix)]
			Service::Unix { path, tls } => Origin::Unix(UnixOrigin::new(path.clone(), *tls, cfg)),
			#[cfg(not(unix))]
			Service::Unix { .. } => unreachable!("unix services are rejected at parse on this platform"),
			Service::TcpOverWs { dest, .. } => Origin::TcpOverWs(TcpOverWsOrigin::new(
				Some(dest.clone()),
				false,
				cfg.proxy_type == ProxyType::Socks,
				cfg,
			)),
			Service::Bastion => Origin::TcpOverWs(TcpOverWsOrigin::new(
				None,
				true,
				cfg.proxy_type == ProxyType::Socks,
				cfg,
			)),
			Service::SocksProxy => Origin::SocksOverWs(SocksOrigin::new(cfg)),
			Service::HelloWorld => Origin::HelloWorld(HelloWorldOrigin::new(cfg)),
			Service::Status { code, is_default } => {
				Origin::Status(StatusOrigin::new(*code, *is_default))
			},
		}
	}

	/// Raw TCP origin for the L3 routing plane: destinations arrive per
	/// request, writes carry a deadline.
	pub fn raw_tcp(name: Strng, cfg: &OriginRequestConfig) -> Origin {
		Origin::RawTcp(RawTcpOrigin::new(name, cfg, tcp::DEFAULT_WRITE_TIMEOUT))
	}

	/// Run once before first use: binds local listeners and warms transports.
	pub async fn start(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
		match self {
			Origin::HelloWorld(o) => o.start(shutdown).await,
			Origin::Http(o) => o.start().await,
			_ => Ok(()),
		}
	}

	pub fn http(&self) -> Option<&dyn HttpRoundTripper> {
		match self {
			Origin::Http(o) => Some(o),
			#[cfg(unix)]
			Origin::Unix(o) => Some(o),
			Origin::HelloWorld(o) => Some(o),
			Origin::Status(o) => Some(o),
			_ => None,
		}
	}

	pub fn stream(&self) -> Option<&dyn StreamEstablisher> {
		match self {
			Origin::RawTcp(o) => Some(o),
			Origin::TcpOverWs(o) => Some(o),
			Origin::SocksOverWs(o) => Some(o),
			_ => None,
		}
	}

	pub fn is_bastion(&self) -> bool {
		matches!(self, Origin::TcpOverWs(o) if o.is_bastion())
	}
}

/// Resolve and dial a `host:port` destination within `connect_timeout`.
/// Unless disabled, IPv6 addresses are attempted before IPv4 (the resolver
/// already interleaves families on dual-stack hosts).
pub(crate) async fn dial(
	dest: &str,
	connect_timeout: Duration,
	no_happy_eyeballs: bool,
) -> Result<TcpStream, OriginError> {
	let dest_name: Strng = dest.into();
	let addrs: Vec<SocketAddr> = tokio::net::lookup_host(dest)
		.await
		.map_err(|_| OriginError::Resolve(dest_name.clone()))?
		.collect();
	if addrs.is_empty() {
		return Err(OriginError::Resolve(dest_name));
	}
	let ordered: Vec<SocketAddr> = if no_happy_eyeballs {
		addrs
	} else {
		let (v6, v4): (Vec<_>, Vec<_>) = addrs.into_iter().partition(|a| a.is_ipv6());
		v6.into_iter().chain(v4).collect()
	};

	let deadline = Instant::now() + connect_timeout;
	let mut last_err: Option<std::io::Error> = None;
	for addr in ordered {
		let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
			break;
		};
		match tokio::time::timeout(remaining, TcpStream::connect(addr)).await {
			Ok(Ok(stream)) => {
				let _ = stream.set_nodelay(true);
				return Ok(stream);
			},
			Ok(Err(e)) => last_err = Some(e),
			Err(_) => break,
		}
	}
	match last_err {
		Some(e) => Err(OriginError::Connect(dest_name, e)),
		None => Err(OriginError::ConnectTimeout(dest_name)),
	}
}
