//! Minimal SOCKS5 server: no authentication, CONNECT only. Destinations are
//! checked against the rule's IP access policy before any dial happens.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tunnel_core::copy;

use crate::ingress::ip_rules::AccessPolicy;
use crate::ingress::origin_request::OriginRequestConfig;
use crate::origin::{dial, OriginConnection, OriginError, StreamEstablisher, TunnelStream};
use crate::carrier::ws::WsStream;
use crate::*;

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NONE_ACCEPTABLE: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_NOT_ALLOWED: u8 = 0x02;
const REP_HOST_UNREACHABLE: u8 = 0x04;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// SOCKS5 proxying over WebSocket framing on the tunnel side. Each tunnel
/// stream carries one SOCKS session; dial targets come from the client and
/// are gated by the configured access policy.
pub struct SocksOrigin {
	policy: Arc<AccessPolicy>,
	connect_timeout: Duration,
	no_happy_eyeballs: bool,
}

impl SocksOrigin {
	pub fn new(cfg: &OriginRequestConfig) -> Self {
		SocksOrigin {
			// Rules are allow-listed: anything not matched is denied.
			policy: Arc::new(AccessPolicy::new(false, cfg.ip_rules.clone())),
			connect_timeout: cfg.connect_timeout,
			no_happy_eyeballs: cfg.no_happy_eyeballs,
		}
	}
}

#[async_trait::async_trait]
impl StreamEstablisher for SocksOrigin {
	async fn establish(&self, _dest: Option<&str>) -> Result<Box<dyn OriginConnection>, OriginError> {
		Ok(Box::new(SocksConnection {
			policy: self.policy.clone(),
			connect_timeout: self.connect_timeout,
			no_happy_eyeballs: self.no_happy_eyeballs,
		}))
	}
}

struct SocksConnection {
	policy: Arc<AccessPolicy>,
	connect_timeout: Duration,
	no_happy_eyeballs: bool,
}

#[async_trait::async_trait]
impl OriginConnection for SocksConnection {
	async fn stream(self: Box<Self>, tunnel: Box<dyn TunnelStream>) -> Result<(), OriginError> {
		let ws = WsStream::accept(tunnel).await;
		serve(
			ws,
			&self.policy,
			self.connect_timeout,
			self.no_happy_eyeballs,
		)
		.await
	}
}

/// Requested CONNECT destination, before resolution.
#[derive(Debug, PartialEq, Eq)]
enum DestAddr {
	Ip(IpAddr),
	Domain(String),
}

async fn handshake<S>(stream: &mut S) -> Result<(DestAddr, u16), OriginError>
where
	S: AsyncRead + AsyncWrite + Unpin + Send,
{
	let mut head = [0u8; 2];
	stream.read_exact(&mut head).await?;
	if head[0] != SOCKS_VERSION {
		return Err(OriginError::Socks(format!("bad version {:#x}", head[0])));
	}
	let mut methods = vec![0u8; head[1] as usize];
	stream.read_exact(&mut methods).await?;
	if !methods.contains(&METHOD_NO_AUTH) {
		stream
			.write_all(&[SOCKS_VERSION, METHOD_NONE_ACCEPTABLE])
			.await?;
		return Err(OriginError::Socks("no supported auth method".to_string()));
	}
	stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

	let mut req = [0u8; 4];
	stream.read_exact(&mut req).await?;
	if req[0] != SOCKS_VERSION {
		return Err(OriginError::Socks(format!("bad version {:#x}", req[0])));
	}
	if req[1] != CMD_CONNECT {
		reply(stream, REP_COMMAND_NOT_SUPPORTED).await?;
		return Err(OriginError::Socks(format!("unsupported command {}", req[1])));
	}
	let dest = match req[3] {
		0x01 => {
			let mut addr = [0u8; 4];
			stream.read_exact(&mut addr).await?;
			DestAddr::Ip(IpAddr::V4(Ipv4Addr::from(addr)))
		},
		0x03 => {
			let mut len = [0u8; 1];
			stream.read_exact(&mut len).await?;
			let mut name = vec![0u8; len[0] as usize];
			stream.read_exact(&mut name).await?;
			let name = String::from_utf8(name)
				.map_err(|_| OriginError::Socks("domain is not utf-8".to_string()))?;
			DestAddr::Domain(name)
		},
		0x04 => {
			let mut addr = [0u8; 16];
			stream.read_exact(&mut addr).await?;
			DestAddr::Ip(IpAddr::V6(Ipv6Addr::from(addr)))
		},
		other => {
			reply(stream, REP_ADDRESS_NOT_SUPPORTED).await?;
			return Err(OriginError::Socks(format!("unsupported address type {other}")));
		},
	};
	let mut port = [0u8; 2];
	stream.read_exact(&mut port).await?;
	Ok((dest, u16::from_be_bytes(port)))
}

async fn reply<S>(stream: &mut S, code: u8) -> Result<(), OriginError>
where
	S: AsyncWrite + Unpin + Send,
{
	// Bound address is not meaningful for a tunneled proxy; zeros per RFC 1928.
	let rsp = [SOCKS_VERSION, code, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
	stream.write_all(&rsp).await?;
	stream.flush().await?;
	Ok(())
}

/// Serve one SOCKS5 session: dial wherever the client asks, subject to the
/// access policy.
pub(crate) async fn serve<S>(
	mut stream: S,
	policy: &AccessPolicy,
	connect_timeout: Duration,
	no_happy_eyeballs: bool,
) -> Result<(), OriginError>
where
	S: AsyncRead + AsyncWrite + Unpin + Send,
{
	let (dest, port) = handshake(&mut stream).await?;
	let ip = match &dest {
		DestAddr::Ip(ip) => *ip,
		DestAddr::Domain(name) => {
			let resolved = tokio::net::lookup_host((name.as_str(), port))
				.await
				.ok()
				.and_then(|mut addrs| addrs.next());
			match resolved {
				Some(addr) => addr.ip(),
				None => {
					reply(&mut stream, REP_HOST_UNREACHABLE).await?;
					return Err(OriginError::Resolve(name.as_str().into()));
				},
			}
		},
	};
	if !policy.allowed(ip, port) {
		debug!(%ip, port, "socks destination denied by ip rules");
		reply(&mut stream, REP_NOT_ALLOWED).await?;
		return Ok(());
	}
	let upstream = match dial(&format!("{ip}:{port}"), connect_timeout, no_happy_eyeballs).await {
		Ok(s) => s,
		Err(e) => {
			let code = match &e {
				OriginError::Connect(_, _) => REP_CONNECTION_REFUSED,
				OriginError::ConnectTimeout(_) | OriginError::Resolve(_) => REP_HOST_UNREACHABLE,
				_ => REP_GENERAL_FAILURE,
			};
			reply(&mut stream, code).await?;
			return Err(e);
		},
	};
	reply(&mut stream, REP_SUCCESS).await?;
	copy::stream(stream, upstream).await?;
	Ok(())
}

/// Answer one CONNECT handshake and splice the client onto an already-dialed
/// origin connection (bastion-style: the destination was fixed up front, the
/// client's requested address is ignored).
pub(crate) async fn serve_fixed<S>(mut stream: S, origin: TcpStream) -> Result<(), OriginError>
where
	S: AsyncRead + AsyncWrite + Unpin + Send,
{
	let (dest, port) = handshake(&mut stream).await?;
	trace!(?dest, port, "socks handshake on pre-dialed connection");
	reply(&mut stream, REP_SUCCESS).await?;
	copy::stream(stream, origin).await?;
	Ok(())
}
