//! Cross-platform unprivileged ICMP echo proxying. Three strategies live
//! behind one trait: per-flow sockets where the kernel assigns the rewritten
//! echo id (linux), a shared socket with an in-process id allocator (darwin),
//! and a synchronous request/reply path with panic containment (windows).
//! Everywhere else, construction reports the platform as unsupported and the
//! router drops ICMP traffic.

pub mod echo_id;
pub mod funnel;

#[cfg(target_os = "linux")]
mod proxy_linux;
#[cfg(target_os = "macos")]
mod proxy_darwin;
#[cfg(windows)]
mod proxy_windows;

use tokio_util::sync::CancellationToken;

use crate::config::IcmpConfig;
use crate::pkt::IcmpPacket;
use crate::*;

/// Funnels with no traffic for this long are torn down, unless configured
/// otherwise.
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(thiserror::Error, Debug)]
pub enum IcmpError {
	#[error("icmp proxying is not supported on this platform")]
	Unsupported,
	#[error("only icmp echo requests can be proxied")]
	NotEchoRequest,
	#[error("icmp echo id space is exhausted")]
	EchoIdExhausted,
	#[error("wrong address family for this proxy")]
	FamilyMismatch,
	#[error("failed to open icmp socket: {0}")]
	Socket(std::io::Error),
	#[error("packet error: {0}")]
	Packet(#[from] crate::pkt::PacketError),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
	#[error("panic in platform icmp path: {0}")]
	Panicked(String),
	#[error(transparent)]
	Internal(#[from] anyhow::Error),
}

/// Per-flow sink returning replies (and their tracing spans) to the tunnel
/// connection that originated the request.
#[async_trait::async_trait]
pub trait FlowResponder: Send + Sync + 'static {
	async fn return_packet(&self, raw: Bytes) -> anyhow::Result<()>;
	/// Identifies the tunnel connection; a funnel whose responder belongs to
	/// a different connection is replaced so replies follow the newest one.
	fn connection_index(&self) -> u8;
	async fn record_request_span(&self, pkt: &IcmpPacket);
	async fn record_reply_span(&self, pkt: &IcmpPacket);
}

/// The platform-independent contract of the echo proxy.
#[async_trait::async_trait]
pub trait IcmpService: Send + Sync + 'static {
	/// Send one echo request, registering (or refreshing) the funnel that
	/// routes its replies back through `responder`.
	async fn request(
		&self,
		pkt: IcmpPacket,
		responder: Arc<dyn FlowResponder>,
	) -> Result<(), IcmpError>;

	/// Run the reply plumbing until cancelled. Cancellation closes sockets
	/// and funnels within one socket-wait period.
	async fn serve(&self, ctx: CancellationToken) -> Result<(), IcmpError>;
}

/// Construct the proxy for this platform.
#[allow(unused_variables)]
pub fn new_icmp_proxy(cfg: &IcmpConfig) -> Result<Arc<dyn IcmpService>, IcmpError> {
	#[cfg(target_os = "linux")]
	{
		Ok(Arc::new(proxy_linux::IcmpProxy::new(cfg)))
	}
	#[cfg(target_os = "macos")]
	{
		Ok(Arc::new(proxy_darwin::IcmpProxy::new(cfg)?))
	}
	#[cfg(windows)]
	{
		Ok(Arc::new(proxy_windows::IcmpProxy::new(cfg)))
	}
	#[cfg(not(any(target_os = "linux", target_os = "macos", windows)))]
	{
		Err(IcmpError::Unsupported)
	}
}

/// Open an unprivileged ICMP datagram socket, registered with tokio. Shared
/// by the unix strategies.
#[cfg(any(target_os = "linux", target_os = "macos"))]
pub(crate) fn open_dgram_socket(bind: IpAddr) -> Result<tokio::net::UdpSocket, IcmpError> {
	use socket2::{Domain, Protocol, Socket, Type};
	let (domain, protocol) = match bind {
		IpAddr::V4(_) => (Domain::IPV4, Protocol::ICMPV4),
		IpAddr::V6(_) => (Domain::IPV6, Protocol::ICMPV6),
	};
	let socket = Socket::new(domain, Type::DGRAM, Some(protocol)).map_err(IcmpError::Socket)?;
	socket
		.bind(&SocketAddr::new(bind, 0).into())
		.map_err(IcmpError::Socket)?;
	socket.set_nonblocking(true).map_err(IcmpError::Socket)?;
	let std_socket: std::net::UdpSocket = socket.into();
	tokio::net::UdpSocket::from_std(std_socket).map_err(IcmpError::Socket)
}
