use std::future::Future;
use std::io;

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tunnel_core::copy;

use crate::carrier::ws::WsStream;
use crate::ingress::origin_request::OriginRequestConfig;
use crate::origin::{dial, socks, OriginConnection, OriginError, StreamEstablisher, TunnelStream};
use crate::*;

/// Raw TCP to a per-request destination (used by the L3 routing plane).
/// Writes carry a deadline so a wedged origin cannot pin the relay forever on
/// kernel backpressure.
pub struct RawTcpOrigin {
	name: Strng,
	connect_timeout: Duration,
	no_happy_eyeballs: bool,
	write_timeout: Duration,
}

pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_secs(30);

impl RawTcpOrigin {
	pub fn new(name: Strng, cfg: &OriginRequestConfig, write_timeout: Duration) -> Self {
		RawTcpOrigin {
			name,
			connect_timeout: cfg.connect_timeout,
			no_happy_eyeballs: cfg.no_happy_eyeballs,
			write_timeout,
		}
	}

	pub fn name(&self) -> &Strng {
		&self.name
	}
}

#[async_trait::async_trait]
impl StreamEstablisher for RawTcpOrigin {
	async fn establish(&self, dest: Option<&str>) -> Result<Box<dyn OriginConnection>, OriginError> {
		let dest = dest.ok_or(OriginError::MissingDestination)?;
		let stream = dial(dest, self.connect_timeout, self.no_happy_eyeballs).await?;
		Ok(Box::new(TcpConnection {
			stream: WriteDeadline::new(stream, self.write_timeout),
		}))
	}
}

/// TCP reached through WebSocket framing on the tunnel side. In bastion mode
/// the destination arrives per request; otherwise it is fixed at config time.
/// When the rule selects a SOCKS proxy type, the tunnel side speaks SOCKS5 and
/// is answered with the pre-dialed connection.
pub struct TcpOverWsOrigin {
	dest: Option<Strng>,
	is_bastion: bool,
	socks_handler: bool,
	connect_timeout: Duration,
	no_happy_eyeballs: bool,
}

impl TcpOverWsOrigin {
	pub fn new(
		dest: Option<Strng>,
		is_bastion: bool,
		socks_handler: bool,
		cfg: &OriginRequestConfig,
	) -> Self {
		TcpOverWsOrigin {
			dest,
			is_bastion,
			socks_handler,
			connect_timeout: cfg.connect_timeout,
			no_happy_eyeballs: cfg.no_happy_eyeballs,
		}
	}

	pub fn is_bastion(&self) -> bool {
		self.is_bastion
	}
}

#[async_trait::async_trait]
impl StreamEstablisher for TcpOverWsOrigin {
	async fn establish(&self, dest: Option<&str>) -> Result<Box<dyn OriginConnection>, OriginError> {
		let target = if self.is_bastion {
			dest.ok_or(OriginError::MissingDestination)?
		} else {
			self.dest.as_deref().ok_or(OriginError::MissingDestination)?
		};
		let stream = dial(target, self.connect_timeout, self.no_happy_eyeballs).await?;
		Ok(Box::new(WsFramedConnection {
			origin: stream,
			socks_handler: self.socks_handler,
		}))
	}
}

struct TcpConnection {
	stream: WriteDeadline<TcpStream>,
}

#[async_trait::async_trait]
impl OriginConnection for TcpConnection {
	async fn stream(self: Box<Self>, tunnel: Box<dyn TunnelStream>) -> Result<(), OriginError> {
		copy::stream(tunnel, self.stream).await?;
		Ok(())
	}
}

struct WsFramedConnection {
	origin: TcpStream,
	socks_handler: bool,
}

#[async_trait::async_trait]
impl OriginConnection for WsFramedConnection {
	async fn stream(self: Box<Self>, tunnel: Box<dyn TunnelStream>) -> Result<(), OriginError> {
		// The edge negotiated the WS upgrade already; wrap the raw tunnel
		// bytes in server-side framing. The wrapper (and its pinger) stops
		// when this scope ends, before the endpoints are closed.
		let ws = WsStream::accept(tunnel).await;
		if self.socks_handler {
			socks::serve_fixed(ws, self.origin).await
		} else {
			copy::stream(ws, self.origin).await?;
			Ok(())
		}
	}
}

/// AsyncWrite wrapper enforcing a per-write deadline. The deadline arms when
/// a write first returns Pending and clears once it completes.
pub struct WriteDeadline<S> {
	inner: S,
	timeout: Duration,
	deadline: Option<Pin<Box<tokio::time::Sleep>>>,
}

impl<S> WriteDeadline<S> {
	pub fn new(inner: S, timeout: Duration) -> Self {
		WriteDeadline {
			inner,
			timeout,
			deadline: None,
		}
	}
}

impl<S: AsyncRead + Unpin> AsyncRead for WriteDeadline<S> {
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		Pin::new(&mut self.inner).poll_read(cx, buf)
	}
}

impl<S: AsyncWrite + Unpin> AsyncWrite for WriteDeadline<S> {
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<Result<usize, io::Error>> {
		let me = &mut *self;
		if me.deadline.is_none() {
			me.deadline = Some(Box::pin(tokio::time::sleep(me.timeout)));
		}
		match Pin::new(&mut me.inner).poll_write(cx, buf) {
			Poll::Ready(res) => {
				me.deadline = None;
				Poll::Ready(res)
			},
			Poll::Pending => {
				if let Some(sleep) = me.deadline.as_mut() {
					if sleep.as_mut().poll(cx).is_ready() {
						return Poll::Ready(Err(io::Error::new(
							io::ErrorKind::TimedOut,
							"origin write timed out",
						)));
					}
				}
				Poll::Pending
			},
		}
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
		Pin::new(&mut self.inner).poll_flush(cx)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
		Pin::new(&mut self.inner).poll_shutdown(cx)
	}
}
