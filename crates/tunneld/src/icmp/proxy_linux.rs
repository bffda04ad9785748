//! Linux strategy: one unprivileged ICMP datagram socket per flow. The
//! kernel rewrites the echo id to the socket's local "port", which therefore
//! doubles as the assigned id; no in-process allocator is needed. Each funnel
//! runs its own reply listener.

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::IcmpConfig;
use crate::icmp::funnel::{Funnel, FunnelTracker};
use crate::icmp::{open_dgram_socket, FlowResponder, IcmpError, IcmpService, DEFAULT_IDLE_TIMEOUT};
use crate::pkt::{decode_message, Echo, IcmpBody, IcmpPacket, IpHeader, DEFAULT_TTL};
use crate::*;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct FlowKey {
	src: IpAddr,
	dst: IpAddr,
	original_id: u16,
}

pub(crate) struct IcmpProxy {
	funnels: Arc<FunnelTracker<FlowKey, IcmpFunnel>>,
	bind_v4: Ipv4Addr,
	bind_v6: Ipv6Addr,
	idle_timeout: Duration,
}

struct IcmpFunnel {
	socket: Arc<tokio::net::UdpSocket>,
	assigned_id: u16,
	responder: Arc<dyn FlowResponder>,
	last_active: Mutex<tokio::time::Instant>,
	closed: CancellationToken,
}

impl IcmpFunnel {
	fn touch(&self) {
		*self.last_active.lock() = tokio::time::Instant::now();
	}
}

impl Funnel for IcmpFunnel {
	fn last_active(&self) -> tokio::time::Instant {
		*self.last_active.lock()
	}

	fn close(&self) {
		// Cancels the reply listener; the socket drops with the last Arc.
		self.closed.cancel();
	}
}

impl IcmpProxy {
	pub(crate) fn new(cfg: &IcmpConfig) -> Self {
		IcmpProxy {
			funnels: Arc::new(FunnelTracker::new()),
			bind_v4: cfg.bind_v4,
			bind_v6: cfg.bind_v6,
			idle_timeout: cfg.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT),
		}
	}

	fn open_funnel(
		&self,
		key: &FlowKey,
		responder: Arc<dyn FlowResponder>,
	) -> anyhow::Result<Arc<IcmpFunnel>> {
		let bind: IpAddr = match key.dst {
			IpAddr::V4(_) => self.bind_v4.into(),
			IpAddr::V6(_) => self.bind_v6.into(),
		};
		let socket = Arc::new(open_dgram_socket(bind)?);
		// The kernel-assigned port is the echo id replies will carry.
		let assigned_id = socket.local_addr()?.port();
		let funnel = Arc::new(IcmpFunnel {
			socket: socket.clone(),
			assigned_id,
			responder: responder.clone(),
			last_active: Mutex::new(tokio::time::Instant::now()),
			closed: CancellationToken::new(),
		});
		trace!(?key, assigned_id, "opened icmp flow socket");
		tokio::spawn(listen_for_replies(key.clone(), funnel.clone()));
		Ok(funnel)
	}
}

async fn listen_for_replies(key: FlowKey, funnel: Arc<IcmpFunnel>) {
	let v4 = key.dst.is_ipv4();
	let mut buf = vec![0u8; 1500];
	loop {
		let (n, from) = tokio::select! {
			_ = funnel.closed.cancelled() => return,
			recv = funnel.socket.recv_from(&mut buf) => match recv {
				Ok(r) => r,
				Err(e) => {
					debug!(err=%e, "icmp flow socket closed");
					return;
				},
			},
		};
		let body = match decode_message(&buf[..n], v4) {
			Ok(body) => body,
			Err(e) => {
				debug!(err=%e, "failed to parse icmp reply");
				continue;
			},
		};
		let echo = match body {
			IcmpBody::EchoReply(echo) => echo,
			other => {
				debug!(?other, "discarding non-echo-reply icmp message");
				continue;
			},
		};
		funnel.touch();
		// The reply carries the kernel-assigned id; restore the one the
		// eyeball originally sent before returning it through the tunnel.
		let reply = IcmpPacket {
			header: IpHeader {
				src: from.ip(),
				dst: key.src,
				ttl: DEFAULT_TTL,
			},
			body: IcmpBody::EchoReply(Echo {
				id: key.original_id,
				seq: echo.seq,
				payload: echo.payload,
			}),
		};
		funnel.responder.record_reply_span(&reply).await;
		if let Err(e) = funnel.responder.return_packet(Bytes::from(reply.encode())).await {
			debug!(err=%e, "failed to return icmp reply");
		}
	}
}

#[async_trait::async_trait]
impl IcmpService for IcmpProxy {
	async fn request(
		&self,
		pkt: IcmpPacket,
		responder: Arc<dyn FlowResponder>,
	) -> Result<(), IcmpError> {
		let IcmpBody::EchoRequest(ref echo) = pkt.body else {
			return Err(IcmpError::NotEchoRequest);
		};
		let key = FlowKey {
			src: pkt.header.src,
			dst: pkt.header.dst,
			original_id: echo.id,
		};
		let (funnel, is_new) = self.funnels.get_or_register(
			key.clone(),
			// Replies must follow the most recent tunnel connection.
			|existing| existing.responder.connection_index() != responder.connection_index(),
			|| self.open_funnel(&key, responder.clone()),
		)?;
		if is_new {
			debug!(?key, assigned_id = funnel.assigned_id, "registered icmp flow");
		}
		funnel.touch();
		// The kernel stamps the socket's id on the way out; everything else
		// in the message is preserved.
		funnel
			.socket
			.send_to(&pkt.encode_message(), SocketAddr::new(pkt.header.dst, 0))
			.await?;
		responder.record_request_span(&pkt).await;
		Ok(())
	}

	async fn serve(&self, ctx: CancellationToken) -> Result<(), IcmpError> {
		self.funnels.schedule_cleanup(ctx, self.idle_timeout).await;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use std::sync::atomic::{AtomicU8, Ordering};

	use tokio::sync::mpsc;

	use super::*;

	struct CaptureResponder {
		index: u8,
		replies: mpsc::UnboundedSender<IcmpPacket>,
		spans: AtomicU8,
	}

	#[async_trait::async_trait]
	impl FlowResponder for CaptureResponder {
		async fn return_packet(&self, raw: Bytes) -> anyhow::Result<()> {
			self.replies.send(IcmpPacket::decode(&raw)?)?;
			Ok(())
		}

		fn connection_index(&self) -> u8 {
			self.index
		}

		async fn record_request_span(&self, _pkt: &IcmpPacket) {
			self.spans.fetch_add(1, Ordering::SeqCst);
		}

		async fn record_reply_span(&self, _pkt: &IcmpPacket) {}
	}

	fn echo_request(seq: u16) -> IcmpPacket {
		IcmpPacket {
			header: IpHeader {
				src: "127.0.0.1".parse().unwrap(),
				dst: "127.0.0.1".parse().unwrap(),
				ttl: 64,
			},
			body: IcmpBody::EchoRequest(Echo {
				id: 36571,
				seq,
				payload: Bytes::from_static(b"tunneld-echo"),
			}),
		}
	}

	#[tokio::test]
	async fn rejects_non_echo_messages() {
		let proxy = IcmpProxy::new(&IcmpConfig::default());
		let (tx, _rx) = mpsc::unbounded_channel();
		let responder = Arc::new(CaptureResponder {
			index: 0,
			replies: tx,
			spans: AtomicU8::new(0),
		});
		let pkt = IcmpPacket {
			header: IpHeader {
				src: "127.0.0.1".parse().unwrap(),
				dst: "127.0.0.1".parse().unwrap(),
				ttl: 64,
			},
			body: IcmpBody::EchoReply(Echo {
				id: 1,
				seq: 1,
				payload: Bytes::new(),
			}),
		};
		let err = proxy.request(pkt, responder).await.unwrap_err();
		assert!(matches!(err, IcmpError::NotEchoRequest));
	}

	// Requires net.ipv4.ping_group_range to include this process's gid, which
	// CI containers do not guarantee.
	#[tokio::test]
	#[ignore]
	async fn loopback_echo_round_trip() {
		let proxy = Arc::new(IcmpProxy::new(&IcmpConfig::default()));
		let ctx = CancellationToken::new();
		{
			let proxy = proxy.clone();
			let ctx = ctx.clone();
			tokio::spawn(async move { proxy.serve(ctx).await });
		}
		let (tx, mut rx) = mpsc::unbounded_channel();
		let responder = Arc::new(CaptureResponder {
			index: 0,
			replies: tx,
			spans: AtomicU8::new(0),
		});
		for seq in 0..20u16 {
			proxy
				.request(echo_request(seq), responder.clone())
				.await
				.unwrap();
			let reply = tokio::time::timeout(Duration::from_secs(2), rx.recv())
				.await
				.unwrap()
				.unwrap();
			let echo = reply.echo().unwrap();
			assert_eq!(echo.id, 36571);
			assert_eq!(echo.seq, seq);
			assert_eq!(echo.payload.as_ref(), b"tunneld-echo");
			assert!(matches!(reply.body, IcmpBody::EchoReply(_)));
		}
		ctx.cancel();
	}
}
