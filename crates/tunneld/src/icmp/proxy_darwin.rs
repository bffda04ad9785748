//! Darwin strategy: one shared unprivileged socket per address family, with
//! an in-process echo-id allocator. Replies are demultiplexed by the assigned
//! id. The kernel may hand us bare ICMP messages or full IP datagrams on the
//! same socket; both shapes are handled.

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::IcmpConfig;
use crate::icmp::echo_id::{EchoIdTracker, EchoKey};
use crate::icmp::funnel::{Funnel, FunnelTracker};
use crate::icmp::{open_dgram_socket, FlowResponder, IcmpError, IcmpService, DEFAULT_IDLE_TIMEOUT};
use crate::pkt::{decode_message, Echo, IcmpBody, IcmpPacket, IpHeader, DEFAULT_TTL};
use crate::*;

/// Funnels are keyed by (family, assigned echo id): the reply only carries
/// the id, so that pair must be unique per live flow.
type FunnelId = (bool, u16);

pub(crate) struct IcmpProxy {
	socket_v4: Arc<tokio::net::UdpSocket>,
	socket_v6: Arc<tokio::net::UdpSocket>,
	echo_ids: Arc<EchoIdTracker>,
	funnels: Arc<FunnelTracker<FunnelId, SharedSocketFunnel>>,
	idle_timeout: Duration,
}

struct SharedSocketFunnel {
	key: EchoKey,
	assigned_id: u16,
	responder: Arc<dyn FlowResponder>,
	echo_ids: Arc<EchoIdTracker>,
	last_active: Mutex<tokio::time::Instant>,
	closed: CancellationToken,
}

impl Funnel for SharedSocketFunnel {
	fn last_active(&self) -> tokio::time::Instant {
		*self.last_active.lock()
	}

	fn close(&self) {
		self.closed.cancel();
		self.echo_ids.release(&self.key, self.assigned_id);
	}
}

impl IcmpProxy {
	pub(crate) fn new(cfg: &IcmpConfig) -> Result<Self, IcmpError> {
		Ok(IcmpProxy {
			socket_v4: Arc::new(open_dgram_socket(cfg.bind_v4.into())?),
			socket_v6: Arc::new(open_dgram_socket(cfg.bind_v6.into())?),
			echo_ids: Arc::new(EchoIdTracker::new()),
			funnels: Arc::new(FunnelTracker::new()),
			idle_timeout: cfg.idle_timeout.unwrap_or(DEFAULT_IDLE_TIMEOUT),
		})
	}

	fn socket_for(&self, v4: bool) -> &Arc<tokio::net::UdpSocket> {
		if v4 { &self.socket_v4 } else { &self.socket_v6 }
	}

	async fn reply_loop(&self, v4: bool, ctx: CancellationToken) {
		let socket = self.socket_for(v4).clone();
		let mut buf = vec![0u8; 65535];
		loop {
			let (n, from) = tokio::select! {
				_ = ctx.cancelled() => return,
				recv = socket.recv_from(&mut buf) => match recv {
					Ok(r) => r,
					Err(e) => {
						debug!(err=%e, "shared icmp socket closed");
						return;
					},
				},
			};
			let body = match parse_reply(&buf[..n], v4) {
				Some(body) => body,
				None => {
					debug!("failed to parse datagram from shared icmp socket");
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
			let Some(funnel) = self.funnels.get(&(v4, echo.id)) else {
				// Reply for a closed flow; drop silently.
				continue;
			};
			*funnel.last_active.lock() = tokio::time::Instant::now();
			let reply = IcmpPacket {
				header: IpHeader {
					src: from.ip(),
					dst: funnel.key.src,
					ttl: DEFAULT_TTL,
				},
				body: IcmpBody::EchoReply(Echo {
					id: funnel.key.original_id,
					seq: echo.seq,
					payload: echo.payload,
				}),
			};
			funnel.responder.record_reply_span(&reply).await;
			if let Err(e) = funnel
				.responder
				.return_packet(Bytes::from(reply.encode()))
				.await
			{
				debug!(err=%e, "failed to return icmp reply");
			}
		}
	}
}

/// The shared socket yields bare ICMP messages at first, then full IP
/// datagrams once replies start flowing. Try both shapes.
fn parse_reply(raw: &[u8], v4: bool) -> Option<IcmpBody> {
	if let Ok(body) = decode_message(raw, v4) {
		if matches!(body, IcmpBody::EchoReply(_)) {
			return Some(body);
		}
	}
	IcmpPacket::decode(raw).ok().map(|pkt| pkt.body)
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
		let key = EchoKey {
			src: pkt.header.src,
			dst: pkt.header.dst,
			original_id: echo.id,
		};
		let assigned_id = self
			.echo_ids
			.get_or_assign(&key)
			.ok_or(IcmpError::EchoIdExhausted)?;
		let v4 = pkt.is_v4();
		let (funnel, _) = self.funnels.get_or_register(
			(v4, assigned_id),
			|existing| existing.responder.connection_index() != responder.connection_index(),
			|| {
				Ok(Arc::new(SharedSocketFunnel {
					key: key.clone(),
					assigned_id,
					responder: responder.clone(),
					echo_ids: self.echo_ids.clone(),
					last_active: Mutex::new(tokio::time::Instant::now()),
					closed: CancellationToken::new(),
				}))
			},
		)?;
		*funnel.last_active.lock() = tokio::time::Instant::now();

		// Rewrite only the echo id; type, code, seq, and payload pass through.
		let rewritten = IcmpPacket {
			header: pkt.header.clone(),
			body: IcmpBody::EchoRequest(Echo {
				id: assigned_id,
				seq: echo.seq,
				payload: echo.payload.clone(),
			}),
		};
		self
			.socket_for(v4)
			.send_to(
				&rewritten.encode_message(),
				SocketAddr::new(pkt.header.dst, 0),
			)
			.await?;
		responder.record_request_span(&pkt).await;
		Ok(())
	}

	async fn serve(&self, ctx: CancellationToken) -> Result<(), IcmpError> {
		tokio::join!(
			self.reply_loop(true, ctx.clone()),
			self.reply_loop(false, ctx.clone()),
			self.funnels.schedule_cleanup(ctx, self.idle_timeout),
		);
		Ok(())
	}
}
