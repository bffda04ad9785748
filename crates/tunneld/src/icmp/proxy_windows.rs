//! Windows strategy: a synchronous raw-socket echo with a bounded reply wait,
//! run on the blocking pool. The raw-socket paths have produced panics under
//! adversarial input, so the whole syscall sequence runs under panic
//! containment and surfaces as an error instead of taking the process down.

use std::io;
use std::mem::MaybeUninit;
use std::panic::{catch_unwind, AssertUnwindSafe};

use socket2::{Domain, Protocol, Socket, Type};
use tokio_util::sync::CancellationToken;

use crate::config::IcmpConfig;
use crate::icmp::{FlowResponder, IcmpError, IcmpService};
use crate::pkt::{Echo, IcmpBody, IcmpPacket, IpHeader, DEFAULT_TTL};
use crate::*;

/// How long the synchronous path waits for a reply before giving up.
const REPLY_WAIT: Duration = Duration::from_secs(1);

pub(crate) struct IcmpProxy {
	bind_v4: Ipv4Addr,
	bind_v6: Ipv6Addr,
}

impl IcmpProxy {
	pub(crate) fn new(cfg: &IcmpConfig) -> Self {
		IcmpProxy {
			bind_v4: cfg.bind_v4,
			bind_v6: cfg.bind_v6,
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
		let v4 = pkt.is_v4();
		let bind: IpAddr = if v4 {
			self.bind_v4.into()
		} else {
			self.bind_v6.into()
		};
		let dst = pkt.header.dst;
		let message = pkt.encode_message();
		let expect_id = echo.id;
		responder.record_request_span(&pkt).await;

		let outcome = tokio::task::spawn_blocking(move || {
			catch_unwind(AssertUnwindSafe(|| {
				blocking_echo(bind, dst, &message, expect_id, v4)
			}))
		})
		.await
		.map_err(|e| IcmpError::Internal(anyhow::anyhow!("blocking echo task failed: {e}")))?;

		let reply = match outcome {
			Ok(result) => result?,
			Err(panic) => {
				let msg = panic
					.downcast_ref::<&str>()
					.map(|s| s.to_string())
					.or_else(|| panic.downcast_ref::<String>().cloned())
					.unwrap_or_else(|| "unknown panic".to_string());
				error!(%msg, "recovered panic in windows icmp path");
				return Err(IcmpError::Panicked(msg));
			},
		};

		let Some((seq, payload, from)) = reply else {
			// No reply within the wait window; the eyeball will retry.
			return Ok(());
		};
		let reply_pkt = IcmpPacket {
			header: IpHeader {
				src: from,
				dst: pkt.header.src,
				ttl: DEFAULT_TTL,
			},
			body: IcmpBody::EchoReply(Echo {
				id: expect_id,
				seq,
				payload,
			}),
		};
		responder.record_reply_span(&reply_pkt).await;
		responder
			.return_packet(Bytes::from(reply_pkt.encode()))
			.await
			.map_err(IcmpError::Internal)?;
		Ok(())
	}

	async fn serve(&self, ctx: CancellationToken) -> Result<(), IcmpError> {
		// Requests are self-contained; nothing to pump.
		ctx.cancelled().await;
		Ok(())
	}
}

fn blocking_echo(
	bind: IpAddr,
	dst: IpAddr,
	message: &[u8],
	expect_id: u16,
	v4: bool,
) -> Result<Option<(u16, Bytes, IpAddr)>, IcmpError> {
	let (domain, protocol) = if v4 {
		(Domain::IPV4, Protocol::ICMPV4)
	} else {
		(Domain::IPV6, Protocol::ICMPV6)
	};
	let socket = Socket::new(domain, Type::RAW, Some(protocol)).map_err(IcmpError::Socket)?;
	socket
		.bind(&SocketAddr::new(bind, 0).into())
		.map_err(IcmpError::Socket)?;
	socket
		.set_read_timeout(Some(REPLY_WAIT))
		.map_err(IcmpError::Socket)?;
	socket
		.send_to(message, &SocketAddr::new(dst, 0).into())
		.map_err(IcmpError::Io)?;

	let deadline = Instant::now() + REPLY_WAIT;
	let mut buf = [MaybeUninit::<u8>::uninit(); 65535];
	while Instant::now() < deadline {
		let (n, from) = match socket.recv_from(&mut buf) {
			Ok(r) => r,
			Err(e)
				if e.kind() == io::ErrorKind::WouldBlock || e.kind() == io::ErrorKind::TimedOut =>
			{
				return Ok(None);
			},
			Err(e) => return Err(IcmpError::Io(e)),
		};
		let raw = unsafe { std::slice::from_raw_parts(buf.as_ptr() as *const u8, n) };
		// Raw sockets deliver the full IP datagram on v4.
		let body = match IcmpPacket::decode(raw) {
			Ok(pkt) => pkt.body,
			Err(_) => match crate::pkt::decode_message(raw, v4) {
				Ok(body) => body,
				Err(_) => continue,
			},
		};
		if let IcmpBody::EchoReply(echo) = body {
			if echo.id == expect_id {
				let from_ip = from
					.as_socket()
					.map(|s| s.ip())
					.unwrap_or(dst);
				return Ok(Some((echo.seq, echo.payload, from_ip)));
			}
		}
	}
	Ok(None)
}
