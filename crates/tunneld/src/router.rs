//! The L3 plane: pulls raw IP datagrams off the tunnel muxer, enforces TTL,
//! and hands ICMP echo requests to the platform proxy. Per-packet failures
//! are logged and never stop the loop; cancellation is the only exit.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio_util::sync::CancellationToken;

use crate::config::IcmpConfig;
use crate::icmp::{FlowResponder, IcmpService};
use crate::metrics::Metrics;
use crate::pkt::{time_exceeded_reply, IcmpPacket};
use crate::trc::{serialize_spans, SpanData, TraceContext};
use crate::*;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
	Ip,
	/// An IP datagram with a trace identity in the metadata.
	IpWithTrace,
	/// Serialized spans flowing back to the edge.
	TracingSpan,
}

#[derive(Debug, Clone)]
pub struct TunnelPacket {
	pub typ: PacketType,
	pub payload: Bytes,
	pub metadata: Option<Bytes>,
}

/// The tunnel multiplexer as seen from the packet plane.
#[async_trait::async_trait]
pub trait Muxer: Send + Sync + 'static {
	async fn receive_packet(&self) -> anyhow::Result<TunnelPacket>;
	async fn send_packet(&self, pkt: TunnelPacket) -> anyhow::Result<()>;
}

pub struct PacketRouter {
	muxer: Arc<dyn Muxer>,
	icmp: Option<Arc<dyn IcmpService>>,
	connection_index: u8,
	reply_src_v4: Ipv4Addr,
	reply_src_v6: Ipv6Addr,
	metrics: Arc<Metrics>,
}

impl PacketRouter {
	pub fn new(
		muxer: Arc<dyn Muxer>,
		icmp: Option<Arc<dyn IcmpService>>,
		connection_index: u8,
		cfg: &IcmpConfig,
		metrics: Arc<Metrics>,
	) -> Self {
		PacketRouter {
			muxer,
			icmp,
			connection_index,
			reply_src_v4: cfg.bind_v4,
			reply_src_v6: cfg.bind_v6,
			metrics,
		}
	}

	pub async fn serve(&self, ctx: CancellationToken) -> anyhow::Result<()> {
		loop {
			let pkt = tokio::select! {
				_ = ctx.cancelled() => return Ok(()),
				received = self.muxer.receive_packet() => received?,
			};
			self.handle_packet(pkt).await;
		}
	}

	async fn handle_packet(&self, pkt: TunnelPacket) {
		self.metrics.packets_routed.inc();
		let trace = match pkt.typ {
			PacketType::Ip => None,
			PacketType::IpWithTrace => pkt
				.metadata
				.as_deref()
				.and_then(TraceContext::decode),
			PacketType::TracingSpan => {
				debug!("dropping unexpected inbound span packet");
				self.metrics.packets_dropped.inc();
				return;
			},
		};
		let responder = Arc::new(PacketResponder {
			muxer: self.muxer.clone(),
			connection_index: self.connection_index,
			trace,
			metrics: self.metrics.clone(),
			replied: AtomicBool::new(false),
		});

		let Some(icmp) = &self.icmp else {
			// No platform support; the rest of the system runs without L3.
			trace!("icmp proxy unavailable; dropping packet");
			self.metrics.packets_dropped.inc();
			return;
		};
		let mut parsed = match IcmpPacket::decode(&pkt.payload) {
			Ok(parsed) => parsed,
			Err(e) => {
				debug!(err=%e, "dropping undecodable packet");
				self.metrics.packets_dropped.inc();
				return;
			},
		};

		if parsed.header.ttl <= 1 {
			self.send_time_exceeded(&parsed, &pkt.payload, &responder).await;
			return;
		}
		parsed.header.ttl -= 1;

		self.metrics.icmp_requests.inc();
		if let Err(e) = icmp.request(parsed, responder).await {
			debug!(err=%e, "icmp proxy rejected request");
		}
	}

	/// The packet died here: answer with Time-Exceeded carrying the original
	/// datagram, and do not forward.
	async fn send_time_exceeded(
		&self,
		parsed: &IcmpPacket,
		raw: &[u8],
		responder: &Arc<PacketResponder>,
	) {
		let reply_src: IpAddr = if parsed.is_v4() {
			self.reply_src_v4.into()
		} else {
			self.reply_src_v6.into()
		};
		self.metrics.ttl_exceeded.inc();
		let reply = time_exceeded_reply(reply_src, parsed.header.src, raw);
		if let Err(e) = responder
			.return_packet(Bytes::from(reply.encode()))
			.await
		{
			debug!(err=%e, "failed to send time-exceeded reply");
		}
	}
}

/// Returns replies and spans to the tunnel connection a packet arrived on.
/// Reply-span emission is suppressed after the first reply of a flow.
pub struct PacketResponder {
	muxer: Arc<dyn Muxer>,
	connection_index: u8,
	trace: Option<TraceContext>,
	metrics: Arc<Metrics>,
	replied: AtomicBool,
}

impl PacketResponder {
	async fn export_span(&self, name: &'static str) {
		let Some(trace) = &self.trace else {
			return;
		};
		let span = SpanData::instant(name, trace);
		let packet = TunnelPacket {
			typ: PacketType::TracingSpan,
			payload: serialize_spans(&[span]),
			metadata: Some(trace.encode()),
		};
		if let Err(e) = self.muxer.send_packet(packet).await {
			debug!(err=%e, name, "failed to export span packet");
		}
	}
}

#[async_trait::async_trait]
impl FlowResponder for PacketResponder {
	async fn return_packet(&self, raw: Bytes) -> anyhow::Result<()> {
		self.metrics.icmp_replies.inc();
		self
			.muxer
			.send_packet(TunnelPacket {
				typ: PacketType::Ip,
				payload: raw,
				metadata: None,
			})
			.await
	}

	fn connection_index(&self) -> u8 {
		self.connection_index
	}

	async fn record_request_span(&self, pkt: &IcmpPacket) {
		trace!(src = %pkt.header.src, dst = %pkt.header.dst, "icmp-echo-request");
		self.export_span("icmp-echo-request").await;
	}

	async fn record_reply_span(&self, pkt: &IcmpPacket) {
		if self.replied.swap(true, Ordering::SeqCst) {
			return;
		}
		trace!(src = %pkt.header.src, dst = %pkt.header.dst, "icmp-echo-reply");
		self.export_span("icmp-echo-reply").await;
	}
}

#[cfg(test)]
#[path = "router_test.rs"]
mod tests;
