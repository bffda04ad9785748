//! Distributed-trace identity for the packet plane. The edge attaches a
//! trace context to selected packets; spans recorded against a flow are
//! serialized back over the tunnel rather than exported out of band.

use std::time::SystemTime;

use serde::Serialize;

use crate::*;

const BINARY_LEN: usize = 16 + 8 + 1;

/// W3C-shaped trace identity: trace id, parent span id, flags. Carried either
/// as 25 raw bytes or as a textual `traceparent` value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
	pub trace_id: [u8; 16],
	pub span_id: [u8; 8],
	pub flags: u8,
}

impl TraceContext {
	pub fn decode(raw: &[u8]) -> Option<TraceContext> {
		if raw.len() == BINARY_LEN {
			let mut trace_id = [0u8; 16];
			trace_id.copy_from_slice(&raw[..16]);
			let mut span_id = [0u8; 8];
			span_id.copy_from_slice(&raw[16..24]);
			return Some(TraceContext {
				trace_id,
				span_id,
				flags: raw[24],
			});
		}
		Self::parse_traceparent(std::str::from_utf8(raw).ok()?)
	}

	/// `00-<32 hex trace id>-<16 hex span id>-<2 hex flags>`
	pub fn parse_traceparent(value: &str) -> Option<TraceContext> {
		let mut parts = value.trim().split('-');
		let version = parts.next()?;
		if version != "00" {
			return None;
		}
		let trace_hex = parts.next()?;
		let span_hex = parts.next()?;
		let flags_hex = parts.next()?;
		if parts.next().is_some() {
			return None;
		}
		let trace_vec = hex::decode(trace_hex).ok()?;
		let span_vec = hex::decode(span_hex).ok()?;
		let flags_vec = hex::decode(flags_hex).ok()?;
		Some(TraceContext {
			trace_id: trace_vec.try_into().ok()?,
			span_id: span_vec.try_into().ok()?,
			flags: *flags_vec.first()?,
		})
	}

	pub fn encode(&self) -> Bytes {
		let mut out = Vec::with_capacity(BINARY_LEN);
		out.extend_from_slice(&self.trace_id);
		out.extend_from_slice(&self.span_id);
		out.push(self.flags);
		Bytes::from(out)
	}

	pub fn traceparent(&self) -> String {
		format!(
			"00-{}-{}-{:02x}",
			hex::encode(self.trace_id),
			hex::encode(self.span_id),
			self.flags
		)
	}
}

/// One completed span, in the shape serialized onto the tunnel.
#[derive(Debug, Clone, Serialize)]
pub struct SpanData {
	pub name: &'static str,
	pub trace_id: String,
	pub parent_span_id: String,
	/// Microseconds since the unix epoch.
	pub start_unix_micros: u64,
	pub duration_micros: u64,
}

impl SpanData {
	pub fn instant(name: &'static str, ctx: &TraceContext) -> SpanData {
		let now = SystemTime::now()
			.duration_since(SystemTime::UNIX_EPOCH)
			.map(|d| d.as_micros() as u64)
			.unwrap_or_default();
		SpanData {
			name,
			trace_id: hex::encode(ctx.trace_id),
			parent_span_id: hex::encode(ctx.span_id),
			start_unix_micros: now,
			duration_micros: 0,
		}
	}
}

pub fn serialize_spans(spans: &[SpanData]) -> Bytes {
	Bytes::from(serde_json::to_vec(spans).expect("span serialization cannot fail"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn binary_round_trip() {
		let ctx = TraceContext {
			trace_id: [7u8; 16],
			span_id: [9u8; 8],
			flags: 1,
		};
		assert_eq!(TraceContext::decode(&ctx.encode()), Some(ctx));
	}

	#[test]
	fn traceparent_parsing() {
		let ctx = TraceContext::parse_traceparent(
			"00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01",
		)
		.unwrap();
		assert_eq!(hex::encode(ctx.trace_id), "0af7651916cd43dd8448eb211c80319c");
		assert_eq!(hex::encode(ctx.span_id), "b7ad6b7169203331");
		assert_eq!(ctx.flags, 1);
		assert_eq!(
			ctx.traceparent(),
			"00-0af7651916cd43dd8448eb211c80319c-b7ad6b7169203331-01"
		);

		assert_eq!(TraceContext::parse_traceparent("01-aa-bb-cc"), None);
		assert_eq!(TraceContext::parse_traceparent("garbage"), None);
	}
}
