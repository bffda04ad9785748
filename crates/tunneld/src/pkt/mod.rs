//! Minimal IP + ICMP codec for the echo-proxy plane. Only what the router
//! needs: echo request/reply, time-exceeded synthesis, TTL handling. Anything
//! else is surfaced as `Other` and dropped by callers.

use crate::*;

pub const DEFAULT_TTL: u8 = 64;

const IPV4_PROTO_ICMP: u8 = 1;
const IPV6_NEXT_HEADER_ICMP: u8 = 58;

const ICMPV4_ECHO_REQUEST: u8 = 8;
const ICMPV4_ECHO_REPLY: u8 = 0;
const ICMPV4_TIME_EXCEEDED: u8 = 11;
const ICMPV6_ECHO_REQUEST: u8 = 128;
const ICMPV6_ECHO_REPLY: u8 = 129;
const ICMPV6_TIME_EXCEEDED: u8 = 3;

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum PacketError {
	#[error("packet truncated")]
	Truncated,
	#[error("unsupported ip version {0}")]
	BadVersion(u8),
	#[error("unsupported ip protocol {0}")]
	UnsupportedProtocol(u8),
	#[error("address family mismatch")]
	FamilyMismatch,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpHeader {
	pub src: IpAddr,
	pub dst: IpAddr,
	/// Hop limit on IPv6.
	pub ttl: u8,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Echo {
	pub id: u16,
	pub seq: u16,
	pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IcmpBody {
	EchoRequest(Echo),
	EchoReply(Echo),
	TimeExceeded { original: Bytes },
	Other { typ: u8, code: u8, body: Bytes },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IcmpPacket {
	pub header: IpHeader,
	pub body: IcmpBody,
}

impl IcmpPacket {
	pub fn is_v4(&self) -> bool {
		self.header.src.is_ipv4()
	}

	pub fn echo(&self) -> Option<&Echo> {
		match &self.body {
			IcmpBody::EchoRequest(e) | IcmpBody::EchoReply(e) => Some(e),
			_ => None,
		}
	}

	/// Parse a full IP datagram carrying ICMP.
	pub fn decode(raw: &[u8]) -> Result<IcmpPacket, PacketError> {
		if raw.is_empty() {
			return Err(PacketError::Truncated);
		}
		match raw[0] >> 4 {
			4 => {
				if raw.len() < 20 {
					return Err(PacketError::Truncated);
				}
				let header_len = ((raw[0] & 0x0f) as usize) * 4;
				if header_len < 20 || raw.len() < header_len {
					return Err(PacketError::Truncated);
				}
				let protocol = raw[9];
				if protocol != IPV4_PROTO_ICMP {
					return Err(PacketError::UnsupportedProtocol(protocol));
				}
				let src = IpAddr::V4(Ipv4Addr::new(raw[12], raw[13], raw[14], raw[15]));
				let dst = IpAddr::V4(Ipv4Addr::new(raw[16], raw[17], raw[18], raw[19]));
				let header = IpHeader {
					src,
					dst,
					ttl: raw[8],
				};
				let body = decode_message(&raw[header_len..], true)?;
				Ok(IcmpPacket { header, body })
			},
			6 => {
				if raw.len() < 40 {
					return Err(PacketError::Truncated);
				}
				let next_header = raw[6];
				if next_header != IPV6_NEXT_HEADER_ICMP {
					return Err(PacketError::UnsupportedProtocol(next_header));
				}
				let mut src = [0u8; 16];
				src.copy_from_slice(&raw[8..24]);
				let mut dst = [0u8; 16];
				dst.copy_from_slice(&raw[24..40]);
				let header = IpHeader {
					src: IpAddr::V6(Ipv6Addr::from(src)),
					dst: IpAddr::V6(Ipv6Addr::from(dst)),
					ttl: raw[7],
				};
				let body = decode_message(&raw[40..], false)?;
				Ok(IcmpPacket { header, body })
			},
			v => Err(PacketError::BadVersion(v)),
		}
	}

	/// Encode the full IP datagram. The ICMP checksum is always filled in;
	/// for IPv6 it is computed without the pseudo-header, matching the
	/// userspace path where the kernel never sees this packet.
	pub fn encode(&self) -> Vec<u8> {
		let message = self.encode_message();
		match (self.header.src, self.header.dst) {
			(IpAddr::V4(src), IpAddr::V4(dst)) => {
				let total_len = 20 + message.len();
				let mut out = Vec::with_capacity(total_len);
				out.push(0x45);
				out.push(0);
				out.extend_from_slice(&(total_len as u16).to_be_bytes());
				out.extend_from_slice(&[0, 0, 0, 0]); // id, flags, frag offset
				out.push(self.header.ttl);
				out.push(IPV4_PROTO_ICMP);
				out.extend_from_slice(&[0, 0]); // header checksum placeholder
				out.extend_from_slice(&src.octets());
				out.extend_from_slice(&dst.octets());
				let cksum = internet_checksum(&out[..20]);
				out[10..12].copy_from_slice(&cksum.to_be_bytes());
				out.extend_from_slice(&message);
				out
			},
			(IpAddr::V6(src), IpAddr::V6(dst)) => {
				let mut out = Vec::with_capacity(40 + message.len());
				out.extend_from_slice(&[0x60, 0, 0, 0]);
				out.extend_from_slice(&(message.len() as u16).to_be_bytes());
				out.push(IPV6_NEXT_HEADER_ICMP);
				out.push(self.header.ttl);
				out.extend_from_slice(&src.octets());
				out.extend_from_slice(&dst.octets());
				out.extend_from_slice(&message);
				out
			},
			_ => unreachable!("src and dst families always agree"),
		}
	}

	/// Encode only the ICMP message, as sent on an unprivileged datagram
	/// socket (the kernel builds the IP header).
	pub fn encode_message(&self) -> Vec<u8> {
		let v4 = self.is_v4();
		let (typ, code, rest): (u8, u8, Vec<u8>) = match &self.body {
			IcmpBody::EchoRequest(echo) => (
				if v4 { ICMPV4_ECHO_REQUEST } else { ICMPV6_ECHO_REQUEST },
				0,
				encode_echo(echo),
			),
			IcmpBody::EchoReply(echo) => (
				if v4 { ICMPV4_ECHO_REPLY } else { ICMPV6_ECHO_REPLY },
				0,
				encode_echo(echo),
			),
			IcmpBody::TimeExceeded { original } => {
				let typ = if v4 {
					ICMPV4_TIME_EXCEEDED
				} else {
					ICMPV6_TIME_EXCEEDED
				};
				let mut rest = vec![0u8; 4];
				rest.extend_from_slice(original);
				(typ, 0, rest)
			},
			IcmpBody::Other { typ, code, body } => (*typ, *code, body.to_vec()),
		};
		let mut out = Vec::with_capacity(4 + rest.len());
		out.push(typ);
		out.push(code);
		out.extend_from_slice(&[0, 0]);
		out.extend_from_slice(&rest);
		let cksum = internet_checksum(&out);
		out[2..4].copy_from_slice(&cksum.to_be_bytes());
		out
	}
}

fn encode_echo(echo: &Echo) -> Vec<u8> {
	let mut out = Vec::with_capacity(4 + echo.payload.len());
	out.extend_from_slice(&echo.id.to_be_bytes());
	out.extend_from_slice(&echo.seq.to_be_bytes());
	out.extend_from_slice(&echo.payload);
	out
}

/// Parse a bare ICMP message (no IP header), as read from an unprivileged
/// datagram socket.
pub fn decode_message(raw: &[u8], v4: bool) -> Result<IcmpBody, PacketError> {
	if raw.len() < 4 {
		return Err(PacketError::Truncated);
	}
	let typ = raw[0];
	let code = raw[1];
	let rest = &raw[4..];
	let echo = |rest: &[u8]| -> Result<Echo, PacketError> {
		if rest.len() < 4 {
			return Err(PacketError::Truncated);
		}
		Ok(Echo {
			id: u16::from_be_bytes([rest[0], rest[1]]),
			seq: u16::from_be_bytes([rest[2], rest[3]]),
			payload: Bytes::copy_from_slice(&rest[4..]),
		})
	};
	let body = match (v4, typ) {
		(true, ICMPV4_ECHO_REQUEST) | (false, ICMPV6_ECHO_REQUEST) => {
			IcmpBody::EchoRequest(echo(rest)?)
		},
		(true, ICMPV4_ECHO_REPLY) | (false, ICMPV6_ECHO_REPLY) => IcmpBody::EchoReply(echo(rest)?),
		(true, ICMPV4_TIME_EXCEEDED) | (false, ICMPV6_TIME_EXCEEDED) => {
			if rest.len() < 4 {
				return Err(PacketError::Truncated);
			}
			IcmpBody::TimeExceeded {
				original: Bytes::copy_from_slice(&rest[4..]),
			}
		},
		_ => IcmpBody::Other {
			typ,
			code,
			body: Bytes::copy_from_slice(rest),
		},
	};
	Ok(body)
}

/// Synthesize the Time-Exceeded reply for a packet whose TTL ran out. The
/// payload carries the original datagram so the sender can correlate.
pub fn time_exceeded_reply(reply_src: IpAddr, original_src: IpAddr, original_raw: &[u8]) -> IcmpPacket {
	IcmpPacket {
		header: IpHeader {
			src: reply_src,
			dst: original_src,
			ttl: DEFAULT_TTL,
		},
		body: IcmpBody::TimeExceeded {
			original: Bytes::copy_from_slice(original_raw),
		},
	}
}

/// RFC 1071 internet checksum.
fn internet_checksum(data: &[u8]) -> u16 {
	let mut sum: u32 = 0;
	for chunk in data.chunks(2) {
		let word = if chunk.len() == 2 {
			u16::from_be_bytes([chunk[0], chunk[1]])
		} else {
			u16::from_be_bytes([chunk[0], 0])
		};
		sum += word as u32;
	}
	while sum >> 16 != 0 {
		sum = (sum & 0xffff) + (sum >> 16);
	}
	!(sum as u16)
}
