//! Full-duplex relay between an eyeball-facing stream and an origin-facing
//! stream. Each direction copies independently; `stream` resolves as soon as
//! either direction finishes, at which point the caller is expected to close
//! both endpoints. A finished direction half-closes its destination first so
//! the peer observes EOF after the last byte.

use std::io;

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

// Connections start with a small buffer and grow it as traffic proves the
// connection is worth the memory. TLS records top out at 16k; keep headroom
// for the record framing.
const INITIAL_BUFFER_SIZE: usize = 1024;
const LARGE_BUFFER_SIZE: usize = 16_384 - 64;
const JUMBO_BUFFER_SIZE: usize = (16 * 16_384) - 64;
// Thresholds (total bytes relayed in one direction) that trigger a resize.
const RESIZE_THRESHOLD_LARGE: u64 = 128 * 1024;
const RESIZE_THRESHOLD_JUMBO: u64 = 10 * 1024 * 1024;

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
	#[error("io error: {0}")]
	Io(#[from] io::Error),

	#[error("origin disconnected before all data was written")]
	OriginDisconnected,

	#[error("eyeball disconnected before all data was written")]
	EyeballDisconnected,

	#[error("while closing connection: {0}")]
	Shutdown(Box<RelayError>),
}

/// Which direction of the relay completed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
	/// Eyeball → origin: the tunnel side stopped sending.
	ToOrigin,
	/// Origin → eyeball: the origin stopped sending.
	ToEyeball,
}

#[derive(Debug, Clone, Copy)]
pub struct StreamDone {
	pub direction: Direction,
	pub bytes: u64,
}

/// Relay bytes between `eyeball` and `origin` until either direction
/// completes (EOF or error). The other direction is abandoned mid-copy; both
/// endpoints must be closed by the caller afterwards.
pub async fn stream<A, B>(eyeball: A, origin: B) -> Result<StreamDone, RelayError>
where
	A: AsyncRead + AsyncWrite + Unpin,
	B: AsyncRead + AsyncWrite + Unpin,
{
	let (mut eyeball_rd, mut eyeball_wr) = tokio::io::split(eyeball);
	let (mut origin_rd, mut origin_wr) = tokio::io::split(origin);

	let to_origin = async {
		let translate = |e: io::Error| match e.kind() {
			io::ErrorKind::NotConnected | io::ErrorKind::WriteZero => RelayError::OriginDisconnected,
			io::ErrorKind::UnexpectedEof => RelayError::EyeballDisconnected,
			_ => e.into(),
		};
		let bytes = ignore_io_errors(copy_direction(&mut eyeball_rd, &mut origin_wr).await)
			.map_err(translate)?;
		trace!(bytes, "to origin done");
		ignore_shutdown_errors(origin_wr.shutdown().await)
			.map_err(translate)
			.map_err(|e| RelayError::Shutdown(Box::new(e)))?;
		Ok::<u64, RelayError>(bytes)
	};

	let to_eyeball = async {
		let translate = |e: io::Error| match e.kind() {
			io::ErrorKind::NotConnected | io::ErrorKind::WriteZero => RelayError::EyeballDisconnected,
			_ => e.into(),
		};
		let bytes = ignore_io_errors(copy_direction(&mut origin_rd, &mut eyeball_wr).await)
			.map_err(translate)?;
		trace!(bytes, "to eyeball done");
		ignore_shutdown_errors(eyeball_wr.shutdown().await)
			.map_err(translate)
			.map_err(|e| RelayError::Shutdown(Box::new(e)))?;
		Ok::<u64, RelayError>(bytes)
	};

	// Either direction finishing ends the stream; the caller tears down both
	// endpoints, which unblocks whatever the other direction was doing.
	tokio::select! {
		res = to_origin => {
			res.map(|bytes| StreamDone { direction: Direction::ToOrigin, bytes })
		},
		res = to_eyeball => {
			res.map(|bytes| StreamDone { direction: Direction::ToEyeball, bytes })
		},
	}
}

/// Copy `reader` to `writer` until EOF, growing the read buffer as cumulative
/// traffic crosses the resize thresholds. Returns bytes copied.
async fn copy_direction<R, W>(reader: &mut R, writer: &mut W) -> io::Result<u64>
where
	R: AsyncRead + Unpin + ?Sized,
	W: AsyncWrite + Unpin + ?Sized,
{
	let mut buffer_size = INITIAL_BUFFER_SIZE;
	let mut buf = BytesMut::with_capacity(buffer_size);
	let mut amt: u64 = 0;
	loop {
		buf.reserve(buffer_size);
		let n = reader.read_buf(&mut buf).await?;
		if n == 0 {
			writer.flush().await?;
			return Ok(amt);
		}
		let chunk = buf.split().freeze();
		writer.write_all(&chunk).await?;
		// Flush per batch: some endpoints (WS framing) buffer until flushed,
		// and interactive protocols stall on unflushed bytes.
		writer.flush().await?;

		let old = amt;
		amt += n as u64;
		if old < RESIZE_THRESHOLD_LARGE && RESIZE_THRESHOLD_LARGE <= amt {
			buffer_size = LARGE_BUFFER_SIZE;
		}
		if old < RESIZE_THRESHOLD_JUMBO && RESIZE_THRESHOLD_JUMBO <= amt {
			buffer_size = JUMBO_BUFFER_SIZE;
		}
	}
}

// A peer may slam the connection shut (RST) rather than close it cleanly.
// That is a normal end of stream from the relay's perspective, not an error
// worth surfacing to the operator.
fn ignore_io_errors(res: io::Result<u64>) -> io::Result<u64> {
	use io::ErrorKind::*;
	match &res {
		Err(e) => match e.kind() {
			NotConnected | UnexpectedEof | ConnectionReset | BrokenPipe => {
				trace!(err=%e, "io terminated ungracefully");
				Ok(0)
			},
			_ => res,
		},
		_ => res,
	}
}

// The peer may have already shut down by the time we propagate our half-close.
fn ignore_shutdown_errors(res: io::Result<()>) -> io::Result<()> {
	match &res {
		Err(e)
			if e.kind() == io::ErrorKind::NotConnected || e.kind() == io::ErrorKind::UnexpectedEof =>
		{
			trace!(err=%e, "peer already shut down");
			Ok(())
		},
		_ => res,
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	use super::*;

	#[tokio::test]
	async fn relays_bytes_then_eof() {
		let (eyeball, mut eyeball_peer) = tokio::io::duplex(64);
		let (origin, mut origin_peer) = tokio::io::duplex(64);

		let relay = tokio::spawn(async move { stream(eyeball, origin).await });

		eyeball_peer.write_all(b"hello origin").await.unwrap();
		// Half-close the eyeball side; the relay should forward EOF.
		eyeball_peer.shutdown().await.unwrap();

		let mut got = Vec::new();
		origin_peer.read_to_end(&mut got).await.unwrap();
		assert_eq!(got, b"hello origin");

		let done = relay.await.unwrap().unwrap();
		assert_eq!(done.direction, Direction::ToOrigin);
		assert_eq!(done.bytes, b"hello origin".len() as u64);
	}

	#[tokio::test]
	async fn origin_close_finishes_stream() {
		let (eyeball, mut eyeball_peer) = tokio::io::duplex(64);
		let (origin, mut origin_peer) = tokio::io::duplex(64);

		let relay = tokio::spawn(async move { stream(eyeball, origin).await });

		origin_peer.write_all(b"response").await.unwrap();
		origin_peer.shutdown().await.unwrap();

		let mut buf = Vec::new();
		eyeball_peer.read_to_end(&mut buf).await.unwrap();
		assert_eq!(buf, b"response");

		let done = relay.await.unwrap().unwrap();
		assert_eq!(done.direction, Direction::ToEyeball);
		assert_eq!(done.bytes, b"response".len() as u64);
	}

	#[tokio::test]
	async fn large_transfer_crosses_resize_thresholds() {
		let payload = vec![0xabu8; 300 * 1024];
		let (eyeball, mut eyeball_peer) = tokio::io::duplex(8 * 1024);
		let (origin, mut origin_peer) = tokio::io::duplex(8 * 1024);

		let relay = tokio::spawn(async move { stream(eyeball, origin).await });

		let send = payload.clone();
		let writer = tokio::spawn(async move {
			eyeball_peer.write_all(&send).await.unwrap();
			eyeball_peer.shutdown().await.unwrap();
		});

		let mut got = Vec::new();
		origin_peer.read_to_end(&mut got).await.unwrap();
		assert_eq!(got.len(), payload.len());
		assert_eq!(got, payload);

		writer.await.unwrap();
		let done = relay.await.unwrap().unwrap();
		assert_eq!(done.bytes, payload.len() as u64);
	}
}
