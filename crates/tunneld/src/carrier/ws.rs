//! Byte-stream adapter over WebSocket framing. Writes become binary frames;
//! reads drain frames into the caller's buffer, stashing any remainder when
//! the buffer is smaller than the frame. A keepalive ping rides on the read
//! task's waker; dropping the wrapper stops it.

use std::io;

use bytes::{Buf, BytesMut};
use futures_util::{Sink, Stream};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::protocol::{Message, Role};
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::*;

const PING_PERIOD: Duration = Duration::from_secs(15);

pub struct WsStream<S> {
	inner: WebSocketStream<S>,
	/// Unconsumed tail of the last data frame.
	stash: BytesMut,
	ping: tokio::time::Interval,
	ping_pending: bool,
	read_closed: bool,
}

impl<S> std::fmt::Debug for WsStream<S> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("WsStream")
			.field("stash", &self.stash)
			.field("ping_pending", &self.ping_pending)
			.field("read_closed", &self.read_closed)
			.finish()
	}
}

impl<S> WsStream<S>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	pub fn new(inner: WebSocketStream<S>) -> Self {
		let mut ping = tokio::time::interval(PING_PERIOD);
		ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
		WsStream {
			inner,
			stash: BytesMut::new(),
			ping,
			ping_pending: false,
			read_closed: false,
		}
	}

	/// Wrap an already-established byte stream in server-side WS framing, with
	/// no HTTP handshake. The tunnel edge has already negotiated the upgrade.
	pub async fn accept(stream: S) -> Self {
		let ws = WebSocketStream::from_raw_socket(stream, Role::Server, None).await;
		Self::new(ws)
	}

	/// Client-side framing over an established stream.
	pub async fn wrap_client(stream: S) -> Self {
		let ws = WebSocketStream::from_raw_socket(stream, Role::Client, None).await;
		Self::new(ws)
	}

	/// Try to keep the connection alive. Ping failures are ignored; a dead
	/// connection surfaces through the read path.
	fn poll_keepalive(&mut self, cx: &mut Context<'_>) {
		if !self.ping_pending && self.ping.poll_tick(cx).is_pending() {
			return;
		}
		self.ping_pending = true;
		match Pin::new(&mut self.inner).poll_ready(cx) {
			Poll::Ready(Ok(())) => {
				if Pin::new(&mut self.inner)
					.start_send(Message::Ping(Bytes::new()))
					.is_ok()
				{
					let _ = Pin::new(&mut self.inner).poll_flush(cx);
				}
				self.ping_pending = false;
			},
			Poll::Ready(Err(_)) => {
				self.ping_pending = false;
			},
			Poll::Pending => {},
		}
	}
}

fn ws_err(e: WsError) -> io::Error {
	match e {
		WsError::Io(io) => io,
		WsError::ConnectionClosed | WsError::AlreadyClosed => {
			io::Error::new(io::ErrorKind::NotConnected, e)
		},
		other => io::Error::other(other),
	}
}

impl<S> AsyncRead for WsStream<S>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	fn poll_read(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &mut ReadBuf<'_>,
	) -> Poll<io::Result<()>> {
		let me = &mut *self;
		me.poll_keepalive(cx);
		loop {
			if !me.stash.is_empty() {
				let n = usize::min(me.stash.len(), buf.remaining());
				buf.put_slice(&me.stash[..n]);
				me.stash.advance(n);
				return Poll::Ready(Ok(()));
			}
			if me.read_closed {
				return Poll::Ready(Ok(()));
			}
			match ready!(Pin::new(&mut me.inner).poll_next(cx)) {
				Some(Ok(msg)) => match msg {
					Message::Binary(_) | Message::Text(_) => {
						me.stash.extend_from_slice(&msg.into_data());
					},
					// Control frames are handled by the protocol layer.
					Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {},
					Message::Close(_) => {
						me.read_closed = true;
						return Poll::Ready(Ok(()));
					},
				},
				Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) | None => {
					me.read_closed = true;
					return Poll::Ready(Ok(()));
				},
				Some(Err(e)) => return Poll::Ready(Err(ws_err(e))),
			}
		}
	}
}

impl<S> AsyncWrite for WsStream<S>
where
	S: AsyncRead + AsyncWrite + Unpin,
{
	fn poll_write(
		mut self: Pin<&mut Self>,
		cx: &mut Context<'_>,
		buf: &[u8],
	) -> Poll<Result<usize, io::Error>> {
		ready!(Pin::new(&mut self.inner).poll_ready(cx)).map_err(ws_err)?;
		Pin::new(&mut self.inner)
			.start_send(Message::Binary(Bytes::copy_from_slice(buf)))
			.map_err(ws_err)?;
		Poll::Ready(Ok(buf.len()))
	}

	fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
		Pin::new(&mut self.inner).poll_flush(cx).map_err(ws_err)
	}

	fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), io::Error>> {
		match Pin::new(&mut self.inner).poll_close(cx) {
			Poll::Ready(Ok(())) => Poll::Ready(Ok(())),
			// The peer may already be gone; shutdown is best effort.
			Poll::Ready(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
				Poll::Ready(Ok(()))
			},
			Poll::Ready(Err(e)) => Poll::Ready(Err(ws_err(e))),
			Poll::Pending => Poll::Pending,
		}
	}
}

#[cfg(test)]
mod tests {
	use tokio::io::{AsyncReadExt, AsyncWriteExt};

	use super::*;

	async fn pair() -> (WsStream<tokio::io::DuplexStream>, WsStream<tokio::io::DuplexStream>) {
		let (a, b) = tokio::io::duplex(16 * 1024);
		let client = WsStream::wrap_client(a);
		let server = WsStream::accept(b);
		tokio::join!(client, server)
	}

	#[tokio::test]
	async fn bytes_round_trip_across_frames() {
		let (mut client, mut server) = pair().await;
		client.write_all(b"hello over websocket").await.unwrap();
		client.flush().await.unwrap();

		let mut buf = vec![0u8; 64];
		let n = server.read(&mut buf).await.unwrap();
		assert_eq!(&buf[..n], b"hello over websocket");
	}

	#[tokio::test]
	async fn partial_reads_stash_the_remainder() {
		let (mut client, mut server) = pair().await;
		let payload: Vec<u8> = (0u8..=255).collect();
		client.write_all(&payload).await.unwrap();
		client.flush().await.unwrap();

		// Read back through a tiny buffer; bytes must arrive in order with
		// nothing lost at frame boundaries.
		let mut got = Vec::new();
		let mut tiny = [0u8; 7];
		while got.len() < payload.len() {
			let n = server.read(&mut tiny).await.unwrap();
			assert!(n > 0);
			got.extend_from_slice(&tiny[..n]);
		}
		assert_eq!(got, payload);
	}

	#[tokio::test]
	async fn multiple_writes_preserve_order() {
		let (mut client, mut server) = pair().await;
		for chunk in [b"one".as_slice(), b"two", b"three"] {
			client.write_all(chunk).await.unwrap();
		}
		client.flush().await.unwrap();
		client.shutdown().await.unwrap();

		let mut got = Vec::new();
		server.read_to_end(&mut got).await.unwrap();
		assert_eq!(got, b"onetwothree");
	}

	#[tokio::test]
	async fn close_yields_eof() {
		let (mut client, mut server) = pair().await;
		client.write_all(b"bye").await.unwrap();
		client.flush().await.unwrap();
		client.shutdown().await.unwrap();

		let mut got = Vec::new();
		server.read_to_end(&mut got).await.unwrap();
		assert_eq!(got, b"bye");
	}
}
