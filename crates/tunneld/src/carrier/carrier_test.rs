use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::Message;

use super::*;
use crate::http::StatusCode;

fn response(status: StatusCode, location: Option<&str>) -> ::http::Response<()> {
	let mut builder = ::http::Response::builder().status(status);
	if let Some(loc) = location {
		builder = builder.header(header::LOCATION, loc);
	}
	builder.body(()).unwrap()
}

#[test]
fn access_response_detection() {
	struct TestCase {
		status: StatusCode,
		location: Option<&'static str>,
		want: bool,
	}
	let cases = [
		TestCase {
			status: StatusCode::FOUND,
			location: Some("https://acme.example/cdn-cgi/access/login?redirect=x"),
			want: true,
		},
		TestCase {
			status: StatusCode::MOVED_PERMANENTLY,
			location: Some("/cdn-cgi/access/login"),
			want: true,
		},
		TestCase {
			status: StatusCode::OK,
			location: Some("/cdn-cgi/access/login"),
			want: false,
		},
		TestCase {
			status: StatusCode::FOUND,
			location: Some("https://acme.example/other"),
			want: false,
		},
		TestCase {
			status: StatusCode::FOUND,
			location: None,
			want: false,
		},
		TestCase {
			status: StatusCode::BAD_GATEWAY,
			location: Some("/cdn-cgi/access/login"),
			want: false,
		},
	];
	for tc in cases {
		let resp = response(tc.status, tc.location);
		assert_eq!(
			is_access_response(&resp),
			tc.want,
			"status={} location={:?}",
			tc.status,
			tc.location
		);
	}
}

/// A WS echo server that reflects binary frames.
async fn spawn_ws_echo() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		while let Ok((stream, _)) = listener.accept().await {
			tokio::spawn(async move {
				let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
				while let Some(Ok(msg)) = ws.next().await {
					match msg {
						Message::Binary(_) | Message::Text(_) => {
							if ws.send(Message::Binary(msg.into_data())).await.is_err() {
								return;
							}
						},
						Message::Close(_) => return,
						_ => {},
					}
				}
			});
		}
	});
	addr
}

#[tokio::test]
async fn carrier_relays_tcp_through_websocket() {
	let ws_addr = spawn_ws_echo().await;
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let local_addr = listener.local_addr().unwrap();

	let opts = CarrierOptions {
		ws_url: strng::format!("ws://{ws_addr}"),
		headers: HeaderMap::new(),
		app_url: "https://app.example".into(),
		token_store: None,
	};
	let ctx = CancellationToken::new();
	let server = tokio::spawn(serve(listener, opts, ctx.clone()));

	let mut client = TcpStream::connect(local_addr).await.unwrap();
	client.write_all(b"ping over the carrier").await.unwrap();
	let mut buf = vec![0u8; b"ping over the carrier".len()];
	client.read_exact(&mut buf).await.unwrap();
	assert_eq!(&buf, b"ping over the carrier");

	drop(client);
	ctx.cancel();
	server.await.unwrap().unwrap();
}

/// A fake edge that answers every upgrade with an Access login redirect.
async fn spawn_access_redirecting_edge() -> SocketAddr {
	let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
	let addr = listener.local_addr().unwrap();
	tokio::spawn(async move {
		while let Ok((mut stream, _)) = listener.accept().await {
			tokio::spawn(async move {
				// Read the upgrade request, then refuse it with a redirect.
				let mut buf = vec![0u8; 4096];
				let mut read = 0;
				loop {
					let n = stream.read(&mut buf[read..]).await.unwrap_or(0);
					if n == 0 {
						break;
					}
					read += n;
					if buf[..read].windows(4).any(|w| w == b"\r\n\r\n") {
						break;
					}
				}
				let _ = stream
					.write_all(
						b"HTTP/1.1 302 Found\r\n\
						Location: https://acme.example/cdn-cgi/access/login?redirect=a\r\n\
						Content-Length: 0\r\n\r\n",
					)
					.await;
			});
		}
	});
	addr
}

#[tokio::test]
async fn access_redirect_without_cached_token_errors() {
	let edge = spawn_access_redirecting_edge().await;
	let opts = CarrierOptions {
		ws_url: strng::format!("ws://{edge}"),
		headers: HeaderMap::new(),
		app_url: "https://app.example".into(),
		token_store: Some(Arc::new(crate::token::TokenStore::with_dir(
			tempfile::tempdir().unwrap().keep(),
		))),
	};
	let err = connect(&opts).await.unwrap_err();
	assert!(matches!(err, CarrierError::MissingToken(_)), "{err}");
}

#[tokio::test]
async fn rejected_token_is_deleted() {
	let edge = spawn_access_redirecting_edge().await;
	let dir = tempfile::tempdir().unwrap();
	let store = Arc::new(crate::token::TokenStore::with_dir(dir.path().to_path_buf()));
	let app = "https://app.example";
	store.save(app, "stale-token").unwrap();

	let opts = CarrierOptions {
		ws_url: strng::format!("ws://{edge}"),
		headers: HeaderMap::new(),
		app_url: app.into(),
		token_store: Some(store.clone()),
	};
	let err = connect(&opts).await.unwrap_err();
	assert!(matches!(err, CarrierError::TokenRejected(_)), "{err}");
	// The bad token is gone so the operator gets a fresh login next run.
	assert_eq!(store.load(app).unwrap(), None);
}
