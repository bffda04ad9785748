use http_body_util::Full;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use once_cell::sync::OnceCell;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::http::{header, request_host, HeaderValue, Request, Response, StatusCode};
use crate::ingress::origin_request::OriginRequestConfig;
use crate::origin::http_origin::{origin_form, single_roundtrip};
use crate::origin::{HttpRoundTripper, OriginError};
use crate::*;

const GREETING_PAGE: &str = r#"<!DOCTYPE html>
<html lang="en">
<head><meta charset="utf-8"><title>Tunnel is up</title></head>
<body>
<h1>Congrats! Your tunnel is up and running.</h1>
<p>Point a real origin service at this rule to serve your own traffic.</p>
</body>
</html>
"#;

/// A built-in demo origin: binds an ephemeral local listener at start and
/// answers every request with a greeting page.
pub struct HelloWorldOrigin {
	connect_timeout: Duration,
	addr: OnceCell<SocketAddr>,
}

impl HelloWorldOrigin {
	pub fn new(cfg: &OriginRequestConfig) -> Self {
		HelloWorldOrigin {
			connect_timeout: cfg.connect_timeout,
			addr: OnceCell::new(),
		}
	}

	pub async fn start(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
		if self.addr.get().is_some() {
			return Ok(());
		}
		let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).await?;
		let addr = listener.local_addr()?;
		let _ = self.addr.set(addr);
		info!(%addr, "hello-world origin listening");
		tokio::spawn(async move {
			loop {
				tokio::select! {
					_ = shutdown.cancelled() => {
						debug!("hello-world origin shutting down");
						return;
					}
					accepted = listener.accept() => {
						let Ok((stream, _)) = accepted else { continue };
						tokio::spawn(async move {
							let served = hyper::server::conn::http1::Builder::new()
								.serve_connection(TokioIo::new(stream), service_fn(greet))
								.await;
							if let Err(e) = served {
								debug!(err=%e, "hello-world connection error");
							}
						});
					}
				}
			}
		});
		Ok(())
	}

	pub fn local_addr(&self) -> Option<SocketAddr> {
		self.addr.get().copied()
	}
}

async fn greet(
	_req: hyper::Request<hyper::body::Incoming>,
) -> Result<hyper::Response<Full<Bytes>>, std::convert::Infallible> {
	Ok(
		hyper::Response::builder()
			.status(StatusCode::OK)
			.header(header::CONTENT_TYPE, "text/html; charset=utf-8")
			.body(Full::new(Bytes::from_static(GREETING_PAGE.as_bytes())))
			.expect("static response must build"),
	)
}

#[async_trait::async_trait]
impl HttpRoundTripper for HelloWorldOrigin {
	async fn round_trip(&self, mut req: Request) -> Result<Response, OriginError> {
		let addr = self.addr.get().copied().ok_or(OriginError::NotStarted)?;
		let original_host = request_host(&req).map(|h| h.to_string());
		*req.uri_mut() = origin_form(req.uri());
		if let Some(host) = original_host {
			if let Ok(v) = HeaderValue::from_str(&host) {
				req.headers_mut().insert("x-forwarded-host", v);
			}
		}
		req.headers_mut().insert(
			header::HOST,
			HeaderValue::from_str(&addr.to_string())
				.map_err(|e| OriginError::InvalidRequest(e.to_string()))?,
		);
		let name: Strng = strng::format!("{addr}");
		let stream = tokio::time::timeout(self.connect_timeout, tokio::net::TcpStream::connect(addr))
			.await
			.map_err(|_| OriginError::ConnectTimeout(name.clone()))?
			.map_err(|e| OriginError::Connect(name, e))?;
		single_roundtrip(stream, req, false).await
	}
}

#[cfg(test)]
mod tests {
	use http_body_util::BodyExt;

	use super::*;
	use crate::http::empty_body;

	#[tokio::test]
	async fn serves_the_greeting_page() {
		let origin = HelloWorldOrigin::new(&OriginRequestConfig::default());
		let shutdown = CancellationToken::new();
		origin.start(shutdown.clone()).await.unwrap();

		let req = ::http::Request::builder()
			.uri("https://any.example/")
			.body(empty_body())
			.unwrap();
		let resp = origin.round_trip(req).await.unwrap();
		assert_eq!(resp.status(), StatusCode::OK);
		let body = resp.into_body().collect().await.unwrap().to_bytes();
		assert!(std::str::from_utf8(&body).unwrap().contains("Congrats"));

		shutdown.cancel();
	}

	#[tokio::test]
	async fn round_trip_before_start_fails() {
		let origin = HelloWorldOrigin::new(&OriginRequestConfig::default());
		let req = ::http::Request::builder()
			.uri("https://any.example/")
			.body(empty_body())
			.unwrap();
		assert!(matches!(
			origin.round_trip(req).await,
			Err(OriginError::NotStarted)
		));
	}
}
