//! HTTP type aliases and body helpers shared by the ingress plane. Bodies are
//! boxed so synthesized responses, proxied origin responses, and upgrade
//! handshakes flow through one type.

pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};
use http_body_util::BodyExt;

use crate::*;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;
pub type Body = http_body_util::combinators::UnsyncBoxBody<Bytes, BoxError>;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

pub fn empty_body() -> Body {
	http_body_util::Empty::<Bytes>::new()
		.map_err(|never| match never {})
		.boxed_unsync()
}

pub fn full_body(data: impl Into<Bytes>) -> Body {
	http_body_util::Full::new(data.into())
		.map_err(|never| match never {})
		.boxed_unsync()
}

pub fn incoming_body(body: hyper::body::Incoming) -> Body {
	body.map_err(|e| Box::new(e) as BoxError).boxed_unsync()
}

/// Build a plain-text response, used for synthesized statuses and errors.
pub fn plain_response(status: StatusCode, msg: impl Into<Bytes>) -> Response {
	::http::Response::builder()
		.status(status)
		.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(full_body(msg))
		.expect("static response must build")
}

/// True if the request asks for a WebSocket upgrade; those are hijacked into
/// raw byte streams rather than round-tripped.
pub fn is_websocket_upgrade<T>(req: &::http::Request<T>) -> bool {
	let connection_upgrade = req
		.headers()
		.get(header::CONNECTION)
		.and_then(|v| v.to_str().ok())
		.map(|v| {
			v.split(',')
				.any(|t| t.trim().eq_ignore_ascii_case("upgrade"))
		})
		.unwrap_or(false);
	let upgrade_websocket = req
		.headers()
		.get(header::UPGRADE)
		.and_then(|v| v.to_str().ok())
		.map(|v| v.eq_ignore_ascii_case("websocket"))
		.unwrap_or(false);
	connection_upgrade && upgrade_websocket
}

/// The host an eyeball asked for: URI authority first, Host header second.
pub fn request_host<T>(req: &::http::Request<T>) -> Option<&str> {
	if let Some(host) = req.uri().host() {
		return Some(host);
	}
	req
		.headers()
		.get(header::HOST)
		.and_then(|v| v.to_str().ok())
}

/// Outcome of a request middleware: keep routing, or answer immediately.
pub enum MiddlewareResult {
	Continue,
	Respond(Response),
}

#[async_trait::async_trait]
pub trait Middleware: Send + Sync + Debug {
	async fn handle(&self, req: &mut Request) -> anyhow::Result<MiddlewareResult>;
}
