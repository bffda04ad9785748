//! The L7 entry point: the tunnel multiplexer hands requests here; they are
//! matched against the ingress, run through the rule's middlewares, and
//! either round-tripped to an HTTP origin or hijacked into a byte stream.

use hyper_util::rt::TokioIo;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;

use crate::http::{
	empty_body, header, is_websocket_upgrade, plain_response, request_host, MiddlewareResult,
	Request, Response, StatusCode,
};
use crate::ingress::{Ingress, Rule};
use crate::metrics::Metrics;
use crate::origin::{bastion, OriginError, StreamEstablisher};
use crate::*;

#[derive(thiserror::Error, Debug)]
pub enum ProxyError {
	#[error(transparent)]
	Origin(#[from] OriginError),
	#[error(transparent)]
	Bastion(#[from] bastion::BastionError),
	#[error("stream services require a websocket upgrade")]
	UpgradeRequired,
	#[error("middleware failed: {0}")]
	Middleware(anyhow::Error),
}

pub struct RequestHandler {
	ingress: Arc<Ingress>,
	metrics: Arc<Metrics>,
}

impl RequestHandler {
	pub fn new(ingress: Arc<Ingress>, metrics: Arc<Metrics>) -> Self {
		RequestHandler { ingress, metrics }
	}

	/// Serve one request. Origin failures become 502-class responses; they
	/// are never allowed to take the tunnel connection down.
	pub async fn handle(&self, req: Request) -> Response {
		self.metrics.requests.inc();
		match self.route(req).await {
			Ok(resp) => resp,
			Err(e) => {
				self.metrics.request_errors.inc();
				warn!(err=%e, "request failed");
				error_response(&e)
			},
		}
	}

	async fn route(&self, mut req: Request) -> Result<Response, ProxyError> {
		let host = request_host(&req).unwrap_or_default().to_string();
		let path = req.uri().path().to_string();
		let (rule, index) = self.ingress.find_matching_rule(&host, &path);
		debug!(host, path, rule = index, service = %rule.service, "matched ingress rule");

		for middleware in &rule.handlers {
			match middleware
				.handle(&mut req)
				.await
				.map_err(ProxyError::Middleware)?
			{
				MiddlewareResult::Continue => {},
				MiddlewareResult::Respond(resp) => return Ok(resp),
			}
		}

		if let Some(establisher) = rule.origin.stream() {
			return self.hijack(rule, establisher, req).await;
		}
		let round_tripper = rule
			.origin
			.http()
			.expect("every origin is either http or stream");
		Ok(round_tripper.round_trip(req).await?)
	}

	/// Turn a WS-upgrade request into a raw byte stream and relay it against
	/// the origin connection. The 101 goes back immediately; the relay runs
	/// for the lifetime of the upgraded connection.
	async fn hijack(
		&self,
		rule: &Rule,
		establisher: &dyn StreamEstablisher,
		mut req: Request,
	) -> Result<Response, ProxyError> {
		if !is_websocket_upgrade(&req) {
			return Err(ProxyError::UpgradeRequired);
		}
		let dest = if rule.origin.is_bastion() {
			Some(bastion::resolve_dest(req.headers())?)
		} else {
			None
		};
		// Establish before answering 101 so dial failures surface as HTTP
		// errors rather than an immediately-closed stream.
		let conn = establisher.establish(dest.as_deref()).await?;

		let ws_key = req.headers().get(header::SEC_WEBSOCKET_KEY).cloned();
		let on_upgrade = hyper::upgrade::on(&mut req);
		tokio::spawn(async move {
			match on_upgrade.await {
				Ok(upgraded) => {
					let io = TokioIo::new(upgraded);
					if let Err(e) = conn.stream(Box::new(io)).await {
						warn!(err=%e, "stream relay ended with error");
					}
				},
				Err(e) => warn!(err=%e, "connection upgrade failed"),
			}
		});

		let mut builder = ::http::Response::builder()
			.status(StatusCode::SWITCHING_PROTOCOLS)
			.header(header::CONNECTION, "Upgrade")
			.header(header::UPGRADE, "websocket");
		if let Some(key) = ws_key {
			builder = builder.header(
				header::SEC_WEBSOCKET_ACCEPT,
				derive_accept_key(key.as_bytes()),
			);
		}
		Ok(
			builder
				.body(empty_body())
				.expect("static response must build"),
		)
	}
}

fn error_response(err: &ProxyError) -> Response {
	let status = match err {
		ProxyError::UpgradeRequired => StatusCode::BAD_REQUEST,
		ProxyError::Bastion(_) => StatusCode::BAD_REQUEST,
		_ => StatusCode::BAD_GATEWAY,
	};
	plain_response(status, format!("{err}"))
}

#[cfg(test)]
#[path = "proxy_test.rs"]
mod tests;
