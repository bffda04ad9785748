//! Carrier mode: encapsulate arbitrary byte streams in WebSocket frames over
//! the tunnel. The client side connects to an edge WS endpoint (running the
//! Access token flow when the edge demands a login); the server side accepts
//! local TCP connections and relays each over its own WS upstream.

pub mod ws;

use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Error as TungsteniteError;
use tokio_tungstenite::{connect_async, MaybeTlsStream};
use tokio_util::sync::CancellationToken;
use tunnel_core::copy;

use crate::http::{header, HeaderMap, HeaderValue};
use crate::token::TokenStore;
use crate::*;
pub use ws::WsStream;

/// Header used to present a cached Access token to the edge.
pub const ACCESS_TOKEN_HEADER: &str = "cf-access-token";

#[derive(thiserror::Error, Debug)]
pub enum CarrierError {
	#[error("invalid websocket url: {0}")]
	InvalidUrl(String),
	#[error("websocket connect failed: {0}")]
	Connect(String),
	#[error("{0} requires a login and no access token is cached")]
	MissingToken(String),
	#[error("the cached access token for {0} was rejected; it has been removed")]
	TokenRejected(String),
	#[error("token store failure: {0}")]
	TokenStore(#[from] crate::token::TokenError),
	#[error("io error: {0}")]
	Io(#[from] std::io::Error),
}

pub type EdgeStream = WsStream<MaybeTlsStream<TcpStream>>;

#[derive(Clone)]
pub struct CarrierOptions {
	/// The edge WS endpoint, ws:// or wss://.
	pub ws_url: Strng,
	/// Extra headers for the upgrade request (tunnel identity et al).
	pub headers: HeaderMap,
	/// App URL keying the cached Access token.
	pub app_url: Strng,
	pub token_store: Option<Arc<TokenStore>>,
}

/// True iff the response is an Access login redirect: a 3xx whose Location
/// points at the CDN-CGI access login path.
pub fn is_access_response<T>(resp: &::http::Response<T>) -> bool {
	if !resp.status().is_redirection() {
		return false;
	}
	resp
		.headers()
		.get(header::LOCATION)
		.and_then(|v| v.to_str().ok())
		.map(|loc| loc.contains("cdn-cgi/access/login"))
		.unwrap_or(false)
}

enum ConnectFailure {
	/// The edge answered with an Access login redirect.
	AccessLogin,
	Other(CarrierError),
}

async fn try_connect(
	opts: &CarrierOptions,
	token: Option<&str>,
) -> Result<EdgeStream, ConnectFailure> {
	let mut req = opts
		.ws_url
		.as_str()
		.into_client_request()
		.map_err(|e| ConnectFailure::Other(CarrierError::InvalidUrl(e.to_string())))?;
	for (name, value) in opts.headers.iter() {
		req.headers_mut().insert(name.clone(), value.clone());
	}
	if let Some(token) = token {
		match HeaderValue::from_str(token) {
			Ok(v) => {
				req.headers_mut().insert(ACCESS_TOKEN_HEADER, v);
			},
			Err(_) => {
				return Err(ConnectFailure::Other(CarrierError::Connect(
					"cached token is not a valid header value".to_string(),
				)));
			},
		}
	}
	match connect_async(req).await {
		Ok((stream, _resp)) => Ok(WsStream::new(stream)),
		Err(TungsteniteError::Http(resp)) if is_access_response(&resp) => {
			Err(ConnectFailure::AccessLogin)
		},
		Err(e) => Err(ConnectFailure::Other(CarrierError::Connect(e.to_string()))),
	}
}

/// Open a WS connection to the edge. If the edge demands an Access login, the
/// cached token is presented once; a second rejection deletes the token and
/// surfaces the error so the operator re-runs the login flow.
pub async fn connect(opts: &CarrierOptions) -> Result<EdgeStream, CarrierError> {
	match try_connect(opts, None).await {
		Ok(stream) => Ok(stream),
		Err(ConnectFailure::Other(e)) => Err(e),
		Err(ConnectFailure::AccessLogin) => {
			let store = opts
				.token_store
				.as_ref()
				.ok_or_else(|| CarrierError::MissingToken(opts.app_url.to_string()))?;
			let token = store
				.load(&opts.app_url)?
				.ok_or_else(|| CarrierError::MissingToken(opts.app_url.to_string()))?;
			debug!(app = %opts.app_url, "edge requires access login; retrying with cached token");
			match try_connect(opts, Some(&token)).await {
				Ok(stream) => Ok(stream),
				Err(_) => {
					store.delete(&opts.app_url)?;
					Err(CarrierError::TokenRejected(opts.app_url.to_string()))
				},
			}
		},
	}
}

/// Accept local TCP connections and relay each over its own WS upstream until
/// cancelled. The listener closes when this returns.
pub async fn serve(
	listener: TcpListener,
	opts: CarrierOptions,
	ctx: CancellationToken,
) -> anyhow::Result<()> {
	info!(addr = ?listener.local_addr().ok(), url = %opts.ws_url, "carrier listening");
	loop {
		tokio::select! {
			_ = ctx.cancelled() => {
				debug!("carrier shutting down");
				return Ok(());
			}
			accepted = listener.accept() => {
				let (stream, peer) = accepted?;
				let opts = opts.clone();
				tokio::spawn(async move {
					if let Err(e) = relay_connection(stream, &opts).await {
						warn!(%peer, err = %e, "carrier connection failed");
					}
				});
			}
		}
	}
}

async fn relay_connection(local: TcpStream, opts: &CarrierOptions) -> Result<(), CarrierError> {
	let _ = local.set_nodelay(true);
	let edge = connect(opts).await?;
	let done = copy::stream(local, edge)
		.await
		.map_err(|e| CarrierError::Connect(e.to_string()))?;
	trace!(?done, "carrier relay complete");
	Ok(())
}

#[cfg(test)]
#[path = "carrier_test.rs"]
mod tests;
