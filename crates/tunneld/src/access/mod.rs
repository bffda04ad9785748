//! Verification of Access-issued JWTs against the team's remote key set.
//! Requests missing or failing the check are answered with 403 before any
//! origin is contacted.

use std::collections::HashMap;

use jsonwebtoken::jwk::{AlgorithmParameters, JwkSet, KeyAlgorithm};
use jsonwebtoken::{decode, decode_header, Algorithm, DecodingKey, Validation};
use secrecy::SecretString;
use serde_json::{Map, Value};

use crate::http::{plain_response, Middleware, MiddlewareResult, Request, StatusCode};
use crate::*;

/// Header carrying the Access JWT on proxied requests.
pub const JWT_ASSERTION_HEADER: &str = "Cf-Access-Jwt-Assertion";

#[derive(thiserror::Error, Debug)]
pub enum AccessError {
	#[error("failed to fetch access key set: {0}")]
	KeySetFetch(String),
	#[error("failed to parse access key set: {0}")]
	KeySetParse(String),
	#[error("the token header is malformed: {0}")]
	InvalidHeader(jsonwebtoken::errors::Error),
	#[error("the token is invalid: {0}")]
	Invalid(jsonwebtoken::errors::Error),
	#[error("the token header does not specify a `kid`")]
	MissingKeyId,
	#[error("token uses the unknown key {0:?}")]
	UnknownKeyId(String),
}

/// Which Access endpoint family the team lives on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AccessEnvironment {
	#[default]
	Production,
	/// FedRAMP-isolated deployments use a dedicated domain.
	Fed,
}

impl AccessEnvironment {
	fn certs_url(&self, team: &str) -> String {
		match self {
			AccessEnvironment::Production => {
				format!("https://{team}.cloudflareaccess.com/cdn-cgi/access/certs")
			},
			AccessEnvironment::Fed => {
				format!("https://{team}.fed.cloudflareaccess.com/cdn-cgi/access/certs")
			},
		}
	}
}

#[derive(Clone)]
struct Jwk {
	decoding: DecodingKey,
	algorithm: Algorithm,
}

impl std::fmt::Debug for Jwk {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Jwk").field("algorithm", &self.algorithm).finish()
	}
}

#[derive(Clone, Debug, Default)]
pub struct Claims {
	pub inner: Map<String, Value>,
	pub jwt: SecretString,
}

pub struct JwtValidator {
	team_name: Strng,
	aud_tags: Vec<Strng>,
	certs_url: String,
	client: reqwest::Client,
	keys: tokio::sync::RwLock<HashMap<String, Jwk>>,
}

impl Debug for JwtValidator {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("JwtValidator")
			.field("team_name", &self.team_name)
			.field("aud_tags", &self.aud_tags)
			.finish()
	}
}

impl JwtValidator {
	pub fn new(team_name: Strng, aud_tags: Vec<Strng>) -> Self {
		Self::with_environment(team_name, aud_tags, AccessEnvironment::default())
	}

	pub fn with_environment(
		team_name: Strng,
		aud_tags: Vec<Strng>,
		env: AccessEnvironment,
	) -> Self {
		let certs_url = env.certs_url(&team_name);
		JwtValidator {
			team_name,
			aud_tags,
			certs_url,
			client: reqwest::Client::new(),
			keys: tokio::sync::RwLock::new(HashMap::new()),
		}
	}

	#[cfg(test)]
	fn with_certs_url(team_name: Strng, aud_tags: Vec<Strng>, certs_url: String) -> Self {
		JwtValidator {
			team_name,
			aud_tags,
			certs_url,
			client: reqwest::Client::new(),
			keys: tokio::sync::RwLock::new(HashMap::new()),
		}
	}

	async fn refresh_keys(&self) -> Result<(), AccessError> {
		let body = self
			.client
			.get(&self.certs_url)
			.send()
			.await
			.and_then(|r| r.error_for_status())
			.map_err(|e| AccessError::KeySetFetch(e.to_string()))?
			.text()
			.await
			.map_err(|e| AccessError::KeySetFetch(e.to_string()))?;
		let parsed = parse_key_set(&body)?;
		*self.keys.write().await = parsed;
		Ok(())
	}

	async fn key_for(&self, kid: &str) -> Result<Jwk, AccessError> {
		if let Some(key) = self.keys.read().await.get(kid) {
			return Ok(key.clone());
		}
		// Unknown kid: the key set may have rotated since we last looked.
		self.refresh_keys().await?;
		self
			.keys
			.read()
			.await
			.get(kid)
			.cloned()
			.ok_or_else(|| AccessError::UnknownKeyId(kid.to_string()))
	}

	/// Verify signature and standard time claims. The audience is checked
	/// separately against the configured tags; client-id style checks are
	/// deliberately skipped.
	pub async fn validate(&self, token: &str) -> Result<Claims, AccessError> {
		let header = decode_header(token).map_err(AccessError::InvalidHeader)?;
		let kid = header.kid.as_deref().ok_or(AccessError::MissingKeyId)?;
		let key = self.key_for(kid).await?;
		let mut validation = Validation::new(key.algorithm);
		validation.validate_aud = false;
		let decoded = decode::<Map<String, Value>>(token, &key.decoding, &validation)
			.map_err(AccessError::Invalid)?;
		Ok(Claims {
			inner: decoded.claims,
			jwt: SecretString::new(token.into()),
		})
	}
}

fn parse_key_set(body: &str) -> Result<HashMap<String, Jwk>, AccessError> {
	let jwks: JwkSet =
		serde_json::from_str(body).map_err(|e| AccessError::KeySetParse(e.to_string()))?;
	let mut keys = HashMap::new();
	for jwk in jwks.keys {
		let Some(algorithm) = jwk
			.common
			.key_algorithm
			.and_then(to_supported_algorithm)
		else {
			warn!(
				alg = ?jwk.common.key_algorithm,
				"unsupported jwk algorithm; tokens signed by this key will be rejected"
			);
			continue;
		};
		let Some(kid) = jwk.common.key_id else {
			continue;
		};
		let decoding = match &jwk.algorithm {
			AlgorithmParameters::RSA(rsa) => DecodingKey::from_rsa_components(&rsa.n, &rsa.e)
				.map_err(|e| AccessError::KeySetParse(format!("key {kid}: {e}")))?,
			AlgorithmParameters::EllipticCurve(ec) => DecodingKey::from_ec_components(&ec.x, &ec.y)
				.map_err(|e| AccessError::KeySetParse(format!("key {kid}: {e}")))?,
			other => {
				warn!(kid, ?other, "skipping non-RSA/EC key in access key set");
				continue;
			},
		};
		keys.insert(kid, Jwk { decoding, algorithm });
	}
	Ok(keys)
}

fn to_supported_algorithm(alg: KeyAlgorithm) -> Option<Algorithm> {
	use std::str::FromStr;
	Algorithm::from_str(alg.to_string().as_str()).ok()
}

/// Audiences a token claims, whether `aud` is a string or an array.
fn token_audiences(claims: &Map<String, Value>) -> Vec<String> {
	match claims.get("aud") {
		Some(Value::String(s)) => vec![s.clone()],
		Some(Value::Array(vals)) => vals
			.iter()
			.filter_map(|v| v.as_str().map(|s| s.to_string()))
			.collect(),
		_ => Vec::new(),
	}
}

fn audience_matches(token_auds: &[String], expected: &[Strng]) -> bool {
	token_auds
		.iter()
		.any(|aud| expected.iter().any(|tag| tag.as_str() == aud))
}

#[async_trait::async_trait]
impl Middleware for JwtValidator {
	async fn handle(&self, req: &mut Request) -> anyhow::Result<MiddlewareResult> {
		let token = req
			.headers()
			.get(JWT_ASSERTION_HEADER)
			.and_then(|v| v.to_str().ok())
			.unwrap_or("");
		if token.is_empty() {
			debug!(team = %self.team_name, "request without access token");
			return Ok(MiddlewareResult::Respond(plain_response(
				StatusCode::FORBIDDEN,
				"no access token",
			)));
		}
		let claims = match self.validate(token).await {
			Ok(claims) => claims,
			// Key-set fetch failures are transient and the caller's problem;
			// everything else is a bad token.
			Err(e @ AccessError::KeySetFetch(_)) => return Err(e.into()),
			Err(e) => {
				debug!(team = %self.team_name, err = %e, "rejecting invalid access token");
				return Ok(MiddlewareResult::Respond(plain_response(
					StatusCode::FORBIDDEN,
					"invalid access token",
				)));
			},
		};
		let auds = token_audiences(&claims.inner);
		if !audience_matches(&auds, &self.aud_tags) {
			return Ok(MiddlewareResult::Respond(plain_response(
				StatusCode::FORBIDDEN,
				format!(
					"token audiences {auds:?} do not match any configured audience tag"
				),
			)));
		}
		req.extensions_mut().insert(claims);
		Ok(MiddlewareResult::Continue)
	}
}

#[cfg(test)]
mod tests {
	use wiremock::matchers::{method, path};
	use wiremock::{Mock, MockServer, ResponseTemplate};

	use super::*;
	use crate::http::empty_body;

	// Public RSA components only; nothing can be signed with this.
	const SAMPLE_JWKS: &str = r#"{
		"keys": [{
			"kty": "RSA",
			"use": "sig",
			"alg": "RS256",
			"kid": "test-key-1",
			"n": "0vx7agoebGcQSuuPiLJXZptN9nndrQmbXEps2aiAFbWhM78LhWx4cbbfAAtVT86zwu1RK7aPFFxuhDR1L6tSoc_BJECPebWKRXjBZCiFV4n3oknjhMstn64tZ_2W-5JsGY4Hc5n9yBXArwl93lqt7_RN5w6Cf0h4QyQ5v-65YGjQR0_FDW2QvzqY368QQMicAtaSqzs8KJZgnYb9c7d0zgdAZHzu6qMQvRL5hajrn1n91CbOpbISD08qNLyrdkt-bFTWhAI4vMQFh6WeZu0fM4lFd2NcRwr3XPksINHaQ-G_xBniIqbw0Ls1jF44-csFCur-kEgU8awapJzKnqDKgw",
			"e": "AQAB"
		}]
	}"#;

	#[test]
	fn parses_rsa_key_sets() {
		let keys = parse_key_set(SAMPLE_JWKS).unwrap();
		assert!(keys.contains_key("test-key-1"));
		assert_eq!(keys["test-key-1"].algorithm, Algorithm::RS256);
	}

	#[test]
	fn audience_matching() {
		let mut claims = Map::new();
		claims.insert("aud".into(), Value::String("tag-a".into()));
		assert!(audience_matches(
			&token_audiences(&claims),
			&["tag-a".into(), "tag-b".into()]
		));
		assert!(!audience_matches(&token_audiences(&claims), &["tag-b".into()]));

		claims.insert(
			"aud".into(),
			Value::Array(vec!["x".into(), "tag-b".into()]),
		);
		assert!(audience_matches(&token_audiences(&claims), &["tag-b".into()]));
		assert!(!audience_matches(&token_audiences(&claims), &[]));
	}

	#[tokio::test]
	async fn missing_token_is_forbidden() {
		let validator = JwtValidator::new("acme".into(), vec!["tag".into()]);
		let mut req = ::http::Request::builder()
			.uri("https://app.example/")
			.body(empty_body())
			.unwrap();
		let result = validator.handle(&mut req).await.unwrap();
		match result {
			MiddlewareResult::Respond(resp) => {
				assert_eq!(resp.status(), StatusCode::FORBIDDEN);
			},
			MiddlewareResult::Continue => panic!("expected a 403 response"),
		}
	}

	#[tokio::test]
	async fn unknown_kid_triggers_refresh_then_fails() {
		let server = MockServer::start().await;
		Mock::given(method("GET"))
			.and(path("/cdn-cgi/access/certs"))
			.respond_with(ResponseTemplate::new(200).set_body_string(SAMPLE_JWKS))
			.expect(1)
			.mount(&server)
			.await;

		let validator = JwtValidator::with_certs_url(
			"acme".into(),
			vec!["tag".into()],
			format!("{}/cdn-cgi/access/certs", server.uri()),
		);
		let err = validator.key_for("nonexistent-kid").await.unwrap_err();
		assert!(matches!(err, AccessError::UnknownKeyId(_)));
		// The refresh populated the cache with the keys it did find.
		assert!(validator.key_for("test-key-1").await.is_ok());
	}

	#[tokio::test]
	async fn environments_map_to_endpoints() {
		assert_eq!(
			AccessEnvironment::Production.certs_url("acme"),
			"https://acme.cloudflareaccess.com/cdn-cgi/access/certs"
		);
		assert_eq!(
			AccessEnvironment::Fed.certs_url("acme"),
			"https://acme.fed.cloudflareaccess.com/cdn-cgi/access/certs"
		);
	}
}
