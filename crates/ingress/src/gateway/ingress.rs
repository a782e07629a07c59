use std::collections::HashMap;
use std::time::SystemTime;

use base64::Engine;
use faros_core::prelude::*;

use super::auth::AuthCache;
use crate::http::{
	HeaderMap, HeaderValue, Request, Response, StatusCode, copy_proxy_headers, header,
	plaintext_response, strip_port,
};
use crate::store::{Connection, Store};
use crate::types::{CONNECTION_CLIENT_CONNECTOR, CONNECTION_CLIENT_HEADER, PROXY_PREFIX};

/// Public entrypoint of the gateway: resolves the request hostname, enforces
/// basic auth, records usage and forwards the request into this process's own
/// tunnel-pool path over real HTTP, so the whole hot path runs through one
/// handler.
pub struct Ingress {
	store: Arc<dyn Store>,
	auth: Arc<AuthCache>,
	internal_gateway_url: String,
	clients: ClientCache,
}

impl Ingress {
	pub fn new(
		store: Arc<dyn Store>,
		auth: Arc<AuthCache>,
		internal_gateway_url: String,
		client_cache_ttl: Duration,
	) -> Ingress {
		Ingress {
			store,
			auth,
			internal_gateway_url,
			clients: ClientCache::new(client_cache_ttl),
		}
	}

	pub async fn serve(&self, req: Request) -> Response {
		let Some(raw_host) = effective_host(&req) else {
			return unauthorized(false);
		};
		let lookup = strip_port(&raw_host).to_string();
		let Some(mut conn) = self.auth.connection(&lookup) else {
			// 401 rather than 404 so hostnames cannot be enumerated.
			return unauthorized(false);
		};

		let mut consumed_auth = false;
		if conn.secure {
			let Some((username, password)) = basic_credentials(req.headers()) else {
				return unauthorized(true);
			};
			match self.auth.authenticate(&lookup, &username, &password) {
				Ok(verified) => {
					conn = verified;
					consumed_auth = true;
				},
				Err(_) => return unauthorized(true),
			}
		}

		// Bump last-used for the idle collector; never on the request path.
		let store = self.store.clone();
		let mut bumped = conn.clone();
		tokio::spawn(async move {
			bumped.last_used_at = SystemTime::now();
			if let Err(err) = store.update_connection(bumped).await {
				warn!(%err, "failed to record connection use");
			}
		});

		match self.forward(req, &conn, &raw_host, consumed_auth).await {
			Ok(resp) => resp,
			Err(err) => {
				warn!(host = %raw_host, %err, "ingress proxy request failed");
				plaintext_response(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
			},
		}
	}

	/// Rewrites the request onto the internal `proxy/<token>/<path>` hop and
	/// streams it through a cached per-tunnel client.
	async fn forward(
		&self,
		req: Request,
		conn: &Connection,
		raw_host: &str,
		consumed_auth: bool,
	) -> anyhow::Result<Response> {
		let client = self.clients.get_or_create(&conn.token)?;
		let (parts, body) = req.into_parts();
		let mut path = parts.uri.path().to_string();
		if let Some(query) = parts.uri.query() {
			path.push('?');
			path.push_str(query);
		}
		let url = format!(
			"{}{}/proxy/{}{}",
			self.internal_gateway_url.trim_end_matches('/'),
			PROXY_PREFIX,
			conn.token,
			path,
		);

		let mut headers = HeaderMap::new();
		copy_proxy_headers(&parts.headers, &mut headers);
		// Drop the credentials only when they were ours to consume.
		if consumed_auth {
			headers.remove(header::AUTHORIZATION);
		}
		headers.insert("x-forwarded-host", HeaderValue::from_str(raw_host)?);
		headers.insert("x-origin-host", HeaderValue::from_str(raw_host)?);
		headers.insert(
			CONNECTION_CLIENT_HEADER,
			HeaderValue::from_static(CONNECTION_CLIENT_CONNECTOR),
		);

		let resp = client
			.request(parts.method, &url)
			.headers(headers)
			.body(reqwest::Body::wrap_stream(body.into_data_stream()))
			.send()
			.await?;

		let mut builder = ::http::Response::builder().status(resp.status());
		let resp_headers = builder.headers_mut().expect("fresh builder cannot have errored");
		copy_proxy_headers(resp.headers(), resp_headers);
		Ok(builder.body(crate::http::Body::from_stream(resp.bytes_stream()))?)
	}
}

fn unauthorized(challenge: bool) -> Response {
	let mut resp = plaintext_response(StatusCode::UNAUTHORIZED, "Unauthorized");
	if challenge {
		resp.headers_mut().insert(
			header::WWW_AUTHENTICATE,
			HeaderValue::from_static("Basic realm=\"restricted\""),
		);
	}
	resp
}

/// The host this request was addressed to: `X-Forwarded-Host` when a fronting
/// proxy set it, else the request authority.
fn effective_host(req: &Request) -> Option<String> {
	if let Some(forwarded) = req.headers().get("x-forwarded-host")
		&& let Ok(host) = forwarded.to_str()
		&& !host.is_empty()
	{
		return Some(host.to_string());
	}
	if let Some(host) = req.uri().host() {
		return Some(match req.uri().port_u16() {
			Some(port) => format!("{host}:{port}"),
			None => host.to_string(),
		});
	}
	req
		.headers()
		.get(header::HOST)
		.and_then(|v| v.to_str().ok())
		.map(str::to_string)
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
	let value = headers.get(header::AUTHORIZATION)?.to_str().ok()?;
	let encoded = value.strip_prefix("Basic ")?;
	let decoded = base64::engine::general_purpose::STANDARD
		.decode(encoded.trim())
		.ok()?;
	let decoded = String::from_utf8(decoded).ok()?;
	let (username, password) = decoded.split_once(':')?;
	Some((username.to_string(), password.to_string()))
}

/// Per-tunnel clients for the loopback hop, kept warm with a TTL. Cardinality
/// is bounded by the number of active tunnels, so expired entries are swept
/// opportunistically on insert.
///
/// Certificate verification is disabled: the hop goes to this process's own
/// listener at an operator-configured loopback address, which serves the
/// public certificate for a different name.
struct ClientCache {
	ttl: Duration,
	inner: Mutex<HashMap<Strng, CachedClient>>,
}

struct CachedClient {
	created: Instant,
	client: reqwest::Client,
}

impl ClientCache {
	fn new(ttl: Duration) -> ClientCache {
		ClientCache {
			ttl,
			inner: Mutex::new(HashMap::new()),
		}
	}

	fn get_or_create(&self, key: &str) -> Result<reqwest::Client, reqwest::Error> {
		let mut inner = self.inner.lock().expect("poisoned");
		if let Some(cached) = inner.get(key)
			&& cached.created.elapsed() < self.ttl
		{
			return Ok(cached.client.clone());
		}
		let client = reqwest::Client::builder()
			.danger_accept_invalid_certs(true)
			.redirect(reqwest::redirect::Policy::none())
			.build()?;
		inner.retain(|_, cached| cached.created.elapsed() < self.ttl);
		inner.insert(
			strng::new(key),
			CachedClient {
				created: Instant::now(),
				client: client.clone(),
			},
		);
		Ok(client)
	}
}
