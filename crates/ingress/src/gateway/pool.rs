use std::collections::HashMap;
use std::convert::Infallible;

use faros_core::prelude::*;
use faros_revdial::{Conn, Dialer, PATH_REV_DIAL, PATH_REV_PROXY, URL_PARAM_ID};
use futures_util::StreamExt;
use hyper_util::rt::TokioIo;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::http::{
	Body, HeaderValue, Request, Response, StatusCode, copy_proxy_headers, header,
	plaintext_response,
};

/// ReversePool owns the live tunnels of one gateway process: a [`Dialer`] per
/// connected tunnel id, plus the set of tokens allowed to use the proxy path.
///
/// It serves both tunnel endpoints; the handler walks the path from the right
/// so the pool can be mounted under any prefix:
/// * `<prefix>/revdial?id=<tunnel-id>` establishes or attaches a stream
/// * `<prefix>/proxy/<tunnel-id>/<rest>` proxies `<rest>` through the tunnel
#[derive(Default)]
pub struct ReversePool {
	state: Mutex<State>,
}

#[derive(Default)]
struct State {
	/// tunnel-id (the connection token) -> live dialer.
	dialers: HashMap<Strng, Arc<Dialer>>,
	/// connection id -> token. The values form the proxy-path allowlist.
	authorized: HashMap<Strng, Strng>,
}

enum PoolRoute {
	RevDial,
	Proxy { id: String, rest: String },
}

impl ReversePool {
	pub fn new() -> ReversePool {
		ReversePool::default()
	}

	pub async fn serve_http(&self, req: Request) -> Response {
		match route(req.uri().path()) {
			Ok(PoolRoute::RevDial) => self.handle_revdial(req).await,
			Ok(PoolRoute::Proxy { id, rest }) => self.handle_proxy(req, id, rest).await,
			Err((status, msg)) => plaintext_response(status, msg),
		}
	}

	/// Establishes tunnel streams. The first stream per id becomes the control
	/// channel (replacing any dead dialer); subsequent streams are data
	/// streams handed to the waiting dialer.
	async fn handle_revdial(&self, req: Request) -> Response {
		let Some(id) = query_param(req.uri().query(), URL_PARAM_ID).filter(|id| !id.is_empty())
		else {
			return plaintext_response(
				StatusCode::INTERNAL_SERVER_ERROR,
				"only reverse connections with id supported",
			);
		};
		let id = strng::new(id);
		let (body_tx, body_rx) = mpsc::channel::<Bytes>(16);
		let conn = Conn::new(req.into_body().into_data_stream(), body_tx);

		let existing = {
			let state = self.state.lock().expect("poisoned");
			state.dialers.get(&id).cloned()
		};
		match existing {
			Some(dialer) if !dialer.is_closed() => {
				debug!(%id, "accepted reverse data stream");
				if dialer.deliver(conn).await.is_err() {
					return plaintext_response(StatusCode::INTERNAL_SERVER_ERROR, "reverse dialer closed");
				}
			},
			_ => {
				info!(%id, "tunnel control stream established");
				let dialer = Dialer::new(id.clone(), conn);
				let replaced = {
					let mut state = self.state.lock().expect("poisoned");
					state.dialers.insert(id.clone(), dialer)
				};
				if let Some(replaced) = replaced {
					replaced.close();
				}
			},
		}
		// The streaming body flushes the 200 immediately and keeps the HTTP/2
		// stream open for exactly as long as the wrapped conn lives.
		::http::Response::builder()
			.status(StatusCode::OK)
			.body(Body::from_stream(
				ReceiverStream::new(body_rx).map(Ok::<_, Infallible>),
			))
			.expect("builder with known status code should not fail")
	}

	/// Reverse-proxies `<rest>` through the tunnel identified by `id`.
	async fn handle_proxy(&self, req: Request, id: String, rest: String) -> Response {
		if !self.is_authorized(&id) {
			return plaintext_response(StatusCode::UNAUTHORIZED, "unauthorized");
		}
		let Some(dialer) = self.dialer(&id) else {
			return plaintext_response(
				StatusCode::INTERNAL_SERVER_ERROR,
				"no reverse connections for this id available",
			);
		};
		match forward_through_tunnel(req, dialer, &rest).await {
			Ok(resp) => resp,
			Err(err) => {
				warn!(%id, %err, "tunnel proxy request failed");
				plaintext_response(StatusCode::BAD_GATEWAY, "tunnel request failed")
			},
		}
	}

	pub fn dialer(&self, token: &str) -> Option<Arc<Dialer>> {
		let state = self.state.lock().expect("poisoned");
		state.dialers.get(token).cloned()
	}

	/// Whether `token`, as presented on the wire, belongs to a known connection.
	pub fn is_authorized(&self, token: &str) -> bool {
		let state = self.state.lock().expect("poisoned");
		state.authorized.values().any(|t| t == token)
	}

	pub(crate) fn authorize(&self, id: Strng, token: Strng) {
		let mut state = self.state.lock().expect("poisoned");
		let previous = state.authorized.insert(id, token.clone());
		if let Some(previous) = previous
			&& previous != token
		{
			// Token rotated; the old tunnel may no longer be used.
			if let Some(dialer) = state.dialers.remove(&previous) {
				dialer.close();
			}
		}
	}

	pub(crate) fn revoke(&self, id: &str) {
		let mut state = self.state.lock().expect("poisoned");
		if let Some(token) = state.authorized.remove(id)
			&& let Some(dialer) = state.dialers.remove(&token)
		{
			dialer.close();
		}
	}

	pub(crate) fn reload(&self, conns: &[crate::store::Connection]) {
		let mut state = self.state.lock().expect("poisoned");
		state.authorized = conns
			.iter()
			.map(|c| (c.id.clone(), c.token.clone()))
			.collect();
	}

	/// Closes every live tunnel.
	pub fn close(&self) {
		let state = self.state.lock().expect("poisoned");
		for dialer in state.dialers.values() {
			dialer.close();
		}
	}
}

/// Opens a fresh tunneled connection and performs one HTTP/1.1 exchange over
/// it. Connections are never reused across requests.
async fn forward_through_tunnel(
	req: Request,
	dialer: Arc<Dialer>,
	rest: &str,
) -> anyhow::Result<Response> {
	let conn = dialer.dial().await?;
	let (mut sender, driver) = hyper::client::conn::http1::Builder::new()
		.handshake::<_, Body>(TokioIo::new(conn))
		.await?;
	tokio::spawn(
		async move {
			if let Err(err) = driver.await {
				debug!(%err, "tunneled connection closed");
			}
		}
		.in_current_span(),
	);

	let (parts, body) = req.into_parts();
	let mut target = String::with_capacity(rest.len() + 1);
	target.push('/');
	target.push_str(rest);
	if let Some(query) = parts.uri.query() {
		target.push('?');
		target.push_str(query);
	}
	let mut builder = ::http::Request::builder().method(parts.method).uri(target);
	let headers = builder.headers_mut().expect("fresh builder cannot have errored");
	copy_proxy_headers(&parts.headers, headers);
	headers.insert(header::HOST, HeaderValue::from_str(dialer.id())?);
	let upstream = builder.body(body)?;

	let resp = sender.send_request(upstream).await?;
	Ok(resp.map(Body::new))
}

fn query_param(query: Option<&str>, name: &str) -> Option<String> {
	url::form_urlencoded::parse(query.unwrap_or_default().as_bytes())
		.find(|(k, _)| k == name)
		.map(|(_, v)| v.into_owned())
}

/// Walks the path from the right for the last `revdial`/`proxy` element, so
/// the handler can be mounted under any prefix.
fn route(path: &str) -> Result<PoolRoute, (StatusCode, &'static str)> {
	let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
	if segments.is_empty() {
		return Err((StatusCode::NOT_FOUND, "not found"));
	}
	for i in (0..segments.len()).rev() {
		if segments[i] == PATH_REV_DIAL {
			if i != segments.len() - 1 {
				return Err((
					StatusCode::INTERNAL_SERVER_ERROR,
					"revdial: only last element on path allowed",
				));
			}
			return Ok(PoolRoute::RevDial);
		}
		if segments[i] == PATH_REV_PROXY {
			if i == segments.len() - 1 {
				return Err((
					StatusCode::INTERNAL_SERVER_ERROR,
					"proxy: reverse path id required",
				));
			}
			return Ok(PoolRoute::Proxy {
				id: segments[i + 1].to_string(),
				rest: segments[i + 2..].join("/"),
			});
		}
	}
	Err((StatusCode::NOT_FOUND, "no tunnel handler for path"))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn route_parses_revdial_and_proxy_under_any_prefix() {
		for path in ["/revdial", "/api/v1alpha1/proxy/revdial", "/deep/nested/prefix/revdial"] {
			assert!(matches!(route(path), Ok(PoolRoute::RevDial)), "path {path}");
		}
		match route("/api/v1alpha1/proxy/proxy/tok-1/some/deep/path") {
			Ok(PoolRoute::Proxy { id, rest }) => {
				assert_eq!(id, "tok-1");
				assert_eq!(rest, "some/deep/path");
			},
			_ => panic!("expected proxy route"),
		}
		match route("/proxy/tok-2") {
			Ok(PoolRoute::Proxy { id, rest }) => {
				assert_eq!(id, "tok-2");
				assert_eq!(rest, "");
			},
			_ => panic!("expected proxy route"),
		}
	}

	#[test]
	fn route_rejects_malformed_paths() {
		// revdial must be the last element.
		assert!(matches!(
			route("/api/v1alpha1/proxy/revdial/extra"),
			Err((StatusCode::INTERNAL_SERVER_ERROR, _))
		));
		// proxy requires an id.
		assert!(matches!(
			route("/api/v1alpha1/proxy/proxy"),
			Err((StatusCode::INTERNAL_SERVER_ERROR, _))
		));
		assert!(matches!(route("/unrelated/path"), Err((StatusCode::NOT_FOUND, _))));
		assert!(matches!(route("/"), Err((StatusCode::NOT_FOUND, _))));
	}

	#[test]
	fn query_param_extraction() {
		assert_eq!(query_param(Some("id=tok-1"), "id").as_deref(), Some("tok-1"));
		assert_eq!(
			query_param(Some("a=b&id=tok%202"), "id").as_deref(),
			Some("tok 2")
		);
		assert_eq!(query_param(None, "id"), None);
	}

	#[test]
	fn authorization_follows_tokens_not_ids() {
		let pool = ReversePool::new();
		pool.authorize("conn-1".into(), "tok-1".into());
		assert!(pool.is_authorized("tok-1"));
		// The connection id itself is not a valid wire credential.
		assert!(!pool.is_authorized("conn-1"));

		// Token rotation drops the old authorization.
		pool.authorize("conn-1".into(), "tok-2".into());
		assert!(pool.is_authorized("tok-2"));
		assert!(!pool.is_authorized("tok-1"));

		pool.revoke("conn-1");
		assert!(!pool.is_authorized("tok-2"));
	}

	#[tokio::test]
	async fn proxy_requires_authorization() {
		let pool = ReversePool::new();
		let req = ::http::Request::builder()
			.uri("/api/v1alpha1/proxy/proxy/tok-x/ping")
			.body(Body::empty())
			.unwrap();
		let resp = pool.serve_http(req).await;
		assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

		// Authorized but no live tunnel: internal error, not unauthorized.
		pool.authorize("conn-x".into(), "tok-x".into());
		let req = ::http::Request::builder()
			.uri("/api/v1alpha1/proxy/proxy/tok-x/ping")
			.body(Body::empty())
			.unwrap();
		let resp = pool.serve_http(req).await;
		assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
	}

	#[tokio::test]
	async fn revdial_requires_id() {
		let pool = ReversePool::new();
		let req = ::http::Request::builder()
			.uri("/api/v1alpha1/proxy/revdial")
			.body(Body::empty())
			.unwrap();
		let resp = pool.serve_http(req).await;
		assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
	}
}
