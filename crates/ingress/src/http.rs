pub type Error = axum_core::Error;
pub type Body = axum_core::body::Body;
pub type Request = ::http::Request<Body>;
pub type Response = ::http::Response<Body>;

pub use ::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode, Uri, header};

pub fn empty_response(code: StatusCode) -> Response {
	::http::Response::builder()
		.status(code)
		.body(Body::empty())
		.expect("builder with known status code should not fail")
}

pub fn plaintext_response(code: StatusCode, body: impl Into<String>) -> Response {
	::http::Response::builder()
		.status(code)
		.header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
		.body(Body::from(body.into()))
		.expect("builder with known status code should not fail")
}

/// Copies end-to-end headers from `src` into `dst`, dropping hop-by-hop
/// headers plus Host (the target sets its own).
pub fn copy_proxy_headers(src: &HeaderMap, dst: &mut HeaderMap) {
	for (name, value) in src {
		match name.as_str() {
			// Hop-by-hop headers are connection-scoped and must not cross a proxy.
			"connection" | "proxy-connection" | "proxy-authenticate" | "proxy-authorization"
			| "te" | "trailer" | "transfer-encoding" | "upgrade" | "keep-alive" | "host" => continue,
			_ => {},
		}
		dst.append(name.clone(), value.clone());
	}
}

/// Strips a trailing `:port` from a host, handling IPv6 literals.
pub fn strip_port(host: &str) -> &str {
	if host.as_bytes().first() == Some(&b'[') {
		match host.find(']') {
			Some(i) => &host[..i + 1],
			None => host,
		}
	} else {
		host.split(':').next().expect("split always has at least 1 item")
	}
}
