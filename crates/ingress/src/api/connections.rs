use std::time::UNIX_EPOCH;

use axum::Json;
use axum::extract::{Path, State};
use faros_core::prelude::*;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use super::{ApiFailure, AppState, authenticate, bearer_token};
use crate::http::HeaderMap;
use crate::store;
use crate::types;

/// Default basic-auth username for secured connections.
const DEFAULT_USERNAME: &str = "faros";

pub(crate) async fn list(
	State(state): State<AppState>,
	headers: HeaderMap,
) -> Result<Json<types::ConnectionList>, ApiFailure> {
	let user = authenticate(&state, &headers).await?;
	let conns = state.store.list_connections(&user.id).await?;
	Ok(Json(types::ConnectionList {
		items: conns.iter().map(to_api).collect(),
	}))
}

pub(crate) async fn get_one(
	State(state): State<AppState>,
	Path(id): Path<String>,
	headers: HeaderMap,
) -> Result<Json<types::Connection>, ApiFailure> {
	let user = authenticate(&state, &headers).await?;
	let conn = owned_connection(&state, &user.id, &id).await?;
	Ok(Json(to_api(&conn)))
}

pub(crate) async fn create(
	State(state): State<AppState>,
	headers: HeaderMap,
	Json(request): Json<types::Connection>,
) -> Result<Json<types::Connection>, ApiFailure> {
	let user = authenticate(&state, &headers).await?;
	if request.name.is_empty() {
		return Err(ApiFailure::BadRequest("name is required".to_string()));
	}
	let quota = state.config.connection_quota;
	if quota > 0 && state.store.list_connections(&user.id).await?.len() >= quota {
		return Err(ApiFailure::Forbidden("connection quota reached".to_string()));
	}
	if state
		.store
		.get_connection_by_name(&user.id, &request.name)
		.await
		.is_ok()
	{
		return Err(ApiFailure::Conflict("connection already exists".to_string()));
	}

	let mut conn = store::Connection::new(user.id.clone(), request.name.clone());
	conn.hostname = resolve_hostname(&request.hostname, &state.config.hostname_suffix)?;
	conn.token = strng::new(Uuid::new_v4().to_string());
	conn.gateway_url = state.config.default_gateway.clone();
	conn.ttl = parse_ttl(request.ttl.as_deref())?;

	let mut username = String::new();
	let mut password = String::new();
	if request.secure {
		username = if request.username.is_empty() {
			DEFAULT_USERNAME.to_string()
		} else {
			request.username.clone()
		};
		password = if request.password.is_empty() {
			Uuid::new_v4().to_string()
		} else {
			request.password.clone()
		};
		conn.secure = true;
		conn.basic_auth_hash = hash_credentials(&username, &password)?;
	}

	let created = state.store.create_connection(conn).await?;
	let mut api = to_api(&created);
	// The plaintext credentials are echoed exactly once; only the hash is kept.
	api.username = username;
	api.password = password;
	Ok(Json(api))
}

pub(crate) async fn update(
	State(state): State<AppState>,
	Path(id): Path<String>,
	headers: HeaderMap,
	Json(request): Json<types::Connection>,
) -> Result<Json<types::Connection>, ApiFailure> {
	let user = authenticate(&state, &headers).await?;
	let mut conn = owned_connection(&state, &user.id, &id).await?;
	if !request.name.is_empty() {
		conn.name = request.name.clone();
	}
	if !request.hostname.is_empty() {
		conn.hostname = resolve_hostname(&request.hostname, &state.config.hostname_suffix)?;
	}
	if let Some(ttl) = request.ttl.as_deref() {
		conn.ttl = parse_ttl(Some(ttl))?;
	}
	if !request.username.is_empty() && !request.password.is_empty() {
		conn.secure = true;
		conn.basic_auth_hash = hash_credentials(&request.username, &request.password)?;
	}
	let updated = state.store.update_connection(conn).await?;
	let mut api = to_api(&updated);
	api.username = request.username;
	api.password = request.password;
	Ok(Json(api))
}

pub(crate) async fn remove(
	State(state): State<AppState>,
	Path(id): Path<String>,
	headers: HeaderMap,
) -> Result<(), ApiFailure> {
	let user = authenticate(&state, &headers).await?;
	let conn = owned_connection(&state, &user.id, &id).await?;
	state.store.delete_connection(&conn.id).await?;
	Ok(())
}

/// Gateway bootstrap for connectors. Authenticated with the connection's own
/// token, since connectors hold no user credentials.
pub(crate) async fn gateway(
	State(state): State<AppState>,
	Path(id): Path<String>,
	headers: HeaderMap,
) -> Result<Json<types::ConnectionGateway>, ApiFailure> {
	let conn = state.store.get_connection(&id).await?;
	let Some(token) = bearer_token(&headers) else {
		return Err(ApiFailure::Unauthorized);
	};
	if token != conn.token.as_str() {
		return Err(ApiFailure::Unauthorized);
	}
	Ok(Json(types::ConnectionGateway {
		hostname: conn.gateway_url.clone(),
	}))
}

async fn owned_connection(
	state: &AppState,
	user_id: &str,
	id: &str,
) -> Result<store::Connection, ApiFailure> {
	let conn = state.store.get_connection(id).await?;
	if conn.user_id != user_id {
		// Not-found rather than forbidden; ids of other users stay opaque.
		return Err(ApiFailure::NotFound);
	}
	Ok(conn)
}

pub(crate) fn to_api(conn: &store::Connection) -> types::Connection {
	types::Connection {
		id: conn.id.to_string(),
		name: conn.name.clone(),
		last_used: conn
			.last_used_at
			.duration_since(UNIX_EPOCH)
			.ok()
			.map(|d| d.as_secs()),
		ttl: if conn.ttl.is_zero() {
			None
		} else {
			Some(humantime::format_duration(conn.ttl).to_string())
		},
		token: conn.token.to_string(),
		hostname: conn.hostname.clone(),
		secure: conn.secure,
		username: String::new(),
		password: String::new(),
	}
}

fn hash_credentials(username: &str, password: &str) -> Result<String, ApiFailure> {
	bcrypt::hash(format!("{username}:{password}"), bcrypt::DEFAULT_COST)
		.map_err(|err| ApiFailure::Internal(format!("failed to hash credentials: {err}")))
}

/// Normalizes a requested hostname (scheme optional) and enforces the suffix;
/// an empty request mints a fresh `<label>.<suffix>` hostname.
fn resolve_hostname(requested: &str, suffix: &str) -> Result<String, ApiFailure> {
	if requested.is_empty() {
		return Ok(format!("https://{}.{suffix}", generated_label()));
	}
	let host = store::trim_hostname(requested);
	if host.is_empty() || host.contains('/') || host.contains(':') {
		return Err(ApiFailure::BadRequest("hostname is not valid".to_string()));
	}
	if !host.ends_with(&format!(".{suffix}")) {
		return Err(ApiFailure::BadRequest(format!(
			"hostname {host:?} must end with {suffix:?}"
		)));
	}
	Ok(format!("https://{host}"))
}

fn generated_label() -> String {
	let digest = Sha256::digest(Uuid::new_v4().to_string().as_bytes());
	hex::encode(&digest[..8])
}

fn parse_ttl(raw: Option<&str>) -> Result<Duration, ApiFailure> {
	match raw {
		None => Ok(Duration::ZERO),
		Some("") => Ok(Duration::ZERO),
		Some(raw) => humantime::parse_duration(raw)
			.map_err(|err| ApiFailure::BadRequest(format!("invalid ttl: {err}"))),
	}
}

#[cfg(test)]
mod tests {
	use axum::Router;
	use tower::ServiceExt;

	use super::*;
	use crate::api::{AppState, StaticTokenAuthenticator, router};
	use crate::config::{ApiToken, Config, Database};
	use crate::http::{Body, StatusCode};
	use crate::store::{MemoryStore, Store};

	fn test_config() -> Config {
		Config {
			api_addr: "127.0.0.1:0".parse().unwrap(),
			gateway_addr: "127.0.0.1:0".parse().unwrap(),
			external_api_url: "https://api.faros.test".to_string(),
			external_gateway_url: "https://gateway.faros.test".to_string(),
			default_gateway: "https://gateway.faros.test".to_string(),
			internal_gateway_url: String::new(),
			hostname_suffix: "apps.faros.test".to_string(),
			tls_cert_file: None,
			tls_key_file: None,
			database: Database::Memory,
			connection_quota: 2,
			gc_interval: Duration::from_secs(60),
			client_cache_ttl: Duration::from_secs(3600),
			api_tokens: vec![ApiToken {
				token: "testtoken".to_string(),
				email: "dev@example.com".to_string(),
			}],
		}
	}

	fn test_router() -> (Router, Arc<dyn Store>) {
		let config = Arc::new(test_config());
		let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
		let authenticator = Arc::new(StaticTokenAuthenticator::new(store.clone(), &config.api_tokens));
		(
			router(AppState {
				config,
				store: store.clone(),
				authenticator,
			}),
			store,
		)
	}

	async fn call(
		router: &Router,
		method: &str,
		path: &str,
		token: Option<&str>,
		body: Option<serde_json::Value>,
	) -> (StatusCode, serde_json::Value) {
		let mut builder = ::http::Request::builder().method(method).uri(path);
		if let Some(token) = token {
			builder = builder.header("authorization", format!("Bearer {token}"));
		}
		let req = match body {
			Some(body) => builder
				.header("content-type", "application/json")
				.body(Body::from(body.to_string()))
				.unwrap(),
			None => builder.body(Body::empty()).unwrap(),
		};
		let resp = router.clone().oneshot(req).await.unwrap();
		let status = resp.status();
		let bytes = axum::body::to_bytes(resp.into_body(), 1 << 20).await.unwrap();
		let json = if bytes.is_empty() {
			serde_json::Value::Null
		} else {
			serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
		};
		(status, json)
	}

	#[tokio::test]
	async fn requires_bearer_token() {
		let (router, _) = test_router();
		let (status, _) = call(&router, "GET", "/api/v1alpha1/connections", None, None).await;
		assert_eq!(status, StatusCode::UNAUTHORIZED);
		let (status, _) =
			call(&router, "GET", "/api/v1alpha1/connections", Some("wrong"), None).await;
		assert_eq!(status, StatusCode::UNAUTHORIZED);
	}

	#[tokio::test]
	async fn create_list_get_delete_flow() {
		let (router, _) = test_router();
		let (status, created) = call(
			&router,
			"POST",
			"/api/v1alpha1/connections",
			Some("testtoken"),
			Some(serde_json::json!({"name": "demo", "ttl": "1h"})),
		)
		.await;
		assert_eq!(status, StatusCode::OK, "{created}");
		let id = created["id"].as_str().unwrap().to_string();
		assert!(!created["token"].as_str().unwrap().is_empty());
		let hostname = created["hostname"].as_str().unwrap();
		assert!(hostname.starts_with("https://"));
		assert!(hostname.ends_with(".apps.faros.test"));
		assert_eq!(created["ttl"], "1h");
		assert!(created.get("username").is_none());

		let (status, listed) =
			call(&router, "GET", "/api/v1alpha1/connections", Some("testtoken"), None).await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(listed["items"].as_array().unwrap().len(), 1);

		let (status, fetched) = call(
			&router,
			"GET",
			&format!("/api/v1alpha1/connections/{id}"),
			Some("testtoken"),
			None,
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(fetched["id"], created["id"]);

		let (status, _) = call(
			&router,
			"DELETE",
			&format!("/api/v1alpha1/connections/{id}"),
			Some("testtoken"),
			None,
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		let (status, _) = call(
			&router,
			"GET",
			&format!("/api/v1alpha1/connections/{id}"),
			Some("testtoken"),
			None,
		)
		.await;
		assert_eq!(status, StatusCode::NOT_FOUND);
	}

	#[tokio::test]
	async fn duplicate_names_and_hostnames_conflict() {
		let (router, _) = test_router();
		let body = serde_json::json!({"name": "dup", "hostname": "dup.apps.faros.test"});
		let (status, _) = call(
			&router,
			"POST",
			"/api/v1alpha1/connections",
			Some("testtoken"),
			Some(body.clone()),
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		let (status, _) = call(
			&router,
			"POST",
			"/api/v1alpha1/connections",
			Some("testtoken"),
			Some(body),
		)
		.await;
		assert_eq!(status, StatusCode::CONFLICT);
		// Same hostname under a different name also conflicts.
		let (status, _) = call(
			&router,
			"POST",
			"/api/v1alpha1/connections",
			Some("testtoken"),
			Some(serde_json::json!({"name": "dup2", "hostname": "dup.apps.faros.test"})),
		)
		.await;
		assert_eq!(status, StatusCode::CONFLICT);
	}

	#[tokio::test]
	async fn hostname_must_match_suffix() {
		let (router, _) = test_router();
		let (status, body) = call(
			&router,
			"POST",
			"/api/v1alpha1/connections",
			Some("testtoken"),
			Some(serde_json::json!({"name": "bad", "hostname": "bad.other.test"})),
		)
		.await;
		assert_eq!(status, StatusCode::BAD_REQUEST, "{body}");
	}

	#[tokio::test]
	async fn quota_is_enforced() {
		let (router, _) = test_router();
		for i in 0..2 {
			let (status, _) = call(
				&router,
				"POST",
				"/api/v1alpha1/connections",
				Some("testtoken"),
				Some(serde_json::json!({"name": format!("quota-{i}")})),
			)
			.await;
			assert_eq!(status, StatusCode::OK);
		}
		let (status, _) = call(
			&router,
			"POST",
			"/api/v1alpha1/connections",
			Some("testtoken"),
			Some(serde_json::json!({"name": "quota-2"})),
		)
		.await;
		assert_eq!(status, StatusCode::FORBIDDEN);
	}

	#[tokio::test]
	async fn secure_create_echoes_credentials_once() {
		let (router, store) = test_router();
		let (status, created) = call(
			&router,
			"POST",
			"/api/v1alpha1/connections",
			Some("testtoken"),
			Some(serde_json::json!({"name": "sec", "secure": true})),
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(created["username"], DEFAULT_USERNAME);
		let password = created["password"].as_str().unwrap();
		assert!(!password.is_empty());

		// Only the hash is stored, and it verifies the echoed credentials.
		let stored = store
			.get_connection(created["id"].as_str().unwrap())
			.await
			.unwrap();
		assert!(stored.secure);
		assert!(
			bcrypt::verify(format!("{DEFAULT_USERNAME}:{password}"), &stored.basic_auth_hash).unwrap()
		);

		// The credentials do not come back on reads.
		let (_, fetched) = call(
			&router,
			"GET",
			&format!("/api/v1alpha1/connections/{}", created["id"].as_str().unwrap()),
			Some("testtoken"),
			None,
		)
		.await;
		assert!(fetched.get("password").is_none());
	}

	#[tokio::test]
	async fn gateway_lookup_requires_connection_token() {
		let (router, _) = test_router();
		let (_, created) = call(
			&router,
			"POST",
			"/api/v1alpha1/connections",
			Some("testtoken"),
			Some(serde_json::json!({"name": "gw"})),
		)
		.await;
		let id = created["id"].as_str().unwrap();
		let token = created["token"].as_str().unwrap();

		let (status, _) = call(
			&router,
			"GET",
			&format!("/api/v1alpha1/connection-gateways/{id}"),
			None,
			None,
		)
		.await;
		assert_eq!(status, StatusCode::UNAUTHORIZED);

		let (status, gw) = call(
			&router,
			"GET",
			&format!("/api/v1alpha1/connection-gateways/{id}"),
			Some(token),
			None,
		)
		.await;
		assert_eq!(status, StatusCode::OK);
		assert_eq!(gw["hostname"], "https://gateway.faros.test");
	}

	#[test]
	fn ttl_parsing() {
		assert_eq!(parse_ttl(None).unwrap(), Duration::ZERO);
		assert_eq!(parse_ttl(Some("")).unwrap(), Duration::ZERO);
		assert_eq!(parse_ttl(Some("100ms")).unwrap(), Duration::from_millis(100));
		assert_eq!(parse_ttl(Some("1h")).unwrap(), Duration::from_secs(3600));
		assert!(parse_ttl(Some("soon")).is_err());
	}

	#[test]
	fn hostname_resolution() {
		let minted = resolve_hostname("", "apps.faros.test").unwrap();
		assert!(minted.starts_with("https://"));
		assert!(minted.ends_with(".apps.faros.test"));
		assert_eq!(
			resolve_hostname("a.apps.faros.test", "apps.faros.test").unwrap(),
			"https://a.apps.faros.test"
		);
		assert_eq!(
			resolve_hostname("https://a.apps.faros.test", "apps.faros.test").unwrap(),
			"https://a.apps.faros.test"
		);
		assert!(resolve_hostname("a.b.test", "apps.faros.test").is_err());
		assert!(resolve_hostname("a/b.apps.faros.test", "apps.faros.test").is_err());
	}
}
