//! The management API: connection CRUD plus the gateway-resolution endpoint
//! connectors bootstrap from.

mod auth;
mod connections;

pub use auth::{Authenticator, StaticTokenAuthenticator};
use axum::Json;
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use faros_core::drain::DrainWatcher;
use faros_core::prelude::*;
use tokio::net::TcpListener;
use tower::ServiceExt;

use crate::http::{HeaderMap, StatusCode, header};
use crate::store::{Store, StoreError, User};
use crate::types::ApiError;
use crate::{Config, serve};

#[derive(Clone)]
pub(crate) struct AppState {
	pub config: Arc<Config>,
	pub store: Arc<dyn Store>,
	pub authenticator: Arc<dyn Authenticator>,
}

pub struct Service {
	listener: TcpListener,
	tls: Option<Arc<rustls::ServerConfig>>,
	state: AppState,
}

impl Service {
	pub async fn new(config: Arc<Config>, store: Arc<dyn Store>) -> anyhow::Result<Service> {
		let listener = TcpListener::bind(config.api_addr)
			.await
			.with_context(|| format!("bind api to {}", config.api_addr))?;
		let tls = match (&config.tls_cert_file, &config.tls_key_file) {
			(Some(cert), Some(key)) => Some(serve::tls_server_config(cert, key)?),
			_ => {
				warn!("api serving without TLS");
				None
			},
		};
		let authenticator: Arc<dyn Authenticator> =
			Arc::new(StaticTokenAuthenticator::new(store.clone(), &config.api_tokens));
		Ok(Service {
			listener,
			tls,
			state: AppState {
				config,
				store,
				authenticator,
			},
		})
	}

	/// The bound address; useful when configured with port 0.
	pub fn address(&self) -> SocketAddr {
		self
			.listener
			.local_addr()
			.expect("listener is bound in new()")
	}

	pub async fn run(self, drain: DrainWatcher) -> anyhow::Result<()> {
		info!("starting api service");
		let router = router(self.state);
		let result = serve::serve("api", self.listener, self.tls, drain, move |req| {
			let router = router.clone();
			async move {
				match router.oneshot(req).await {
					Ok(resp) => resp,
					Err(infallible) => match infallible {},
				}
			}
		})
		.await;
		info!("stopped api service");
		result
	}
}

pub(crate) fn router(state: AppState) -> axum::Router {
	axum::Router::new()
		.route("/healthz", get(healthz))
		.route(
			"/api/v1alpha1/connections",
			get(connections::list).post(connections::create),
		)
		.route(
			"/api/v1alpha1/connections/{id}",
			get(connections::get_one)
				.put(connections::update)
				.delete(connections::remove),
		)
		.route(
			"/api/v1alpha1/connection-gateways/{id}",
			get(connections::gateway),
		)
		.with_state(state)
}

async fn healthz(State(state): State<AppState>) -> Result<&'static str, ApiFailure> {
	state.store.status().await?;
	Ok("ok")
}

/// Resolves the bearer token on `headers` to a user.
pub(crate) async fn authenticate(
	state: &AppState,
	headers: &HeaderMap,
) -> Result<User, ApiFailure> {
	let Some(token) = bearer_token(headers) else {
		return Err(ApiFailure::Unauthorized);
	};
	match state.authenticator.authenticate(token).await? {
		Some(user) => Ok(user),
		None => Err(ApiFailure::Unauthorized),
	}
}

pub(crate) fn bearer_token(headers: &HeaderMap) -> Option<&str> {
	headers
		.get(header::AUTHORIZATION)?
		.to_str()
		.ok()?
		.strip_prefix("Bearer ")
}

#[derive(Debug)]
pub(crate) enum ApiFailure {
	BadRequest(String),
	Unauthorized,
	Forbidden(String),
	NotFound,
	Conflict(String),
	Internal(String),
}

impl From<StoreError> for ApiFailure {
	fn from(err: StoreError) -> ApiFailure {
		match err {
			StoreError::NotFound => ApiFailure::NotFound,
			StoreError::Conflict(what) => ApiFailure::Conflict(format!("{what} already exists")),
			StoreError::Query => ApiFailure::BadRequest("malformed request".to_string()),
			StoreError::Backend(err) => {
				error!(%err, "store error");
				ApiFailure::Internal("store failure".to_string())
			},
		}
	}
}

impl IntoResponse for ApiFailure {
	fn into_response(self) -> axum::response::Response {
		let (status, error) = match self {
			ApiFailure::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
			ApiFailure::Unauthorized => (StatusCode::UNAUTHORIZED, "unauthorized".to_string()),
			ApiFailure::Forbidden(msg) => (StatusCode::FORBIDDEN, msg),
			ApiFailure::NotFound => (StatusCode::NOT_FOUND, "not found".to_string()),
			ApiFailure::Conflict(msg) => (StatusCode::CONFLICT, msg),
			ApiFailure::Internal(msg) => (StatusCode::INTERNAL_SERVER_ERROR, msg),
		};
		(status, Json(ApiError { error })).into_response()
	}
}
