//! The gateway process: public TLS ingress, the tunnel pool, and the loops
//! keeping both in sync with the store.

mod auth;
mod gc;
mod ingress;
mod pool;
mod sync;

pub use auth::{AuthCache, AuthError};
use faros_core::drain::DrainWatcher;
use faros_core::prelude::*;
pub use ingress::Ingress;
pub use pool::ReversePool;
use tokio::net::TcpListener;

use crate::Config;
use crate::serve;
use crate::store::Store;
use crate::types::PROXY_PREFIX;

/// One gateway process. Requests under the proxy prefix go to the tunnel
/// pool; everything else is treated as public ingress traffic.
pub struct Service {
	config: Arc<Config>,
	store: Arc<dyn Store>,
	listener: TcpListener,
	tls: Option<Arc<rustls::ServerConfig>>,
	pool: Arc<ReversePool>,
	auth: Arc<AuthCache>,
	ingress: Arc<Ingress>,
}

impl Service {
	pub async fn new(config: Arc<Config>, store: Arc<dyn Store>) -> anyhow::Result<Service> {
		let listener = TcpListener::bind(config.gateway_addr)
			.await
			.with_context(|| format!("bind gateway to {}", config.gateway_addr))?;
		let tls = match (&config.tls_cert_file, &config.tls_key_file) {
			(Some(cert), Some(key)) => Some(serve::tls_server_config(cert, key)?),
			_ => {
				warn!("gateway serving without TLS; connectors require an https gateway");
				None
			},
		};
		// The loopback hop defaults to our own bound address.
		let internal_gateway_url = if config.internal_gateway_url.is_empty() {
			let scheme = if tls.is_some() { "https" } else { "http" };
			format!("{scheme}://127.0.0.1:{}", listener.local_addr()?.port())
		} else {
			config.internal_gateway_url.clone()
		};
		let pool = Arc::new(ReversePool::new());
		let auth = Arc::new(AuthCache::new());
		let ingress = Arc::new(Ingress::new(
			store.clone(),
			auth.clone(),
			internal_gateway_url,
			config.client_cache_ttl,
		));
		Ok(Service {
			config,
			store,
			listener,
			tls,
			pool,
			auth,
			ingress,
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
		info!("starting gateway service");
		tokio::spawn(
			sync::run(self.store.clone(), self.pool.clone(), self.auth.clone()).in_current_span(),
		);
		tokio::spawn(gc::run(self.store.clone(), self.config.gc_interval).in_current_span());

		let pool = self.pool.clone();
		let ingress = self.ingress.clone();
		let result = serve::serve("gateway", self.listener, self.tls, drain, move |req| {
			let pool = pool.clone();
			let ingress = ingress.clone();
			async move {
				if req
					.uri()
					.path()
					.strip_prefix(PROXY_PREFIX)
					.is_some_and(|rest| rest.is_empty() || rest.starts_with('/'))
				{
					pool.serve_http(req).await
				} else {
					ingress.serve(req).await
				}
			}
		})
		.await;
		self.pool.close();
		info!("stopped gateway service");
		result
	}
}
