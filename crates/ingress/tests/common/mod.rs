//! Shared harness: spawns real API + gateway services on ephemeral ports with
//! a self-signed certificate, plus helpers to run connectors against them.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use faros_core::drain;
use faros_ingress::client::ApiClient;
use faros_ingress::config::{ApiToken, Config, ConnectorConfig, Database};
use faros_ingress::store::Store;
use faros_ingress::{api, gateway, store, types};
use http::StatusCode;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

pub const API_TOKEN: &str = "test-api-token";
pub const SUFFIX: &str = "apps.faros.test";

pub fn init() {
	faros_core::telemetry::testing::setup_test_logging();
	let _ = rustls::crypto::ring::default_provider().install_default();
}

pub struct Harness {
	pub store: Arc<dyn Store>,
	pub api_addr: SocketAddr,
	pub gateway_addr: SocketAddr,
	_drain: drain::DrainTrigger,
	_certs: TempDir,
}

impl Harness {
	pub async fn start(database: Database) -> Harness {
		init();
		let certs = TempDir::new().expect("create temp dir");
		let cert = rcgen::generate_simple_self_signed(vec![
			"localhost".to_string(),
			format!("*.{SUFFIX}"),
		])
		.expect("generate certificate");
		let cert_path = certs.path().join("tls.crt");
		let key_path = certs.path().join("tls.key");
		std::fs::write(&cert_path, cert.cert.pem()).expect("write cert");
		std::fs::write(&key_path, cert.key_pair.serialize_pem()).expect("write key");

		let mut config = Config {
			api_addr: "127.0.0.1:0".parse().unwrap(),
			gateway_addr: "127.0.0.1:0".parse().unwrap(),
			external_api_url: String::new(),
			external_gateway_url: String::new(),
			default_gateway: String::new(),
			internal_gateway_url: String::new(),
			hostname_suffix: SUFFIX.to_string(),
			tls_cert_file: Some(cert_path),
			tls_key_file: Some(key_path),
			database,
			connection_quota: 0,
			gc_interval: Duration::from_millis(100),
			client_cache_ttl: Duration::from_secs(3600),
			api_tokens: vec![ApiToken {
				token: API_TOKEN.to_string(),
				email: "dev@example.com".to_string(),
			}],
		};

		let store = store::from_config(&config.database).await.expect("open store");
		let gateway_svc = gateway::Service::new(Arc::new(config.clone()), store.clone())
			.await
			.expect("start gateway");
		let gateway_addr = gateway_svc.address();
		config.default_gateway = format!("https://127.0.0.1:{}", gateway_addr.port());
		config.external_gateway_url = config.default_gateway.clone();

		let api_svc = api::Service::new(Arc::new(config.clone()), store.clone())
			.await
			.expect("start api");
		let api_addr = api_svc.address();
		config.external_api_url = format!("https://127.0.0.1:{}", api_addr.port());

		let (drain_tx, drain_rx) = drain::new();
		tokio::spawn(gateway_svc.run(drain_rx.clone()));
		tokio::spawn(api_svc.run(drain_rx));
		// Let the gateway's sync loop attach its change subscription before
		// anything mutates the store.
		tokio::time::sleep(Duration::from_millis(100)).await;

		Harness {
			store,
			api_addr,
			gateway_addr,
			_drain: drain_tx,
			_certs: certs,
		}
	}

	pub fn gateway_url(&self) -> String {
		format!("https://127.0.0.1:{}", self.gateway_addr.port())
	}

	pub fn api_client(&self) -> ApiClient {
		ApiClient::new(
			&format!("https://127.0.0.1:{}", self.api_addr.port()),
			API_TOKEN,
			true,
		)
		.expect("build api client")
	}

	/// A client that resolves `hostname` at the local gateway; URLs must carry
	/// the gateway port.
	pub fn public_client(&self, hostname: &str) -> reqwest::Client {
		reqwest::Client::builder()
			.danger_accept_invalid_certs(true)
			.resolve(hostname, self.gateway_addr)
			.build()
			.expect("build public client")
	}

	pub fn public_url(&self, hostname: &str, path: &str) -> String {
		format!("https://{hostname}:{}{path}", self.gateway_addr.port())
	}

	pub async fn create_connection(
		&self,
		name: &str,
		label: Option<&str>,
		secure: bool,
		ttl: Option<&str>,
	) -> types::Connection {
		let request = types::Connection {
			name: name.to_string(),
			hostname: label.map(|l| format!("{l}.{SUFFIX}")).unwrap_or_default(),
			secure,
			ttl: ttl.map(str::to_string),
			..Default::default()
		};
		self
			.api_client()
			.create_connection(&request)
			.await
			.expect("create connection")
	}

	pub fn spawn_connector(&self, conn: &types::Connection, downstream_url: &str) -> ConnectorHandle {
		let config = ConnectorConfig {
			controller_url: format!("https://127.0.0.1:{}", self.api_addr.port()),
			downstream_url: downstream_url.to_string(),
			token: conn.token.clone(),
			connection_id: conn.id.clone(),
			tls_skip_verify: true,
		};
		let connector =
			faros_ingress::connector::Connector::new(config).expect("build connector");
		let shutdown = CancellationToken::new();
		let task = tokio::spawn(connector.run(shutdown.clone()));
		ConnectorHandle { shutdown, task }
	}
}

pub struct ConnectorHandle {
	shutdown: CancellationToken,
	task: tokio::task::JoinHandle<anyhow::Result<()>>,
}

impl ConnectorHandle {
	/// Graceful stop.
	pub async fn stop(self) {
		self.shutdown.cancel();
		let _ = self.task.await;
	}

	/// Hard kill, as if the process died: the control stream is torn down
	/// without any goodbye.
	pub fn kill(&self) {
		self.task.abort();
	}
}

/// Polls `url` until it answers with `want`, for up to ten seconds.
pub async fn wait_for_status(client: &reqwest::Client, url: &str, want: StatusCode) {
	for _ in 0..100 {
		if let Ok(resp) = client.get(url).send().await
			&& resp.status() == want
		{
			return;
		}
		tokio::time::sleep(Duration::from_millis(100)).await;
	}
	panic!("{url} did not answer with {want} in time");
}
