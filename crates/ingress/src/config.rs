use std::env;
use std::path::PathBuf;
use std::str::FromStr;

use faros_core::prelude::*;

/// Configuration for the API and gateway services, read from `FAROS_*`
/// environment variables.
#[derive(Clone, Debug)]
pub struct Config {
	/// Address the management API binds to.
	pub api_addr: SocketAddr,
	/// Address the gateway binds to.
	pub gateway_addr: SocketAddr,
	/// URL the API is externally reachable at.
	pub external_api_url: String,
	/// URL the gateway is externally reachable at.
	pub external_gateway_url: String,
	/// Gateway URL stamped onto new connections.
	pub default_gateway: String,
	/// URL the gateway reaches itself at for the internal proxy hop.
	/// Empty means "derive from the bound address".
	pub internal_gateway_url: String,
	/// Suffix under which connection hostnames are minted.
	pub hostname_suffix: String,
	/// TLS material shared by both servers; plain TCP when unset.
	pub tls_cert_file: Option<PathBuf>,
	pub tls_key_file: Option<PathBuf>,
	pub database: Database,
	/// Maximum connections per user; 0 means unlimited.
	pub connection_quota: usize,
	/// How often idle connections are garbage collected.
	pub gc_interval: Duration,
	/// How long per-tunnel ingress clients are kept warm.
	pub client_cache_ttl: Duration,
	/// Static bearer tokens accepted by the API, standing in for the
	/// externally-managed login flow.
	pub api_tokens: Vec<ApiToken>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Database {
	Memory,
	Sqlite(PathBuf),
}

#[derive(Clone, Debug)]
pub struct ApiToken {
	pub token: String,
	pub email: String,
}

impl Config {
	pub fn load() -> anyhow::Result<Config> {
		let external_gateway_url =
			parse_default("FAROS_GATEWAY_EXTERNAL_URL", "https://gateway.faros.sh".to_string())?;
		let database = match parse_default("FAROS_DATABASE_TYPE", "sqlite".to_string())?.as_str() {
			"memory" => Database::Memory,
			"sqlite" => Database::Sqlite(parse_default(
				"FAROS_DATABASE_SQLITE_URI",
				PathBuf::from("dev/faros.sqlite3"),
			)?),
			other => anyhow::bail!("unsupported database type {other:?}"),
		};
		Ok(Config {
			api_addr: parse_default("FAROS_API_ADDR", "0.0.0.0:8443".parse()?)?,
			gateway_addr: parse_default("FAROS_GATEWAY_ADDR", "0.0.0.0:8444".parse()?)?,
			external_api_url: parse_default("FAROS_API_EXTERNAL_URL", "https://api.faros.sh".to_string())?,
			default_gateway: parse_default("FAROS_DEFAULT_GATEWAY", external_gateway_url.clone())?,
			external_gateway_url,
			internal_gateway_url: parse_default("FAROS_GATEWAY_INTERNAL_URL", String::new())?,
			hostname_suffix: parse_default("FAROS_HOSTNAME_SUFFIX", "apps.faros.sh".to_string())?,
			tls_cert_file: parse("FAROS_TLS_CERT_FILE")?,
			tls_key_file: parse("FAROS_TLS_KEY_FILE")?,
			database,
			connection_quota: parse_default("FAROS_CONNECTIONS_QUOTA", 0)?,
			gc_interval: parse_duration_default("FAROS_GC_INTERVAL", Duration::from_secs(60))?,
			client_cache_ttl: parse_duration_default("FAROS_CLIENT_CACHE_TTL", Duration::from_secs(3600))?,
			api_tokens: parse_api_tokens(&parse_default("FAROS_API_TOKENS", String::new())?)?,
		})
	}
}

/// Configuration for the connector process.
#[derive(Clone, Debug)]
pub struct ConnectorConfig {
	/// URL of the management API.
	pub controller_url: String,
	/// Local service requests are proxied to.
	pub downstream_url: String,
	/// Connection token; doubles as the tunnel id on the wire.
	pub token: String,
	/// Connection id, used to resolve the gateway to dial.
	pub connection_id: String,
	/// Skip TLS verification towards the gateway (self-signed dev setups).
	pub tls_skip_verify: bool,
}

impl ConnectorConfig {
	pub fn load() -> anyhow::Result<ConnectorConfig> {
		Ok(ConnectorConfig {
			controller_url: parse_default("FAROS_EXTERNAL_URL", "https://api.faros.sh".to_string())?,
			downstream_url: parse_default("FAROS_DOWNSTREAM_URL", "http://localhost:8080".to_string())?,
			token: parse_default("FAROS_TOKEN", String::new())?,
			connection_id: parse_default("FAROS_CONNECTION_ID", String::new())?,
			tls_skip_verify: parse_default("FAROS_TLS_CLIENT_SKIP_VERIFY", false)?,
		})
	}
}

fn parse<T: FromStr>(env: &str) -> anyhow::Result<Option<T>>
where
	<T as FromStr>::Err: ToString,
{
	match env::var(env) {
		Ok(val) => val
			.parse::<T>()
			.map(Some)
			.map_err(|e| anyhow::anyhow!("invalid env var {}={} ({})", env, val, e.to_string())),
		Err(_) => Ok(None),
	}
}

fn parse_default<T: FromStr>(env: &str, default: T) -> anyhow::Result<T>
where
	<T as FromStr>::Err: ToString,
{
	parse(env).map(|v| v.unwrap_or(default))
}

fn parse_duration_default(env: &str, default: Duration) -> anyhow::Result<Duration> {
	match env::var(env) {
		Ok(val) => humantime::parse_duration(&val)
			.map_err(|e| anyhow::anyhow!("invalid env var {env}={val} ({e})")),
		Err(_) => Ok(default),
	}
}

/// Parses `token=email,token=email` pairs.
fn parse_api_tokens(raw: &str) -> anyhow::Result<Vec<ApiToken>> {
	let mut tokens = Vec::new();
	for pair in raw.split(',').filter(|p| !p.trim().is_empty()) {
		let (token, email) = pair
			.trim()
			.split_once('=')
			.ok_or_else(|| anyhow::anyhow!("invalid api token entry {pair:?}, expected token=email"))?;
		tokens.push(ApiToken {
			token: token.to_string(),
			email: email.to_string(),
		});
	}
	Ok(tokens)
}
