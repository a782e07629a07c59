//! External API types, shared by the management API and its client.

use serde::{Deserialize, Serialize};

pub use faros_revdial::{
	CONNECTION_CLIENT_CONNECTOR, CONNECTION_CLIENT_HEADER, CONNECTION_CLIENT_PROXY,
};

/// Prefix of every management API route.
pub const API_PREFIX: &str = "/api/v1alpha1";
/// Path the gateway mounts the tunnel pool under.
pub const PROXY_PREFIX: &str = "/api/v1alpha1/proxy";

/// A connection as exposed on the API. `username`/`password` are only
/// populated on the create response, mirroring that the server stores just a
/// hash of them.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct Connection {
	#[serde(skip_serializing_if = "String::is_empty")]
	pub id: String,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub name: String,
	/// Unix seconds of the last proxied request.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub last_used: Option<u64>,
	/// Idle lifetime as a humantime string (`"1h"`, `"90s"`); absent or `0s`
	/// means the connection never expires.
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ttl: Option<String>,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub token: String,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub hostname: String,
	#[serde(skip_serializing_if = "std::ops::Not::not")]
	pub secure: bool,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub username: String,
	#[serde(skip_serializing_if = "String::is_empty")]
	pub password: String,
}

#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionList {
	#[serde(skip_serializing_if = "Vec::is_empty")]
	pub items: Vec<Connection>,
}

/// Gateway bootstrap information handed to connectors.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct ConnectionGateway {
	#[serde(skip_serializing_if = "String::is_empty")]
	pub hostname: String,
}

/// Error payload returned by the API.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct ApiError {
	pub error: String,
}
