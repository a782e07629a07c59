//! Reverse-dial transport.
//!
//! A connector behind NAT opens one long-lived HTTP/2 request to the gateway;
//! that request/response body pair becomes a full-duplex control channel. When
//! the gateway needs a logical connection back to the connector it writes a
//! `conn-ready` control message, and the connector opens another HTTP/2 stream
//! which both sides wrap as a [`Conn`]. The gateway side hands out connections
//! through a [`Dialer`], the connector side accepts them through a
//! [`Listener`].
//!
//! The URL layout on the gateway host is:
//! * `<base>/revdial?id=<tunnel-id>` — establish or attach a stream
//! * `<base>/proxy/<tunnel-id>/<rest>` — reverse-proxy `<rest>` through the tunnel

mod conn;
mod dialer;
mod listener;

use serde::{Deserialize, Serialize};

pub use crate::conn::{Conn, ConnHandle};
pub use crate::dialer::Dialer;
pub use crate::listener::{Listener, default_client};

/// Path element that establishes or attaches a tunnel stream.
pub const PATH_REV_DIAL: &str = "revdial";
/// Path element that reverse-proxies a request through an established tunnel.
pub const PATH_REV_PROXY: &str = "proxy";
/// Query parameter carrying the tunnel id.
pub const URL_PARAM_ID: &str = "id";

/// Header identifying the party on a tunnel request (`Faros-Connection-Client`,
/// kept lowercase for the header APIs; HTTP header names are case-insensitive).
pub const CONNECTION_CLIENT_HEADER: &str = "faros-connection-client";
pub const CONNECTION_CLIENT_CONNECTOR: &str = "connector";
pub const CONNECTION_CLIENT_PROXY: &str = "proxy";

#[derive(thiserror::Error, Debug)]
pub enum Error {
	#[error("listener closed")]
	ListenerClosed,
	#[error("dialer closed")]
	DialerClosed,
	#[error("transport unavailable: {0}")]
	TransportUnavailable(#[source] Box<Error>),
	#[error("connection pickup failed: {0}")]
	PickupFailed(String),
	#[error("invalid gateway url {0:?}, expected https://host<:port></path>")]
	InvalidUrl(String),
	#[error("tunnel id must not be empty")]
	EmptyId,
	#[error("unexpected status code {0}")]
	UnexpectedStatus(http::StatusCode),
	#[error(transparent)]
	Request(#[from] reqwest::Error),
}

/// A control-channel message; one JSON object per newline-terminated line.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct ControlMessage {
	pub command: Command,
	#[serde(rename = "connPath", default, skip_serializing_if = "String::is_empty")]
	pub conn_path: String,
	#[serde(default, skip_serializing_if = "String::is_empty")]
	pub err: String,
}

impl ControlMessage {
	pub fn conn_ready() -> ControlMessage {
		ControlMessage {
			command: Command::ConnReady,
			conn_path: String::new(),
			err: String::new(),
		}
	}

	pub fn keep_alive() -> ControlMessage {
		ControlMessage {
			command: Command::KeepAlive,
			conn_path: String::new(),
			err: String::new(),
		}
	}

	pub fn pickup_failed(err: impl ToString) -> ControlMessage {
		ControlMessage {
			command: Command::PickupFailed,
			conn_path: String::new(),
			err: err.to_string(),
		}
	}

	pub fn encode(&self) -> Vec<u8> {
		let mut line = serde_json::to_vec(self).expect("control message serialization cannot fail");
		line.push(b'\n');
		line
	}
}

/// Commands understood on the control channel. Unrecognized commands decode to
/// [`Command::Unknown`] and are ignored, keeping the protocol forward-compatible.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum Command {
	ConnReady,
	PickupFailed,
	KeepAlive,
	#[serde(other)]
	Unknown,
}
