use std::collections::HashMap;

use faros_core::prelude::*;

use crate::store::{Connection, trim_hostname};

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
	#[error("unknown hostname")]
	UnknownHost,
	#[error("invalid credentials")]
	InvalidCredentials,
}

/// AuthCache resolves public hostnames to connections and verifies basic-auth
/// credentials against the stored hash.
///
/// Alongside the hostname map it keeps an id -> hostname reverse index, so
/// `deleted` events (which only carry the object id) evict exactly the right
/// entry.
#[derive(Default)]
pub struct AuthCache {
	state: Mutex<State>,
}

#[derive(Default)]
struct State {
	by_host: HashMap<String, Connection>,
	host_by_id: HashMap<Strng, String>,
}

impl AuthCache {
	pub fn new() -> AuthCache {
		AuthCache::default()
	}

	/// Looks up the connection serving `hostname` (scheme-less form).
	pub fn connection(&self, hostname: &str) -> Option<Connection> {
		let state = self.state.lock().expect("poisoned");
		state.by_host.get(hostname).cloned()
	}

	/// Verifies basic-auth credentials for `hostname` against the stored
	/// bcrypt hash of `"user:pass"`.
	pub fn authenticate(
		&self,
		hostname: &str,
		username: &str,
		password: &str,
	) -> Result<Connection, AuthError> {
		let Some(conn) = self.connection(hostname) else {
			return Err(AuthError::UnknownHost);
		};
		let presented = format!("{username}:{password}");
		match bcrypt::verify(&presented, &conn.basic_auth_hash) {
			Ok(true) => Ok(conn),
			Ok(false) => Err(AuthError::InvalidCredentials),
			Err(err) => {
				debug!(hostname, %err, "basic auth hash comparison failed");
				Err(AuthError::InvalidCredentials)
			},
		}
	}

	pub(crate) fn insert(&self, conn: Connection) {
		let host = trim_hostname(&conn.hostname).to_string();
		let mut state = self.state.lock().expect("poisoned");
		// The hostname may have changed; drop the entry it used to live under.
		if let Some(previous) = state.host_by_id.insert(conn.id.clone(), host.clone())
			&& previous != host
		{
			state.by_host.remove(&previous);
		}
		state.by_host.insert(host, conn);
	}

	pub(crate) fn remove(&self, id: &str) {
		let mut state = self.state.lock().expect("poisoned");
		if let Some(host) = state.host_by_id.remove(id) {
			state.by_host.remove(&host);
		}
	}

	pub(crate) fn reload(&self, conns: Vec<Connection>) {
		let mut state = self.state.lock().expect("poisoned");
		state.by_host.clear();
		state.host_by_id.clear();
		for conn in conns {
			let host = trim_hostname(&conn.hostname).to_string();
			state.host_by_id.insert(conn.id.clone(), host.clone());
			state.by_host.insert(host, conn);
		}
	}
}
