//! Persistence for users and connections, plus the change-event stream that
//! keeps gateway processes in sync.

mod memory;
mod sqlite;

use std::time::SystemTime;

use async_trait::async_trait;
use faros_core::prelude::*;
pub use memory::MemoryStore;
use serde::{Deserialize, Serialize};
pub use sqlite::SqliteStore;
use tokio::sync::mpsc;

use crate::config::Database;

pub async fn from_config(database: &Database) -> Result<Arc<dyn Store>, StoreError> {
	Ok(match database {
		Database::Memory => Arc::new(MemoryStore::new()),
		Database::Sqlite(path) => Arc::new(SqliteStore::open(path.clone()).await?),
	})
}

/// One exposed endpoint. The `token` doubles as the tunnel id on the wire;
/// the `id` never leaves the control plane.
#[derive(Clone, Debug, PartialEq)]
pub struct Connection {
	pub id: Strng,
	pub user_id: Strng,
	/// User-facing label, unique per user.
	pub name: String,
	/// Bearer token the connector presents to open the tunnel.
	pub token: Strng,
	/// Public hostname, stored with its `https://` prefix. Globally unique.
	pub hostname: String,
	/// Whether basic auth is required.
	pub secure: bool,
	/// bcrypt hash of `"user:pass"`; empty iff `secure` is false.
	pub basic_auth_hash: String,
	/// Gateway shard the connector should dial.
	pub gateway_url: String,
	/// Idle lifetime; zero means never expire.
	pub ttl: Duration,
	pub last_used_at: SystemTime,
	pub created_at: SystemTime,
	pub updated_at: SystemTime,
}

impl Connection {
	pub fn new(user_id: Strng, name: String) -> Connection {
		let now = SystemTime::now();
		Connection {
			id: Strng::default(),
			user_id,
			name,
			token: Strng::default(),
			hostname: String::new(),
			secure: false,
			basic_auth_hash: String::new(),
			gateway_url: String::new(),
			ttl: Duration::ZERO,
			last_used_at: now,
			created_at: now,
			updated_at: now,
		}
	}

	/// Whether the connection's idle lifetime has elapsed. Connections with a
	/// zero ttl never expire.
	pub fn expired(&self, now: SystemTime) -> bool {
		!self.ttl.is_zero() && self.last_used_at + self.ttl < now
	}

	/// Hostname as the gateway routes it, without the scheme prefix.
	pub fn routing_hostname(&self) -> &str {
		trim_hostname(&self.hostname)
	}
}

pub fn trim_hostname(hostname: &str) -> &str {
	hostname
		.strip_prefix("https://")
		.unwrap_or(hostname)
		.trim_end_matches('/')
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct User {
	pub id: Strng,
	/// Unique.
	pub email: String,
	pub created_at: SystemTime,
	pub updated_at: SystemTime,
}

/// A change notification. Events carry no state; consumers re-read the object.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Event {
	#[serde(rename = "type")]
	pub event_type: EventType,
	pub resource: EventResource,
	#[serde(rename = "objectId")]
	pub object_id: String,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventType {
	Created,
	Updated,
	Deleted,
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EventResource {
	Connection,
	User,
}

impl Event {
	pub fn connection(event_type: EventType, object_id: impl Into<String>) -> Event {
		Event {
			event_type,
			resource: EventResource::Connection,
			object_id: object_id.into(),
		}
	}

	pub fn user(event_type: EventType, object_id: impl Into<String>) -> Event {
		Event {
			event_type,
			resource: EventResource::User,
			object_id: object_id.into(),
		}
	}
}

#[derive(thiserror::Error, Debug)]
pub enum StoreError {
	#[error("object not found")]
	NotFound,
	#[error("already exists: {0}")]
	Conflict(&'static str),
	#[error("malformed request, failed to query")]
	Query,
	#[error("store backend: {0}")]
	Backend(String),
}

/// Storage backend for users and connections.
///
/// Implementations are safe for concurrent use; callers must not assume
/// transactional boundaries across calls.
#[async_trait]
pub trait Store: Send + Sync + 'static {
	async fn get_connection(&self, id: &str) -> Result<Connection, StoreError>;
	async fn get_connection_by_name(&self, user_id: &str, name: &str)
	-> Result<Connection, StoreError>;
	async fn get_connection_by_hostname(&self, hostname: &str) -> Result<Connection, StoreError>;
	async fn list_connections(&self, user_id: &str) -> Result<Vec<Connection>, StoreError>;
	async fn list_all_connections(&self) -> Result<Vec<Connection>, StoreError>;
	/// Assigns the id and timestamps; enforces hostname, token and
	/// (user, name) uniqueness.
	async fn create_connection(&self, conn: Connection) -> Result<Connection, StoreError>;
	async fn update_connection(&self, conn: Connection) -> Result<Connection, StoreError>;
	async fn delete_connection(&self, id: &str) -> Result<(), StoreError>;

	async fn get_user(&self, id: &str) -> Result<User, StoreError>;
	async fn get_user_by_email(&self, email: &str) -> Result<User, StoreError>;
	async fn list_users(&self) -> Result<Vec<User>, StoreError>;
	async fn create_user(&self, email: &str) -> Result<User, StoreError>;
	async fn delete_user(&self, id: &str) -> Result<(), StoreError>;

	/// Streams change events into `tx` until the receiver is dropped or the
	/// backend fails. Delivery is at-least-once with no ordering guarantee per
	/// object; consumers re-read and use `updated_at` as the authority.
	async fn subscribe_changes(&self, tx: mpsc::Sender<Event>) -> Result<(), StoreError>;

	/// Health check.
	async fn status(&self) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
	use super::*;

	fn sample(user_id: &str, name: &str, hostname: &str, token: &str) -> Connection {
		let mut conn = Connection::new(user_id.into(), name.to_string());
		conn.hostname = format!("https://{hostname}");
		conn.token = token.into();
		conn.gateway_url = "https://gateway.faros.sh".to_string();
		conn
	}

	async fn exercise_store(store: Arc<dyn Store>) {
		let user = store.create_user("a@example.com").await.unwrap();
		assert!(!user.id.is_empty());
		assert!(matches!(
			store.create_user("a@example.com").await,
			Err(StoreError::Conflict(_))
		));
		let by_email = store.get_user_by_email("a@example.com").await.unwrap();
		assert_eq!(by_email.id, user.id);

		let created = store
			.create_connection(sample(&user.id, "demo", "demo.apps.test", "tok-1"))
			.await
			.unwrap();
		assert!(!created.id.is_empty());

		// Unique constraints: hostname, (user, name), token.
		for dup in [
			sample(&user.id, "other", "demo.apps.test", "tok-2"),
			sample(&user.id, "demo", "other.apps.test", "tok-3"),
			sample(&user.id, "third", "third.apps.test", "tok-1"),
		] {
			assert!(
				matches!(store.create_connection(dup).await, Err(StoreError::Conflict(_))),
				"duplicate create should conflict"
			);
		}

		let fetched = store.get_connection(&created.id).await.unwrap();
		assert_eq!(fetched.hostname, "https://demo.apps.test");
		let by_name = store.get_connection_by_name(&user.id, "demo").await.unwrap();
		assert_eq!(by_name.id, created.id);
		let by_host = store
			.get_connection_by_hostname("https://demo.apps.test")
			.await
			.unwrap();
		assert_eq!(by_host.id, created.id);

		let mut updated = fetched.clone();
		updated.ttl = Duration::from_secs(60);
		let updated = store.update_connection(updated).await.unwrap();
		assert_eq!(updated.ttl, Duration::from_secs(60));
		assert!(updated.updated_at >= fetched.updated_at);

		assert_eq!(store.list_connections(&user.id).await.unwrap().len(), 1);
		assert_eq!(store.list_all_connections().await.unwrap().len(), 1);

		store.delete_connection(&created.id).await.unwrap();
		assert!(matches!(
			store.get_connection(&created.id).await,
			Err(StoreError::NotFound)
		));
	}

	async fn exercise_events(store: Arc<dyn Store>) {
		let (tx, mut rx) = mpsc::channel(16);
		let sub_store = store.clone();
		let sub = tokio::spawn(async move { sub_store.subscribe_changes(tx).await });
		// Let the subscription attach; events are not replayed to late subscribers.
		tokio::time::sleep(Duration::from_millis(50)).await;

		let user = store.create_user("events@example.com").await.unwrap();
		let conn = store
			.create_connection(sample(&user.id, "evt", "evt.apps.test", "tok-evt"))
			.await
			.unwrap();
		store.delete_connection(&conn.id).await.unwrap();

		let mut seen = Vec::new();
		while seen.len() < 3 {
			let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
				.await
				.expect("event should be delivered")
				.expect("subscription should stay open");
			seen.push(event);
		}
		assert!(seen.contains(&Event::user(EventType::Created, user.id.to_string())));
		assert!(seen.contains(&Event::connection(EventType::Created, conn.id.to_string())));
		assert!(seen.contains(&Event::connection(EventType::Deleted, conn.id.to_string())));

		drop(rx);
		// Dropping the receiver ends the subscription cleanly.
		tokio::time::timeout(Duration::from_secs(5), sub)
			.await
			.expect("subscription should end")
			.unwrap()
			.unwrap();
	}

	#[tokio::test]
	async fn memory_store_crud() {
		exercise_store(Arc::new(MemoryStore::new())).await;
	}

	#[tokio::test]
	async fn memory_store_events() {
		exercise_events(Arc::new(MemoryStore::new())).await;
	}

	#[tokio::test]
	async fn sqlite_store_crud() {
		let dir = tempfile::tempdir().unwrap();
		let store = SqliteStore::open(dir.path().join("test.sqlite3")).await.unwrap();
		exercise_store(Arc::new(store)).await;
	}

	#[tokio::test]
	async fn sqlite_store_events() {
		let dir = tempfile::tempdir().unwrap();
		let store = SqliteStore::open(dir.path().join("test.sqlite3")).await.unwrap();
		exercise_events(Arc::new(store)).await;
	}

	#[tokio::test]
	async fn sqlite_store_persists_across_handles() {
		let dir = tempfile::tempdir().unwrap();
		let path = dir.path().join("test.sqlite3");
		let first = SqliteStore::open(path.clone()).await.unwrap();
		let user = first.create_user("persist@example.com").await.unwrap();
		first
			.create_connection(sample(&user.id, "p", "p.apps.test", "tok-p"))
			.await
			.unwrap();

		let second = SqliteStore::open(path).await.unwrap();
		let conns = second.list_all_connections().await.unwrap();
		assert_eq!(conns.len(), 1);
		assert_eq!(conns[0].name, "p");
	}

	#[tokio::test]
	async fn concurrent_hostname_creates_conflict() {
		let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
		let user = store.create_user("race@example.com").await.unwrap();
		let a = store.clone();
		let b = store.clone();
		let ua = user.id.clone();
		let ub = user.id.clone();
		let (ra, rb) = tokio::join!(
			tokio::spawn(
				async move { a.create_connection(sample(&ua, "ra", "dup.apps.test", "tok-ra")).await }
			),
			tokio::spawn(
				async move { b.create_connection(sample(&ub, "rb", "dup.apps.test", "tok-rb")).await }
			),
		);
		let results = [ra.unwrap(), rb.unwrap()];
		let ok = results.iter().filter(|r| r.is_ok()).count();
		let conflicts = results
			.iter()
			.filter(|r| matches!(r, Err(StoreError::Conflict(_))))
			.count();
		assert_eq!((ok, conflicts), (1, 1));
		assert_eq!(store.list_all_connections().await.unwrap().len(), 1);
	}

	#[test]
	fn expiry_honors_zero_ttl() {
		let mut conn = Connection::new("u".into(), "n".to_string());
		let now = SystemTime::now();
		conn.last_used_at = now - Duration::from_secs(3600);
		conn.ttl = Duration::ZERO;
		assert!(!conn.expired(now));
		conn.ttl = Duration::from_secs(60);
		assert!(conn.expired(now));
		conn.ttl = Duration::from_secs(7200);
		assert!(!conn.expired(now));
	}

	#[test]
	fn hostname_trimming() {
		assert_eq!(trim_hostname("https://a.apps.test"), "a.apps.test");
		assert_eq!(trim_hostname("a.apps.test"), "a.apps.test");
		assert_eq!(trim_hostname("https://a.apps.test/"), "a.apps.test");
	}
}
