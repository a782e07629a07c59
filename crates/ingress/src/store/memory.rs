use std::collections::HashMap;
use std::time::SystemTime;

use async_trait::async_trait;
use faros_core::prelude::*;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use super::{Connection, Event, EventType, Store, StoreError, User};

/// In-memory store with broadcast change delivery; the development and test
/// counterpart of the SQL-backed store.
pub struct MemoryStore {
	inner: Mutex<Inner>,
	events: broadcast::Sender<Event>,
}

#[derive(Default)]
struct Inner {
	connections: HashMap<Strng, Connection>,
	users: HashMap<Strng, User>,
}

impl MemoryStore {
	pub fn new() -> MemoryStore {
		let (events, _) = broadcast::channel(128);
		MemoryStore {
			inner: Mutex::new(Inner::default()),
			events,
		}
	}

	fn notify(&self, event: Event) {
		// No subscribers is fine; gateways reload on subscribe.
		let _ = self.events.send(event);
	}

	fn check_connection_unique(
		inner: &Inner,
		conn: &Connection,
		exclude_id: Option<&str>,
	) -> Result<(), StoreError> {
		for existing in inner.connections.values() {
			if Some(existing.id.as_str()) == exclude_id {
				continue;
			}
			if existing.hostname == conn.hostname {
				return Err(StoreError::Conflict("hostname"));
			}
			if existing.user_id == conn.user_id && existing.name == conn.name {
				return Err(StoreError::Conflict("connection name"));
			}
			if existing.token == conn.token {
				return Err(StoreError::Conflict("token"));
			}
		}
		Ok(())
	}
}

impl Default for MemoryStore {
	fn default() -> Self {
		Self::new()
	}
}

#[async_trait]
impl Store for MemoryStore {
	async fn get_connection(&self, id: &str) -> Result<Connection, StoreError> {
		if id.is_empty() {
			return Err(StoreError::Query);
		}
		let inner = self.inner.lock().expect("poisoned");
		inner.connections.get(id).cloned().ok_or(StoreError::NotFound)
	}

	async fn get_connection_by_name(
		&self,
		user_id: &str,
		name: &str,
	) -> Result<Connection, StoreError> {
		if user_id.is_empty() || name.is_empty() {
			return Err(StoreError::Query);
		}
		let inner = self.inner.lock().expect("poisoned");
		inner
			.connections
			.values()
			.find(|c| c.user_id == user_id && c.name == name)
			.cloned()
			.ok_or(StoreError::NotFound)
	}

	async fn get_connection_by_hostname(&self, hostname: &str) -> Result<Connection, StoreError> {
		if hostname.is_empty() {
			return Err(StoreError::Query);
		}
		let inner = self.inner.lock().expect("poisoned");
		inner
			.connections
			.values()
			.find(|c| c.hostname == hostname)
			.cloned()
			.ok_or(StoreError::NotFound)
	}

	async fn list_connections(&self, user_id: &str) -> Result<Vec<Connection>, StoreError> {
		if user_id.is_empty() {
			return Err(StoreError::Query);
		}
		let inner = self.inner.lock().expect("poisoned");
		Ok(
			inner
				.connections
				.values()
				.filter(|c| c.user_id == user_id)
				.cloned()
				.collect(),
		)
	}

	async fn list_all_connections(&self) -> Result<Vec<Connection>, StoreError> {
		let inner = self.inner.lock().expect("poisoned");
		Ok(inner.connections.values().cloned().collect())
	}

	async fn create_connection(&self, mut conn: Connection) -> Result<Connection, StoreError> {
		let now = SystemTime::now();
		conn.id = strng::new(Uuid::new_v4().to_string());
		conn.created_at = now;
		conn.updated_at = now;
		conn.last_used_at = now;
		{
			let mut inner = self.inner.lock().expect("poisoned");
			Self::check_connection_unique(&inner, &conn, None)?;
			inner.connections.insert(conn.id.clone(), conn.clone());
		}
		self.notify(Event::connection(EventType::Created, conn.id.to_string()));
		Ok(conn)
	}

	async fn update_connection(&self, mut conn: Connection) -> Result<Connection, StoreError> {
		if conn.id.is_empty() {
			return Err(StoreError::Query);
		}
		conn.updated_at = SystemTime::now();
		{
			let mut inner = self.inner.lock().expect("poisoned");
			if !inner.connections.contains_key(&conn.id) {
				return Err(StoreError::NotFound);
			}
			Self::check_connection_unique(&inner, &conn, Some(&conn.id))?;
			inner.connections.insert(conn.id.clone(), conn.clone());
		}
		self.notify(Event::connection(EventType::Updated, conn.id.to_string()));
		Ok(conn)
	}

	async fn delete_connection(&self, id: &str) -> Result<(), StoreError> {
		if id.is_empty() {
			return Err(StoreError::Query);
		}
		let removed = {
			let mut inner = self.inner.lock().expect("poisoned");
			inner.connections.remove(id)
		};
		if removed.is_none() {
			return Err(StoreError::NotFound);
		}
		self.notify(Event::connection(EventType::Deleted, id));
		Ok(())
	}

	async fn get_user(&self, id: &str) -> Result<User, StoreError> {
		if id.is_empty() {
			return Err(StoreError::Query);
		}
		let inner = self.inner.lock().expect("poisoned");
		inner.users.get(id).cloned().ok_or(StoreError::NotFound)
	}

	async fn get_user_by_email(&self, email: &str) -> Result<User, StoreError> {
		if email.is_empty() {
			return Err(StoreError::Query);
		}
		let inner = self.inner.lock().expect("poisoned");
		inner
			.users
			.values()
			.find(|u| u.email == email)
			.cloned()
			.ok_or(StoreError::NotFound)
	}

	async fn list_users(&self) -> Result<Vec<User>, StoreError> {
		let inner = self.inner.lock().expect("poisoned");
		Ok(inner.users.values().cloned().collect())
	}

	async fn create_user(&self, email: &str) -> Result<User, StoreError> {
		if email.is_empty() {
			return Err(StoreError::Query);
		}
		let now = SystemTime::now();
		let user = User {
			id: strng::new(Uuid::new_v4().to_string()),
			email: email.to_string(),
			created_at: now,
			updated_at: now,
		};
		{
			let mut inner = self.inner.lock().expect("poisoned");
			if inner.users.values().any(|u| u.email == email) {
				return Err(StoreError::Conflict("email"));
			}
			inner.users.insert(user.id.clone(), user.clone());
		}
		self.notify(Event::user(EventType::Created, user.id.to_string()));
		Ok(user)
	}

	async fn delete_user(&self, id: &str) -> Result<(), StoreError> {
		if id.is_empty() {
			return Err(StoreError::Query);
		}
		let removed = {
			let mut inner = self.inner.lock().expect("poisoned");
			inner.users.remove(id)
		};
		if removed.is_none() {
			return Err(StoreError::NotFound);
		}
		self.notify(Event::user(EventType::Deleted, id));
		Ok(())
	}

	async fn subscribe_changes(&self, tx: mpsc::Sender<Event>) -> Result<(), StoreError> {
		let mut events = self.events.subscribe();
		loop {
			let received = tokio::select! {
				// The subscriber went away; end the subscription cleanly.
				_ = tx.closed() => return Ok(()),
				received = events.recv() => received,
			};
			match received {
				Ok(event) => {
					if tx.send(event).await.is_err() {
						return Ok(());
					}
				},
				Err(broadcast::error::RecvError::Lagged(missed)) => {
					// Force the subscriber through its reload-on-subscribe path.
					return Err(StoreError::Backend(format!("event stream lagged by {missed}")));
				},
				Err(broadcast::error::RecvError::Closed) => return Ok(()),
			}
		}
	}

	async fn status(&self) -> Result<(), StoreError> {
		Ok(())
	}
}
