use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use faros_core::prelude::*;
use rusqlite::{OptionalExtension, params};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{Connection, Event, EventResource, EventType, Store, StoreError, User};

/// How often the change subscriber polls the events table.
const POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Events fetched per poll.
const POLL_BATCH: usize = 64;

const MIGRATION: &str = "
CREATE TABLE IF NOT EXISTS users (
	id TEXT PRIMARY KEY,
	email TEXT NOT NULL UNIQUE,
	created_at INTEGER NOT NULL,
	updated_at INTEGER NOT NULL
);
CREATE TABLE IF NOT EXISTS connections (
	id TEXT PRIMARY KEY,
	user_id TEXT NOT NULL,
	name TEXT NOT NULL,
	token TEXT NOT NULL UNIQUE,
	hostname TEXT NOT NULL UNIQUE,
	secure INTEGER NOT NULL DEFAULT 0,
	basic_auth_hash TEXT NOT NULL DEFAULT '',
	gateway_url TEXT NOT NULL DEFAULT '',
	ttl_ms INTEGER NOT NULL DEFAULT 0,
	last_used_at INTEGER NOT NULL,
	created_at INTEGER NOT NULL,
	updated_at INTEGER NOT NULL,
	UNIQUE (user_id, name)
);
CREATE INDEX IF NOT EXISTS idx_connections_user ON connections (user_id);
CREATE TABLE IF NOT EXISTS events (
	id TEXT PRIMARY KEY,
	type TEXT NOT NULL,
	resource TEXT NOT NULL,
	object_id TEXT NOT NULL,
	created_at INTEGER NOT NULL
);
";

/// SQLite-backed store. Change delivery uses the polling fallback: every
/// mutation inserts a row into `events` in the same transaction, and
/// subscribers fetch, deliver, then delete on a one second interval.
pub struct SqliteStore {
	db: Arc<Mutex<rusqlite::Connection>>,
}

impl SqliteStore {
	pub async fn open(path: PathBuf) -> Result<SqliteStore, StoreError> {
		let db = tokio::task::spawn_blocking(move || -> Result<rusqlite::Connection, StoreError> {
			if let Some(parent) = path.parent()
				&& !parent.as_os_str().is_empty()
			{
				std::fs::create_dir_all(parent).map_err(|e| StoreError::Backend(e.to_string()))?;
			}
			let db = rusqlite::Connection::open(&path).map_err(db_err)?;
			// WAL so API and gateway processes can share the file.
			let _mode: String = db
				.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))
				.map_err(db_err)?;
			db.busy_timeout(Duration::from_secs(5)).map_err(db_err)?;
			db.execute_batch(MIGRATION).map_err(db_err)?;
			Ok(db)
		})
		.await
		.map_err(|e| StoreError::Backend(e.to_string()))??;
		info!("initialized sqlite store");
		Ok(SqliteStore {
			db: Arc::new(Mutex::new(db)),
		})
	}

	async fn with_db<T, F>(&self, f: F) -> Result<T, StoreError>
	where
		T: Send + 'static,
		F: FnOnce(&mut rusqlite::Connection) -> Result<T, StoreError> + Send + 'static,
	{
		let db = self.db.clone();
		tokio::task::spawn_blocking(move || {
			let mut db = db.lock().expect("poisoned");
			f(&mut db)
		})
		.await
		.map_err(|e| StoreError::Backend(e.to_string()))?
	}
}

#[async_trait]
impl Store for SqliteStore {
	async fn get_connection(&self, id: &str) -> Result<Connection, StoreError> {
		if id.is_empty() {
			return Err(StoreError::Query);
		}
		let id = id.to_string();
		self
			.with_db(move |db| {
				db.query_row(
					&format!("{CONNECTION_SELECT} WHERE id = ?1"),
					params![id],
					row_to_connection,
				)
				.optional()
				.map_err(db_err)?
				.ok_or(StoreError::NotFound)
			})
			.await
	}

	async fn get_connection_by_name(
		&self,
		user_id: &str,
		name: &str,
	) -> Result<Connection, StoreError> {
		if user_id.is_empty() || name.is_empty() {
			return Err(StoreError::Query);
		}
		let (user_id, name) = (user_id.to_string(), name.to_string());
		self
			.with_db(move |db| {
				db.query_row(
					&format!("{CONNECTION_SELECT} WHERE user_id = ?1 AND name = ?2"),
					params![user_id, name],
					row_to_connection,
				)
				.optional()
				.map_err(db_err)?
				.ok_or(StoreError::NotFound)
			})
			.await
	}

	async fn get_connection_by_hostname(&self, hostname: &str) -> Result<Connection, StoreError> {
		if hostname.is_empty() {
			return Err(StoreError::Query);
		}
		let hostname = hostname.to_string();
		self
			.with_db(move |db| {
				db.query_row(
					&format!("{CONNECTION_SELECT} WHERE hostname = ?1"),
					params![hostname],
					row_to_connection,
				)
				.optional()
				.map_err(db_err)?
				.ok_or(StoreError::NotFound)
			})
			.await
	}

	async fn list_connections(&self, user_id: &str) -> Result<Vec<Connection>, StoreError> {
		if user_id.is_empty() {
			return Err(StoreError::Query);
		}
		let user_id = user_id.to_string();
		self
			.with_db(move |db| {
				let mut stmt = db
					.prepare(&format!("{CONNECTION_SELECT} WHERE user_id = ?1 ORDER BY created_at"))
					.map_err(db_err)?;
				let rows = stmt
					.query_map(params![user_id], row_to_connection)
					.map_err(db_err)?
					.collect::<Result<Vec<_>, _>>()
					.map_err(db_err)?;
				Ok(rows)
			})
			.await
	}

	async fn list_all_connections(&self) -> Result<Vec<Connection>, StoreError> {
		self
			.with_db(|db| {
				let mut stmt = db
					.prepare(&format!("{CONNECTION_SELECT} ORDER BY created_at"))
					.map_err(db_err)?;
				let rows = stmt
					.query_map([], row_to_connection)
					.map_err(db_err)?
					.collect::<Result<Vec<_>, _>>()
					.map_err(db_err)?;
				Ok(rows)
			})
			.await
	}

	async fn create_connection(&self, mut conn: Connection) -> Result<Connection, StoreError> {
		let now = SystemTime::now();
		conn.id = strng::new(Uuid::new_v4().to_string());
		conn.created_at = now;
		conn.updated_at = now;
		conn.last_used_at = now;
		let inserted = conn.clone();
		self
			.with_db(move |db| {
				let tx = db.transaction().map_err(db_err)?;
				tx.execute(
					"INSERT INTO connections (id, user_id, name, token, hostname, secure, basic_auth_hash, gateway_url, ttl_ms, last_used_at, created_at, updated_at)
					 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
					params![
						inserted.id.as_str(),
						inserted.user_id.as_str(),
						inserted.name,
						inserted.token.as_str(),
						inserted.hostname,
						inserted.secure as i64,
						inserted.basic_auth_hash,
						inserted.gateway_url,
						inserted.ttl.as_millis() as i64,
						to_millis(inserted.last_used_at),
						to_millis(inserted.created_at),
						to_millis(inserted.updated_at),
					],
				)
				.map_err(db_err)?;
				insert_event(&tx, EventType::Created, EventResource::Connection, &inserted.id)?;
				tx.commit().map_err(db_err)?;
				Ok(inserted)
			})
			.await
	}

	async fn update_connection(&self, mut conn: Connection) -> Result<Connection, StoreError> {
		if conn.id.is_empty() {
			return Err(StoreError::Query);
		}
		conn.updated_at = SystemTime::now();
		let updated = conn.clone();
		self
			.with_db(move |db| {
				let tx = db.transaction().map_err(db_err)?;
				let changed = tx
					.execute(
						"UPDATE connections SET name = ?2, token = ?3, hostname = ?4, secure = ?5, basic_auth_hash = ?6, gateway_url = ?7, ttl_ms = ?8, last_used_at = ?9, updated_at = ?10
						 WHERE id = ?1",
						params![
							updated.id.as_str(),
							updated.name,
							updated.token.as_str(),
							updated.hostname,
							updated.secure as i64,
							updated.basic_auth_hash,
							updated.gateway_url,
							updated.ttl.as_millis() as i64,
							to_millis(updated.last_used_at),
							to_millis(updated.updated_at),
						],
					)
					.map_err(db_err)?;
				if changed == 0 {
					return Err(StoreError::NotFound);
				}
				insert_event(&tx, EventType::Updated, EventResource::Connection, &updated.id)?;
				tx.commit().map_err(db_err)?;
				Ok(updated)
			})
			.await
	}

	async fn delete_connection(&self, id: &str) -> Result<(), StoreError> {
		if id.is_empty() {
			return Err(StoreError::Query);
		}
		let id = id.to_string();
		self
			.with_db(move |db| {
				let tx = db.transaction().map_err(db_err)?;
				let changed = tx
					.execute("DELETE FROM connections WHERE id = ?1", params![id])
					.map_err(db_err)?;
				if changed == 0 {
					return Err(StoreError::NotFound);
				}
				insert_event(&tx, EventType::Deleted, EventResource::Connection, &id)?;
				tx.commit().map_err(db_err)?;
				Ok(())
			})
			.await
	}

	async fn get_user(&self, id: &str) -> Result<User, StoreError> {
		if id.is_empty() {
			return Err(StoreError::Query);
		}
		let id = id.to_string();
		self
			.with_db(move |db| {
				db.query_row(
					"SELECT id, email, created_at, updated_at FROM users WHERE id = ?1",
					params![id],
					row_to_user,
				)
				.optional()
				.map_err(db_err)?
				.ok_or(StoreError::NotFound)
			})
			.await
	}

	async fn get_user_by_email(&self, email: &str) -> Result<User, StoreError> {
		if email.is_empty() {
			return Err(StoreError::Query);
		}
		let email = email.to_string();
		self
			.with_db(move |db| {
				db.query_row(
					"SELECT id, email, created_at, updated_at FROM users WHERE email = ?1",
					params![email],
					row_to_user,
				)
				.optional()
				.map_err(db_err)?
				.ok_or(StoreError::NotFound)
			})
			.await
	}

	async fn list_users(&self) -> Result<Vec<User>, StoreError> {
		self
			.with_db(|db| {
				let mut stmt = db
					.prepare("SELECT id, email, created_at, updated_at FROM users ORDER BY created_at")
					.map_err(db_err)?;
				let rows = stmt
					.query_map([], row_to_user)
					.map_err(db_err)?
					.collect::<Result<Vec<_>, _>>()
					.map_err(db_err)?;
				Ok(rows)
			})
			.await
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
		let inserted = user.clone();
		self
			.with_db(move |db| {
				let tx = db.transaction().map_err(db_err)?;
				tx.execute(
					"INSERT INTO users (id, email, created_at, updated_at) VALUES (?1, ?2, ?3, ?4)",
					params![
						inserted.id.as_str(),
						inserted.email,
						to_millis(inserted.created_at),
						to_millis(inserted.updated_at),
					],
				)
				.map_err(db_err)?;
				insert_event(&tx, EventType::Created, EventResource::User, &inserted.id)?;
				tx.commit().map_err(db_err)?;
				Ok(inserted)
			})
			.await
	}

	async fn delete_user(&self, id: &str) -> Result<(), StoreError> {
		if id.is_empty() {
			return Err(StoreError::Query);
		}
		let id = id.to_string();
		self
			.with_db(move |db| {
				let tx = db.transaction().map_err(db_err)?;
				let changed = tx
					.execute("DELETE FROM users WHERE id = ?1", params![id])
					.map_err(db_err)?;
				if changed == 0 {
					return Err(StoreError::NotFound);
				}
				insert_event(&tx, EventType::Deleted, EventResource::User, &id)?;
				tx.commit().map_err(db_err)?;
				Ok(())
			})
			.await
	}

	async fn subscribe_changes(&self, tx: mpsc::Sender<Event>) -> Result<(), StoreError> {
		debug!("subscribing to change events");
		loop {
			let batch: Vec<(String, Event)> = self
				.with_db(|db| {
					let mut stmt = db
						.prepare(&format!(
							"SELECT id, type, resource, object_id FROM events ORDER BY created_at, id LIMIT {POLL_BATCH}"
						))
						.map_err(db_err)?;
					let rows = stmt
						.query_map([], |row| {
							let id: String = row.get(0)?;
							let event_type: String = row.get(1)?;
							let resource: String = row.get(2)?;
							let object_id: String = row.get(3)?;
							Ok((id, event_type, resource, object_id))
						})
						.map_err(db_err)?
						.collect::<Result<Vec<_>, _>>()
						.map_err(db_err)?;
					let mut batch = Vec::with_capacity(rows.len());
					for (id, event_type, resource, object_id) in rows {
						batch.push((
							id,
							Event {
								event_type: parse_kind(&event_type)?,
								resource: parse_resource(&resource)?,
								object_id,
							},
						));
					}
					Ok(batch)
				})
				.await?;
			if batch.is_empty() {
				tokio::select! {
					// The subscriber went away; end the subscription cleanly.
					_ = tx.closed() => return Ok(()),
					_ = tokio::time::sleep(POLL_INTERVAL) => {},
				}
				continue;
			}
			for (row_id, event) in batch {
				if tx.send(event).await.is_err() {
					return Ok(());
				}
				// Deleted only after delivery: at-least-once.
				self
					.with_db(move |db| {
						db.execute("DELETE FROM events WHERE id = ?1", params![row_id])
							.map_err(db_err)?;
						Ok(())
					})
					.await?;
			}
		}
	}

	async fn status(&self) -> Result<(), StoreError> {
		self
			.with_db(|db| {
				db.query_row("SELECT 1", [], |_| Ok(())).map_err(db_err)?;
				Ok(())
			})
			.await
	}
}

const CONNECTION_SELECT: &str = "SELECT id, user_id, name, token, hostname, secure, basic_auth_hash, gateway_url, ttl_ms, last_used_at, created_at, updated_at FROM connections";

fn row_to_connection(row: &rusqlite::Row<'_>) -> rusqlite::Result<Connection> {
	Ok(Connection {
		id: strng::new(row.get::<_, String>(0)?),
		user_id: strng::new(row.get::<_, String>(1)?),
		name: row.get(2)?,
		token: strng::new(row.get::<_, String>(3)?),
		hostname: row.get(4)?,
		secure: row.get::<_, i64>(5)? != 0,
		basic_auth_hash: row.get(6)?,
		gateway_url: row.get(7)?,
		ttl: Duration::from_millis(row.get::<_, i64>(8)?.max(0) as u64),
		last_used_at: from_millis(row.get(9)?),
		created_at: from_millis(row.get(10)?),
		updated_at: from_millis(row.get(11)?),
	})
}

fn row_to_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
	Ok(User {
		id: strng::new(row.get::<_, String>(0)?),
		email: row.get(1)?,
		created_at: from_millis(row.get(2)?),
		updated_at: from_millis(row.get(3)?),
	})
}

fn insert_event(
	tx: &rusqlite::Transaction<'_>,
	event_type: EventType,
	resource: EventResource,
	object_id: &str,
) -> Result<(), StoreError> {
	tx.execute(
		"INSERT INTO events (id, type, resource, object_id, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
		params![
			Uuid::new_v4().to_string(),
			kind_str(event_type),
			resource_str(resource),
			object_id,
			to_millis(SystemTime::now()),
		],
	)
	.map_err(db_err)?;
	Ok(())
}

fn kind_str(event_type: EventType) -> &'static str {
	match event_type {
		EventType::Created => "created",
		EventType::Updated => "updated",
		EventType::Deleted => "deleted",
	}
}

fn parse_kind(raw: &str) -> Result<EventType, StoreError> {
	match raw {
		"created" => Ok(EventType::Created),
		"updated" => Ok(EventType::Updated),
		"deleted" => Ok(EventType::Deleted),
		other => Err(StoreError::Backend(format!("unknown event type {other:?}"))),
	}
}

fn resource_str(resource: EventResource) -> &'static str {
	match resource {
		EventResource::Connection => "connection",
		EventResource::User => "user",
	}
}

fn parse_resource(raw: &str) -> Result<EventResource, StoreError> {
	match raw {
		"connection" => Ok(EventResource::Connection),
		"user" => Ok(EventResource::User),
		other => Err(StoreError::Backend(format!("unknown event resource {other:?}"))),
	}
}

fn to_millis(t: SystemTime) -> i64 {
	t.duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as i64
}

fn from_millis(ms: i64) -> SystemTime {
	UNIX_EPOCH + Duration::from_millis(ms.max(0) as u64)
}

fn db_err(err: rusqlite::Error) -> StoreError {
	if let rusqlite::Error::SqliteFailure(e, msg) = &err
		&& e.code == rusqlite::ErrorCode::ConstraintViolation
	{
		let msg = msg.as_deref().unwrap_or_default();
		return if msg.contains("hostname") {
			StoreError::Conflict("hostname")
		} else if msg.contains("token") {
			StoreError::Conflict("token")
		} else if msg.contains("email") {
			StoreError::Conflict("email")
		} else {
			StoreError::Conflict("connection name")
		};
	}
	StoreError::Backend(err.to_string())
}
