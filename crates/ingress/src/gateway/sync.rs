use faros_core::prelude::*;
use tokio::sync::mpsc;

use super::auth::AuthCache;
use super::pool::ReversePool;
use crate::store::{Event, EventResource, EventType, Store, StoreError};

/// How long to wait before resubscribing after the change stream fails.
const RESUBSCRIBE_DELAY: Duration = Duration::from_secs(1);

/// The gateway's sync loop: one full reload plus change subscription that
/// keeps both the auth cache (hostname routing) and the tunnel pool (token
/// allowlist) consistent with the store.
///
/// Events can be lost across resubscribes, so every (re)subscribe starts with
/// a full reload.
pub(crate) async fn run(store: Arc<dyn Store>, pool: Arc<ReversePool>, auth: Arc<AuthCache>) {
	loop {
		match store.list_all_connections().await {
			Ok(conns) => {
				pool.reload(&conns);
				auth.reload(conns);
			},
			Err(err) => {
				warn!(%err, "failed to load connections, retrying");
				tokio::time::sleep(RESUBSCRIBE_DELAY).await;
				continue;
			},
		}
		debug!("subscribing to store changes");
		let (tx, mut rx) = mpsc::channel(32);
		let sub_store = store.clone();
		let subscription = tokio::spawn(async move { sub_store.subscribe_changes(tx).await });
		while let Some(event) = rx.recv().await {
			apply_event(store.as_ref(), &pool, &auth, event).await;
		}
		if let Ok(Err(err)) = subscription.await {
			warn!(%err, "change subscription failed");
		}
		tokio::time::sleep(RESUBSCRIBE_DELAY).await;
	}
}

async fn apply_event(store: &dyn Store, pool: &ReversePool, auth: &AuthCache, event: Event) {
	if event.resource != EventResource::Connection {
		return;
	}
	trace!(?event, "applying change event");
	match event.event_type {
		EventType::Created | EventType::Updated => match store.get_connection(&event.object_id).await
		{
			Ok(conn) => {
				pool.authorize(conn.id.clone(), conn.token.clone());
				auth.insert(conn);
			},
			// Deleted between the event and the re-read.
			Err(StoreError::NotFound) => {
				pool.revoke(&event.object_id);
				auth.remove(&event.object_id);
			},
			Err(err) => {
				warn!(object_id = %event.object_id, %err, "failed to re-read connection");
			},
		},
		EventType::Deleted => {
			pool.revoke(&event.object_id);
			auth.remove(&event.object_id);
		},
	}
}
