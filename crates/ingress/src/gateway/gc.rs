use std::time::SystemTime;

use faros_core::prelude::*;
use tokio::time::MissedTickBehavior;

use crate::store::Store;

/// Periodically deletes connections whose idle lifetime elapsed. A zero ttl
/// means the connection never expires. Deletions propagate through the change
/// stream, so caches and live tunnels are torn down by the sync loops.
pub async fn run(store: Arc<dyn Store>, interval: Duration) {
	let mut ticker = tokio::time::interval(interval);
	ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
	loop {
		ticker.tick().await;
		sweep(store.as_ref()).await;
	}
}

async fn sweep(store: &dyn Store) {
	let now = SystemTime::now();
	let conns = match store.list_all_connections().await {
		Ok(conns) => conns,
		Err(err) => {
			warn!(%err, "garbage collector failed to list connections");
			return;
		},
	};
	for conn in conns {
		if !conn.expired(now) {
			continue;
		}
		info!(id = %conn.id, hostname = conn.routing_hostname(), "deleting expired connection");
		if let Err(err) = store.delete_connection(&conn.id).await {
			warn!(id = %conn.id, %err, "failed to delete expired connection");
		}
	}
}
