use std::collections::HashMap;

use async_trait::async_trait;
use faros_core::prelude::*;

use crate::config::ApiToken;
use crate::store::{Store, StoreError, User};

/// Resolves API bearer tokens to users.
///
/// This is the seam where an identity provider integration plugs in; the
/// in-tree implementation maps statically configured tokens to user emails.
#[async_trait]
pub trait Authenticator: Send + Sync + 'static {
	/// Returns the user the token belongs to, or `None` for unknown tokens.
	async fn authenticate(&self, token: &str) -> Result<Option<User>, StoreError>;
}

/// Token list from configuration. Users are created on first use, the same
/// way a login callback would register them.
pub struct StaticTokenAuthenticator {
	store: Arc<dyn Store>,
	tokens: HashMap<String, String>,
}

impl StaticTokenAuthenticator {
	pub fn new(store: Arc<dyn Store>, tokens: &[ApiToken]) -> StaticTokenAuthenticator {
		StaticTokenAuthenticator {
			store,
			tokens: tokens
				.iter()
				.map(|t| (t.token.clone(), t.email.clone()))
				.collect(),
		}
	}
}

#[async_trait]
impl Authenticator for StaticTokenAuthenticator {
	async fn authenticate(&self, token: &str) -> Result<Option<User>, StoreError> {
		let Some(email) = self.tokens.get(token) else {
			return Ok(None);
		};
		match self.store.get_user_by_email(email).await {
			Ok(user) => Ok(Some(user)),
			Err(StoreError::NotFound) => match self.store.create_user(email).await {
				Ok(user) => Ok(Some(user)),
				// Concurrent first use of the same token.
				Err(StoreError::Conflict(_)) => self.store.get_user_by_email(email).await.map(Some),
				Err(err) => Err(err),
			},
			Err(err) => Err(err),
		}
	}
}

#[cfg(test)]
mod tests {
	use crate::store::MemoryStore;

	use super::*;

	#[tokio::test]
	async fn resolves_and_creates_users() {
		let store = Arc::new(MemoryStore::new());
		let auth = StaticTokenAuthenticator::new(
			store.clone() as Arc<dyn Store>,
			&[ApiToken {
				token: "secret".to_string(),
				email: "dev@example.com".to_string(),
			}],
		);
		assert!(auth.authenticate("nope").await.unwrap().is_none());
		let first = auth.authenticate("secret").await.unwrap().unwrap();
		assert_eq!(first.email, "dev@example.com");
		// Second call resolves the same user instead of creating a new one.
		let second = auth.authenticate("secret").await.unwrap().unwrap();
		assert_eq!(first.id, second.id);
		assert_eq!(store.list_users().await.unwrap().len(), 1);
	}
}
