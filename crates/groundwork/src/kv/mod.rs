//! The byte-level key-value capability consumed by components that only need
//! get/set/delete with optional expiry, such as the KV-backed nonce store.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::RwLock;
use thiserror::Error;

use crate::*;

#[derive(Debug, Error)]
pub enum StoreError {
	#[error("backend failure: {0}")]
	Backend(anyhow::Error),
}

#[async_trait]
pub trait Store: Send + Sync {
	/// Returns `None` when the key is absent or expired.
	async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError>;
	async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError>;
	/// Sets a value that expires after `ttl`.
	async fn set_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError>;
	/// Atomic test-and-set: returns true iff the key was absent and is now
	/// set. This is the primitive replay defenses build on.
	async fn set_if_absent(
		&self,
		key: &str,
		value: Bytes,
		ttl: Option<Duration>,
	) -> Result<bool, StoreError>;
	async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// In-process implementation. Expiry is checked on access; there is no
/// background sweeper.
#[derive(Default)]
pub struct MemoryStore {
	entries: RwLock<HashMap<String, Entry>>,
}

struct Entry {
	value: Bytes,
	expires_at: Option<Instant>,
}

impl Entry {
	fn live(&self, now: Instant) -> bool {
		self.expires_at.is_none_or(|at| now < at)
	}
}

impl MemoryStore {
	pub fn new() -> MemoryStore {
		MemoryStore::default()
	}
}

#[async_trait]
impl Store for MemoryStore {
	async fn get(&self, key: &str) -> Result<Option<Bytes>, StoreError> {
		let entries = self.entries.read();
		Ok(
			entries
				.get(key)
				.filter(|entry| entry.live(Instant::now()))
				.map(|entry| entry.value.clone()),
		)
	}

	async fn set(&self, key: &str, value: Bytes) -> Result<(), StoreError> {
		self.entries.write().insert(
			key.to_string(),
			Entry {
				value,
				expires_at: None,
			},
		);
		Ok(())
	}

	async fn set_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), StoreError> {
		self.entries.write().insert(
			key.to_string(),
			Entry {
				value,
				expires_at: Some(Instant::now() + ttl),
			},
		);
		Ok(())
	}

	async fn set_if_absent(
		&self,
		key: &str,
		value: Bytes,
		ttl: Option<Duration>,
	) -> Result<bool, StoreError> {
		let now = Instant::now();
		let mut entries = self.entries.write();
		if entries.get(key).is_some_and(|entry| entry.live(now)) {
			return Ok(false);
		}
		entries.insert(
			key.to_string(),
			Entry {
				value,
				expires_at: ttl.map(|ttl| now + ttl),
			},
		);
		Ok(true)
	}

	async fn delete(&self, key: &str) -> Result<(), StoreError> {
		self.entries.write().remove(key);
		Ok(())
	}
}
