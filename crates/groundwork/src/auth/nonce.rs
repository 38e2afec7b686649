use std::collections::{HashSet, VecDeque};

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::kv;
use crate::*;

#[derive(Debug, Error)]
pub enum NonceError {
	#[error("nonce store failure: {0}")]
	Store(#[from] kv::StoreError),
}

/// Replay defense: a bounded, TTL-expiring set with atomic test-and-insert.
#[async_trait]
pub trait NonceStore: Send + Sync {
	/// Records `nonce`, returning true iff it was not already live. After a
	/// successful insert, every further call with the same nonce returns
	/// false until the nonce expires or is evicted.
	async fn add_if_not_exists(&self, nonce: &str) -> Result<bool, NonceError>;
}

/// In-process store: a mutex-guarded set plus a FIFO insertion queue.
/// Expired entries are swept from the queue head on each access; when the
/// cap is reached the oldest live nonce is evicted.
pub struct MemoryNonceStore {
	ttl: Duration,
	max_size: usize,
	inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
	live: HashSet<String>,
	order: VecDeque<(String, Instant)>,
}

impl MemoryNonceStore {
	pub fn new(ttl: Duration, max_size: usize) -> MemoryNonceStore {
		MemoryNonceStore {
			ttl,
			max_size: max_size.max(1),
			inner: Mutex::new(Inner::default()),
		}
	}
}

#[async_trait]
impl NonceStore for MemoryNonceStore {
	async fn add_if_not_exists(&self, nonce: &str) -> Result<bool, NonceError> {
		let now = Instant::now();
		let mut inner = self.inner.lock();

		while inner
			.order
			.front()
			.is_some_and(|(_, inserted)| now.duration_since(*inserted) >= self.ttl)
		{
			if let Some((expired, _)) = inner.order.pop_front() {
				inner.live.remove(&expired);
			}
		}

		if inner.live.contains(nonce) {
			return Ok(false);
		}

		if inner.order.len() >= self.max_size {
			if let Some((evicted, _)) = inner.order.pop_front() {
				inner.live.remove(&evicted);
			}
		}

		inner.live.insert(nonce.to_string());
		inner.order.push_back((nonce.to_string(), now));
		Ok(true)
	}
}

/// Store backed by the KV capability. Insertion is the backend's atomic
/// `set_if_absent` with TTL; a backend failure rejects the nonce rather than
/// letting a possibly-replayed request through.
pub struct KvNonceStore {
	store: Arc<dyn kv::Store>,
	ttl: Duration,
	prefix: String,
}

const DEFAULT_PREFIX: &str = "nonce/";

impl KvNonceStore {
	pub fn new(store: Arc<dyn kv::Store>, ttl: Duration) -> KvNonceStore {
		KvNonceStore {
			store,
			ttl,
			prefix: DEFAULT_PREFIX.to_string(),
		}
	}

	pub fn with_prefix(mut self, prefix: &str) -> KvNonceStore {
		self.prefix = prefix.to_string();
		self
	}
}

#[async_trait]
impl NonceStore for KvNonceStore {
	async fn add_if_not_exists(&self, nonce: &str) -> Result<bool, NonceError> {
		let key = format!("{}{}", self.prefix, nonce);
		match self
			.store
			.set_if_absent(&key, Bytes::from_static(b"1"), Some(self.ttl))
			.await
		{
			Ok(inserted) => Ok(inserted),
			Err(err) => {
				warn!(%err, "nonce store backend failed, rejecting nonce");
				Ok(false)
			},
		}
	}
}
