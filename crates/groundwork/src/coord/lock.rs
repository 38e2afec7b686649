use etcd_client::LockOptions;
use tokio::task::JoinHandle;

use crate::coord::{Client, Error};
use crate::*;

/// Lease TTL backing a lock session. If the holder dies without unlocking,
/// the lock frees itself once the lease lapses.
const SESSION_TTL_SECONDS: i64 = 60;

const DEFAULT_TRY_LOCK_TIMEOUT: Duration = Duration::from_millis(1);

impl Client {
	/// Creates a lock handle over `name`, backed by its own session lease.
	/// The lease is kept alive by a background task for as long as the handle
	/// lives; [`Lock::close`] ends the session and releases any held lock.
	pub async fn new_lock(&self, name: &str) -> Result<Lock, Error> {
		let lease_id = self.lease(SESSION_TTL_SECONDS).await?;
		let mut keep_alive = self.keep_alive(lease_id).await?;
		let renewer = tokio::spawn(async move {
			let interval = Duration::from_secs(SESSION_TTL_SECONDS as u64 / 3);
			loop {
				tokio::time::sleep(interval).await;
				if let Err(err) = keep_alive.renew().await {
					debug!(%err, "lock session keep-alive ended");
					return;
				}
			}
		});
		Ok(Lock {
			etcd: self.etcd.clone(),
			name: self.key(name),
			lease_id,
			renewer,
			lock_key: None,
		})
	}
}

/// Mutual exclusion across processes, keyed by a lock path. Exactly one
/// session holds the lock at a time; a crashed holder is evicted when its
/// session lease expires.
pub struct Lock {
	etcd: etcd_client::Client,
	name: String,
	lease_id: i64,
	renewer: JoinHandle<()>,
	lock_key: Option<Vec<u8>>,
}

impl Lock {
	/// Blocks until the lock is acquired. Acquiring a lock this handle
	/// already holds is a no-op.
	pub async fn lock(&mut self) -> Result<(), Error> {
		if self.lock_key.is_some() {
			return Ok(());
		}
		let options = LockOptions::new().with_lease(self.lease_id);
		let mut etcd = self.etcd.clone();
		let response = etcd.lock(self.name.as_str(), Some(options)).await?;
		self.lock_key = Some(response.key().to_vec());
		Ok(())
	}

	/// Attempts to acquire the lock, waiting at most `timeout` (about a
	/// millisecond by default). `Ok(false)` means the lock is held by another
	/// session; transport failures surface as errors.
	pub async fn try_lock(&mut self, timeout: Option<Duration>) -> Result<bool, Error> {
		if self.lock_key.is_some() {
			return Ok(true);
		}
		let wait = timeout.unwrap_or(DEFAULT_TRY_LOCK_TIMEOUT);
		let options = LockOptions::new().with_lease(self.lease_id);
		let mut etcd = self.etcd.clone();
		match tokio::time::timeout(wait, etcd.lock(self.name.as_str(), Some(options))).await {
			Ok(Ok(response)) => {
				self.lock_key = Some(response.key().to_vec());
				Ok(true)
			},
			Ok(Err(err)) => Err(err.into()),
			Err(_) => Ok(false),
		}
	}

	/// Releases the lock. Unlocking a lock that is not held is a no-op.
	pub async fn unlock(&mut self) -> Result<(), Error> {
		let Some(key) = self.lock_key.clone() else {
			return Ok(());
		};
		let mut etcd = self.etcd.clone();
		etcd.unlock(key).await?;
		self.lock_key = None;
		Ok(())
	}

	/// Whether this handle believes it holds the lock. Local state only; it
	/// does not round-trip to the backend.
	pub fn is_locked(&self) -> bool {
		self.lock_key.is_some()
	}

	/// Ends the session: stops lease renewal and revokes the lease, which
	/// releases any held lock on the backend.
	pub async fn close(mut self) -> Result<(), Error> {
		self.renewer.abort();
		let _ = self.unlock().await;
		let mut etcd = self.etcd.clone();
		etcd.lease_revoke(self.lease_id).await?;
		Ok(())
	}
}

impl Drop for Lock {
	fn drop(&mut self) {
		// Without renewal the lease, and with it any held lock, lapses after
		// the session TTL even if close() was never called.
		self.renewer.abort();
	}
}

impl Debug for Lock {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Lock")
			.field("name", &self.name)
			.field("locked", &self.is_locked())
			.finish_non_exhaustive()
	}
}
