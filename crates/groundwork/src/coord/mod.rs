//! Client for a strongly-consistent, transactional KV backend (etcd), with
//! optional transparent value encryption, leases, watches, and a distributed
//! lock primitive.

mod codec;
mod config;
mod lock;

use std::collections::HashMap;

use async_trait::async_trait;
use etcd_client::{
	Compare, CompareOp, ConnectOptions, DeleteOptions, EventType, GetOptions, LeaseKeepAliveStream,
	LeaseKeeper, PutOptions, Txn, TxnOp, TxnOpResponse, WatchOptions, WatchStream, Watcher,
};
use secrecy::ExposeSecret;
use thiserror::Error;

pub use codec::{Aes256Gcm, CodecError, Identity, ValueCodec};
pub use config::{Config, ConfigError, TlsConfig};
pub use lock::Lock;

use crate::kv;
use crate::*;

#[derive(Debug, Error)]
pub enum Error {
	#[error("invalid configuration: {0}")]
	Config(#[from] ConfigError),
	#[error("key not found: {0}")]
	NotFound(String),
	#[error("request timed out")]
	Timeout,
	#[error("value could not be encrypted: {0}")]
	Encrypt(#[source] CodecError),
	#[error("value could not be decrypted: {0}")]
	Decrypt(#[source] CodecError),
	#[error("stream closed by backend")]
	Closed,
	#[error("backend error: {0}")]
	Backend(#[from] etcd_client::Error),
}

#[derive(Clone)]
pub struct Client {
	etcd: etcd_client::Client,
	codec: Arc<dyn ValueCodec>,
	request_timeout: Duration,
	namespace: String,
}

impl Debug for Client {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Client")
			.field("namespace", &self.namespace)
			.finish_non_exhaustive()
	}
}

impl Client {
	pub async fn connect(config: Config) -> Result<Client, Error> {
		config.validate().map_err(Error::Config)?;

		let mut options = ConnectOptions::new()
			.with_connect_timeout(config.dial_timeout)
			.with_keep_alive(config.keep_alive_time, config.keep_alive_timeout)
			.with_keep_alive_while_idle(true)
			.with_timeout(config.request_timeout);
		if let Some(username) = &config.username {
			let password = config
				.password
				.as_ref()
				.map(|p| p.expose_secret().to_string())
				.unwrap_or_default();
			options = options.with_user(username, password);
		}
		if let Some(tls) = &config.tls {
			options = options.with_tls(tls.load().map_err(Error::Config)?);
		}

		let etcd = etcd_client::Client::connect(&config.endpoints, Some(options)).await?;
		let codec: Arc<dyn ValueCodec> = match &config.encryption_key {
			Some(key) => Arc::new(Aes256Gcm::new(key.expose_secret().as_bytes())),
			None => Arc::new(Identity),
		};
		Ok(Client {
			etcd,
			codec,
			request_timeout: config.request_timeout,
			namespace: config.namespace.unwrap_or_default(),
		})
	}

	fn key(&self, key: &str) -> String {
		format!("{}{}", self.namespace, key)
	}

	fn strip(&self, key: &str) -> String {
		key.strip_prefix(&self.namespace).unwrap_or(key).to_string()
	}

	async fn bounded<T>(
		&self,
		operation: impl Future<Output = Result<T, etcd_client::Error>>,
	) -> Result<T, Error> {
		match tokio::time::timeout(self.request_timeout, operation).await {
			Ok(result) => Ok(result?),
			Err(_) => Err(Error::Timeout),
		}
	}

	/// Writes `value` under `key`. Returns the backend revision of the write.
	pub async fn put(&self, key: &str, value: impl AsRef<[u8]>) -> Result<i64, Error> {
		self.put_opts(key, value, None).await
	}

	/// Writes a key that is deleted automatically when `lease_id` expires.
	pub async fn put_with_lease(
		&self,
		key: &str,
		value: impl AsRef<[u8]>,
		lease_id: i64,
	) -> Result<i64, Error> {
		self
			.put_opts(key, value, Some(PutOptions::new().with_lease(lease_id)))
			.await
	}

	async fn put_opts(
		&self,
		key: &str,
		value: impl AsRef<[u8]>,
		options: Option<PutOptions>,
	) -> Result<i64, Error> {
		let sealed = self.codec.seal(value.as_ref()).map_err(Error::Encrypt)?;
		let mut etcd = self.etcd.clone();
		let response = self.bounded(etcd.put(self.key(key), sealed, options)).await?;
		Ok(response.header().map(|h| h.revision()).unwrap_or_default())
	}

	pub async fn get(&self, key: &str) -> Result<Vec<u8>, Error> {
		let mut etcd = self.etcd.clone();
		let response = self.bounded(etcd.get(self.key(key), None)).await?;
		let Some(kv) = response.kvs().first() else {
			return Err(Error::NotFound(key.to_string()));
		};
		self.codec.open(kv.value()).map_err(Error::Decrypt)
	}

	/// Reads `key` as it was at the given backend revision.
	pub async fn get_with_revision(&self, key: &str, revision: i64) -> Result<Vec<u8>, Error> {
		let mut etcd = self.etcd.clone();
		let options = GetOptions::new().with_revision(revision);
		let response = self.bounded(etcd.get(self.key(key), Some(options))).await?;
		let Some(kv) = response.kvs().first() else {
			return Err(Error::NotFound(key.to_string()));
		};
		self.codec.open(kv.value()).map_err(Error::Decrypt)
	}

	/// Returns every key/value pair in the half-open interval `[start, end)`.
	pub async fn get_range(&self, start: &str, end: &str) -> Result<Vec<(String, Vec<u8>)>, Error> {
		let mut etcd = self.etcd.clone();
		let options = GetOptions::new().with_range(self.key(end));
		let response = self.bounded(etcd.get(self.key(start), Some(options))).await?;
		let mut pairs = Vec::with_capacity(response.kvs().len());
		for kv in response.kvs() {
			let value = self.codec.open(kv.value()).map_err(Error::Decrypt)?;
			pairs.push((self.strip(kv.key_str()?), value));
		}
		Ok(pairs)
	}

	/// Returns every key/value pair whose key starts with `prefix`.
	pub async fn get_prefix(&self, prefix: &str) -> Result<HashMap<String, Vec<u8>>, Error> {
		let mut etcd = self.etcd.clone();
		let options = GetOptions::new().with_prefix();
		let response = self.bounded(etcd.get(self.key(prefix), Some(options))).await?;
		let mut pairs = HashMap::with_capacity(response.kvs().len());
		for kv in response.kvs() {
			let value = self.codec.open(kv.value()).map_err(Error::Decrypt)?;
			pairs.insert(self.strip(kv.key_str()?), value);
		}
		Ok(pairs)
	}

	/// Lists keys under `prefix` without transferring values.
	pub async fn list(&self, prefix: &str) -> Result<Vec<String>, Error> {
		let mut etcd = self.etcd.clone();
		let options = GetOptions::new().with_prefix().with_keys_only();
		let response = self.bounded(etcd.get(self.key(prefix), Some(options))).await?;
		let mut keys = Vec::with_capacity(response.kvs().len());
		for kv in response.kvs() {
			keys.push(self.strip(kv.key_str()?));
		}
		Ok(keys)
	}

	/// Deletes `key`, returning how many keys were removed (0 or 1).
	pub async fn delete(&self, key: &str) -> Result<i64, Error> {
		let mut etcd = self.etcd.clone();
		let response = self.bounded(etcd.delete(self.key(key), None)).await?;
		Ok(response.deleted())
	}

	/// Deletes every key under `prefix`, returning the number removed.
	pub async fn delete_prefix(&self, prefix: &str) -> Result<i64, Error> {
		let mut etcd = self.etcd.clone();
		let options = DeleteOptions::new().with_prefix();
		let response = self
			.bounded(etcd.delete(self.key(prefix), Some(options)))
			.await?;
		Ok(response.deleted())
	}

	/// Count-only query; no value bytes cross the wire.
	pub async fn exists(&self, key: &str) -> Result<bool, Error> {
		let mut etcd = self.etcd.clone();
		let options = GetOptions::new().with_count_only();
		let response = self.bounded(etcd.get(self.key(key), Some(options))).await?;
		Ok(response.count() > 0)
	}

	/// Counts keys under `prefix` without transferring them.
	pub async fn count(&self, prefix: &str) -> Result<i64, Error> {
		let mut etcd = self.etcd.clone();
		let options = GetOptions::new().with_prefix().with_count_only();
		let response = self.bounded(etcd.get(self.key(prefix), Some(options))).await?;
		Ok(response.count())
	}

	/// Atomically writes `value` only if `key` does not exist yet. Returns
	/// true when this call created the key.
	pub async fn put_if_not_exists(&self, key: &str, value: impl AsRef<[u8]>) -> Result<bool, Error> {
		self.put_if_not_exists_opts(key, value, None).await
	}

	async fn put_if_not_exists_opts(
		&self,
		key: &str,
		value: impl AsRef<[u8]>,
		lease_id: Option<i64>,
	) -> Result<bool, Error> {
		let sealed = self.codec.seal(value.as_ref()).map_err(Error::Encrypt)?;
		let key = self.key(key);
		let put_options = lease_id.map(|id| PutOptions::new().with_lease(id));
		let txn = Txn::new()
			.when(vec![Compare::create_revision(
				key.clone(),
				CompareOp::Equal,
				0,
			)])
			.and_then(vec![TxnOp::put(key, sealed, put_options)]);
		let mut etcd = self.etcd.clone();
		let response = self.bounded(etcd.txn(txn)).await?;
		Ok(response.succeeded())
	}

	/// Atomically replaces the value of `key` with `new` only if its current
	/// value equals `old`. With encryption enabled equal plaintexts do not
	/// produce equal ciphertexts, so the comparison happens client-side and
	/// the swap is guarded by the observed mod revision.
	pub async fn compare_and_swap(
		&self,
		key: &str,
		old: impl AsRef<[u8]>,
		new: impl AsRef<[u8]>,
	) -> Result<bool, Error> {
		let namespaced = self.key(key);
		let mut etcd = self.etcd.clone();
		let response = self.bounded(etcd.get(namespaced.clone(), None)).await?;
		let Some(kv) = response.kvs().first() else {
			return Ok(false);
		};
		let current = self.codec.open(kv.value()).map_err(Error::Decrypt)?;
		if current != old.as_ref() {
			return Ok(false);
		}

		let sealed = self.codec.seal(new.as_ref()).map_err(Error::Encrypt)?;
		let txn = Txn::new()
			.when(vec![Compare::mod_revision(
				namespaced.clone(),
				CompareOp::Equal,
				kv.mod_revision(),
			)])
			.and_then(vec![TxnOp::put(namespaced, sealed, None)]);
		let response = self.bounded(etcd.txn(txn)).await?;
		Ok(response.succeeded())
	}

	/// Writes every entry in one transaction; either all land or none do.
	pub async fn bulk_put<I, K, V>(&self, entries: I) -> Result<(), Error>
	where
		I: IntoIterator<Item = (K, V)>,
		K: AsRef<str>,
		V: AsRef<[u8]>,
	{
		let mut operations = Vec::new();
		for (key, value) in entries {
			let sealed = self.codec.seal(value.as_ref()).map_err(Error::Encrypt)?;
			operations.push(TxnOp::put(self.key(key.as_ref()), sealed, None));
		}
		if operations.is_empty() {
			return Ok(());
		}
		let mut etcd = self.etcd.clone();
		self
			.bounded(etcd.txn(Txn::new().and_then(operations)))
			.await?;
		Ok(())
	}

	/// Deletes every key in one transaction, returning the total removed.
	pub async fn bulk_delete<I, K>(&self, keys: I) -> Result<i64, Error>
	where
		I: IntoIterator<Item = K>,
		K: AsRef<str>,
	{
		let operations: Vec<TxnOp> = keys
			.into_iter()
			.map(|key| TxnOp::delete(self.key(key.as_ref()), None))
			.collect();
		if operations.is_empty() {
			return Ok(0);
		}
		let mut etcd = self.etcd.clone();
		let response = self
			.bounded(etcd.txn(Txn::new().and_then(operations)))
			.await?;
		let mut deleted = 0;
		for op in response.op_responses() {
			if let TxnOpResponse::Delete(delete) = op {
				deleted += delete.deleted();
			}
		}
		Ok(deleted)
	}

	/// Watches a single key. Events arrive in revision order; the watch is
	/// cancelled when the returned handle is dropped.
	pub async fn watch(&self, key: &str) -> Result<Watch, Error> {
		self.watch_opts(key, None).await
	}

	/// Watches every key under `prefix`.
	pub async fn watch_prefix(&self, prefix: &str) -> Result<Watch, Error> {
		self
			.watch_opts(prefix, Some(WatchOptions::new().with_prefix()))
			.await
	}

	async fn watch_opts(&self, key: &str, options: Option<WatchOptions>) -> Result<Watch, Error> {
		let mut etcd = self.etcd.clone();
		let (watcher, stream) = self.bounded(etcd.watch(self.key(key), options)).await?;
		Ok(Watch {
			watcher,
			stream,
			codec: self.codec.clone(),
			namespace: self.namespace.clone(),
		})
	}

	/// Grants a lease living for `ttl_seconds`; returns the lease id.
	pub async fn lease(&self, ttl_seconds: i64) -> Result<i64, Error> {
		let mut etcd = self.etcd.clone();
		let response = self.bounded(etcd.lease_grant(ttl_seconds, None)).await?;
		Ok(response.id())
	}

	/// Opens the keep-alive channel for a lease. The caller drives renewal by
	/// calling [`KeepAlive::renew`]; an unconsumed handle lets the lease lapse.
	pub async fn keep_alive(&self, lease_id: i64) -> Result<KeepAlive, Error> {
		let mut etcd = self.etcd.clone();
		let (keeper, responses) = self.bounded(etcd.lease_keep_alive(lease_id)).await?;
		Ok(KeepAlive { keeper, responses })
	}

	/// Revokes a lease immediately; keys bound to it are deleted.
	pub async fn revoke_lease(&self, lease_id: i64) -> Result<(), Error> {
		let mut etcd = self.etcd.clone();
		self.bounded(etcd.lease_revoke(lease_id)).await?;
		Ok(())
	}

	/// Copies `from` to `to`, then deletes `from`. This is get/put/delete,
	/// not a transaction: a crash between steps can leave both keys present.
	/// Callers needing atomicity should compose their own transaction.
	pub async fn move_key(&self, from: &str, to: &str) -> Result<(), Error> {
		let value = self.get(from).await?;
		self.put(to, &value).await?;
		self.delete(from).await?;
		Ok(())
	}

	/// Reclaims backend storage for revisions below `revision`.
	pub async fn compact_revision(&self, revision: i64) -> Result<(), Error> {
		let mut etcd = self.etcd.clone();
		self.bounded(etcd.compact(revision, None)).await?;
		Ok(())
	}

	/// Backend server status: (version, database size in bytes).
	pub async fn status(&self) -> Result<(String, i64), Error> {
		let mut etcd = self.etcd.clone();
		let response = self.bounded(etcd.status()).await?;
		Ok((response.version().to_string(), response.db_size()))
	}

	/// Names of the cluster members.
	pub async fn member_list(&self) -> Result<Vec<String>, Error> {
		let mut etcd = self.etcd.clone();
		let response = self.bounded(etcd.member_list()).await?;
		Ok(
			response
				.members()
				.iter()
				.map(|member| member.name().to_string())
				.collect(),
		)
	}
}

/// An active watch. Dropping it cancels the watch on the backend.
pub struct Watch {
	watcher: Watcher,
	stream: WatchStream,
	codec: Arc<dyn ValueCodec>,
	namespace: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
	Put,
	Delete,
}

#[derive(Debug, Clone)]
pub struct Event {
	pub kind: EventKind,
	pub key: String,
	/// Empty for delete events.
	pub value: Vec<u8>,
}

impl Watch {
	/// Waits for the next batch of events. Returns `None` when the watch is
	/// closed or cancelled.
	pub async fn recv(&mut self) -> Result<Option<Vec<Event>>, Error> {
		loop {
			let Some(response) = self.stream.message().await? else {
				return Ok(None);
			};
			if response.canceled() {
				return Ok(None);
			}
			// creation acks and progress notifies carry no events
			if response.events().is_empty() {
				continue;
			}
			let mut events = Vec::with_capacity(response.events().len());
			for event in response.events() {
				let Some(kv) = event.kv() else { continue };
				let kind = match event.event_type() {
					EventType::Put => EventKind::Put,
					EventType::Delete => EventKind::Delete,
				};
				let value = match kind {
					EventKind::Put => self.codec.open(kv.value()).map_err(Error::Decrypt)?,
					EventKind::Delete => Vec::new(),
				};
				let key = kv.key_str()?;
				events.push(Event {
					kind,
					key: key.strip_prefix(&self.namespace).unwrap_or(key).to_string(),
					value,
				});
			}
			return Ok(Some(events));
		}
	}

	pub async fn cancel(&mut self) -> Result<(), Error> {
		self.watcher.cancel().await?;
		Ok(())
	}
}

/// Caller-driven lease renewal.
pub struct KeepAlive {
	keeper: LeaseKeeper,
	responses: LeaseKeepAliveStream,
}

impl KeepAlive {
	/// Sends one keep-alive and waits for the ack; returns the remaining TTL
	/// in seconds.
	pub async fn renew(&mut self) -> Result<i64, Error> {
		self.keeper.keep_alive().await?;
		match self.responses.message().await? {
			Some(response) => Ok(response.ttl()),
			None => Err(Error::Closed),
		}
	}
}

// The coordination backend doubles as the byte-level KV capability, so it can
// back the KV nonce store directly.
#[async_trait]
impl kv::Store for Client {
	async fn get(&self, key: &str) -> Result<Option<Bytes>, kv::StoreError> {
		match Client::get(self, key).await {
			Ok(value) => Ok(Some(value.into())),
			Err(Error::NotFound(_)) => Ok(None),
			Err(err) => Err(kv::StoreError::Backend(err.into())),
		}
	}

	async fn set(&self, key: &str, value: Bytes) -> Result<(), kv::StoreError> {
		self
			.put(key, &value)
			.await
			.map(|_| ())
			.map_err(|err| kv::StoreError::Backend(err.into()))
	}

	async fn set_ttl(&self, key: &str, value: Bytes, ttl: Duration) -> Result<(), kv::StoreError> {
		let lease = self
			.lease(ttl.as_secs().max(1) as i64)
			.await
			.map_err(|err| kv::StoreError::Backend(err.into()))?;
		self
			.put_with_lease(key, &value, lease)
			.await
			.map(|_| ())
			.map_err(|err| kv::StoreError::Backend(err.into()))
	}

	async fn set_if_absent(
		&self,
		key: &str,
		value: Bytes,
		ttl: Option<Duration>,
	) -> Result<bool, kv::StoreError> {
		let lease_id = match ttl {
			Some(ttl) => Some(
				self
					.lease(ttl.as_secs().max(1) as i64)
					.await
					.map_err(|err| kv::StoreError::Backend(err.into()))?,
			),
			None => None,
		};
		self
			.put_if_not_exists_opts(key, &value, lease_id)
			.await
			.map_err(|err| kv::StoreError::Backend(err.into()))
	}

	async fn delete(&self, key: &str) -> Result<(), kv::StoreError> {
		Client::delete(self, key)
			.await
			.map(|_| ())
			.map_err(|err| kv::StoreError::Backend(err.into()))
	}
}
