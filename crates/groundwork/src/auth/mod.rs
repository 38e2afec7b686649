//! HMAC-SHA256 request signing with replay defense.

mod credential;
mod hmac;
mod nonce;

#[cfg(test)]
mod hmac_tests;

use thiserror::Error;

pub use credential::Credential;
pub use hmac::{DEFAULT_INTERVAL, DEFAULT_MAX_INPUT_SIZE, HmacProvider, SignedRequest};
pub use nonce::{KvNonceStore, MemoryNonceStore, NonceError, NonceStore};

use crate::*;

#[derive(Debug, Error)]
pub enum AuthError {
	/// Every verification failure collapses to this error; the cause is
	/// available to operators through debug logs only.
	#[error("invalid request")]
	InvalidRequest,
	#[error("invalid credential")]
	InvalidCredential,
	#[error("key id must not contain '.'")]
	InvalidKeyId,
	#[error("unknown key id {0:?}")]
	UnknownKey(String),
}

/// Maps key ids to signing credentials. Key ids must never contain `.`,
/// which is reserved as the token separator.
pub trait KeyProvider: Send + Sync {
	fn fetch_secret(&self, key_id: &str) -> Result<Credential, AuthError>;
}

/// A provider holding exactly one (key id, credential) pair.
#[derive(Debug)]
pub struct SingleKeyProvider {
	key_id: String,
	credential: Credential,
}

impl SingleKeyProvider {
	pub fn new(key_id: &str, secret: &[u8]) -> Result<SingleKeyProvider, AuthError> {
		if key_id.contains('.') {
			return Err(AuthError::InvalidKeyId);
		}
		Ok(SingleKeyProvider {
			key_id: key_id.to_string(),
			credential: Credential::new(secret)?,
		})
	}
}

impl KeyProvider for SingleKeyProvider {
	fn fetch_secret(&self, key_id: &str) -> Result<Credential, AuthError> {
		if key_id != self.key_id {
			return Err(AuthError::UnknownKey(key_id.to_string()));
		}
		Ok(self.credential.clone())
	}
}
