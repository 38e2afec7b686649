use std::io::Read;

use chrono::{DateTime, SecondsFormat, Utc};
use ring::{constant_time, hmac};
use uuid::Uuid;

use crate::auth::nonce::NonceStore;
use crate::auth::{AuthError, KeyProvider};
use crate::*;

pub const DEFAULT_MAX_INPUT_SIZE: u64 = 32 * 1024 * 1024;
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A signature bound to the moment it was produced. The signature token is
/// `hex(mac)` or `keyId.hex(mac)`; the timestamp is RFC 3339 UTC; the nonce
/// is a UUID.
#[derive(Debug, Clone)]
pub struct SignedRequest {
	pub signature: String,
	pub timestamp: String,
	pub nonce: String,
}

/// Produces and verifies HMAC-SHA256 signatures. Timestamped signatures are
/// single-use within the configured interval; verification consumes the nonce
/// only after the signature itself proves valid, so forged requests cannot
/// exhaust the nonce store.
pub struct HmacProvider {
	keys: Arc<dyn KeyProvider>,
	nonces: Arc<dyn NonceStore>,
	interval: Duration,
	max_input_size: u64,
}

impl HmacProvider {
	pub fn new(keys: Arc<dyn KeyProvider>, nonces: Arc<dyn NonceStore>) -> HmacProvider {
		HmacProvider {
			keys,
			nonces,
			interval: DEFAULT_INTERVAL,
			max_input_size: DEFAULT_MAX_INPUT_SIZE,
		}
	}

	/// The accepted clock skew on either side of now.
	pub fn with_interval(mut self, interval: Duration) -> HmacProvider {
		self.interval = interval;
		self
	}

	/// The hard cap on body bytes read during signing and verification.
	pub fn with_max_input_size(mut self, max_input_size: u64) -> HmacProvider {
		self.max_input_size = max_input_size;
		self
	}

	/// Stateless HMAC-SHA256 over `body`: no timestamp, no nonce, replayable.
	pub fn sign_plain(&self, key_id: &str, body: impl Read) -> Result<String, AuthError> {
		validate_key_id(key_id)?;
		let body = self.read_bounded(body)?;
		let key = self.mac_key(key_id)?;
		Ok(format_token(key_id, &hmac::sign(&key, &body)))
	}

	/// Verifies a [`sign_plain`](Self::sign_plain) token and returns the key
	/// id it was signed under.
	pub fn verify_plain(&self, body: impl Read, token: &str) -> Result<String, AuthError> {
		let (key_id, mac_hex) = split_token(token);
		let mac = hex::decode(mac_hex).map_err(|_| AuthError::InvalidRequest)?;
		let body = self.read_bounded(body)?;
		let key = self.mac_key(key_id).map_err(|_| AuthError::InvalidRequest)?;
		let expected = hmac::sign(&key, &body);
		constant_time::verify_slices_are_equal(expected.as_ref(), &mac)
			.map_err(|_| AuthError::InvalidRequest)?;
		Ok(key_id.to_string())
	}

	/// Signs `body` bound to the current UTC time and a fresh UUID nonce.
	/// The MAC covers `timestamp:nonce:body`.
	pub fn sign(&self, key_id: &str, body: impl Read) -> Result<SignedRequest, AuthError> {
		validate_key_id(key_id)?;
		let body = self.read_bounded(body)?;
		let timestamp = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
		let nonce = Uuid::new_v4().to_string();
		let key = self.mac_key(key_id)?;
		let mac = mac_over(&key, &timestamp, &nonce, &body);
		Ok(SignedRequest {
			signature: format_token(key_id, &mac),
			timestamp,
			nonce,
		})
	}

	/// Verifies a signed request and returns the key id it was signed under.
	///
	/// The checks run in a fixed order: presence, timestamp window, signature
	/// decoding, bounded body read, key resolution, constant-time MAC
	/// comparison, and only then nonce consumption. Every failure surfaces
	/// the same opaque error.
	pub async fn verify(
		&self,
		body: impl Read,
		signature: &str,
		timestamp: &str,
		nonce: &str,
	) -> Result<String, AuthError> {
		if signature.is_empty() || timestamp.is_empty() || nonce.is_empty() {
			return Err(AuthError::InvalidRequest);
		}

		let signed_at = DateTime::parse_from_rfc3339(timestamp)
			.map_err(|_| AuthError::InvalidRequest)?
			.with_timezone(&Utc);
		let interval =
			chrono::Duration::from_std(self.interval).map_err(|_| AuthError::InvalidRequest)?;
		let skew = Utc::now().signed_duration_since(signed_at);
		if skew > interval || skew < -interval {
			debug!(timestamp, "signature timestamp outside the accepted window");
			return Err(AuthError::InvalidRequest);
		}

		let (key_id, mac_hex) = split_token(signature);
		let mac = hex::decode(mac_hex).map_err(|_| AuthError::InvalidRequest)?;
		let body = self.read_bounded(body)?;
		let key = self.mac_key(key_id).map_err(|_| AuthError::InvalidRequest)?;
		let expected = mac_over(&key, timestamp, nonce, &body);
		constant_time::verify_slices_are_equal(expected.as_ref(), &mac)
			.map_err(|_| AuthError::InvalidRequest)?;

		match self.nonces.add_if_not_exists(nonce).await {
			Ok(true) => Ok(key_id.to_string()),
			Ok(false) => {
				debug!("nonce replayed or rejected");
				Err(AuthError::InvalidRequest)
			},
			Err(err) => {
				debug!(%err, "nonce store failed");
				Err(AuthError::InvalidRequest)
			},
		}
	}

	fn read_bounded(&self, mut body: impl Read) -> Result<Vec<u8>, AuthError> {
		let mut buf = Vec::new();
		let read = body
			.by_ref()
			.take(self.max_input_size.saturating_add(1))
			.read_to_end(&mut buf)
			.map_err(|_| AuthError::InvalidRequest)?;
		if read as u64 > self.max_input_size {
			return Err(AuthError::InvalidRequest);
		}
		Ok(buf)
	}

	fn mac_key(&self, key_id: &str) -> Result<hmac::Key, AuthError> {
		let credential = self.keys.fetch_secret(key_id)?;
		credential.expose(|secret| hmac::Key::new(hmac::HMAC_SHA256, secret))
	}
}

fn mac_over(key: &hmac::Key, timestamp: &str, nonce: &str, body: &[u8]) -> hmac::Tag {
	let mut ctx = hmac::Context::with_key(key);
	ctx.update(timestamp.as_bytes());
	ctx.update(b":");
	ctx.update(nonce.as_bytes());
	ctx.update(b":");
	ctx.update(body);
	ctx.sign()
}

fn format_token(key_id: &str, mac: &hmac::Tag) -> String {
	let encoded = hex::encode(mac.as_ref());
	if key_id.is_empty() {
		encoded
	} else {
		format!("{key_id}.{encoded}")
	}
}

fn split_token(token: &str) -> (&str, &str) {
	match token.split_once('.') {
		Some((key_id, mac)) => (key_id, mac),
		None => ("", token),
	}
}

fn validate_key_id(key_id: &str) -> Result<(), AuthError> {
	if key_id.contains('.') {
		return Err(AuthError::InvalidKeyId);
	}
	Ok(())
}
