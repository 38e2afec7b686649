use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::digest;
use ring::rand::{SecureRandom, SystemRandom};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CodecError {
	#[error("value could not be sealed")]
	Seal,
	#[error("value could not be opened")]
	Open,
}

/// Transforms values on their way to and from the backend. Keys are never
/// transformed. The seam exists so later transforms (compression, schema
/// envelopes) slot in without touching the client API.
pub trait ValueCodec: Send + Sync {
	fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError>;
	fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CodecError>;
}

/// The no-op codec used when no encryption key is configured.
pub struct Identity;

impl ValueCodec for Identity {
	fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
		Ok(plaintext.to_vec())
	}

	fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CodecError> {
		Ok(sealed.to_vec())
	}
}

/// AES-256-GCM with the key derived by hashing the user-supplied key material
/// with SHA-256. Sealed layout: `nonce(12) || ciphertext || tag(16)`.
pub struct Aes256Gcm {
	key: LessSafeKey,
	rng: SystemRandom,
}

impl Aes256Gcm {
	pub fn new(key: &[u8]) -> Aes256Gcm {
		let derived = digest::digest(&digest::SHA256, key);
		let unbound =
			UnboundKey::new(&AES_256_GCM, derived.as_ref()).expect("SHA-256 digest is a valid key");
		Aes256Gcm {
			key: LessSafeKey::new(unbound),
			rng: SystemRandom::new(),
		}
	}
}

impl ValueCodec for Aes256Gcm {
	fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CodecError> {
		let mut nonce = [0u8; NONCE_LEN];
		self.rng.fill(&mut nonce).map_err(|_| CodecError::Seal)?;

		let mut in_out = plaintext.to_vec();
		self
			.key
			.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
			.map_err(|_| CodecError::Seal)?;

		let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
		sealed.extend_from_slice(&nonce);
		sealed.extend_from_slice(&in_out);
		Ok(sealed)
	}

	fn open(&self, sealed: &[u8]) -> Result<Vec<u8>, CodecError> {
		if sealed.len() < NONCE_LEN + AES_256_GCM.tag_len() {
			return Err(CodecError::Open);
		}
		let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
		let nonce = Nonce::try_assume_unique_for_key(nonce).map_err(|_| CodecError::Open)?;

		let mut in_out = ciphertext.to_vec();
		let plaintext_len = self
			.key
			.open_in_place(nonce, Aad::empty(), &mut in_out)
			.map_err(|_| CodecError::Open)?
			.len();
		in_out.truncate(plaintext_len);
		Ok(in_out)
	}
}
