use once_cell::sync::Lazy;
use ring::aead::{AES_256_GCM, Aad, LessSafeKey, NONCE_LEN, Nonce, UnboundKey};
use ring::rand::{SecureRandom, SystemRandom};
use secrecy::{ExposeSecret, SecretBox};

use crate::auth::AuthError;
use crate::*;

// One random key per process. Credentials sealed under it are unreadable in
// heap dumps and cannot outlive the process.
static PROCESS_KEY: Lazy<LessSafeKey> = Lazy::new(|| {
	let mut key = [0u8; 32];
	SystemRandom::new()
		.fill(&mut key)
		.expect("system randomness unavailable");
	LessSafeKey::new(UnboundKey::new(&AES_256_GCM, &key).expect("AES-256-GCM key size"))
});

static RNG: Lazy<SystemRandom> = Lazy::new(SystemRandom::new);

/// A signing secret, encrypted at rest under the per-process key. Plaintext
/// exists only inside [`Credential::expose`] and is zeroed when the closure
/// returns.
#[derive(Clone)]
pub struct Credential {
	// nonce || ciphertext || tag
	sealed: Vec<u8>,
}

impl Credential {
	pub fn new(secret: &[u8]) -> Result<Credential, AuthError> {
		if secret.is_empty() {
			return Err(AuthError::InvalidCredential);
		}
		let mut nonce = [0u8; NONCE_LEN];
		RNG.fill(&mut nonce).map_err(|_| AuthError::InvalidCredential)?;

		let mut in_out = secret.to_vec();
		PROCESS_KEY
			.seal_in_place_append_tag(Nonce::assume_unique_for_key(nonce), Aad::empty(), &mut in_out)
			.map_err(|_| AuthError::InvalidCredential)?;

		let mut sealed = Vec::with_capacity(NONCE_LEN + in_out.len());
		sealed.extend_from_slice(&nonce);
		sealed.extend_from_slice(&in_out);
		Ok(Credential { sealed })
	}

	/// Opens the secret and passes the plaintext to `f`. The buffer is zeroed
	/// when the call returns; `f` must not let the plaintext escape.
	pub fn expose<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Result<R, AuthError> {
		let (nonce, ciphertext) = self.sealed.split_at(NONCE_LEN);
		let nonce = Nonce::try_assume_unique_for_key(nonce).map_err(|_| AuthError::InvalidCredential)?;

		let mut in_out = ciphertext.to_vec();
		let plaintext_len = PROCESS_KEY
			.open_in_place(nonce, Aad::empty(), &mut in_out)
			.map_err(|_| AuthError::InvalidCredential)?
			.len();
		in_out.truncate(plaintext_len);

		let plaintext: SecretBox<[u8]> = SecretBox::new(in_out.into_boxed_slice());
		Ok(f(plaintext.expose_secret()))
	}
}

impl Debug for Credential {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Credential").finish_non_exhaustive()
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn roundtrip() {
		let credential = Credential::new(b"super secret").unwrap();
		let length = credential.expose(|secret| {
			assert_eq!(secret, b"super secret");
			secret.len()
		});
		assert_eq!(length.unwrap(), 12);
	}

	#[test]
	fn rejects_empty_secrets() {
		assert!(matches!(
			Credential::new(b""),
			Err(AuthError::InvalidCredential)
		));
	}

	#[test]
	fn sealed_form_hides_the_secret() {
		let credential = Credential::new(b"super secret").unwrap();
		let window = credential
			.sealed
			.windows(b"super secret".len())
			.any(|w| w == b"super secret");
		assert!(!window);
	}
}
