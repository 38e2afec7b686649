use assert_matches::assert_matches;
use chrono::{SecondsFormat, Utc};
use ring::hmac;

use super::*;

fn provider(key_id: &str, secret: &[u8]) -> HmacProvider {
	let keys = Arc::new(SingleKeyProvider::new(key_id, secret).unwrap());
	let nonces = Arc::new(MemoryNonceStore::new(Duration::from_secs(600), 1000));
	HmacProvider::new(keys, nonces)
}

/// Computes the MAC the way a remote signer with the shared secret would.
fn mac_hex(secret: &[u8], timestamp: &str, nonce: &str, body: &[u8]) -> String {
	let key = hmac::Key::new(hmac::HMAC_SHA256, secret);
	let mut ctx = hmac::Context::with_key(&key);
	ctx.update(timestamp.as_bytes());
	ctx.update(b":");
	ctx.update(nonce.as_bytes());
	ctx.update(b":");
	ctx.update(body);
	hex::encode(ctx.sign().as_ref())
}

fn flip_last_char(s: &str) -> String {
	let mut chars: Vec<char> = s.chars().collect();
	let last = chars.last_mut().unwrap();
	*last = if *last == '0' { '1' } else { '0' };
	chars.into_iter().collect()
}

#[tokio::test]
async fn sign_verify_roundtrip() {
	let provider = provider("test-key", b"test-secret");
	let body = b"Hello, World!";

	let signed = provider.sign("test-key", body.as_slice()).unwrap();
	let key_id = provider
		.verify(
			body.as_slice(),
			&signed.signature,
			&signed.timestamp,
			&signed.nonce,
		)
		.await
		.unwrap();
	assert_eq!(key_id, "test-key");

	// immediate replay of the same signature is rejected
	assert_matches!(
		provider
			.verify(
				body.as_slice(),
				&signed.signature,
				&signed.timestamp,
				&signed.nonce,
			)
			.await,
		Err(AuthError::InvalidRequest)
	);
}

#[test]
fn token_format() {
	let provider = provider("test-key", b"test-secret");
	let signed = provider.sign("test-key", b"body".as_slice()).unwrap();
	let (key_id, mac) = signed.signature.split_once('.').unwrap();
	assert_eq!(key_id, "test-key");
	assert_eq!(mac.len(), 64);
	assert!(mac.chars().all(|c| c.is_ascii_hexdigit()));
}

#[tokio::test]
async fn stale_timestamp_rejected_without_consuming_the_nonce() {
	let provider = provider("", b"test-secret");
	let body = b"Hello, World!";
	let nonce = "8b5a79f2-64a7-41d3-bb8a-01d6ffacb9a8";

	let stale = (Utc::now() - chrono::Duration::minutes(6))
		.to_rfc3339_opts(SecondsFormat::Secs, true);
	let signature = mac_hex(b"test-secret", &stale, nonce, body);
	assert_matches!(
		provider.verify(body.as_slice(), &signature, &stale, nonce).await,
		Err(AuthError::InvalidRequest)
	);

	// a fresh signature may still use the same nonce value
	let fresh = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
	let signature = mac_hex(b"test-secret", &fresh, nonce, body);
	provider
		.verify(body.as_slice(), &signature, &fresh, nonce)
		.await
		.unwrap();
}

#[tokio::test]
async fn future_timestamp_rejected() {
	let provider = provider("", b"test-secret");
	let ahead = (Utc::now() + chrono::Duration::minutes(6))
		.to_rfc3339_opts(SecondsFormat::Secs, true);
	let signature = mac_hex(b"test-secret", &ahead, "nonce-1", b"body");
	assert_matches!(
		provider.verify(b"body".as_slice(), &signature, &ahead, "nonce-1").await,
		Err(AuthError::InvalidRequest)
	);
}

#[tokio::test]
async fn tampering_rejected_without_consuming_the_nonce() {
	let provider = provider("test-key", b"test-secret");
	let body = b"Hello, World!";
	let signed = provider.sign("test-key", body.as_slice()).unwrap();

	// tampered body
	assert_matches!(
		provider
			.verify(
				b"Hello, World?".as_slice(),
				&signed.signature,
				&signed.timestamp,
				&signed.nonce,
			)
			.await,
		Err(AuthError::InvalidRequest)
	);
	// tampered signature
	assert_matches!(
		provider
			.verify(
				body.as_slice(),
				&flip_last_char(&signed.signature),
				&signed.timestamp,
				&signed.nonce,
			)
			.await,
		Err(AuthError::InvalidRequest)
	);

	// the nonce survived both rejections
	provider
		.verify(
			body.as_slice(),
			&signed.signature,
			&signed.timestamp,
			&signed.nonce,
		)
		.await
		.unwrap();
}

#[tokio::test]
async fn unknown_key_id_rejected() {
	let signer = provider("a", b"test-secret");
	let verifier = provider("b", b"test-secret");

	let signed = signer.sign("a", b"body".as_slice()).unwrap();
	assert_matches!(
		verifier
			.verify(
				b"body".as_slice(),
				&signed.signature,
				&signed.timestamp,
				&signed.nonce,
			)
			.await,
		Err(AuthError::InvalidRequest)
	);
}

#[tokio::test]
async fn empty_parameters_rejected() {
	let provider = provider("test-key", b"test-secret");
	let signed = provider.sign("test-key", b"body".as_slice()).unwrap();

	for (signature, timestamp, nonce) in [
		("", signed.timestamp.as_str(), signed.nonce.as_str()),
		(signed.signature.as_str(), "", signed.nonce.as_str()),
		(signed.signature.as_str(), signed.timestamp.as_str(), ""),
	] {
		assert_matches!(
			provider.verify(b"body".as_slice(), signature, timestamp, nonce).await,
			Err(AuthError::InvalidRequest)
		);
	}
}

#[tokio::test]
async fn oversized_body_rejected() {
	let provider = provider("test-key", b"test-secret").with_max_input_size(16);

	assert_matches!(
		provider.sign("test-key", [0u8; 17].as_slice()),
		Err(AuthError::InvalidRequest)
	);

	let signed = provider.sign("test-key", [0u8; 16].as_slice()).unwrap();
	assert_matches!(
		provider
			.verify(
				[0u8; 17].as_slice(),
				&signed.signature,
				&signed.timestamp,
				&signed.nonce,
			)
			.await,
		Err(AuthError::InvalidRequest)
	);
}

#[test]
fn key_id_must_not_contain_the_separator() {
	assert_matches!(
		SingleKeyProvider::new("bad.id", b"secret"),
		Err(AuthError::InvalidKeyId)
	);

	let provider = provider("ok", b"secret");
	assert_matches!(
		provider.sign("bad.id", b"body".as_slice()),
		Err(AuthError::InvalidKeyId)
	);
}

#[test]
fn plain_sign_verify_roundtrip() {
	let provider = provider("test-key", b"test-secret");
	let token = provider.sign_plain("test-key", b"body".as_slice()).unwrap();
	assert!(token.starts_with("test-key."));

	let key_id = provider.verify_plain(b"body".as_slice(), &token).unwrap();
	assert_eq!(key_id, "test-key");

	// plain signatures are deterministic and replayable
	let again = provider.sign_plain("test-key", b"body".as_slice()).unwrap();
	assert_eq!(token, again);

	assert_matches!(
		provider.verify_plain(b"other".as_slice(), &token),
		Err(AuthError::InvalidRequest)
	);
	assert_matches!(
		provider.verify_plain(b"body".as_slice(), &flip_last_char(&token)),
		Err(AuthError::InvalidRequest)
	);
}

#[test]
fn plain_tokens_without_a_key_id() {
	let provider = provider("", b"test-secret");
	let token = provider.sign_plain("", b"body".as_slice()).unwrap();
	assert!(!token.contains('.'));
	assert_eq!(token.len(), 64);
	assert_eq!(provider.verify_plain(b"body".as_slice(), &token).unwrap(), "");
}
