#![forbid(unsafe_code)]

use aes_gcm::{AeadInPlace, Aes256Gcm, KeyInit, Nonce, Tag};
use anyhow::anyhow;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};

use crate::{MessageCipher, SecretString};

/// AES-256-GCM cipher for stored message bodies.
///
/// Ciphertext layout before base64: nonce (12 bytes) ∥ tag (16 bytes) ∥
/// encrypted body. The key is derived from the configured secret with
/// SHA-256 so operators can supply a passphrase of any length.
pub struct AesGcmCipher {
	key: [u8; 32],
}

impl AesGcmCipher {
	pub fn new(secret: &SecretString) -> Self {
		let mut hasher = Sha256::new();
		hasher.update(secret.expose().as_bytes());
		let digest = hasher.finalize();
		let mut key = [0u8; 32];
		key.copy_from_slice(&digest);
		Self { key }
	}
}

impl MessageCipher for AesGcmCipher {
	fn encrypt(&self, plaintext: &str) -> anyhow::Result<String> {
		let cipher = Aes256Gcm::new((&self.key).into());

		let mut nonce = [0u8; 12];
		OsRng.fill_bytes(&mut nonce);

		let mut body = plaintext.as_bytes().to_vec();
		let tag = cipher
			.encrypt_in_place_detached((&nonce).into(), b"", &mut body)
			.map_err(|_| anyhow!("encryption failed"))?;

		let mut packed = Vec::with_capacity(12 + 16 + body.len());
		packed.extend_from_slice(&nonce);
		packed.extend_from_slice(&tag);
		packed.extend_from_slice(&body);
		Ok(BASE64.encode(packed))
	}

	fn decrypt(&self, ciphertext: &str) -> anyhow::Result<String> {
		let packed = BASE64.decode(ciphertext.trim())?;
		if packed.len() < 28 {
			return Err(anyhow!("ciphertext too short: {} bytes", packed.len()));
		}

		let cipher = Aes256Gcm::new((&self.key).into());
		let mut body = packed[28..].to_vec();
		cipher
			.decrypt_in_place_detached(
				Nonce::from_slice(&packed[0..12]),
				b"",
				&mut body,
				Tag::from_slice(&packed[12..28]),
			)
			.map_err(|_| anyhow!("decryption failed (wrong key or corrupted data)"))?;

		Ok(String::from_utf8(body)?)
	}
}

/// Pass-through cipher used when no encryption key is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCipher;

impl MessageCipher for NoopCipher {
	fn encrypt(&self, plaintext: &str) -> anyhow::Result<String> {
		Ok(plaintext.to_string())
	}

	fn decrypt(&self, ciphertext: &str) -> anyhow::Result<String> {
		Ok(ciphertext.to_string())
	}
}
