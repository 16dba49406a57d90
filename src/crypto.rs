//! Secret-at-rest layer.
//!
//! A single symmetric key, generated once from the OS CSPRNG and kept in
//! the settings table as hex, transparently encrypts stored API secrets.
//! AES-256-GCM with a random 96-bit nonce; the stored blob is
//! `base64(nonce ‖ ciphertext ‖ tag)`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::rngs::OsRng;
use rand::RngCore;

use crate::errors::CoreError;
use crate::metadata::store::MetadataStore;

/// Setting key under which the hex-encoded 256-bit key is stored.
pub const ENCRYPTION_KEY_SETTING: &str = "system.encryption_key";

const NONCE_LEN: usize = 12;
/// Blobs shorter than this cannot possibly contain `base64(nonce ‖ tag)`
/// and are treated as legacy plaintext without attempting to decode them.
const MIN_CIPHERTEXT_LEN: usize = 44;

/// Fill `buf` from the OS CSPRNG. A failure here is process-fatal: the
/// caller is expected to log and terminate rather than fall back to a
/// weaker source of randomness.
pub fn fill_csprng(buf: &mut [u8]) -> Result<(), CoreError> {
    OsRng
        .try_fill_bytes(buf)
        .map_err(|e| CoreError::CryptoUnavailable(e.to_string()))
}

/// Load the encryption key from settings, generating and persisting one on
/// first use. CSPRNG failure here is fatal to the process.
pub fn load_or_create_key(store: &dyn MetadataStore) -> Result<[u8; 32], CoreError> {
    if let Some(existing) = store.get_setting(ENCRYPTION_KEY_SETTING)? {
        let bytes = hex::decode(&existing)
            .map_err(|e| CoreError::DBError(format!("corrupt encryption key setting: {e}")))?;
        let mut key = [0u8; 32];
        if bytes.len() != 32 {
            return Err(CoreError::DBError(
                "encryption key setting has the wrong length".into(),
            ));
        }
        key.copy_from_slice(&bytes);
        return Ok(key);
    }

    let mut key = [0u8; 32];
    if let Err(e) = fill_csprng(&mut key) {
        tracing::error!("CSPRNG unavailable while generating encryption key: {e}");
        std::process::exit(70); // EX_SOFTWARE
    }
    store.set_setting(ENCRYPTION_KEY_SETTING, &hex::encode(key))?;
    Ok(key)
}

/// Encrypt `plaintext` under `key`, returning `base64(nonce ‖ ciphertext ‖ tag)`.
pub fn encrypt_secret(key: &[u8; 32], plaintext: &str) -> Result<String, CoreError> {
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    let mut nonce_bytes = [0u8; NONCE_LEN];
    fill_csprng(&mut nonce_bytes)?;
    let nonce = Nonce::from_slice(&nonce_bytes);

    let ciphertext = cipher
        .encrypt(nonce, plaintext.as_bytes())
        .map_err(|e| CoreError::CryptoUnavailable(format!("AEAD encryption failed: {e}")))?;

    let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    blob.extend_from_slice(&nonce_bytes);
    blob.extend_from_slice(&ciphertext);
    Ok(BASE64.encode(blob))
}

/// Decrypt `blob` under `key`. Implements the lenient legacy policy: if the
/// blob is too short, not valid base64, the decoded payload is shorter than
/// the nonce, or AEAD open fails, the original blob is returned verbatim.
/// This preserves (I7) while allowing transparent upgrade of older rows --
/// it is a migration contract, not error-swallowing.
pub fn decrypt_secret(key: &[u8; 32], blob: &str) -> String {
    if blob.len() < MIN_CIPHERTEXT_LEN {
        return blob.to_string();
    }
    let Ok(decoded) = BASE64.decode(blob) else {
        return blob.to_string();
    };
    if decoded.len() <= NONCE_LEN {
        return blob.to_string();
    }
    let (nonce_bytes, ciphertext) = decoded.split_at(NONCE_LEN);
    let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key));
    match cipher.decrypt(Nonce::from_slice(nonce_bytes), ciphertext) {
        Ok(plaintext) => String::from_utf8(plaintext).unwrap_or_else(|_| blob.to_string()),
        Err(_) => blob.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_key() -> [u8; 32] {
        [7u8; 32]
    }

    #[test]
    fn round_trips_nonempty_strings() {
        let key = test_key();
        for s in ["a", "secret-access-key-value", "unicode: héllo wörld"] {
            let ciphertext = encrypt_secret(&key, s).unwrap();
            assert_eq!(decrypt_secret(&key, &ciphertext), s);
        }
    }

    #[test]
    fn two_encryptions_differ() {
        let key = test_key();
        let a = encrypt_secret(&key, "same-plaintext").unwrap();
        let b = encrypt_secret(&key, "same-plaintext").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn legacy_plaintext_passes_through() {
        let key = test_key();
        assert_eq!(decrypt_secret(&key, "short"), "short");
        assert_eq!(
            decrypt_secret(&key, "not-base64-!!!-but-long-enough-to-pass-length-check"),
            "not-base64-!!!-but-long-enough-to-pass-length-check"
        );
        // Valid base64, long enough, but not a real ciphertext for this key.
        let bogus = BASE64.encode([0u8; 40]);
        assert_eq!(decrypt_secret(&key, &bogus), bogus);
    }

    #[test]
    fn wrong_key_falls_back_to_verbatim() {
        let key_a = test_key();
        let key_b = [9u8; 32];
        let blob = encrypt_secret(&key_a, "top-secret").unwrap();
        assert_eq!(decrypt_secret(&key_b, &blob), blob);
    }
}
