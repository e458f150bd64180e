//! Encryption at rest for backend bearer tokens.
//!
//! AES-256-GCM with a per-record random salt and IV; the key is derived from
//! the gateway secret with scrypt. Blobs are stored as
//! `salt_hex:iv_hex:tag_hex:ciphertext_hex`. Decryption never hard-fails:
//! a corrupt blob or rotated secret yields `None` and the record is treated
//! as needing re-pairing.

use aes_gcm::aead::consts::U16;
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::aes::Aes256;
use aes_gcm::{AesGcm, Nonce};
use anyhow::{Context, Result, anyhow};
use rand::RngCore;
use scrypt::Params;
use tracing::debug;

// 16-byte IV variant; the 128-bit tag is the GCM default.
type TokenAead = AesGcm<Aes256, U16>;

const SALT_LEN: usize = 16;
const IV_LEN: usize = 16;
const TAG_LEN: usize = 16;
const KEY_LEN: usize = 32;

/// Symmetric cipher bound to the shared gateway secret.
#[derive(Clone)]
pub struct TokenCipher {
    secret: Vec<u8>,
}

impl TokenCipher {
    pub fn new(secret: impl Into<Vec<u8>>) -> Self {
        Self {
            secret: secret.into(),
        }
    }

    fn derive_key(&self, salt: &[u8]) -> Result<[u8; KEY_LEN]> {
        // Node scrypt defaults: N=2^14, r=8, p=1.
        let params = Params::new(14, 8, 1, KEY_LEN).map_err(|e| anyhow!("scrypt params: {e}"))?;
        let mut key = [0u8; KEY_LEN];
        scrypt::scrypt(&self.secret, salt, &params, &mut key)
            .map_err(|e| anyhow!("scrypt kdf: {e}"))?;
        Ok(key)
    }

    /// Encrypts `plaintext` into the hex-serialized blob format.
    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut salt = [0u8; SALT_LEN];
        let mut iv = [0u8; IV_LEN];
        let mut rng = rand::rng();
        rng.fill_bytes(&mut salt);
        rng.fill_bytes(&mut iv);

        let key = self.derive_key(&salt)?;
        let cipher =
            TokenAead::new_from_slice(&key).map_err(|e| anyhow!("cipher init: {e}"))?;
        let mut sealed = cipher
            .encrypt(Nonce::<U16>::from_slice(&iv), plaintext.as_bytes())
            .map_err(|e| anyhow!("encrypt: {e}"))?;

        // The AEAD appends the tag; the blob format keeps it separate.
        let split = sealed
            .len()
            .checked_sub(TAG_LEN)
            .context("ciphertext shorter than tag")?;
        let tag = sealed.split_off(split);

        Ok(format!(
            "{}:{}:{}:{}",
            hex::encode(salt),
            hex::encode(iv),
            hex::encode(tag),
            hex::encode(sealed)
        ))
    }

    /// Decrypts a blob produced by [`encrypt`](Self::encrypt). Any parse,
    /// KDF, or MAC failure yields `None`.
    pub fn decrypt(&self, blob: &str) -> Option<String> {
        let mut parts = blob.split(':');
        let salt = hex::decode(parts.next()?).ok()?;
        let iv = hex::decode(parts.next()?).ok()?;
        let tag = hex::decode(parts.next()?).ok()?;
        let ciphertext = hex::decode(parts.next()?).ok()?;
        if parts.next().is_some()
            || salt.len() != SALT_LEN
            || iv.len() != IV_LEN
            || tag.len() != TAG_LEN
        {
            debug!("token blob has malformed fields");
            return None;
        }

        let key = self.derive_key(&salt).ok()?;
        let cipher = TokenAead::new_from_slice(&key).ok()?;
        let mut sealed = ciphertext;
        sealed.extend_from_slice(&tag);
        match cipher.decrypt(Nonce::<U16>::from_slice(&iv), sealed.as_slice()) {
            Ok(plain) => String::from_utf8(plain).ok(),
            Err(_) => {
                debug!("token blob failed authentication");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_decrypt_roundtrip() {
        let cipher = TokenCipher::new("gateway-secret");
        let blob = cipher.encrypt("bearer-token-123").expect("encrypt");
        assert_eq!(cipher.decrypt(&blob).as_deref(), Some("bearer-token-123"));
    }

    #[test]
    fn blob_format_has_four_hex_fields() {
        let cipher = TokenCipher::new("gateway-secret");
        let blob = cipher.encrypt("tok").expect("encrypt");
        let parts: Vec<&str> = blob.split(':').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0].len(), SALT_LEN * 2);
        assert_eq!(parts[1].len(), IV_LEN * 2);
        assert_eq!(parts[2].len(), TAG_LEN * 2);
        for part in parts {
            assert!(hex::decode(part).is_ok());
        }
    }

    #[test]
    fn salts_differ_per_record() {
        let cipher = TokenCipher::new("gateway-secret");
        let a = cipher.encrypt("tok").expect("encrypt");
        let b = cipher.encrypt("tok").expect("encrypt");
        assert_ne!(a, b);
    }

    #[test]
    fn tampered_blob_decrypts_to_none() {
        let cipher = TokenCipher::new("gateway-secret");
        let blob = cipher.encrypt("tok").expect("encrypt");
        let mut tampered: Vec<char> = blob.chars().collect();
        let last = tampered.len() - 1;
        tampered[last] = if tampered[last] == '0' { '1' } else { '0' };
        let tampered: String = tampered.into_iter().collect();
        assert_eq!(cipher.decrypt(&tampered), None);
    }

    #[test]
    fn wrong_secret_decrypts_to_none() {
        let blob = TokenCipher::new("secret-a").encrypt("tok").expect("encrypt");
        assert_eq!(TokenCipher::new("secret-b").decrypt(&blob), None);
    }

    #[test]
    fn garbage_blobs_decrypt_to_none() {
        let cipher = TokenCipher::new("gateway-secret");
        assert_eq!(cipher.decrypt(""), None);
        assert_eq!(cipher.decrypt("not-a-blob"), None);
        assert_eq!(cipher.decrypt("aa:bb:cc"), None);
        assert_eq!(cipher.decrypt("zz:zz:zz:zz"), None);
    }
}
