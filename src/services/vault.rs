use crate::constants::buffers::{CRYPTO_KEY_SIZE, CRYPTO_NONCE_SIZE, CRYPTO_TAG_SIZE};
use crate::errors::CoreError;
use crate::services::logger::Logger;
use aes_gcm::aead::{Aead, KeyInit, OsRng};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::Engine;
use rand::RngCore;

/// Credential vault: seals opaque byte blobs with AES-256-GCM under a single
/// process-wide key. Sealed layout is `nonce || ciphertext || tag`; a fresh
/// nonce is drawn per call. The vault never logs plaintext.
pub struct CredentialVault {
    cipher: Aes256Gcm,
    ephemeral: bool,
}

fn decode_key(raw: &str) -> Option<Vec<u8>> {
    let trimmed = raw.trim();
    if trimmed.len() == CRYPTO_KEY_SIZE * 2 {
        if let Ok(decoded) = hex::decode(trimmed) {
            return Some(decoded);
        }
    }
    if trimmed.len() == CRYPTO_KEY_SIZE {
        return Some(trimmed.as_bytes().to_vec());
    }
    let engine = base64::engine::general_purpose::STANDARD;
    engine
        .decode(trimmed.as_bytes())
        .ok()
        .filter(|bytes| bytes.len() == CRYPTO_KEY_SIZE)
}

/// Overwrite a plaintext buffer. Callers must invoke this on every decrypted
/// credential buffer as soon as it has been consumed.
pub fn zero(buf: &mut [u8]) {
    for byte in buf.iter_mut() {
        *byte = 0;
    }
}

impl CredentialVault {
    /// Build the vault from injected key material (hex, raw 32 bytes, or
    /// base64). With no material, a fresh key is generated and a single
    /// warning is logged: everything sealed under it dies with the process.
    pub fn new(key_material: Option<&str>, logger: &Logger) -> Result<Self, CoreError> {
        let (secret, ephemeral) = match key_material.and_then(decode_key) {
            Some(secret) => (secret, false),
            None => {
                if key_material.is_some() {
                    return Err(CoreError::credential_integrity(
                        "Vault key material is not a 32-byte key",
                    )
                    .with_hint("Provide 64 hex chars, 32 raw bytes, or base64 of 32 bytes."));
                }
                let mut generated = vec![0u8; CRYPTO_KEY_SIZE];
                OsRng.fill_bytes(&mut generated);
                logger.warn(
                    "No vault key injected; generated an ephemeral key. Sealed credentials will not survive this process.",
                    None,
                );
                (generated, true)
            }
        };
        if secret.len() != CRYPTO_KEY_SIZE {
            return Err(CoreError::credential_integrity(
                "Vault key material is not a 32-byte key",
            ));
        }
        let key = aes_gcm::Key::<Aes256Gcm>::from_slice(&secret);
        Ok(Self {
            cipher: Aes256Gcm::new(key),
            ephemeral,
        })
    }

    pub fn is_ephemeral(&self) -> bool {
        self.ephemeral
    }

    pub fn seal(&self, plaintext: &[u8]) -> Result<Vec<u8>, CoreError> {
        let mut nonce_bytes = [0u8; CRYPTO_NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|_| CoreError::credential_integrity("Failed to seal credential"))?;
        let mut sealed = Vec::with_capacity(CRYPTO_NONCE_SIZE + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);
        Ok(sealed)
    }

    pub fn unseal(&self, sealed: &[u8]) -> Result<Vec<u8>, CoreError> {
        if sealed.len() < CRYPTO_NONCE_SIZE + CRYPTO_TAG_SIZE {
            return Err(CoreError::credential_integrity(
                "Sealed credential is too short",
            ));
        }
        let (nonce_bytes, ciphertext) = sealed.split_at(CRYPTO_NONCE_SIZE);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| CoreError::credential_integrity("Sealed credential failed integrity check"))
    }
}
