//! crypto/aes - AES-256-GCM провайдер.
//!
//! Формат шифротекста: [nonce 12][ciphertext][tag 16].
//!
//! Режимы nonce:
//! - randomized    - 12 случайных байт (OsRng); для значений.
//! - deterministic - HMAC-SHA256(mac_key, plaintext)[..12] (SIV-style); для ключей,
//!   чтобы одинаковый ключ давал одинаковый шифротекст и искался в карте.
//!   mac_key = SHA-256("safebox-siv" || key), чтобы не использовать ключ AES дважды.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Key, Nonce,
};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use super::{CipherError, SafeBoxCipher};

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

type HmacSha256 = Hmac<Sha256>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum NonceMode {
    Random,
    Synthetic,
}

pub struct AesGcmCipher {
    key: [u8; 32],
    mac_key: [u8; 32],
    mode: NonceMode,
}

impl AesGcmCipher {
    /// Случайный nonce на каждый encrypt.
    pub fn randomized(key: [u8; 32]) -> Self {
        Self::new(key, NonceMode::Random)
    }

    /// Детерминированный nonce из содержимого.
    pub fn deterministic(key: [u8; 32]) -> Self {
        Self::new(key, NonceMode::Synthetic)
    }

    fn new(key: [u8; 32], mode: NonceMode) -> Self {
        let mut h = Sha256::new();
        h.update(b"safebox-siv");
        h.update(key);
        let mut mac_key = [0u8; 32];
        mac_key.copy_from_slice(&h.finalize());
        Self { key, mac_key, mode }
    }

    #[inline]
    pub fn is_deterministic(&self) -> bool {
        self.mode == NonceMode::Synthetic
    }

    fn nonce_for(&self, plaintext: &[u8]) -> Result<[u8; NONCE_LEN], CipherError> {
        let mut nonce = [0u8; NONCE_LEN];
        match self.mode {
            NonceMode::Random => OsRng.fill_bytes(&mut nonce),
            NonceMode::Synthetic => {
                let mut mac = <HmacSha256 as Mac>::new_from_slice(&self.mac_key)
                    .map_err(|e| CipherError::Other(format!("hmac init: {}", e)))?;
                mac.update(plaintext);
                let tag = mac.finalize().into_bytes();
                nonce.copy_from_slice(&tag[..NONCE_LEN]);
            }
        }
        Ok(nonce)
    }
}

impl SafeBoxCipher for AesGcmCipher {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let nonce = self.nonce_for(plaintext)?;
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        let ct = cipher
            .encrypt(Nonce::from_slice(&nonce), plaintext)
            .map_err(|e| CipherError::Other(format!("aes-gcm encrypt: {}", e)))?;
        let mut out = Vec::with_capacity(NONCE_LEN + ct.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ct);
        Ok(out)
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError> {
        // Слишком короткий блоб тоже не аутентифицируется.
        if ciphertext.len() < NONCE_LEN + TAG_LEN {
            return Err(CipherError::Authentication);
        }
        let (nonce, body) = ciphertext.split_at(NONCE_LEN);
        let cipher = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&self.key));
        cipher
            .decrypt(Nonce::from_slice(nonce), body)
            .map_err(|_| CipherError::Authentication)
    }
}

impl Drop for AesGcmCipher {
    fn drop(&mut self) {
        self.key.zeroize();
        self.mac_key.zeroize();
    }
}
