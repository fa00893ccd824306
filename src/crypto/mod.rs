//! crypto - граница шифрования, которую потребляет движок.
//!
//! Движок не знает алгоритмов: он видит только `SafeBoxCipher` (encrypt/decrypt
//! непрозрачных байтов) и отличает ошибку аутентификации (`CipherError::Authentication`)
//! от прочих - по ней запись считается «мёртвой».
//!
//! Ключи ищутся по шифротексту, поэтому шифр ключей обязан быть детерминированным;
//! шифр значений может быть рандомизированным.
//!
//! Провайдеры:
//! - aes.rs - AesGcmCipher (randomized / deterministic SIV-style nonce).
//!
//! ENV (для CLI):
//!   SB_KEY_HEX / SB_KEY_BASE64 - 32-байтный мастер-ключ

use anyhow::{anyhow, Result};
use base64::Engine;
use thiserror::Error;

pub mod aes;
pub use aes::AesGcmCipher;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CipherError {
    /// Шифротекст не прошёл проверку тега (подмена, чужой ключ, ротация).
    #[error("authentication failed")]
    Authentication,
    #[error("cipher failure: {0}")]
    Other(String),
}

impl CipherError {
    #[inline]
    pub fn is_authentication(&self) -> bool {
        matches!(self, CipherError::Authentication)
    }
}

/// Возможность шифрования, которую движок получает извне. Thread-safe.
pub trait SafeBoxCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;
    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>, CipherError>;
}

/// Загрузить 32-байтный ключ из SB_KEY_HEX или SB_KEY_BASE64.
pub fn key_from_env() -> Result<[u8; 32]> {
    if let Ok(hex) = std::env::var("SB_KEY_HEX") {
        return slice32(&decode_hex_trimmed(&hex)?);
    }
    if let Ok(b64) = std::env::var("SB_KEY_BASE64") {
        return slice32(&decode_base64_trimmed(&b64)?);
    }
    Err(anyhow!("set SB_KEY_HEX or SB_KEY_BASE64 (32 bytes)"))
}

// ---------------------- helpers ----------------------

fn slice32(bytes: &[u8]) -> Result<[u8; 32]> {
    if bytes.len() != 32 {
        return Err(anyhow!("key must be exactly 32 bytes, got {}", bytes.len()));
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(bytes);
    Ok(out)
}

pub(crate) fn decode_hex_trimmed(s: &str) -> Result<Vec<u8>> {
    let s = s.trim();
    if s.len() % 2 != 0 {
        return Err(anyhow!("hex key must have even length"));
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    for i in (0..bytes.len()).step_by(2) {
        let h = (bytes[i] as char)
            .to_digit(16)
            .ok_or_else(|| anyhow!("invalid hex at pos {}", i))?;
        let l = (bytes[i + 1] as char)
            .to_digit(16)
            .ok_or_else(|| anyhow!("invalid hex at pos {}", i + 1))?;
        out.push(((h << 4) | l) as u8);
    }
    Ok(out)
}

fn decode_base64_trimmed(s: &str) -> Result<Vec<u8>> {
    base64::engine::general_purpose::STANDARD
        .decode(s.trim().as_bytes())
        .map_err(|e| anyhow!("base64 decode: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hex_key_decoding() {
        let hex = "00".repeat(31) + "ff";
        let k = slice32(&decode_hex_trimmed(&hex).unwrap()).unwrap();
        assert_eq!(k[31], 0xff);
        assert!(decode_hex_trimmed("abc").is_err());
        assert!(slice32(&[1, 2, 3]).is_err());
    }
}
