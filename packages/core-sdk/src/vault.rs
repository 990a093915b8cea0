use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::engine::general_purpose::{STANDARD, URL_SAFE, URL_SAFE_NO_PAD};
use base64::Engine;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

/** \brief 加密密钥所在的环境变量。 */
pub const ENCRYPTION_KEY_ENV: &str = "AI_ENCRYPTION_KEY";

const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const MASK_VISIBLE_PREFIX: usize = 4;
const MASK_VISIBLE_SUFFIX: usize = 3;
const MASK_MIN_LEN: usize = 8;

#[derive(Debug, Error)]
pub enum VaultError {
    #[error("AI encryption key is not configured ({ENCRYPTION_KEY_ENV})")]
    MissingKey,
    #[error("AI encryption key material is unusable: {0}")]
    InvalidKeyMaterial(String),
    #[error("ciphertext is corrupted or was produced with a different key")]
    InvalidCiphertext,
    #[error("encryption failed: {0}")]
    Encryption(String),
}

/**
 * \brief Provider API Key 的对称加解密（AES-256-GCM）。
 * \details 密文格式：base64url(nonce || ciphertext || tag)，每次加密使用随机 nonce。
 */
#[derive(Clone)]
pub struct CredentialVault {
    cipher: Aes256Gcm,
}

impl fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialVault").finish_non_exhaustive()
    }
}

impl CredentialVault {
    /**
     * \brief 使用给定密钥材料构造。
     * \details 能解码为 32 字节的 base64（Fernet 风格）直接作为密钥，其余字符串经 SHA-256 派生。
     */
    pub fn from_key_material(material: &str) -> Result<Self, VaultError> {
        let material = material.trim();
        if material.is_empty() {
            return Err(VaultError::MissingKey);
        }
        let key = derive_key(material);
        let cipher = Aes256Gcm::new_from_slice(&key)
            .map_err(|e| VaultError::InvalidKeyMaterial(e.to_string()))?;
        Ok(Self { cipher })
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String, VaultError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        getrandom::getrandom(&mut nonce_bytes)
            .map_err(|e| VaultError::Encryption(format!("nonce generation failed: {e}")))?;
        let nonce = Nonce::from_slice(&nonce_bytes);
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext.as_bytes())
            .map_err(|e| VaultError::Encryption(e.to_string()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&ciphertext);
        Ok(URL_SAFE_NO_PAD.encode(out))
    }

    pub fn decrypt(&self, token: &str) -> Result<String, VaultError> {
        let raw = URL_SAFE_NO_PAD
            .decode(token.trim().as_bytes())
            .map_err(|_| VaultError::InvalidCiphertext)?;
        if raw.len() < NONCE_LEN + TAG_LEN {
            debug!(len = raw.len(), "ciphertext too short");
            return Err(VaultError::InvalidCiphertext);
        }
        let (nonce_bytes, body) = raw.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce_bytes), body)
            .map_err(|_| VaultError::InvalidCiphertext)?;
        String::from_utf8(plaintext).map_err(|_| {
            warn!("decrypted credential is not valid UTF-8");
            VaultError::InvalidCiphertext
        })
    }
}

/**
 * \brief 生成可展示的脱敏 Key：长度不超过 8 返回 "***"，否则保留前 4 位与后 3 位。
 */
pub fn mask(plaintext: &str) -> String {
    let chars: Vec<char> = plaintext.chars().collect();
    if chars.len() <= MASK_MIN_LEN {
        return "***".to_string();
    }
    let head: String = chars[..MASK_VISIBLE_PREFIX].iter().collect();
    let tail: String = chars[chars.len() - MASK_VISIBLE_SUFFIX..].iter().collect();
    format!("{}...{}", head, tail)
}

fn derive_key(material: &str) -> [u8; 32] {
    let mut key = [0u8; 32];
    for engine in [URL_SAFE, STANDARD] {
        if let Ok(bytes) = engine.decode(material.as_bytes()) {
            if bytes.len() == key.len() {
                key.copy_from_slice(&bytes);
                return key;
            }
        }
    }
    let digest = Sha256::digest(material.as_bytes());
    key.copy_from_slice(&digest);
    key
}
