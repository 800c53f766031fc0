//! Encryption at rest for git source credentials
//!
//! AES-256-GCM with a single key kept in a JSON key file next to the
//! database. Stored values look like `enc:v1:<key id>:<nonce>:<ciphertext>`.

use aes_gcm::{
    aead::{Aead, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use anyhow::{Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::info;

const KEY_LENGTH: usize = 32;
const NONCE_LENGTH: usize = 12;
const ENCRYPTED_PREFIX: &str = "enc:v1:";

#[derive(Serialize, Deserialize)]
struct KeyFile {
    id: String,
    key: String,
    created_at: String,
}

pub struct CredentialVault {
    key: [u8; KEY_LENGTH],
    key_id: String,
}

impl CredentialVault {
    /// Fresh random key, not persisted
    pub fn generate() -> Self {
        let mut key = [0u8; KEY_LENGTH];
        OsRng.fill_bytes(&mut key);
        Self {
            key,
            key_id: uuid::Uuid::new_v4().to_string(),
        }
    }

    /// Load the key file, creating it (mode 0600) on first start
    pub fn load_or_create(path: &Path) -> Result<Self> {
        if path.exists() {
            return Self::load(path);
        }

        let vault = Self::generate();
        vault.save(path)?;
        info!(path = %path.display(), "Generated credential encryption key");
        Ok(vault)
    }

    fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read key file {}", path.display()))?;
        let file: KeyFile = serde_json::from_str(&content).context("Failed to parse key file")?;

        let bytes = STANDARD.decode(&file.key).context("Failed to decode key")?;
        if bytes.len() != KEY_LENGTH {
            anyhow::bail!("Invalid key length: expected {}, got {}", KEY_LENGTH, bytes.len());
        }

        let mut key = [0u8; KEY_LENGTH];
        key.copy_from_slice(&bytes);
        Ok(Self { key, key_id: file.id })
    }

    fn save(&self, path: &Path) -> Result<()> {
        let file = KeyFile {
            id: self.key_id.clone(),
            key: STANDARD.encode(self.key),
            created_at: crate::model::now_rfc3339(),
        };
        let content = serde_json::to_string_pretty(&file)?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let tmp_path = path.with_extension("tmp");
        std::fs::write(&tmp_path, &content)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&tmp_path, path)?;
        Ok(())
    }

    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    fn cipher(&self) -> Result<Aes256Gcm> {
        Aes256Gcm::new_from_slice(&self.key).map_err(|e| anyhow::anyhow!("Failed to create cipher: {}", e))
    }

    pub fn encrypt(&self, plaintext: &str) -> Result<String> {
        let mut nonce_bytes = [0u8; NONCE_LENGTH];
        OsRng.fill_bytes(&mut nonce_bytes);

        let ciphertext = self
            .cipher()?
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_bytes())
            .map_err(|e| anyhow::anyhow!("Encryption failed: {}", e))?;

        Ok(format!(
            "{}{}:{}:{}",
            ENCRYPTED_PREFIX,
            self.key_id,
            STANDARD.encode(nonce_bytes),
            STANDARD.encode(ciphertext)
        ))
    }

    /// Decrypt a stored value; values without the prefix pass through
    pub fn decrypt(&self, stored: &str) -> Result<String> {
        let Some(data) = stored.strip_prefix(ENCRYPTED_PREFIX) else {
            return Ok(stored.to_string());
        };

        let mut parts = data.splitn(3, ':');
        let (Some(key_id), Some(nonce_b64), Some(cipher_b64)) = (parts.next(), parts.next(), parts.next()) else {
            anyhow::bail!("Invalid encrypted credential format");
        };

        if key_id != self.key_id {
            anyhow::bail!("Credential was encrypted with unknown key {}", key_id);
        }

        let nonce_bytes = STANDARD.decode(nonce_b64).context("Failed to decode nonce")?;
        if nonce_bytes.len() != NONCE_LENGTH {
            anyhow::bail!("Invalid nonce length");
        }
        let ciphertext = STANDARD.decode(cipher_b64).context("Failed to decode ciphertext")?;

        let plaintext = self
            .cipher()?
            .decrypt(Nonce::from_slice(&nonce_bytes), ciphertext.as_ref())
            .map_err(|e| anyhow::anyhow!("Decryption failed: {}", e))?;

        String::from_utf8(plaintext).context("Invalid UTF-8 in decrypted credential")
    }

    pub fn is_encrypted(value: &str) -> bool {
        value.starts_with(ENCRYPTED_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_encrypt_decrypt() {
        let vault = CredentialVault::generate();
        let encrypted = vault.encrypt("ghp_token").unwrap();

        assert!(CredentialVault::is_encrypted(&encrypted));
        assert!(!encrypted.contains("ghp_token"));
        assert_eq!(vault.decrypt(&encrypted).unwrap(), "ghp_token");
    }

    #[test]
    fn test_plain_values_pass_through() {
        let vault = CredentialVault::generate();
        assert_eq!(vault.decrypt("plain").unwrap(), "plain");
    }

    #[test]
    fn test_foreign_key_is_rejected() {
        let encrypted = CredentialVault::generate().encrypt("secret").unwrap();
        assert!(CredentialVault::generate().decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let vault = CredentialVault::generate();
        let mut encrypted = vault.encrypt("secret").unwrap();
        encrypted.pop();
        encrypted.push(if encrypted.ends_with('A') { 'B' } else { 'A' });
        assert!(vault.decrypt(&encrypted).is_err());
    }

    #[test]
    fn test_key_file_is_reused() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys").join("secrets.key");

        let first = CredentialVault::load_or_create(&path).unwrap();
        let encrypted = first.encrypt("secret").unwrap();

        let second = CredentialVault::load_or_create(&path).unwrap();
        assert_eq!(first.key_id(), second.key_id());
        assert_eq!(second.decrypt(&encrypted).unwrap(), "secret");
    }
}
