//! Authenticated encryption for stored credential blobs
//!
//! Blobs are AES-256-GCM encrypted with a fresh 96-bit nonce per write and
//! stored as base64(`nonce || ciphertext`). The key is derived from a master
//! secret with Argon2id, so the database alone never yields plaintext
//! credentials.

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Nonce,
};
use argon2::Argon2;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use std::fmt;
use tracing::debug;

use crate::config::SecurityConfig;
use crate::error::{Result, TriageError};
use crate::models::Credentials;

/// Nonce size for AES-GCM (96 bits / 12 bytes)
const NONCE_SIZE: usize = 12;

pub struct CredentialCipher {
    cipher: Aes256Gcm,
}

impl fmt::Debug for CredentialCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialCipher").finish_non_exhaustive()
    }
}

impl CredentialCipher {
    /// Derive the encryption key from a master secret and salt
    pub fn from_secret(secret: &[u8], salt: &[u8]) -> Result<Self> {
        if secret.is_empty() {
            return Err(TriageError::Crypto("master secret cannot be empty".to_string()));
        }

        let mut key = [0u8; 32];
        Argon2::default()
            .hash_password_into(secret, salt, &mut key)
            .map_err(|e| TriageError::Crypto(format!("Argon2 key derivation failed: {}", e)))?;

        debug!("Derived credential encryption key");
        Ok(Self {
            cipher: Aes256Gcm::new(&key.into()),
        })
    }

    /// Read the master secret from the environment variable named in the config
    pub fn from_env(security: &SecurityConfig) -> Result<Self> {
        let secret = std::env::var(&security.secret_env).map_err(|_| {
            TriageError::Config(format!(
                "{} is not set; it holds the secret used to encrypt stored credentials",
                security.secret_env
            ))
        })?;
        Self::from_secret(secret.as_bytes(), security.salt.as_bytes())
    }

    pub fn encrypt(&self, plaintext: &[u8]) -> Result<String> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|e| TriageError::Crypto(format!("AES-GCM encryption failed: {}", e)))?;

        let mut combined = Vec::with_capacity(NONCE_SIZE + ciphertext.len());
        combined.extend_from_slice(nonce.as_slice());
        combined.extend_from_slice(&ciphertext);

        Ok(BASE64.encode(&combined))
    }

    pub fn decrypt(&self, encoded: &str) -> Result<Vec<u8>> {
        let combined = BASE64
            .decode(encoded)
            .map_err(|e| TriageError::Crypto(format!("Invalid base64 encoding: {}", e)))?;

        if combined.len() <= NONCE_SIZE {
            return Err(TriageError::Crypto(format!(
                "Encrypted data too short: {} bytes",
                combined.len()
            )));
        }

        let (nonce_bytes, ciphertext) = combined.split_at(NONCE_SIZE);
        self.cipher
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|_| {
                TriageError::Crypto(
                    "AES-GCM decryption failed (wrong secret or corrupted data)".to_string(),
                )
            })
    }

    pub fn seal_credentials(&self, credentials: &Credentials) -> Result<String> {
        let json = serde_json::to_vec(credentials)?;
        self.encrypt(&json)
    }

    pub fn open_credentials(&self, sealed: &str) -> Result<Credentials> {
        let json = self.decrypt(sealed)?;
        Ok(serde_json::from_slice(&json)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{GmailCredentials, ImapCredentials};
    use serial_test::serial;

    const SALT: &[u8] = b"test-salt-0123456789";

    fn cipher() -> CredentialCipher {
        CredentialCipher::from_secret(b"correct horse battery staple", SALT).unwrap()
    }

    #[test]
    fn test_sealed_blob_hides_plaintext() {
        let creds = Credentials::Imap(ImapCredentials {
            host: "imap.example.com".to_string(),
            port: 993,
            username: "alice".to_string(),
            password: "p@ssw0rd-very-secret".to_string(),
            use_tls: true,
        });

        let sealed = cipher().seal_credentials(&creds).unwrap();
        assert!(!sealed.contains("p@ssw0rd"));
        let raw = BASE64.decode(&sealed).unwrap();
        assert!(!String::from_utf8_lossy(&raw).contains("p@ssw0rd"));

        let opened = cipher().open_credentials(&sealed).unwrap();
        assert_eq!(opened, creds);
    }

    #[test]
    fn test_nonce_is_fresh_per_encryption() {
        let c = cipher();
        let a = c.encrypt(b"same input").unwrap();
        let b = c.encrypt(b"same input").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_secret_fails_authentication() {
        let creds = Credentials::Gmail(GmailCredentials {
            refresh_token: "1//token".to_string(),
            client_id: None,
            client_secret: None,
        });
        let sealed = cipher().seal_credentials(&creds).unwrap();

        let other = CredentialCipher::from_secret(b"a different secret", SALT).unwrap();
        assert!(matches!(
            other.open_credentials(&sealed),
            Err(TriageError::Crypto(_))
        ));
    }

    #[test]
    fn test_tampered_ciphertext_is_rejected() {
        let c = cipher();
        let sealed = c.encrypt(b"payload").unwrap();
        let mut raw = BASE64.decode(&sealed).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0x01;
        assert!(c.decrypt(&BASE64.encode(&raw)).is_err());
    }

    #[test]
    fn test_truncated_and_malformed_input() {
        let c = cipher();
        assert!(c.decrypt("not base64 !!").is_err());
        assert!(c.decrypt(&BASE64.encode([0u8; NONCE_SIZE])).is_err());
    }

    #[test]
    fn test_empty_secret_rejected() {
        assert!(CredentialCipher::from_secret(b"", SALT).is_err());
    }

    #[test]
    #[serial]
    fn test_from_env() {
        let security = SecurityConfig {
            secret_env: "MAIL_TRIAGE_TEST_SECRET".to_string(),
            salt: "test-salt-0123456789".to_string(),
        };

        std::env::remove_var("MAIL_TRIAGE_TEST_SECRET");
        let err = CredentialCipher::from_env(&security).unwrap_err();
        assert!(err.to_string().contains("MAIL_TRIAGE_TEST_SECRET"));

        std::env::set_var("MAIL_TRIAGE_TEST_SECRET", "correct horse battery staple");
        let from_env = CredentialCipher::from_env(&security).unwrap();
        let sealed = cipher().encrypt(b"shared").unwrap();
        assert_eq!(from_env.decrypt(&sealed).unwrap(), b"shared");
        std::env::remove_var("MAIL_TRIAGE_TEST_SECRET");
    }
}
