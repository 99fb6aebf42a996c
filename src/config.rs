//! Provider configuration and credential loading
//!
//! Credentials arrive either as plain values or as one AES-CBC encrypted,
//! base64 encoded blob (`CLB_ENCRYPTED_CREDENTIALS`) holding
//! `{"SecretId": "...", "SecretKey": "..."}`.

use std::fmt;
use std::time::Duration;

use aes::cipher::{block_padding::NoPadding, BlockDecryptMut, KeyIvInit};
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// AES block size, which also fixes the key length and the IV
pub const AES_BLOCK_SIZE: usize = 16;

type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;

/// Provider API credentials
#[derive(Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Credentials {
    pub secret_id: String,
    pub secret_key: String,
}

impl Credentials {
    pub fn new(secret_id: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Self {
            secret_id: secret_id.into(),
            secret_key: secret_key.into(),
        }
    }

    /// Pick credentials from an encrypted blob when present, plain values otherwise
    pub fn resolve(
        secret_id: Option<String>,
        secret_key: Option<String>,
        encrypted: Option<&str>,
        key: Option<&str>,
    ) -> Result<Self> {
        if let Some(blob) = encrypted.filter(|b| !b.trim().is_empty()) {
            let key = key.ok_or_else(|| {
                Error::ConfigError(
                    "CLB_ENCRYPTED_CREDENTIALS is set but no decryption key was provided"
                        .to_string(),
                )
            })?;
            return decrypt_credentials(blob, key.as_bytes());
        }

        match (secret_id, secret_key) {
            (Some(id), Some(key)) if !id.is_empty() && !key.is_empty() => Ok(Self::new(id, key)),
            _ => Err(Error::ConfigError(
                "provider secret id and secret key are required".to_string(),
            )),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("secret_id", &self.secret_id)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Decrypt an AES-128-CBC ciphertext whose IV is the key itself.
///
/// Padding is removed by reading the last byte as the pad length.
pub fn aes_cbc_decrypt(ciphertext: &[u8], key: &[u8]) -> Result<Vec<u8>> {
    if key.len() != AES_BLOCK_SIZE {
        return Err(Error::ConfigError(format!(
            "decryption key must be {AES_BLOCK_SIZE} bytes, got {}",
            key.len()
        )));
    }
    if ciphertext.is_empty() || ciphertext.len() % AES_BLOCK_SIZE != 0 {
        return Err(Error::ConfigError(format!(
            "ciphertext length {} is not a multiple of {AES_BLOCK_SIZE}",
            ciphertext.len()
        )));
    }

    let decryptor = Aes128CbcDec::new_from_slices(key, &key[..AES_BLOCK_SIZE])
        .map_err(|e| Error::ConfigError(format!("invalid key: {e}")))?;
    let mut plain = decryptor
        .decrypt_padded_vec_mut::<NoPadding>(ciphertext)
        .map_err(|e| Error::ConfigError(format!("decryption failed: {e}")))?;

    pkcs7_unpad(&mut plain)?;
    Ok(plain)
}

fn pkcs7_unpad(plain: &mut Vec<u8>) -> Result<()> {
    let pad = plain.last().copied().unwrap_or(0) as usize;
    if pad == 0 || pad > AES_BLOCK_SIZE || pad > plain.len() {
        return Err(Error::ConfigError(format!("invalid padding length {pad}")));
    }
    plain.truncate(plain.len() - pad);
    Ok(())
}

/// Decode and decrypt the encrypted credential blob
pub fn decrypt_credentials(blob_b64: &str, key: &[u8]) -> Result<Credentials> {
    let ciphertext = base64::engine::general_purpose::STANDARD
        .decode(blob_b64.trim())
        .map_err(|e| Error::ConfigError(format!("encrypted credentials are not base64: {e}")))?;
    let plain = aes_cbc_decrypt(&ciphertext, key)?;
    let credentials: Credentials = serde_json::from_slice(&plain)
        .map_err(|e| Error::ConfigError(format!("decrypted credentials are not valid JSON: {e}")))?;
    Ok(credentials)
}

/// Token bucket settings shared by every outbound call
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    /// Sustained calls per second
    #[serde(default = "default_rate")]
    pub rate_per_sec: f64,

    /// Calls allowed back to back before throttling starts
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Waits longer than this are logged
    #[serde(default = "default_slow_wait", with = "duration_ms")]
    pub slow_wait_threshold: Duration,
}

fn default_rate() -> f64 {
    20.0
}

fn default_burst() -> u32 {
    20
}

fn default_slow_wait() -> Duration {
    Duration::from_millis(500)
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            rate_per_sec: default_rate(),
            burst: default_burst(),
            slow_wait_threshold: default_slow_wait(),
        }
    }
}

/// Retry budget for rate-limited and busy replies
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    /// Total attempts including the first one
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    #[serde(default = "default_retry_backoff", with = "duration_ms")]
    pub backoff: Duration,
}

fn default_max_attempts() -> u32 {
    10
}

fn default_retry_backoff() -> Duration {
    Duration::from_secs(1)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff: default_retry_backoff(),
        }
    }
}

/// Async task polling settings
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPollConfig {
    #[serde(default = "default_poll_interval", with = "duration_ms")]
    pub interval: Duration,

    #[serde(default = "default_max_polls")]
    pub max_polls: u32,
}

fn default_poll_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_polls() -> u32 {
    60
}

impl Default for TaskPollConfig {
    fn default() -> Self {
        Self {
            interval: default_poll_interval(),
            max_polls: default_max_polls(),
        }
    }
}

/// Provider-imposed item caps per call
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchLimits {
    #[serde(default = "default_listeners_per_create")]
    pub listeners_per_create: usize,
    #[serde(default = "default_twenty")]
    pub listeners_per_delete: usize,
    #[serde(default = "default_twenty")]
    pub rules_per_call: usize,
    #[serde(default = "default_twenty")]
    pub targets_per_call: usize,
    #[serde(default = "default_ids_per_describe")]
    pub ids_per_describe: usize,
}

fn default_listeners_per_create() -> usize {
    50
}

fn default_twenty() -> usize {
    20
}

fn default_ids_per_describe() -> usize {
    100
}

impl Default for BatchLimits {
    fn default() -> Self {
        Self {
            listeners_per_create: default_listeners_per_create(),
            listeners_per_delete: default_twenty(),
            rules_per_call: default_twenty(),
            targets_per_call: default_twenty(),
            ids_per_describe: default_ids_per_describe(),
        }
    }
}

/// Everything needed to build provider clients
#[derive(Clone, Debug)]
pub struct ProviderConfig {
    pub credentials: Credentials,
    /// Provider API domain or URL
    pub endpoint: String,
    pub default_region: String,
    /// Deadline for a single provider call
    pub call_timeout: Duration,
    pub rate_limit: RateLimitConfig,
    pub retry: RetryPolicy,
    pub task_poll: TaskPollConfig,
    pub limits: BatchLimits,
    /// Parallel port-range listener creations per reconciliation
    pub segment_concurrency: usize,
}

impl ProviderConfig {
    pub fn new(credentials: Credentials, endpoint: impl Into<String>, default_region: impl Into<String>) -> Self {
        Self {
            credentials,
            endpoint: endpoint.into(),
            default_region: default_region.into(),
            call_timeout: Duration::from_secs(10),
            rate_limit: RateLimitConfig::default(),
            retry: RetryPolicy::default(),
            task_poll: TaskPollConfig::default(),
            limits: BatchLimits::default(),
            segment_concurrency: 10,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.endpoint.is_empty() {
            return Err(Error::ConfigError("provider endpoint is required".to_string()));
        }
        if self.default_region.is_empty() {
            return Err(Error::ConfigError("default region is required".to_string()));
        }
        if self.rate_limit.rate_per_sec <= 0.0 || self.rate_limit.burst == 0 {
            return Err(Error::ConfigError(
                "rate limit must allow at least one call".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 || self.task_poll.max_polls == 0 {
            return Err(Error::ConfigError(
                "retry and poll budgets must be at least 1".to_string(),
            ));
        }
        if self.segment_concurrency == 0 {
            return Err(Error::ConfigError(
                "segment concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aes::cipher::{block_padding::Pkcs7, BlockEncryptMut};

    const KEY: &[u8; 16] = b"0123456789abcdef";

    fn encrypt(plain: &[u8]) -> String {
        let enc = cbc::Encryptor::<aes::Aes128>::new_from_slices(KEY, KEY).unwrap();
        let ct = enc.encrypt_padded_vec_mut::<Pkcs7>(plain);
        base64::engine::general_purpose::STANDARD.encode(ct)
    }

    #[test]
    fn test_decrypt_credentials() {
        let blob = encrypt(br#"{"SecretId":"AKID1","SecretKey":"s3cret"}"#);
        let creds = decrypt_credentials(&blob, KEY).unwrap();
        assert_eq!(creds.secret_id, "AKID1");
        assert_eq!(creds.secret_key, "s3cret");
    }

    #[test]
    fn test_decrypt_rejects_wrong_key_length() {
        let err = aes_cbc_decrypt(&[0u8; 16], b"short").unwrap_err();
        assert!(err.to_string().contains("16 bytes"));
    }

    #[test]
    fn test_decrypt_rejects_partial_block() {
        let err = aes_cbc_decrypt(&[0u8; 15], KEY).unwrap_err();
        assert!(err.to_string().contains("multiple of 16"));
    }

    #[test]
    fn test_unpad_strips_tail_count() {
        let mut data = b"hello\x03\x03\x03".to_vec();
        pkcs7_unpad(&mut data).unwrap();
        assert_eq!(data, b"hello");

        let mut bad = b"hello\x00".to_vec();
        assert!(pkcs7_unpad(&mut bad).is_err());
    }

    #[test]
    fn test_debug_redacts_secret_key() {
        let creds = Credentials::new("AKID1", "s3cret");
        let dbg = format!("{creds:?}");
        assert!(dbg.contains("AKID1"));
        assert!(!dbg.contains("s3cret"));
    }

    #[test]
    fn test_resolve_prefers_encrypted_blob() {
        let blob = encrypt(br#"{"SecretId":"enc","SecretKey":"k"}"#);
        let key = std::str::from_utf8(KEY).unwrap();
        let creds = Credentials::resolve(
            Some("plain".to_string()),
            Some("plain".to_string()),
            Some(&blob),
            Some(key),
        )
        .unwrap();
        assert_eq!(creds.secret_id, "enc");

        let err = Credentials::resolve(None, None, None, None).unwrap_err();
        assert!(matches!(err, Error::ConfigError(_)));
    }

    #[test]
    fn test_provider_config_validation() {
        let mut cfg = ProviderConfig::new(Credentials::new("a", "b"), "clb.example.com", "ap-1");
        assert!(cfg.validate().is_ok());
        cfg.retry.max_attempts = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_batch_limits_defaults_from_empty_json() {
        let limits: BatchLimits = serde_json::from_str("{}").unwrap();
        assert_eq!(limits.listeners_per_create, 50);
        assert_eq!(limits.targets_per_call, 20);
    }
}
