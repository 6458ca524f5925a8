//! # src/config.rs
//!
//! Die von außen gelieferte Konfiguration: das HMAC-Geheimnis für Payloads und
//! das Geheimnis für die PII-Verschlüsselung. Quelle ist eine TOML-Datei, deren
//! Werte von Umgebungsvariablen überschrieben werden können.
//!
//! ```toml
//! hmac_secret = "..."
//! pii_secret = "..."
//! ```

use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::Path;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::services::payload_signer::PayloadSigner;
use crate::services::pii_cipher::PiiCipher;

pub const HMAC_SECRET_ENV: &str = "VOUCHER_HMAC_SECRET";
pub const PII_SECRET_ENV: &str = "VOUCHER_PII_SECRET";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Could not read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML Deserialization Error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Secret '{0}' is missing or empty.")]
    MissingSecret(&'static str),
}

#[derive(Deserialize, Default)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    hmac_secret: Option<String>,
    pii_secret: Option<String>,
}

/// Die Geheimnisse der Engine. `Debug` gibt sie nie aus.
#[derive(Clone)]
pub struct EngineConfig {
    hmac_secret: Zeroizing<String>,
    pii_secret: Zeroizing<String>,
}

impl fmt::Debug for EngineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EngineConfig")
            .field("hmac_secret", &"<redacted>")
            .field("pii_secret", &"<redacted>")
            .finish()
    }
}

impl EngineConfig {
    pub fn new(hmac_secret: impl Into<String>, pii_secret: impl Into<String>) -> Result<Self, ConfigError> {
        Self::from_parts(Some(hmac_secret.into()), Some(pii_secret.into()))
    }

    fn from_parts(hmac_secret: Option<String>, pii_secret: Option<String>) -> Result<Self, ConfigError> {
        let hmac_secret = hmac_secret
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::MissingSecret("hmac_secret"))?;
        let pii_secret = pii_secret
            .filter(|s| !s.trim().is_empty())
            .ok_or(ConfigError::MissingSecret("pii_secret"))?;
        Ok(EngineConfig {
            hmac_secret: Zeroizing::new(hmac_secret),
            pii_secret: Zeroizing::new(pii_secret),
        })
    }

    /// Liest die Konfiguration aus einem TOML-String, ohne Umgebungsvariablen.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let raw: RawConfig = toml::from_str(content)?;
        Self::from_parts(raw.hmac_secret, raw.pii_secret)
    }

    /// Liest die Konfiguration nur aus den Umgebungsvariablen.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::resolve(RawConfig::default(), |key| std::env::var(key).ok())
    }

    /// Liest eine TOML-Datei; gesetzte Umgebungsvariablen haben Vorrang.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let raw: RawConfig = toml::from_str(&content)?;
        Self::resolve(raw, |key| std::env::var(key).ok())
    }

    fn resolve(raw: RawConfig, env: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let hmac_secret = env(HMAC_SECRET_ENV).or(raw.hmac_secret);
        let pii_secret = env(PII_SECRET_ENV).or(raw.pii_secret);
        Self::from_parts(hmac_secret, pii_secret)
    }

    pub fn payload_signer(&self) -> PayloadSigner {
        PayloadSigner::new(self.hmac_secret.as_bytes())
    }

    pub fn pii_cipher(&self) -> PiiCipher {
        PiiCipher::new(self.pii_secret.as_bytes())
    }
}
