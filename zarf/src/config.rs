//! Typed configuration matching the deployment schema.
//!
//! The core never parses configuration files itself; tooling
//! deserializes YAML (or any serde format) into these structs and hands
//! them over. Rotation returns an updated [`Config`] in the same shape
//! so it can be written straight back.

use crate::cipher::{CipherName, Encoding};
use crate::error::Error;
use crate::kek::{KeyEncryptingKey, WrapScheme};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Full configuration: one entry per environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Config {
    /// Environments by name (`development`, `production`, ...).
    pub environments: BTreeMap<String, EnvironmentConfig>,
}

impl Config {
    /// Looks up an environment by name.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the environment is not declared.
    pub fn environment(&self, name: &str) -> Result<&EnvironmentConfig, Error> {
        self.environments
            .get(name)
            .ok_or_else(|| Error::Config(format!("environment {name} is not configured")))
    }
}

/// Cipher list for one environment. The first entry is the primary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EnvironmentConfig {
    /// Declared ciphers, primary first.
    pub ciphers: Vec<CipherConfig>,
}

const fn default_true() -> bool {
    true
}

/// One declared cipher: version, algorithm, and exactly one keystore
/// selector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CipherConfig {
    /// Cipher version (1-255; 0 is reserved)
    pub version: u8,

    /// Algorithm (default `aes-256-cbc`)
    #[serde(default)]
    pub cipher_name: CipherName,

    /// Text-API encoding (default `base64`)
    #[serde(default)]
    pub encoding: Encoding,

    /// Whether messages get a header unless suppressed (default true)
    #[serde(default = "default_true")]
    pub always_add_header: bool,

    /// File keystore: path of the wrapped DEK file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_filename: Option<PathBuf>,

    /// File keystore: path of the wrapped IV file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iv_filename: Option<PathBuf>,

    /// Environment keystore: variable holding the wrapped DEK as base64
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_env_var: Option<String>,

    /// Memory keystore: wrapped DEK as base64, inline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_key: Option<String>,

    /// Memory keystore: wrapped IV as base64, inline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encrypted_iv: Option<String>,

    /// KEK private key, PEM, inline
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_encrypting_key: Option<String>,

    /// KEK private key, PEM, referenced by path
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_encrypting_key_filename: Option<PathBuf>,

    /// DEK wrap scheme recorded at KEK generation (default `oaep`)
    #[serde(default)]
    pub key_wrap: WrapScheme,
}

/// The keystore variant a cipher entry selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeystoreSelector<'a> {
    /// Wrapped DEK (and optional wrapped IV) in owner-only files
    File {
        /// Wrapped DEK file
        key: &'a Path,
        /// Wrapped IV file, if configured
        iv: Option<&'a Path>,
    },
    /// Wrapped DEK as base64 in a named environment variable
    Environment(&'a str),
    /// Wrapped DEK (and optional wrapped IV) inline in the config
    Memory {
        /// Wrapped DEK, base64
        key: &'a str,
        /// Wrapped IV, base64, if configured
        iv: Option<&'a str>,
    },
}

impl CipherConfig {
    /// Creates an entry with defaults and no keystore selector.
    #[must_use]
    pub fn new(version: u8) -> Self {
        Self {
            version,
            cipher_name: CipherName::default(),
            encoding: Encoding::default(),
            always_add_header: true,
            key_filename: None,
            iv_filename: None,
            key_env_var: None,
            encrypted_key: None,
            encrypted_iv: None,
            key_encrypting_key: None,
            key_encrypting_key_filename: None,
            key_wrap: WrapScheme::default(),
        }
    }

    /// Determines the keystore variant this entry selects.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] unless exactly one selector is present,
    /// or an IV selector appears without its key selector.
    pub fn selector(&self) -> Result<KeystoreSelector<'_>, Error> {
        let selected = [
            self.key_filename.is_some(),
            self.key_env_var.is_some(),
            self.encrypted_key.is_some(),
        ]
        .iter()
        .filter(|&&s| s)
        .count();
        if selected != 1 {
            return Err(Error::Config(format!(
                "cipher v{} must declare exactly one of key_filename, key_env_var, encrypted_key (found {selected})",
                self.version
            )));
        }
        if self.iv_filename.is_some() && self.key_filename.is_none() {
            return Err(Error::Config(format!(
                "cipher v{}: iv_filename requires key_filename",
                self.version
            )));
        }
        if self.encrypted_iv.is_some() && self.encrypted_key.is_none() {
            return Err(Error::Config(format!(
                "cipher v{}: encrypted_iv requires encrypted_key",
                self.version
            )));
        }

        if let Some(ref key) = self.key_filename {
            Ok(KeystoreSelector::File { key, iv: self.iv_filename.as_deref() })
        } else if let Some(ref var) = self.key_env_var {
            Ok(KeystoreSelector::Environment(var))
        } else {
            Ok(KeystoreSelector::Memory {
                key: self.encrypted_key.as_deref().unwrap_or_default(),
                iv: self.encrypted_iv.as_deref(),
            })
        }
    }

    /// Whether this entry carries KEK material (inline or by path).
    #[must_use]
    pub const fn has_kek(&self) -> bool {
        self.key_encrypting_key.is_some() || self.key_encrypting_key_filename.is_some()
    }

    /// Loads this entry's KEK with the recorded wrap scheme.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if no KEK material is declared or the
    /// PEM is invalid, [`Error::Keystore`] if the PEM file is
    /// unreadable.
    pub fn kek(&self) -> Result<KeyEncryptingKey, Error> {
        if let Some(ref pem) = self.key_encrypting_key {
            return KeyEncryptingKey::from_pem_with(pem, self.key_wrap);
        }
        if let Some(ref path) = self.key_encrypting_key_filename {
            let pem = std::fs::read_to_string(path).map_err(|e| {
                Error::Keystore(format!("cannot read KEK file {}: {e}", path.display()))
            })?;
            return KeyEncryptingKey::from_pem_with(&pem, self.key_wrap);
        }
        Err(Error::Config(format!("cipher v{} declares no key-encrypting key", self.version)))
    }
}

/// Builds a memory-backed cipher entry wrapped by `kek`. Key material
/// is derived from the version so two entries for the same version
/// decrypt each other's output.
#[cfg(test)]
pub(crate) fn memory_entry(
    version: u8,
    name: CipherName,
    kek: &KeyEncryptingKey,
) -> CipherConfig {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;

    let mut entry = CipherConfig::new(version);
    entry.cipher_name = name;
    entry.encrypted_key =
        Some(STANDARD.encode(kek.wrap(&vec![version; name.key_len()]).unwrap()));
    entry.encrypted_iv =
        Some(STANDARD.encode(kek.wrap(&vec![version ^ 0xA5; name.iv_len()]).unwrap()));
    entry.key_encrypting_key = Some(kek.to_pem().unwrap().to_string());
    entry
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector_requires_exactly_one() {
        let entry = CipherConfig::new(1);
        assert!(matches!(entry.selector(), Err(Error::Config(_))));

        let mut both = CipherConfig::new(1);
        both.key_filename = Some(PathBuf::from("/keys/v1.key"));
        both.key_env_var = Some("APP_V1".to_string());
        assert!(matches!(both.selector(), Err(Error::Config(_))));
    }

    #[test]
    fn test_selector_variants() {
        let mut file = CipherConfig::new(1);
        file.key_filename = Some(PathBuf::from("/keys/v1.key"));
        file.iv_filename = Some(PathBuf::from("/keys/v1.iv"));
        assert!(matches!(file.selector().unwrap(), KeystoreSelector::File { iv: Some(_), .. }));

        let mut env = CipherConfig::new(2);
        env.key_env_var = Some("APP_PRODUCTION_V2".to_string());
        assert_eq!(env.selector().unwrap(), KeystoreSelector::Environment("APP_PRODUCTION_V2"));

        let mut memory = CipherConfig::new(3);
        memory.encrypted_key = Some("QUJD".to_string());
        assert!(matches!(memory.selector().unwrap(), KeystoreSelector::Memory { iv: None, .. }));
    }

    #[test]
    fn test_orphan_iv_selectors_rejected() {
        let mut entry = CipherConfig::new(1);
        entry.key_env_var = Some("APP_V1".to_string());
        entry.iv_filename = Some(PathBuf::from("/keys/v1.iv"));
        assert!(matches!(entry.selector(), Err(Error::Config(_))));

        let mut entry = CipherConfig::new(1);
        entry.key_env_var = Some("APP_V1".to_string());
        entry.encrypted_iv = Some("QUJD".to_string());
        assert!(matches!(entry.selector(), Err(Error::Config(_))));
    }

    #[test]
    fn test_missing_kek_rejected() {
        let entry = CipherConfig::new(1);
        assert!(!entry.has_kek());
        assert!(matches!(entry.kek(), Err(Error::Config(_))));
    }

    #[test]
    fn test_environment_lookup() {
        let mut config = Config::default();
        config.environments.insert("test".to_string(), EnvironmentConfig::default());

        assert!(config.environment("test").is_ok());
        assert!(matches!(config.environment("production"), Err(Error::Config(_))));
    }

    #[test]
    fn test_defaults_deserialize() {
        let entry: CipherConfig =
            serde_json::from_str(r#"{"version": 1, "key_env_var": "APP_V1"}"#).unwrap();
        assert_eq!(entry.cipher_name, CipherName::Aes256Cbc);
        assert_eq!(entry.encoding, Encoding::Base64);
        assert!(entry.always_add_header);
        assert_eq!(entry.key_wrap, WrapScheme::Oaep);
    }
}
