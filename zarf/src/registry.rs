//! Version-addressable cipher registry.
//!
//! A registry is an ordered, immutable set of ciphers built from one
//! environment's configuration. The head of the list is the primary
//! (used for all new encryptions); the tail are secondaries, retained
//! to decrypt data produced under older versions.
//!
//! A process holds at most one registry at a time, installed into an
//! atomically-replaceable slot: readers see either the old registry or
//! the new one, never a partial state.

use crate::cipher::{self, Cipher, EncryptOptions};
use crate::config::{CipherConfig, EnvironmentConfig, KeystoreSelector};
use crate::error::Error;
use crate::header::Header;
use crate::keystore::{EnvKeystore, FileKeystore, Keystore, MemoryKeystore};
use secrecy::ExposeSecret;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Ordered, immutable set of ciphers: primary first, secondaries after.
pub struct Registry {
    ciphers: Vec<Arc<Cipher>>,
    by_version: HashMap<u8, Arc<Cipher>>,
}

impl Registry {
    /// Builds every declared cipher in order: locate its keystore,
    /// unwrap the DEK (and IV, where configured) via the KEK, and
    /// construct the cipher. The first entry becomes the primary.
    ///
    /// # Errors
    ///
    /// Any entry failure aborts the load: [`Error::Config`] (empty
    /// list, duplicate versions, invalid entry), [`Error::Keystore`],
    /// [`Error::InsecurePermissions`], or [`Error::KeyUnwrapFailed`].
    pub fn load(config: &EnvironmentConfig) -> Result<Self, Error> {
        if config.ciphers.is_empty() {
            return Err(Error::Config("at least one cipher must be configured".to_string()));
        }

        let mut ciphers = Vec::with_capacity(config.ciphers.len());
        let mut by_version = HashMap::with_capacity(config.ciphers.len());
        for entry in &config.ciphers {
            let cipher = Arc::new(build_cipher(entry)?);
            tracing::debug!(version = cipher.version(), name = %cipher.name(), "cipher loaded");
            if by_version.insert(cipher.version(), Arc::clone(&cipher)).is_some() {
                return Err(Error::Config(format!(
                    "duplicate cipher version {}",
                    cipher.version()
                )));
            }
            ciphers.push(cipher);
        }

        tracing::info!(
            primary = ciphers[0].version(),
            ciphers = ciphers.len(),
            "registry loaded"
        );
        Ok(Self { ciphers, by_version })
    }

    /// Returns the primary cipher, used for all new encryptions.
    #[must_use]
    pub fn primary(&self) -> &Arc<Cipher> {
        &self.ciphers[0]
    }

    /// Looks up a cipher by version.
    ///
    /// # Errors
    ///
    /// Returns [`Error::UnknownCipherVersion`] if the version is not
    /// registered.
    pub fn by_version(&self, version: u8) -> Result<&Arc<Cipher>, Error> {
        self.by_version.get(&version).ok_or(Error::UnknownCipherVersion(version))
    }

    /// Returns the decrypt-only ciphers, most recent first.
    #[must_use]
    pub fn secondaries(&self) -> &[Arc<Cipher>] {
        &self.ciphers[1..]
    }

    /// Returns every cipher, primary first.
    #[must_use]
    pub fn ciphers(&self) -> &[Arc<Cipher>] {
        &self.ciphers
    }

    /// Encrypts with the primary cipher's defaults.
    ///
    /// # Errors
    ///
    /// See [`Cipher::encrypt`].
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        self.primary().encrypt(plaintext)
    }

    /// Encrypts with the primary cipher and explicit options.
    ///
    /// # Errors
    ///
    /// See [`Cipher::encrypt_with`].
    pub fn encrypt_with(&self, plaintext: &[u8], opts: &EncryptOptions) -> Result<Vec<u8>, Error> {
        self.primary().encrypt_with(plaintext, opts)
    }

    /// Decrypts, resolving the header's cipher version against every
    /// registered cipher. Headerless input is raw ciphertext under the
    /// primary.
    ///
    /// # Errors
    ///
    /// [`Error::UnknownCipherVersion`] when the header names an
    /// unregistered version; otherwise as [`Cipher::decrypt`].
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        if !Header::starts_with_magic(data) {
            return self.primary().decrypt(data);
        }

        let (header, consumed) = Header::parse(data)?;
        let resolved = cipher::resolve(
            &header,
            |v| self.by_version.get(&v).map(Arc::as_ref),
            self.primary().as_ref(),
        )?;
        let plaintext = resolved.decrypt_body(&data[consumed..])?;
        if header.compressed() {
            cipher::inflate(&plaintext)
        } else {
            Ok(plaintext)
        }
    }

    /// Decrypts, swallowing [`Error::DecryptionFailed`].
    ///
    /// # Errors
    ///
    /// Everything except `DecryptionFailed` still surfaces.
    pub fn try_decrypt(&self, data: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        match self.decrypt(data) {
            Ok(plaintext) => Ok(Some(plaintext)),
            Err(Error::DecryptionFailed(_)) => Ok(None),
            Err(err) => Err(err),
        }
    }

    /// Encrypts a string with the primary cipher's text encoding.
    ///
    /// # Errors
    ///
    /// See [`Cipher::encrypt_text`].
    pub fn encrypt_text(&self, text: &str) -> Result<String, Error> {
        self.primary().encrypt_text(text)
    }

    /// Reverses [`Registry::encrypt_text`], resolving versions across
    /// the whole registry.
    ///
    /// # Errors
    ///
    /// As [`Registry::decrypt`]; undecodable input and non-UTF-8
    /// plaintext surface as [`Error::DecryptionFailed`].
    pub fn decrypt_text(&self, text: &str) -> Result<String, Error> {
        if text.is_empty() {
            return Ok(String::new());
        }
        let data = self.primary().encoding().decode(text)?;
        let plaintext = self.decrypt(&data)?;
        String::from_utf8(plaintext)
            .map_err(|e| Error::DecryptionFailed(format!("plaintext is not valid UTF-8: {e}")))
    }
}

fn build_cipher(entry: &CipherConfig) -> Result<Cipher, Error> {
    let kek = entry.kek()?;

    let (wrapped_key, wrapped_iv) = match entry.selector()? {
        KeystoreSelector::File { key, iv } => {
            let wrapped = FileKeystore::new(key).read()?;
            let wrapped_iv = iv.map(|path| FileKeystore::new(path).read()).transpose()?;
            (wrapped, wrapped_iv)
        }
        KeystoreSelector::Environment(var) => (EnvKeystore::new(var).read()?, None),
        KeystoreSelector::Memory { key, iv } => {
            let wrapped = MemoryKeystore::from_base64(key)?.read()?;
            let wrapped_iv = iv
                .map(|encoded| MemoryKeystore::from_base64(encoded).and_then(|m| m.read()))
                .transpose()?;
            (wrapped, wrapped_iv)
        }
    };

    let dek = kek.unwrap(&wrapped_key)?;
    let iv = wrapped_iv
        .map(|wrapped| kek.unwrap(&wrapped))
        .transpose()?
        .map(|secret| secret.expose_secret().clone());

    Ok(Cipher::new(entry.version, entry.cipher_name, dek, iv)?
        .with_encoding(entry.encoding)
        .with_always_add_header(entry.always_add_header)
        .with_kek(kek))
}

static CURRENT: RwLock<Option<Arc<Registry>>> = RwLock::new(None);

/// Installs a registry as the process-wide instance, atomically
/// replacing any previous one, and returns the shared handle.
pub fn install(registry: Registry) -> Arc<Registry> {
    let shared = Arc::new(registry);
    *CURRENT.write().expect("registry lock poisoned") = Some(Arc::clone(&shared));
    shared
}

/// Returns the process-wide registry.
///
/// # Errors
///
/// Returns [`Error::Config`] if [`install`] has not been called yet;
/// initialization is explicit, never lazy.
pub fn current() -> Result<Arc<Registry>, Error> {
    CURRENT
        .read()
        .expect("registry lock poisoned")
        .clone()
        .ok_or_else(|| Error::Config("no registry installed".to_string()))
}

#[cfg(test)]
pub(crate) fn test_registry(versions: &[u8]) -> Registry {
    use crate::cipher::CipherName;
    use crate::config::memory_entry;
    use crate::kek::shared_kek;

    let kek = shared_kek();
    let config = EnvironmentConfig {
        ciphers: versions
            .iter()
            .map(|&v| memory_entry(v, CipherName::Aes256Cbc, &kek))
            .collect(),
    };
    Registry::load(&config).expect("test registry load failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherName;
    use crate::config::memory_entry;
    use crate::kek::shared_kek;

    #[test]
    fn test_load_orders_primary_and_secondaries() {
        let registry = test_registry(&[2, 1]);

        assert_eq!(registry.primary().version(), 2);
        assert_eq!(registry.by_version(1).unwrap().version(), 1);
        let secondaries: Vec<u8> = registry.secondaries().iter().map(|c| c.version()).collect();
        assert_eq!(secondaries, vec![1]);
        assert_eq!(registry.ciphers().len(), 2);
    }

    #[test]
    fn test_unknown_version_lookup() {
        let registry = test_registry(&[1]);
        assert!(matches!(registry.by_version(9), Err(Error::UnknownCipherVersion(9))));
    }

    #[test]
    fn test_empty_config_rejected() {
        let result = Registry::load(&EnvironmentConfig::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_duplicate_versions_rejected() {
        let kek = shared_kek();
        let config = EnvironmentConfig {
            ciphers: vec![
                memory_entry(1, CipherName::Aes256Cbc, &kek),
                memory_entry(1, CipherName::Aes256Cbc, &kek),
            ],
        };
        assert!(matches!(Registry::load(&config), Err(Error::Config(_))));
    }

    #[test]
    fn test_encrypt_decrypt_round_trip() {
        let registry = test_registry(&[1]);
        let ciphertext = registry.encrypt(b"registry data").unwrap();
        assert_eq!(registry.decrypt(&ciphertext).unwrap(), b"registry data");
    }

    #[test]
    fn test_decrypts_secondary_ciphertext() {
        let kek = shared_kek();
        let v1 = memory_entry(1, CipherName::Aes256Cbc, &kek);

        let old = Registry::load(&EnvironmentConfig { ciphers: vec![v1.clone()] }).unwrap();
        let ciphertext = old.encrypt(b"written before rotation").unwrap();

        let rotated = Registry::load(&EnvironmentConfig {
            ciphers: vec![memory_entry(2, CipherName::Aes256Cbc, &kek), v1],
        })
        .unwrap();

        assert_eq!(rotated.primary().version(), 2);
        assert_eq!(rotated.decrypt(&ciphertext).unwrap(), b"written before rotation");
    }

    #[test]
    fn test_unknown_header_version_rejected() {
        let registry = test_registry(&[1, 2]);
        let mut data = Header::new(99).to_bytes().unwrap();
        data.extend_from_slice(&[0u8; 32]);
        assert!(matches!(registry.decrypt(&data), Err(Error::UnknownCipherVersion(99))));
    }

    #[test]
    fn test_text_round_trip() {
        let registry = test_registry(&[3]);
        let encrypted = registry.encrypt_text("hello registry").unwrap();
        assert_eq!(registry.decrypt_text(&encrypted).unwrap(), "hello registry");
    }

    #[test]
    fn test_try_decrypt() {
        let registry = test_registry(&[1]);
        assert!(registry.try_decrypt(b"unaligned garbage").unwrap().is_none());
    }

    #[test]
    fn test_install_and_current() {
        assert!(matches!(current().err(), None | Some(Error::Config(_))));

        let handle = install(test_registry(&[1]));
        let fetched = current().expect("registry should be installed");
        assert_eq!(handle.primary().version(), fetched.primary().version());
    }
}
