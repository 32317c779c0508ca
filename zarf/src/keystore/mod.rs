//! Persistence for KEK-wrapped DEKs.
//!
//! A keystore holds exactly one wrapped DEK. The clear DEK never
//! touches the store; wrapping and unwrapping happen in the caller with
//! a [`KeyEncryptingKey`].

use crate::cipher::{random_bytes, CipherName};
use crate::error::Error;
use crate::kek::KeyEncryptingKey;
use secrecy::{ExposeSecret, SecretVec};

mod env;
mod file;
mod memory;

pub use env::EnvKeystore;
pub use file::FileKeystore;
pub use memory::MemoryKeystore;

/// Pluggable persistence for one wrapped DEK.
///
/// Implementations must be thread-safe (`Send + Sync`); the registry
/// reads from keystores while other threads may be rotating.
pub trait Keystore: Send + Sync {
    /// Reads the wrapped DEK bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Keystore`] if the wrapped DEK cannot be
    /// retrieved, [`Error::InsecurePermissions`] for world- or
    /// group-readable key files.
    fn read(&self) -> Result<Vec<u8>, Error>;

    /// Atomically replaces the wrapped DEK bytes.
    ///
    /// Readers observe either the previous or the new wrapped DEK,
    /// never a partial write.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Keystore`] if persistence or permission
    /// enforcement fails.
    fn write(&self, wrapped: &[u8]) -> Result<(), Error>;
}

/// Generates a fresh DEK for `name`, wraps it with `kek`, persists the
/// wrapped form, and returns both forms so the configuration can be
/// updated alongside.
///
/// # Errors
///
/// Returns [`Error::EncryptionFailed`] if wrapping fails,
/// [`Error::Keystore`] if persistence fails.
pub fn generate_data_key(
    store: &dyn Keystore,
    kek: &KeyEncryptingKey,
    name: CipherName,
) -> Result<(Vec<u8>, SecretVec<u8>), Error> {
    let clear = SecretVec::new(random_bytes(name.key_len()));
    let wrapped = kek.wrap(clear.expose_secret())?;
    store.write(&wrapped)?;
    Ok((wrapped, clear))
}
