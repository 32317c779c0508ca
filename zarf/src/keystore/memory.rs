//! In-memory keystore: the wrapped DEK lives in the configuration blob.

use super::Keystore;
use crate::error::Error;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::sync::RwLock;

/// Keystore holding the wrapped DEK inline, for test and bootstrap use.
///
/// The interior lock lets rotation tooling observe writes through
/// [`MemoryKeystore::to_base64`] when rebuilding the configuration.
pub struct MemoryKeystore {
    wrapped: RwLock<Vec<u8>>,
}

impl MemoryKeystore {
    /// Creates a keystore around already-wrapped DEK bytes.
    #[must_use]
    pub fn new(wrapped: Vec<u8>) -> Self {
        Self { wrapped: RwLock::new(wrapped) }
    }

    /// Creates a keystore from the base64 form stored in configuration.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Keystore`] if the input is not valid base64.
    pub fn from_base64(encoded: &str) -> Result<Self, Error> {
        let wrapped = STANDARD
            .decode(encoded.trim())
            .map_err(|e| Error::Keystore(format!("inline wrapped DEK is not valid base64: {e}")))?;
        Ok(Self::new(wrapped))
    }

    /// Returns the current wrapped DEK as base64, the form stored in
    /// configuration.
    #[must_use]
    pub fn to_base64(&self) -> String {
        STANDARD.encode(&*self.wrapped.read().expect("keystore lock poisoned"))
    }
}

impl Keystore for MemoryKeystore {
    fn read(&self) -> Result<Vec<u8>, Error> {
        Ok(self.wrapped.read().expect("keystore lock poisoned").clone())
    }

    fn write(&self, wrapped: &[u8]) -> Result<(), Error> {
        *self.wrapped.write().expect("keystore lock poisoned") = wrapped.to_vec();
        Ok(())
    }
}
