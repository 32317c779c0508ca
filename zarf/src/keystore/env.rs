//! Environment-variable keystore.

use super::Keystore;
use crate::error::Error;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

/// Keystore reading the wrapped DEK from a named environment variable
/// as a base64 string.
///
/// `read` is a pure lookup. `write` sets the variable in the *current
/// process* only, which covers bootstrap and test flows; deployment
/// tooling is responsible for exporting the value into real
/// environments.
pub struct EnvKeystore {
    name: String,
}

impl EnvKeystore {
    /// Creates a keystore for the given variable name.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }

    /// Returns the environment variable name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }
}

impl Keystore for EnvKeystore {
    fn read(&self) -> Result<Vec<u8>, Error> {
        let value = std::env::var(&self.name).map_err(|_| {
            Error::Keystore(format!("environment variable {} is not set", self.name))
        })?;
        STANDARD.decode(value.trim()).map_err(|e| {
            Error::Keystore(format!("environment variable {} is not valid base64: {e}", self.name))
        })
    }

    fn write(&self, wrapped: &[u8]) -> Result<(), Error> {
        std::env::set_var(&self.name, STANDARD.encode(wrapped));
        tracing::info!(var = %self.name, "wrapped DEK stored in process environment");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read_round_trip() {
        let store = EnvKeystore::new("ZARF_TEST_DEK_ROUND_TRIP");
        store.write(b"wrapped-bytes").expect("write failed");
        assert_eq!(store.read().expect("read failed"), b"wrapped-bytes");
    }

    #[test]
    fn test_missing_variable() {
        let store = EnvKeystore::new("ZARF_TEST_DEK_UNSET");
        assert!(matches!(store.read(), Err(Error::Keystore(_))));
    }

    #[test]
    fn test_invalid_base64() {
        std::env::set_var("ZARF_TEST_DEK_BAD", "not!base64@@@");
        let store = EnvKeystore::new("ZARF_TEST_DEK_BAD");
        assert!(matches!(store.read(), Err(Error::Keystore(_))));
    }
}
