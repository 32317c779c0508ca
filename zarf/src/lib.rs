//! # `zarf`
//!
//! Versioned encrypted-blob codec with envelope key management, for
//! protecting application data at rest (database columns, files,
//! log-like streams).
//!
//! ## Features
//!
//! - Self-describing ciphertext header (`@EnC`) carrying the cipher
//!   version and optional per-message key/IV
//! - Envelope key management: an RSA KEK wraps short-lived DEKs
//! - Version-addressable cipher registry with primary/secondary
//!   selection for zero-downtime key rotation
//! - Streaming encryption and decryption with transparent zlib
//!   compression
//! - Pluggable keystores: owner-only files, environment variables,
//!   in-memory
//!
//! ## Example
//!
//! ```rust,ignore
//! use zarf::prelude::*;
//!
//! let config: Config = serde_yaml::from_str(&std::fs::read_to_string("zarf.yml")?)?;
//! let registry = registry::install(Registry::load(config.environment("production")?)?);
//!
//! let token = registry.encrypt_text("4242 4242 4242 4242")?;
//! let card = registry.decrypt_text(&token)?;
//! ```

#![warn(clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod cipher;
pub mod config;
mod engine;
pub mod error;
pub mod header;
pub mod kek;
pub mod keystore;
pub mod reader;
pub mod registry;
pub mod rotation;
pub mod writer;

pub mod prelude {
    //! Convenience re-exports for common use.
    pub use crate::cipher::{Cipher, CipherName, Encoding, EncryptOptions};
    pub use crate::config::{CipherConfig, Config, EnvironmentConfig};
    pub use crate::error::Error;
    pub use crate::kek::{KeyEncryptingKey, WrapScheme};
    pub use crate::keystore::{EnvKeystore, FileKeystore, Keystore, MemoryKeystore};
    pub use crate::reader::{Reader, ReaderOptions};
    pub use crate::registry::{self, Registry};
    pub use crate::rotation::rotate;
    pub use crate::writer::{Writer, WriterOptions};
}
