//! Cipher primitive: one DEK + IV + algorithm, single-shot operations.
//!
//! A [`Cipher`] is built when a keystore unwraps its DEK and is held
//! immutably for the life of the process. It encrypts and decrypts byte
//! buffers, optionally prefixing the self-describing header, and wraps
//! the byte routines with a text API that applies the configured
//! encoding to the full ciphertext (header included).

use crate::engine::{DecryptEngine, EncryptEngine};
use crate::error::Error;
use crate::header::Header;
use crate::kek::KeyEncryptingKey;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD};
use base64::Engine as _;
use rand::RngCore;
use secrecy::{ExposeSecret, SecretVec};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::{Read, Write};
use std::str::FromStr;

/// Supported symmetric algorithms.
///
/// CBC modes stream; AES-256-GCM is sealed in one shot at stream
/// finalization and appends its authentication tag to the ciphertext.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CipherName {
    /// AES-128 in CBC mode with PKCS#7 padding
    #[serde(rename = "aes-128-cbc")]
    Aes128Cbc,
    /// AES-192 in CBC mode with PKCS#7 padding
    #[serde(rename = "aes-192-cbc")]
    Aes192Cbc,
    /// AES-256 in CBC mode with PKCS#7 padding
    #[serde(rename = "aes-256-cbc")]
    Aes256Cbc,
    /// AES-256 in GCM mode (authenticated)
    #[serde(rename = "aes-256-gcm")]
    Aes256Gcm,
}

impl CipherName {
    /// Key length in bytes.
    #[must_use]
    pub const fn key_len(self) -> usize {
        match self {
            Self::Aes128Cbc => 16,
            Self::Aes192Cbc => 24,
            Self::Aes256Cbc | Self::Aes256Gcm => 32,
        }
    }

    /// IV (or nonce) length in bytes.
    #[must_use]
    pub const fn iv_len(self) -> usize {
        match self {
            Self::Aes128Cbc | Self::Aes192Cbc | Self::Aes256Cbc => 16,
            Self::Aes256Gcm => 12,
        }
    }

    /// Canonical dashed name, as carried in headers and configuration.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Aes128Cbc => "aes-128-cbc",
            Self::Aes192Cbc => "aes-192-cbc",
            Self::Aes256Cbc => "aes-256-cbc",
            Self::Aes256Gcm => "aes-256-gcm",
        }
    }
}

impl Default for CipherName {
    fn default() -> Self {
        Self::Aes256Cbc
    }
}

impl fmt::Display for CipherName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CipherName {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aes-128-cbc" => Ok(Self::Aes128Cbc),
            "aes-192-cbc" => Ok(Self::Aes192Cbc),
            "aes-256-cbc" => Ok(Self::Aes256Cbc),
            "aes-256-gcm" => Ok(Self::Aes256Gcm),
            other => Err(Error::Config(format!("unknown cipher name: {other}"))),
        }
    }
}

/// Text encoding applied to full ciphertexts by the string API.
///
/// The encoding is a property of the cipher, not of the message; binary
/// streams are never encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Encoding {
    /// No encoding; the text API rejects this variant
    #[serde(rename = "none")]
    None,
    /// Standard-alphabet base64 with padding
    #[serde(rename = "base64")]
    Base64,
    /// Standard-alphabet base64 without padding
    #[serde(rename = "base64strict")]
    Base64Strict,
    /// Lowercase hexadecimal
    #[serde(rename = "base16")]
    Base16,
}

impl Default for Encoding {
    fn default() -> Self {
        Self::Base64
    }
}

impl Encoding {
    /// Encodes raw ciphertext for the text API.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for [`Encoding::None`]: raw ciphertext
    /// is not valid UTF-8, so the text API requires an encoding.
    pub fn encode(self, data: &[u8]) -> Result<String, Error> {
        match self {
            Self::None => {
                Err(Error::Config("the text API requires an encoding other than none".to_string()))
            }
            Self::Base64 => Ok(STANDARD.encode(data)),
            Self::Base64Strict => Ok(STANDARD_NO_PAD.encode(data)),
            Self::Base16 => Ok(hex::encode(data)),
        }
    }

    /// Decodes text-API input back to raw ciphertext.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DecryptionFailed`] when the input is not valid
    /// under this encoding.
    pub fn decode(self, text: &str) -> Result<Vec<u8>, Error> {
        match self {
            Self::None => Ok(text.as_bytes().to_vec()),
            Self::Base64 => STANDARD
                .decode(text)
                .map_err(|e| Error::DecryptionFailed(format!("invalid base64 input: {e}"))),
            Self::Base64Strict => STANDARD_NO_PAD
                .decode(text)
                .map_err(|e| Error::DecryptionFailed(format!("invalid base64 input: {e}"))),
            Self::Base16 => hex::decode(text)
                .map_err(|e| Error::DecryptionFailed(format!("invalid base16 input: {e}"))),
        }
    }
}

/// Per-message encryption options.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncryptOptions {
    header: Option<bool>,
    random_iv: bool,
    random_key: bool,
    compress: bool,
}

impl EncryptOptions {
    /// Creates default options: cipher decides the header, fixed key and
    /// IV, no compression.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Forces the header on or off. Ignored (forced on) when the message
    /// needs the header to carry an IV, key, or compression flag.
    #[must_use]
    pub const fn with_header(mut self, header: bool) -> Self {
        self.header = Some(header);
        self
    }

    /// Generates a fresh IV for this message, embedded in the header.
    #[must_use]
    pub const fn with_random_iv(mut self, random_iv: bool) -> Self {
        self.random_iv = random_iv;
        self
    }

    /// Generates a fresh DEK for this message, embedded in the header in
    /// KEK-wrapped form. Implies a random IV.
    #[must_use]
    pub const fn with_random_key(mut self, random_key: bool) -> Self {
        self.random_key = random_key;
        self
    }

    /// Compresses the plaintext before encryption.
    #[must_use]
    pub const fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }
}

/// One DEK + IV + algorithm, addressable by version.
///
/// # Example
///
/// ```
/// use secrecy::SecretVec;
/// use zarf::cipher::{Cipher, CipherName};
///
/// # fn main() -> Result<(), zarf::error::Error> {
/// let cipher = Cipher::new(
///     1,
///     CipherName::Aes256Cbc,
///     SecretVec::new(vec![0u8; 32]),
///     Some(vec![0u8; 16]),
/// )?;
///
/// let ciphertext = cipher.encrypt(b"attack at dawn")?;
/// assert_eq!(cipher.decrypt(&ciphertext)?, b"attack at dawn");
/// # Ok(())
/// # }
/// ```
pub struct Cipher {
    version: u8,
    name: CipherName,
    key: SecretVec<u8>,
    iv: Option<Vec<u8>>,
    encoding: Encoding,
    always_add_header: bool,
    kek: Option<KeyEncryptingKey>,
}

impl Cipher {
    /// Creates a cipher from unwrapped key material.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the version is 0 (reserved for
    /// "unset") or the key/IV length does not match the algorithm.
    pub fn new(
        version: u8,
        name: CipherName,
        key: SecretVec<u8>,
        iv: Option<Vec<u8>>,
    ) -> Result<Self, Error> {
        if version == 0 {
            return Err(Error::Config("cipher version 0 is reserved".to_string()));
        }
        if key.expose_secret().len() != name.key_len() {
            return Err(Error::Config(format!(
                "{name} requires a {}-byte key, got {}",
                name.key_len(),
                key.expose_secret().len()
            )));
        }
        if let Some(ref iv) = iv {
            if iv.len() != name.iv_len() {
                return Err(Error::Config(format!(
                    "{name} requires a {}-byte IV, got {}",
                    name.iv_len(),
                    iv.len()
                )));
            }
        }
        Ok(Self { version, name, key, iv, encoding: Encoding::default(), always_add_header: true, kek: None })
    }

    /// Sets the text-API encoding.
    #[must_use]
    pub const fn with_encoding(mut self, encoding: Encoding) -> Self {
        self.encoding = encoding;
        self
    }

    /// Sets whether headerless messages still get a header by default.
    #[must_use]
    pub const fn with_always_add_header(mut self, always_add_header: bool) -> Self {
        self.always_add_header = always_add_header;
        self
    }

    /// Attaches the KEK of this cipher's version, enabling per-message
    /// random keys.
    #[must_use]
    pub fn with_kek(mut self, kek: KeyEncryptingKey) -> Self {
        self.kek = Some(kek);
        self
    }

    /// Returns the cipher version.
    #[must_use]
    pub const fn version(&self) -> u8 {
        self.version
    }

    /// Returns the algorithm.
    #[must_use]
    pub const fn name(&self) -> CipherName {
        self.name
    }

    /// Returns the text-API encoding.
    #[must_use]
    pub const fn encoding(&self) -> Encoding {
        self.encoding
    }

    /// Whether messages get a header unless explicitly suppressed.
    #[must_use]
    pub const fn always_add_header(&self) -> bool {
        self.always_add_header
    }

    pub(crate) fn key(&self) -> &SecretVec<u8> {
        &self.key
    }

    pub(crate) fn fixed_iv(&self) -> Option<&[u8]> {
        self.iv.as_deref()
    }

    pub(crate) fn kek(&self) -> Option<&KeyEncryptingKey> {
        self.kek.as_ref()
    }

    /// Encrypts a byte buffer with the cipher's defaults.
    ///
    /// Empty input produces empty output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::EncryptionFailed`] if the underlying cipher
    /// rejects its input, [`Error::Config`] if the cipher lacks an IV.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
        self.encrypt_with(plaintext, &EncryptOptions::default())
    }

    /// Encrypts a byte buffer.
    ///
    /// A random key implies a random IV; a header is forced whenever it
    /// must carry compression, an IV, or a key.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] when a fixed IV is needed but not
    /// configured, or a random key is requested without a KEK;
    /// [`Error::EncryptionFailed`] on cipher failure.
    pub fn encrypt_with(&self, plaintext: &[u8], opts: &EncryptOptions) -> Result<Vec<u8>, Error> {
        if plaintext.is_empty() {
            return Ok(Vec::new());
        }

        let random_iv = opts.random_iv || opts.random_key;
        let add_header =
            opts.compress || random_iv || opts.header.unwrap_or(self.always_add_header);

        let iv = if random_iv {
            random_bytes(self.name.iv_len())
        } else {
            self.iv.clone().ok_or_else(|| {
                Error::Config(format!(
                    "cipher v{} has no fixed IV; request a random IV or configure one",
                    self.version
                ))
            })?
        };

        let (key, wrapped_key) = if opts.random_key {
            let kek = self.kek.as_ref().ok_or_else(|| {
                Error::Config(format!(
                    "cipher v{} has no key-encrypting key; random keys are unavailable",
                    self.version
                ))
            })?;
            let fresh = SecretVec::new(random_bytes(self.name.key_len()));
            let wrapped = kek.wrap(fresh.expose_secret())?;
            (fresh, Some(wrapped))
        } else {
            (SecretVec::new(self.key.expose_secret().clone()), None)
        };

        let compressed;
        let payload: &[u8] = if opts.compress {
            compressed = deflate(plaintext)?;
            &compressed
        } else {
            plaintext
        };

        let mut out = Vec::with_capacity(payload.len() + 64);
        if add_header {
            let mut header = Header::new(self.version).with_compressed(opts.compress);
            if random_iv {
                header = header.with_iv(iv.clone());
            }
            if let Some(wrapped) = wrapped_key {
                header = header.with_wrapped_key(wrapped);
            }
            out.extend(header.to_bytes()?);
        }

        let mut engine = EncryptEngine::new(self.name, key.expose_secret(), &iv)?;
        out.extend(engine.update(payload));
        out.extend(engine.finalize()?);
        Ok(out)
    }

    /// Decrypts a byte buffer.
    ///
    /// Input starting with the ciphertext magic is parsed as headered;
    /// anything else is raw ciphertext under this cipher's fixed key and
    /// IV. Empty input produces empty output.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedHeader`], [`Error::DecryptionFailed`],
    /// [`Error::UnknownCipherVersion`] (header names a version other
    /// than this cipher's), or [`Error::KeyUnwrapFailed`].
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        if !Header::starts_with_magic(data) {
            let iv = self.iv.as_deref().ok_or_else(|| {
                Error::Config(format!("cipher v{} has no fixed IV", self.version))
            })?;
            let mut engine = DecryptEngine::new(self.name, self.key.expose_secret(), iv)?;
            let mut out = engine.update(data);
            out.extend(engine.finalize()?);
            return Ok(out);
        }

        let (header, consumed) = Header::parse(data)?;
        let resolved =
            resolve(&header, |v| (v == self.version).then_some(self), self)?;
        let plaintext = resolved.decrypt_body(&data[consumed..])?;
        if header.compressed() {
            inflate(&plaintext)
        } else {
            Ok(plaintext)
        }
    }

    /// Decrypts, swallowing [`Error::DecryptionFailed`].
    ///
    /// Useful when scanning data that mixes plaintext and ciphertext.
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

    /// Encrypts a string and applies the configured text encoding to the
    /// full ciphertext, header included.
    ///
    /// # Errors
    ///
    /// As [`Cipher::encrypt`]; additionally [`Error::Config`] when the
    /// encoding is `none`.
    pub fn encrypt_text(&self, text: &str) -> Result<String, Error> {
        let ciphertext = self.encrypt(text.as_bytes())?;
        if ciphertext.is_empty() {
            return Ok(String::new());
        }
        self.encoding.encode(&ciphertext)
    }

    /// Reverses [`Cipher::encrypt_text`].
    ///
    /// # Errors
    ///
    /// As [`Cipher::decrypt`]; undecodable input and non-UTF-8 plaintext
    /// surface as [`Error::DecryptionFailed`].
    pub fn decrypt_text(&self, text: &str) -> Result<String, Error> {
        if text.is_empty() {
            return Ok(String::new());
        }
        let ciphertext = self.encoding.decode(text)?;
        let plaintext = self.decrypt(&ciphertext)?;
        String::from_utf8(plaintext)
            .map_err(|e| Error::DecryptionFailed(format!("plaintext is not valid UTF-8: {e}")))
    }
}

/// Effective decryption parameters after header resolution.
///
/// Header-embedded values win; the header's `cipher_version` selects the
/// registry entry (0 meaning "use the fallback cipher").
pub(crate) struct Resolved {
    name: CipherName,
    key: SecretVec<u8>,
    iv: Vec<u8>,
}

impl Resolved {
    pub(crate) fn decrypt_engine(&self) -> Result<DecryptEngine, Error> {
        DecryptEngine::new(self.name, self.key.expose_secret(), &self.iv)
    }

    pub(crate) fn decrypt_body(&self, body: &[u8]) -> Result<Vec<u8>, Error> {
        let mut engine = self.decrypt_engine()?;
        let mut out = engine.update(body);
        out.extend(engine.finalize()?);
        Ok(out)
    }
}

pub(crate) fn resolve<'r>(
    header: &Header,
    lookup: impl Fn(u8) -> Option<&'r Cipher>,
    fallback: &'r Cipher,
) -> Result<Resolved, Error> {
    let base = if header.cipher_version() == 0 {
        fallback
    } else {
        lookup(header.cipher_version())
            .ok_or(Error::UnknownCipherVersion(header.cipher_version()))?
    };

    let name = match header.cipher_name() {
        Some(raw) => raw
            .parse::<CipherName>()
            .map_err(|_| Error::DecryptionFailed(format!("unsupported cipher name: {raw}")))?,
        None => base.name,
    };

    let iv = match header.iv() {
        Some(iv) => iv.to_vec(),
        None => base.iv.clone().ok_or_else(|| {
            Error::Config(format!("cipher v{} has no fixed IV", base.version))
        })?,
    };

    let key = match header.wrapped_key() {
        Some(wrapped) => {
            let kek = base.kek.as_ref().ok_or_else(|| {
                Error::KeyUnwrapFailed(format!(
                    "no key-encrypting key configured for version {}",
                    base.version
                ))
            })?;
            let raw = if header.key_encoded() {
                STANDARD.decode(wrapped).map_err(|e| {
                    Error::KeyUnwrapFailed(format!("embedded key is not valid base64: {e}"))
                })?
            } else {
                wrapped.to_vec()
            };
            kek.unwrap(&raw)?
        }
        None => SecretVec::new(base.key.expose_secret().clone()),
    };

    Ok(Resolved { name, key, iv })
}

/// Fills a fresh buffer from the operating system RNG.
pub(crate) fn random_bytes(len: usize) -> Vec<u8> {
    let mut bytes = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    bytes
}

pub(crate) fn deflate(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut encoder =
        flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

pub(crate) fn inflate(data: &[u8]) -> Result<Vec<u8>, Error> {
    let mut out = Vec::new();
    flate2::read::ZlibDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| Error::DecryptionFailed(format!("decompression failed: {e}")))?;
    Ok(out)
}
