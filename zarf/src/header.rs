//! Self-describing ciphertext header.
//!
//! Every headered ciphertext starts with the magic `@EnC` followed by a
//! compact description of how it was produced:
//! - cipher version (which registry entry encrypted it)
//! - flags (compression, embedded IV/key/cipher-name)
//! - optional per-message IV
//! - optional per-message DEK, wrapped by the KEK of the cipher version
//! - optional cipher name override
//!
//! Two layouts exist on the wire. The current layout places a format
//! version byte of `2` directly after the magic. The legacy layout has a
//! 16-bit little-endian flag word there instead, of which only the top
//! bit (compression) was ever defined; it carries no cipher version and
//! no embedded fields. The byte after the magic disambiguates: `2`
//! selects the current layout, anything else is parsed as legacy.

use crate::error::Error;
use std::io::Read;

/// Magic bytes prefixed to every headered ciphertext.
pub const MAGIC: [u8; 4] = *b"@EnC";

/// Format version emitted by the current layout.
pub const FORMAT_VERSION: u8 = 2;

/// Compression bit of the legacy 16-bit flag word.
const LEGACY_COMPRESSED: u16 = 0x8000;

/// Header flags for the current layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderFlags(u8);

impl HeaderFlags {
    const COMPRESSED: u8 = 0x01;
    const INCLUDES_IV: u8 = 0x02;
    const INCLUDES_KEY: u8 = 0x04;
    const INCLUDES_CIPHER_NAME: u8 = 0x08;
    const KEY_ENCODED: u8 = 0x10;

    /// Creates empty flags.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Creates flags from a raw byte. Unknown bits are dropped.
    #[must_use]
    pub const fn from_u8(value: u8) -> Self {
        Self(
            value
                & (Self::COMPRESSED
                    | Self::INCLUDES_IV
                    | Self::INCLUDES_KEY
                    | Self::INCLUDES_CIPHER_NAME
                    | Self::KEY_ENCODED),
        )
    }

    /// Returns the raw flags value.
    #[must_use]
    pub const fn as_u8(self) -> u8 {
        self.0
    }

    #[must_use]
    const fn has(self, bit: u8) -> bool {
        (self.0 & bit) != 0
    }

    #[must_use]
    const fn with(mut self, bit: u8, on: bool) -> Self {
        if on {
            self.0 |= bit;
        }
        self
    }
}

/// Parsed ciphertext header.
///
/// Current on-wire layout:
/// ```text
/// [magic:4]["2":1][flags:1][cipher_version:1]
///   [cipher_name_len:2-LE][cipher_name]   (if includes_cipher_name)
///   [iv_len:2-LE][iv]                     (if includes_iv)
///   [wrapped_key_len:2-LE][wrapped_key]   (if includes_key)
/// ```
///
/// The wrapped key, when present, is always the KEK-wrapped form; the
/// clear DEK never appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    cipher_version: u8,
    compressed: bool,
    key_encoded: bool,
    cipher_name: Option<String>,
    iv: Option<Vec<u8>>,
    wrapped_key: Option<Vec<u8>>,
}

impl Header {
    /// Creates a header for the given cipher version.
    ///
    /// A version of `0` means "unset": decryption falls back to the
    /// caller-supplied cipher. Legacy headers always parse to version 0.
    #[must_use]
    pub const fn new(cipher_version: u8) -> Self {
        Self {
            cipher_version,
            compressed: false,
            key_encoded: false,
            cipher_name: None,
            iv: None,
            wrapped_key: None,
        }
    }

    /// Marks the payload as compressed before encryption.
    #[must_use]
    pub const fn with_compressed(mut self, compressed: bool) -> Self {
        self.compressed = compressed;
        self
    }

    /// Embeds a per-message IV.
    #[must_use]
    pub fn with_iv(mut self, iv: Vec<u8>) -> Self {
        self.iv = Some(iv);
        self
    }

    /// Embeds a per-message DEK in KEK-wrapped form.
    #[must_use]
    pub fn with_wrapped_key(mut self, wrapped_key: Vec<u8>) -> Self {
        self.wrapped_key = Some(wrapped_key);
        self
    }

    /// Embeds a cipher name override.
    #[must_use]
    pub fn with_cipher_name(mut self, cipher_name: impl Into<String>) -> Self {
        self.cipher_name = Some(cipher_name.into());
        self
    }

    /// Marks the wrapped key as additionally base64-encoded (legacy
    /// compatibility flag).
    #[must_use]
    pub const fn with_key_encoded(mut self, key_encoded: bool) -> Self {
        self.key_encoded = key_encoded;
        self
    }

    /// Returns the cipher version, `0` meaning unset.
    #[must_use]
    pub const fn cipher_version(&self) -> u8 {
        self.cipher_version
    }

    /// Whether the payload was compressed before encryption.
    #[must_use]
    pub const fn compressed(&self) -> bool {
        self.compressed
    }

    /// Whether the wrapped key is additionally base64-encoded.
    #[must_use]
    pub const fn key_encoded(&self) -> bool {
        self.key_encoded
    }

    /// Returns the embedded cipher name, if any.
    #[must_use]
    pub fn cipher_name(&self) -> Option<&str> {
        self.cipher_name.as_deref()
    }

    /// Returns the embedded IV, if any.
    #[must_use]
    pub fn iv(&self) -> Option<&[u8]> {
        self.iv.as_deref()
    }

    /// Returns the embedded KEK-wrapped key, if any.
    #[must_use]
    pub fn wrapped_key(&self) -> Option<&[u8]> {
        self.wrapped_key.as_deref()
    }

    /// Whether `data` starts with the ciphertext magic.
    #[must_use]
    pub fn starts_with_magic(data: &[u8]) -> bool {
        data.len() >= MAGIC.len() && data[..MAGIC.len()] == MAGIC
    }

    fn flags(&self) -> HeaderFlags {
        HeaderFlags::empty()
            .with(HeaderFlags::COMPRESSED, self.compressed)
            .with(HeaderFlags::INCLUDES_IV, self.iv.is_some())
            .with(HeaderFlags::INCLUDES_KEY, self.wrapped_key.is_some())
            .with(HeaderFlags::INCLUDES_CIPHER_NAME, self.cipher_name.is_some())
            .with(HeaderFlags::KEY_ENCODED, self.key_encoded)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.wrapped_key.is_some() && self.iv.is_none() {
            return Err(Error::MalformedHeader(
                "embedded key requires an embedded IV".to_string(),
            ));
        }
        for (label, len) in [
            ("cipher name", self.cipher_name.as_ref().map_or(0, String::len)),
            ("IV", self.iv.as_ref().map_or(0, Vec::len)),
            ("wrapped key", self.wrapped_key.as_ref().map_or(0, Vec::len)),
        ] {
            if len > usize::from(u16::MAX) {
                return Err(Error::MalformedHeader(format!("{label} too long: {len} bytes")));
            }
        }
        Ok(())
    }

    /// Serializes the header in the current layout.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedHeader`] if an embedded key is present
    /// without an IV, or any field exceeds 65535 bytes.
    pub fn to_bytes(&self) -> Result<Vec<u8>, Error> {
        self.validate()?;

        let mut bytes = Vec::with_capacity(7);
        bytes.extend_from_slice(&MAGIC);
        bytes.push(FORMAT_VERSION);
        bytes.push(self.flags().as_u8());
        bytes.push(self.cipher_version);

        // Field order is fixed: cipher_name, iv, wrapped_key.
        for field in [
            self.cipher_name.as_ref().map(String::as_bytes),
            self.iv.as_deref(),
            self.wrapped_key.as_deref(),
        ]
        .into_iter()
        .flatten()
        {
            // Safe cast: lengths validated above (max 65535)
            #[allow(clippy::cast_possible_truncation)]
            let len = field.len() as u16;
            bytes.extend_from_slice(&len.to_le_bytes());
            bytes.extend_from_slice(field);
        }

        Ok(bytes)
    }

    /// Serializes the header in the legacy layout (magic + 16-bit LE
    /// flag word).
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedHeader`] if the header carries fields
    /// the legacy layout cannot express (IV, key, cipher name, version).
    pub fn to_legacy_bytes(&self) -> Result<Vec<u8>, Error> {
        if self.iv.is_some() || self.wrapped_key.is_some() || self.cipher_name.is_some() {
            return Err(Error::MalformedHeader(
                "legacy layout cannot embed IV, key, or cipher name".to_string(),
            ));
        }
        if self.cipher_version != 0 {
            return Err(Error::MalformedHeader(
                "legacy layout carries no cipher version".to_string(),
            ));
        }

        let flag_word: u16 = if self.compressed { LEGACY_COMPRESSED } else { 0 };
        let mut bytes = Vec::with_capacity(6);
        bytes.extend_from_slice(&MAGIC);
        bytes.extend_from_slice(&flag_word.to_le_bytes());
        Ok(bytes)
    }

    /// Reads a header incrementally from a stream, consuming exactly the
    /// header bytes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedHeader`] on magic mismatch, truncation,
    /// or flag/length inconsistency; [`Error::Io`] on any other source
    /// failure.
    pub fn read_from<R: Read>(source: &mut R) -> Result<Self, Error> {
        let mut magic = [0u8; 4];
        read_exact(source, &mut magic)?;
        if magic != MAGIC {
            return Err(Error::MalformedHeader("missing magic".to_string()));
        }

        let mut discriminant = [0u8; 1];
        read_exact(source, &mut discriminant)?;
        if discriminant[0] != FORMAT_VERSION {
            // Legacy layout: the byte after the magic is the low byte of
            // the 16-bit flag word. Unknown bits are ignored.
            let mut high = [0u8; 1];
            read_exact(source, &mut high)?;
            let flag_word = u16::from_le_bytes([discriminant[0], high[0]]);
            return Ok(Self::new(0).with_compressed(flag_word & LEGACY_COMPRESSED != 0));
        }

        let mut fixed = [0u8; 2];
        read_exact(source, &mut fixed)?;
        let flags = HeaderFlags::from_u8(fixed[0]);
        let cipher_version = fixed[1];

        if flags.has(HeaderFlags::INCLUDES_KEY) && !flags.has(HeaderFlags::INCLUDES_IV) {
            return Err(Error::MalformedHeader(
                "embedded key requires an embedded IV".to_string(),
            ));
        }

        let cipher_name = if flags.has(HeaderFlags::INCLUDES_CIPHER_NAME) {
            let raw = read_field(source)?;
            Some(String::from_utf8(raw).map_err(|e| {
                Error::MalformedHeader(format!("cipher name is not valid UTF-8: {e}"))
            })?)
        } else {
            None
        };
        let iv = if flags.has(HeaderFlags::INCLUDES_IV) { Some(read_field(source)?) } else { None };
        let wrapped_key =
            if flags.has(HeaderFlags::INCLUDES_KEY) { Some(read_field(source)?) } else { None };

        Ok(Self {
            cipher_version,
            compressed: flags.has(HeaderFlags::COMPRESSED),
            key_encoded: flags.has(HeaderFlags::KEY_ENCODED),
            cipher_name,
            iv,
            wrapped_key,
        })
    }

    /// Parses a header from the front of `data`, returning the header
    /// and the number of bytes consumed.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedHeader`] on magic mismatch, truncation,
    /// or flag/length inconsistency.
    pub fn parse(data: &[u8]) -> Result<(Self, usize), Error> {
        let mut cursor = std::io::Cursor::new(data);
        let header = Self::read_from(&mut cursor)?;
        // Safe cast: the cursor position is bounded by data.len()
        #[allow(clippy::cast_possible_truncation)]
        Ok((header, cursor.position() as usize))
    }
}

fn read_exact<R: Read>(source: &mut R, buf: &mut [u8]) -> Result<(), Error> {
    source.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            Error::MalformedHeader("truncated header".to_string())
        } else {
            Error::Io(e)
        }
    })
}

fn read_field<R: Read>(source: &mut R) -> Result<Vec<u8>, Error> {
    let mut len = [0u8; 2];
    read_exact(source, &mut len)?;
    let mut field = vec![0u8; usize::from(u16::from_le_bytes(len))];
    read_exact(source, &mut field)?;
    Ok(field)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_round_trip_minimal() {
        let header = Header::new(1);
        let bytes = header.to_bytes().expect("Failed to serialize header");
        let (parsed, consumed) = Header::parse(&bytes).expect("Failed to parse header");

        assert_eq!(parsed, header);
        assert_eq!(consumed, bytes.len());
        assert_eq!(bytes.len(), 7);
    }

    #[test]
    fn test_header_round_trip_all_fields() {
        let header = Header::new(3)
            .with_compressed(true)
            .with_cipher_name("aes-256-gcm")
            .with_iv(vec![7u8; 12])
            .with_wrapped_key(vec![42u8; 256])
            .with_key_encoded(true);

        let bytes = header.to_bytes().expect("Failed to serialize header");
        let (parsed, consumed) = Header::parse(&bytes).expect("Failed to parse header");

        assert_eq!(parsed, header);
        assert_eq!(consumed, bytes.len());
        assert!(parsed.compressed());
        assert!(parsed.key_encoded());
        assert_eq!(parsed.cipher_name(), Some("aes-256-gcm"));
        assert_eq!(parsed.iv(), Some(&[7u8; 12][..]));
        assert_eq!(parsed.wrapped_key(), Some(&[42u8; 256][..]));
    }

    #[test]
    fn test_header_parse_leaves_remainder() {
        let mut bytes = Header::new(2).with_iv(vec![1, 2, 3]).to_bytes().unwrap();
        let header_len = bytes.len();
        bytes.extend_from_slice(b"ciphertext follows");

        let (parsed, consumed) = Header::parse(&bytes).expect("Failed to parse header");
        assert_eq!(consumed, header_len);
        assert_eq!(parsed.cipher_version(), 2);
        assert_eq!(&bytes[consumed..], b"ciphertext follows");
    }

    #[test]
    fn test_header_key_requires_iv() {
        let header = Header::new(1).with_wrapped_key(vec![1, 2, 3]);
        assert!(matches!(header.to_bytes(), Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn test_header_parse_key_without_iv_flag_rejected() {
        // Hand-build a header claiming includes_key without includes_iv.
        let bytes = [b'@', b'E', b'n', b'C', 2, 0x04, 1, 3, 0, 1, 2, 3];
        assert!(matches!(Header::parse(&bytes), Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn test_header_bad_magic() {
        let result = Header::parse(b"@enc\x02\x00\x01");
        assert!(matches!(result, Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn test_header_truncated() {
        let bytes = Header::new(1).with_iv(vec![9u8; 16]).to_bytes().unwrap();
        for cut in 1..bytes.len() {
            let result = Header::parse(&bytes[..cut]);
            assert!(
                matches!(result, Err(Error::MalformedHeader(_))),
                "truncation at {cut} must be rejected"
            );
        }
    }

    #[test]
    fn test_header_unknown_current_flags_ignored() {
        let mut bytes = Header::new(5).to_bytes().unwrap();
        bytes[5] |= 0xE0; // bits 5-7 are undefined
        let (parsed, _) = Header::parse(&bytes).expect("Failed to parse header");
        assert_eq!(parsed, Header::new(5));
    }

    #[test]
    fn test_legacy_round_trip() {
        for compressed in [false, true] {
            let header = Header::new(0).with_compressed(compressed);
            let bytes = header.to_legacy_bytes().expect("Failed to serialize legacy header");
            assert_eq!(bytes.len(), 6);

            let (parsed, consumed) = Header::parse(&bytes).expect("Failed to parse legacy header");
            assert_eq!(consumed, bytes.len());
            assert_eq!(parsed.cipher_version(), 0);
            assert_eq!(parsed.compressed(), compressed);
        }
    }

    #[test]
    fn test_legacy_unknown_bits_ignored() {
        let mut bytes = Vec::from(MAGIC);
        bytes.extend_from_slice(&(LEGACY_COMPRESSED | 0x1234u16).to_le_bytes());
        let (parsed, _) = Header::parse(&bytes).expect("Failed to parse legacy header");
        assert!(parsed.compressed());
    }

    #[test]
    fn test_legacy_rejects_embedded_fields() {
        let header = Header::new(0).with_iv(vec![1; 16]);
        assert!(matches!(header.to_legacy_bytes(), Err(Error::MalformedHeader(_))));

        let header = Header::new(1);
        assert!(matches!(header.to_legacy_bytes(), Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn test_starts_with_magic() {
        assert!(Header::starts_with_magic(b"@EnC\x02..."));
        assert!(!Header::starts_with_magic(b"@En"));
        assert!(!Header::starts_with_magic(b"plaintext"));
    }
}
