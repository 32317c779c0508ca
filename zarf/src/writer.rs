//! Streaming encryption sink.
//!
//! The pipeline is fixed at construction: user writes flow through an
//! optional zlib stage, then the cipher, then the sink. The header is
//! emitted once, before any ciphertext. Compression happens before
//! encryption.

use crate::cipher::{random_bytes, CipherName};
use crate::engine::EncryptEngine;
use crate::error::Error;
use crate::header::Header;
use crate::registry::Registry;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use secrecy::{ExposeSecret, SecretVec};
use std::io::{self, Write};

/// Construction options for [`Writer`].
#[derive(Debug, Clone, Copy, Default)]
pub struct WriterOptions {
    version: Option<u8>,
    cipher_name: Option<CipherName>,
    header: Option<bool>,
    random_key: bool,
    random_iv: bool,
    compress: bool,
    legacy_header: bool,
}

impl WriterOptions {
    /// Creates default options: primary cipher, fixed key and IV, no
    /// compression, header per the cipher's configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Encrypts under a specific registry version instead of the
    /// primary.
    #[must_use]
    pub const fn with_version(mut self, version: u8) -> Self {
        self.version = Some(version);
        self
    }

    /// Overrides the algorithm for this stream. Requires random key and
    /// random IV so the override can be carried in the header.
    #[must_use]
    pub const fn with_cipher_name(mut self, cipher_name: CipherName) -> Self {
        self.cipher_name = Some(cipher_name);
        self
    }

    /// Forces the header on or off. Forced on whenever the stream needs
    /// it (compression, random IV, random key).
    #[must_use]
    pub const fn with_header(mut self, header: bool) -> Self {
        self.header = Some(header);
        self
    }

    /// Generates a fresh DEK for this stream, embedded KEK-wrapped in
    /// the header.
    #[must_use]
    pub const fn with_random_key(mut self, random_key: bool) -> Self {
        self.random_key = random_key;
        self
    }

    /// Generates a fresh IV for this stream, embedded in the header.
    #[must_use]
    pub const fn with_random_iv(mut self, random_iv: bool) -> Self {
        self.random_iv = random_iv;
        self
    }

    /// Compresses before encryption.
    #[must_use]
    pub const fn with_compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Emits the legacy header layout (magic + flag word). Incompatible
    /// with anything the legacy layout cannot carry.
    #[must_use]
    pub const fn with_legacy_header(mut self, legacy_header: bool) -> Self {
        self.legacy_header = legacy_header;
        self
    }
}

/// Ciphertext-producing sink adapter: encrypts whatever is written and
/// forwards it.
struct CipherSink<W: Write> {
    engine: Option<EncryptEngine>,
    sink: W,
}

impl<W: Write> Write for CipherSink<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let engine = self.engine.as_mut().ok_or_else(|| Error::StreamClosed.into_io())?;
        let ciphertext = engine.update(buf);
        self.sink.write_all(&ciphertext)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.sink.flush()
    }
}

impl<W: Write> CipherSink<W> {
    fn finish(mut self) -> Result<W, Error> {
        if let Some(engine) = self.engine.take() {
            let tail = engine.finalize()?;
            self.sink.write_all(&tail)?;
        }
        Ok(self.sink)
    }
}

enum Stage<W: Write> {
    Plain(CipherSink<W>),
    Compressed(ZlibEncoder<CipherSink<W>>),
}

/// Streaming encryption sink.
///
/// Bytes written to the sink appear in the exact order produced by the
/// cipher. A writer is single-owner: share one per thread or serialize.
///
/// Dropping a writer without [`Writer::close`] (or [`Writer::finish`])
/// leaves the stream without its final cipher block, and the resulting
/// ciphertext cannot be decrypted; use [`Writer::scoped`] to guarantee
/// closing on every exit path.
///
/// # Example
///
/// ```rust,ignore
/// let mut writer = Writer::new(file, &registry, WriterOptions::new().with_compress(true))?;
/// writer.write_all(b"sensitive log line\n")?;
/// writer.close()?;
/// ```
pub struct Writer<W: Write> {
    stage: Option<Stage<W>>,
    bytes_in: u64,
}

impl<W: Write> Writer<W> {
    /// Builds the pipeline, resolves the cipher, and emits the header.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] for invalid option combinations
    /// (`random_key` without `random_iv`, a cipher-name override without
    /// both, a legacy header with embedded fields, a fixed-IV stream on
    /// a cipher with no IV), [`Error::UnknownCipherVersion`] for an
    /// unregistered version, or [`Error::Io`] if the header cannot be
    /// written.
    pub fn new(mut sink: W, registry: &Registry, options: WriterOptions) -> Result<Self, Error> {
        if options.random_key && !options.random_iv {
            return Err(Error::Config("random_key requires random_iv".to_string()));
        }
        if options.cipher_name.is_some() && !(options.random_key && options.random_iv) {
            return Err(Error::Config(
                "a cipher name override requires random_key and random_iv".to_string(),
            ));
        }
        if options.legacy_header
            && (options.random_key || options.random_iv || options.cipher_name.is_some())
        {
            return Err(Error::Config(
                "the legacy header cannot embed an IV, key, or cipher name".to_string(),
            ));
        }

        let cipher = match options.version {
            Some(version) => registry.by_version(version)?,
            None => registry.primary(),
        };
        let name = options.cipher_name.unwrap_or_else(|| cipher.name());
        let add_header = options.compress
            || options.random_iv
            || options.random_key
            || options.header.unwrap_or_else(|| cipher.always_add_header());

        let iv = if options.random_iv {
            random_bytes(name.iv_len())
        } else {
            cipher.fixed_iv().map(<[u8]>::to_vec).ok_or_else(|| {
                Error::Config(format!(
                    "cipher v{} has no fixed IV; request a random IV",
                    cipher.version()
                ))
            })?
        };

        let (key, wrapped_key) = if options.random_key {
            let kek = cipher.kek().ok_or_else(|| {
                Error::Config(format!(
                    "cipher v{} has no key-encrypting key; random keys are unavailable",
                    cipher.version()
                ))
            })?;
            let fresh = SecretVec::new(random_bytes(name.key_len()));
            let wrapped = kek.wrap(fresh.expose_secret())?;
            (fresh, Some(wrapped))
        } else {
            (SecretVec::new(cipher.key().expose_secret().clone()), None)
        };

        if add_header {
            let header_bytes = if options.legacy_header {
                Header::new(0).with_compressed(options.compress).to_legacy_bytes()?
            } else {
                let mut header =
                    Header::new(cipher.version()).with_compressed(options.compress);
                if options.random_iv {
                    header = header.with_iv(iv.clone());
                }
                if let Some(wrapped) = wrapped_key {
                    header = header.with_wrapped_key(wrapped);
                }
                if options.cipher_name.is_some() {
                    header = header.with_cipher_name(name.as_str());
                }
                header.to_bytes()?
            };
            sink.write_all(&header_bytes)?;
        }

        let engine = EncryptEngine::new(name, key.expose_secret(), &iv)?;
        let cipher_sink = CipherSink { engine: Some(engine), sink };
        let stage = if options.compress {
            Stage::Compressed(ZlibEncoder::new(cipher_sink, Compression::default()))
        } else {
            Stage::Plain(cipher_sink)
        };

        Ok(Self { stage: Some(stage), bytes_in: 0 })
    }

    /// Total uncompressed bytes accepted so far.
    #[must_use]
    pub const fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Finalizes the cipher, emits the final block, flushes, and drops
    /// the sink. A second close is a no-op; writes after close fail
    /// with [`Error::StreamClosed`].
    ///
    /// # Errors
    ///
    /// Returns [`Error::EncryptionFailed`] or [`Error::Io`] from the
    /// finalization path.
    pub fn close(&mut self) -> Result<(), Error> {
        let Some(stage) = self.stage.take() else {
            return Ok(());
        };
        let mut sink = finalize_stage(stage)?;
        sink.flush()?;
        Ok(())
    }

    /// Finalizes the cipher, emits the final block, and hands the sink
    /// back instead of dropping it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::StreamClosed`] if already closed, otherwise as
    /// [`Writer::close`].
    pub fn finish(mut self) -> Result<W, Error> {
        let stage = self.stage.take().ok_or(Error::StreamClosed)?;
        finalize_stage(stage)
    }

    /// Runs `f` with a fresh writer and closes it on every exit path.
    /// The operation's error wins; a close failure on a successful
    /// operation is surfaced.
    ///
    /// # Errors
    ///
    /// Construction errors, `f`'s error, or the close failure.
    pub fn scoped<T>(
        sink: W,
        registry: &Registry,
        options: WriterOptions,
        f: impl FnOnce(&mut Self) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut writer = Self::new(sink, registry, options)?;
        let result = f(&mut writer);
        let closed = writer.close();
        let value = result?;
        closed?;
        Ok(value)
    }
}

fn finalize_stage<W: Write>(stage: Stage<W>) -> Result<W, Error> {
    let cipher_sink = match stage {
        Stage::Plain(sink) => sink,
        Stage::Compressed(encoder) => encoder.finish()?,
    };
    cipher_sink.finish()
}

impl<W: Write> Write for Writer<W> {
    /// Accepts plaintext; the return value counts input bytes accepted,
    /// not ciphertext produced.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let stage = self.stage.as_mut().ok_or_else(|| Error::StreamClosed.into_io())?;
        let accepted = match stage {
            Stage::Plain(sink) => sink.write(buf)?,
            Stage::Compressed(encoder) => encoder.write(buf)?,
        };
        self.bytes_in += accepted as u64;
        Ok(accepted)
    }

    /// Flushes the underlying sink only; cipher state cannot be
    /// finalized mid-stream.
    fn flush(&mut self) -> io::Result<()> {
        match self.stage.as_mut() {
            Some(Stage::Plain(sink)) => sink.sink.flush(),
            Some(Stage::Compressed(encoder)) => encoder.get_mut().sink.flush(),
            None => Err(Error::StreamClosed.into_io()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::Header;
    use crate::registry::test_registry;

    fn encrypt_stream(options: WriterOptions, plaintext: &[u8], chunk: usize) -> Vec<u8> {
        let registry = test_registry(&[1]);
        let mut writer =
            Writer::new(Vec::new(), &registry, options).expect("writer construction failed");
        for part in plaintext.chunks(chunk.max(1)) {
            writer.write_all(part).expect("write failed");
        }
        assert_eq!(writer.bytes_in(), plaintext.len() as u64);
        writer.finish().expect("finish failed")
    }

    #[test]
    fn test_round_trip_through_registry_decrypt() {
        let registry = test_registry(&[1]);
        for chunk in [1, 7, 4096] {
            let ciphertext = encrypt_stream(WriterOptions::new(), b"streamed secret", chunk);
            assert_eq!(registry.decrypt(&ciphertext).unwrap(), b"streamed secret");
        }
    }

    #[test]
    fn test_compressed_stream_shrinks() {
        let registry = test_registry(&[1]);
        let plaintext = vec![0u8; 256 * 1024];

        let mut writer = Writer::new(
            Vec::new(),
            &registry,
            WriterOptions::new().with_compress(true).with_random_iv(true),
        )
        .unwrap();
        writer.write_all(&plaintext).unwrap();
        let ciphertext = writer.finish().unwrap();

        assert!(ciphertext.len() < plaintext.len() / 10);
        assert_eq!(registry.decrypt(&ciphertext).unwrap(), plaintext);
    }

    #[test]
    fn test_random_key_stream() {
        let registry = test_registry(&[1]);
        let options = WriterOptions::new().with_random_key(true).with_random_iv(true);

        let mut writer = Writer::new(Vec::new(), &registry, options).unwrap();
        writer.write_all(b"fresh key per stream").unwrap();
        let ciphertext = writer.finish().unwrap();

        let (header, _) = Header::parse(&ciphertext).unwrap();
        assert!(header.wrapped_key().is_some());
        assert_eq!(registry.decrypt(&ciphertext).unwrap(), b"fresh key per stream");
    }

    #[test]
    fn test_cipher_name_override() {
        let registry = test_registry(&[1]);
        let options = WriterOptions::new()
            .with_cipher_name(CipherName::Aes256Gcm)
            .with_random_key(true)
            .with_random_iv(true);

        let mut writer = Writer::new(Vec::new(), &registry, options).unwrap();
        writer.write_all(b"sealed under gcm").unwrap();
        let ciphertext = writer.finish().unwrap();

        let (header, _) = Header::parse(&ciphertext).unwrap();
        assert_eq!(header.cipher_name(), Some("aes-256-gcm"));
        assert_eq!(registry.decrypt(&ciphertext).unwrap(), b"sealed under gcm");
    }

    #[test]
    fn test_headerless_stream() {
        let ciphertext = encrypt_stream(WriterOptions::new().with_header(false), b"raw", 64);
        assert!(!Header::starts_with_magic(&ciphertext));
        assert_eq!(ciphertext.len(), 16);
    }

    #[test]
    fn test_legacy_header_stream() {
        let registry = test_registry(&[1]);
        let mut writer = Writer::new(
            Vec::new(),
            &registry,
            WriterOptions::new().with_legacy_header(true).with_compress(true),
        )
        .unwrap();
        writer.write_all(b"legacy framed").unwrap();
        let ciphertext = writer.finish().unwrap();

        let (header, _) = Header::parse(&ciphertext).unwrap();
        assert_eq!(header.cipher_version(), 0);
        assert!(header.compressed());
        assert_eq!(registry.decrypt(&ciphertext).unwrap(), b"legacy framed");
    }

    #[test]
    fn test_invalid_option_combinations() {
        let registry = test_registry(&[1]);

        let result =
            Writer::new(Vec::new(), &registry, WriterOptions::new().with_random_key(true));
        assert!(matches!(result, Err(Error::Config(_))));

        let result = Writer::new(
            Vec::new(),
            &registry,
            WriterOptions::new().with_cipher_name(CipherName::Aes256Gcm),
        );
        assert!(matches!(result, Err(Error::Config(_))));

        let result = Writer::new(
            Vec::new(),
            &registry,
            WriterOptions::new().with_legacy_header(true).with_random_iv(true),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn test_unknown_version_rejected() {
        let registry = test_registry(&[1]);
        let result = Writer::new(Vec::new(), &registry, WriterOptions::new().with_version(9));
        assert!(matches!(result, Err(Error::UnknownCipherVersion(9))));
    }

    #[test]
    fn test_write_after_close_fails() {
        let registry = test_registry(&[1]);
        let mut writer = Writer::new(Vec::new(), &registry, WriterOptions::new()).unwrap();
        writer.write_all(b"data").unwrap();
        writer.close().unwrap();

        let err = writer.write(b"more").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        writer.close().expect("second close is a no-op");
    }

    #[test]
    fn test_scoped_closes_and_surfaces_operation_error() {
        let registry = test_registry(&[1]);

        let ciphertext = Writer::scoped(
            Vec::new(),
            &registry,
            WriterOptions::new(),
            |writer| {
                writer.write_all(b"scoped").map_err(Error::Io)?;
                Ok(())
            },
        );
        assert!(ciphertext.is_ok());

        let failed: Result<(), Error> =
            Writer::scoped(Vec::new(), &registry, WriterOptions::new(), |_| {
                Err(Error::EncryptionFailed("forced".to_string()))
            });
        assert!(matches!(failed, Err(Error::EncryptionFailed(_))));
    }
}
