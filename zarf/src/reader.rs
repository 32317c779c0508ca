//! Streaming decryption source.
//!
//! Construction sniffs the first four bytes of the source. The magic
//! selects headered mode: the header is parsed incrementally and its
//! embedded parameters override the registry entry for its cipher
//! version. Anything else is treated as headerless ciphertext under the
//! caller-specified version (default: primary).
//!
//! Crate errors raised mid-stream (bad padding, failed authentication)
//! surface from `read` as `io::ErrorKind::InvalidData` wrapping the
//! [`Error`].

use crate::cipher;
use crate::engine::DecryptEngine;
use crate::error::Error;
use crate::header::Header;
use crate::registry::Registry;
use flate2::read::ZlibDecoder;
use std::io::{self, Chain, Cursor, Read};

/// Construction options for [`Reader`].
#[derive(Debug, Clone, Copy, Default)]
pub struct ReaderOptions {
    version: Option<u8>,
}

impl ReaderOptions {
    /// Creates default options: headerless streams decrypt under the
    /// primary cipher.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Selects the registry version used when the stream carries no
    /// header (or a header without a version).
    #[must_use]
    pub const fn with_version(mut self, version: u8) -> Self {
        self.version = Some(version);
        self
    }
}

/// Source with the sniffed prefix stitched back in front.
type SniffedSource<R> = Chain<Cursor<Vec<u8>>, R>;

/// Plaintext-producing source adapter: pulls ciphertext, decrypts, and
/// serves plaintext. Finalizes the cipher exactly once at source EOF.
struct CipherSource<R: Read> {
    source: SniffedSource<R>,
    engine: Option<DecryptEngine>,
    buffer: Vec<u8>,
    pos: usize,
    done: bool,
}

impl<R: Read> CipherSource<R> {
    fn new(source: SniffedSource<R>, engine: DecryptEngine) -> Self {
        Self { source, engine: Some(engine), buffer: Vec::new(), pos: 0, done: false }
    }
}

impl<R: Read> Read for CipherSource<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        loop {
            if self.pos < self.buffer.len() {
                let n = out.len().min(self.buffer.len() - self.pos);
                out[..n].copy_from_slice(&self.buffer[self.pos..self.pos + n]);
                self.pos += n;
                if self.pos == self.buffer.len() {
                    self.buffer.clear();
                    self.pos = 0;
                }
                return Ok(n);
            }
            if self.done {
                return Ok(0);
            }

            let mut chunk = [0u8; 8192];
            let n = match self.source.read(&mut chunk) {
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            };
            if n == 0 {
                self.done = true;
                if let Some(engine) = self.engine.take() {
                    self.buffer = engine.finalize().map_err(Error::into_io)?;
                    self.pos = 0;
                }
            } else if let Some(engine) = self.engine.as_mut() {
                self.buffer = engine.update(&chunk[..n]);
                self.pos = 0;
            }
        }
    }
}

enum Stage<R: Read> {
    Plain(CipherSource<R>),
    Compressed(ZlibDecoder<CipherSource<R>>),
}

/// Streaming decryption source.
///
/// A reader is single-owner: share one per thread or serialize.
///
/// # Example
///
/// ```rust,ignore
/// let mut reader = Reader::new(file, &registry, ReaderOptions::new())?;
/// let mut plaintext = String::new();
/// reader.read_to_string(&mut plaintext)?;
/// ```
pub struct Reader<R: Read> {
    stage: Stage<R>,
}

impl<R: Read> Reader<R> {
    /// Sniffs the stream, resolves the effective cipher, and installs
    /// the decompression stage when the header demands it.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MalformedHeader`] for a truncated or
    /// inconsistent header, [`Error::UnknownCipherVersion`] when the
    /// header (or `options.version`) names an unregistered version,
    /// [`Error::KeyUnwrapFailed`] when an embedded key cannot be
    /// unwrapped, or [`Error::Io`] from the source.
    pub fn new(source: R, registry: &Registry, options: ReaderOptions) -> Result<Self, Error> {
        let mut source = source;
        let mut prefix = [0u8; 4];
        let mut filled = 0;
        while filled < prefix.len() {
            match source.read(&mut prefix[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(Error::Io(e)),
            }
        }

        let fallback = match options.version {
            Some(version) => registry.by_version(version)?,
            None => registry.primary(),
        };

        if filled == prefix.len() && Header::starts_with_magic(&prefix) {
            let mut sniffed = Cursor::new(prefix.to_vec()).chain(source);
            let header = Header::read_from(&mut sniffed)?;
            let resolved = cipher::resolve(
                &header,
                |v| registry.by_version(v).ok().map(|c| c.as_ref()),
                fallback.as_ref(),
            )?;
            let cipher_source = CipherSource::new(sniffed, resolved.decrypt_engine()?);
            let stage = if header.compressed() {
                Stage::Compressed(ZlibDecoder::new(cipher_source))
            } else {
                Stage::Plain(cipher_source)
            };
            return Ok(Self { stage });
        }

        // Headerless: the sniffed bytes are ciphertext.
        let sniffed = Cursor::new(prefix[..filled].to_vec()).chain(source);
        let resolved = cipher::resolve(&Header::new(0), |_| None, fallback.as_ref())?;
        let cipher_source = CipherSource::new(sniffed, resolved.decrypt_engine()?);
        Ok(Self { stage: Stage::Plain(cipher_source) })
    }

    /// Lazily yields decrypted lines separated by `\n`, separator
    /// preserved.
    #[must_use]
    pub fn lines(self) -> Lines<R> {
        self.lines_with(b"\n".to_vec(), false)
    }

    /// Lazily yields decrypted lines with an explicit separator.
    /// Multi-byte separators are supported. When `strip` is set the
    /// separator bytes are removed from each yielded line.
    ///
    /// # Panics
    ///
    /// Panics if the separator is empty.
    #[must_use]
    pub fn lines_with(self, separator: impl Into<Vec<u8>>, strip: bool) -> Lines<R> {
        let separator = separator.into();
        assert!(!separator.is_empty(), "line separator must not be empty");
        Lines { reader: self, separator, strip, buffer: Vec::new(), done: false }
    }
}

impl<R: Read> Read for Reader<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        match &mut self.stage {
            Stage::Plain(source) => source.read(out),
            Stage::Compressed(decoder) => decoder.read(out),
        }
    }
}

/// Lazy iterator over decrypted lines. See [`Reader::lines_with`].
pub struct Lines<R: Read> {
    reader: Reader<R>,
    separator: Vec<u8>,
    strip: bool,
    buffer: Vec<u8>,
    done: bool,
}

impl<R: Read> Lines<R> {
    fn take_line(&mut self, end: usize, with_separator: bool) -> io::Result<String> {
        let take = if with_separator { end + self.separator.len() } else { end };
        let keep = if self.strip { end } else { take };
        let line: Vec<u8> = self.buffer.drain(..take).take(keep).collect();
        String::from_utf8(line)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
    }

    fn find_separator(&self) -> Option<usize> {
        self.buffer
            .windows(self.separator.len())
            .position(|window| window == self.separator.as_slice())
    }
}

impl<R: Read> Iterator for Lines<R> {
    type Item = io::Result<String>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(end) = self.find_separator() {
                return Some(self.take_line(end, true));
            }
            if self.done {
                if self.buffer.is_empty() {
                    return None;
                }
                let end = self.buffer.len();
                return Some(self.take_line(end, false));
            }

            let mut chunk = [0u8; 8192];
            match self.reader.read(&mut chunk) {
                Ok(0) => self.done = true,
                Ok(n) => self.buffer.extend_from_slice(&chunk[..n]),
                Err(e) => {
                    self.done = true;
                    return Some(Err(e));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::test_registry;
    use crate::writer::{Writer, WriterOptions};
    use std::io::Write as _;

    fn encrypt(options: WriterOptions, plaintext: &[u8]) -> Vec<u8> {
        let registry = test_registry(&[1]);
        let mut writer = Writer::new(Vec::new(), &registry, options).expect("writer failed");
        writer.write_all(plaintext).expect("write failed");
        writer.finish().expect("finish failed")
    }

    fn read_all(ciphertext: &[u8], options: ReaderOptions) -> Vec<u8> {
        let registry = test_registry(&[1]);
        let mut reader =
            Reader::new(ciphertext, &registry, options).expect("reader construction failed");
        let mut plaintext = Vec::new();
        reader.read_to_end(&mut plaintext).expect("read failed");
        plaintext
    }

    #[test]
    fn test_headered_round_trip() {
        let ciphertext = encrypt(WriterOptions::new(), b"stream me back");
        assert_eq!(read_all(&ciphertext, ReaderOptions::new()), b"stream me back");
    }

    #[test]
    fn test_headerless_round_trip() {
        let ciphertext = encrypt(WriterOptions::new().with_header(false), b"no frame");
        assert_eq!(read_all(&ciphertext, ReaderOptions::new().with_version(1)), b"no frame");
    }

    #[test]
    fn test_compressed_round_trip_any_chunking() {
        let plaintext: Vec<u8> = (0u32..100_000).flat_map(u32::to_le_bytes).collect();

        let registry = test_registry(&[1]);
        let mut writer = Writer::new(
            Vec::new(),
            &registry,
            WriterOptions::new().with_compress(true).with_random_iv(true),
        )
        .unwrap();
        for part in plaintext.chunks(1013) {
            writer.write_all(part).unwrap();
        }
        let ciphertext = writer.finish().unwrap();

        let mut reader = Reader::new(&ciphertext[..], &registry, ReaderOptions::new()).unwrap();
        let mut recovered = Vec::new();
        let mut small = [0u8; 277];
        loop {
            let n = reader.read(&mut small).unwrap();
            if n == 0 {
                break;
            }
            recovered.extend_from_slice(&small[..n]);
        }
        assert_eq!(recovered, plaintext);
    }

    #[test]
    fn test_random_key_round_trip() {
        let ciphertext = encrypt(
            WriterOptions::new().with_random_key(true).with_random_iv(true),
            b"per-stream key",
        );
        assert_eq!(read_all(&ciphertext, ReaderOptions::new()), b"per-stream key");
    }

    #[test]
    fn test_empty_source_yields_nothing() {
        assert!(read_all(b"", ReaderOptions::new()).is_empty());
    }

    #[test]
    fn test_reads_after_eof_return_zero() {
        let ciphertext = encrypt(WriterOptions::new(), b"once");
        let registry = test_registry(&[1]);
        let mut reader = Reader::new(&ciphertext[..], &registry, ReaderOptions::new()).unwrap();

        let mut plaintext = Vec::new();
        reader.read_to_end(&mut plaintext).unwrap();
        assert_eq!(plaintext, b"once");

        let mut again = [0u8; 8];
        assert_eq!(reader.read(&mut again).unwrap(), 0);
    }

    #[test]
    fn test_unknown_header_version_rejected() {
        let mut data = Header::new(42).to_bytes().unwrap();
        data.extend_from_slice(&[0u8; 16]);

        let registry = test_registry(&[1]);
        let result = Reader::new(&data[..], &registry, ReaderOptions::new());
        assert!(matches!(result, Err(Error::UnknownCipherVersion(42))));
    }

    #[test]
    fn test_truncated_header_rejected() {
        let bytes = Header::new(1).to_bytes().unwrap();
        let registry = test_registry(&[1]);
        let result = Reader::new(&bytes[..5], &registry, ReaderOptions::new());
        assert!(matches!(result, Err(Error::MalformedHeader(_))));
    }

    #[test]
    fn test_corrupted_stream_surfaces_decryption_failure() {
        let mut ciphertext = encrypt(WriterOptions::new(), b"will be damaged");
        ciphertext.truncate(ciphertext.len() - 3);

        let registry = test_registry(&[1]);
        let mut reader = Reader::new(&ciphertext[..], &registry, ReaderOptions::new()).unwrap();
        let err = reader.read_to_end(&mut Vec::new()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn test_lines_preserve_separator() {
        let ciphertext = encrypt(WriterOptions::new(), b"alpha\nbeta\ngamma");
        let registry = test_registry(&[1]);
        let reader = Reader::new(&ciphertext[..], &registry, ReaderOptions::new()).unwrap();

        let lines: Vec<String> = reader.lines().map(Result::unwrap).collect();
        assert_eq!(lines, vec!["alpha\n", "beta\n", "gamma"]);
    }

    #[test]
    fn test_lines_stripped() {
        let ciphertext = encrypt(WriterOptions::new(), b"alpha\nbeta\n");
        let registry = test_registry(&[1]);
        let reader = Reader::new(&ciphertext[..], &registry, ReaderOptions::new()).unwrap();

        let lines: Vec<String> = reader.lines_with(b"\n".to_vec(), true).map(Result::unwrap).collect();
        assert_eq!(lines, vec!["alpha", "beta"]);
    }

    #[test]
    fn test_lines_multibyte_separator() {
        let ciphertext = encrypt(WriterOptions::new(), b"one\r\ntwo\r\nthree");
        let registry = test_registry(&[1]);
        let reader = Reader::new(&ciphertext[..], &registry, ReaderOptions::new()).unwrap();

        let lines: Vec<String> =
            reader.lines_with(b"\r\n".to_vec(), false).map(Result::unwrap).collect();
        assert_eq!(lines, vec!["one\r\n", "two\r\n", "three"]);
    }
}
