//! Incremental cipher state machines.
//!
//! CBC modes stream block-by-block with PKCS#7 padding applied at
//! finalization. GCM is one-shot in the AEAD API, so its engine buffers
//! input and seals (or opens) the whole message when finalized.

use crate::cipher::CipherName;
use crate::error::Error;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecryptMut, BlockEncryptMut, BlockSizeUser, KeyIvInit};
use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use zeroize::Zeroizing;

type Aes128CbcEnc = cbc::Encryptor<aes::Aes128>;
type Aes192CbcEnc = cbc::Encryptor<aes::Aes192>;
type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes128CbcDec = cbc::Decryptor<aes::Aes128>;
type Aes192CbcDec = cbc::Decryptor<aes::Aes192>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Streaming PKCS#7 CBC encryptor over any block cipher.
struct CbcEncryptor<C: BlockEncryptMut> {
    cipher: C,
    pending: Zeroizing<Vec<u8>>,
}

impl<C: BlockEncryptMut> CbcEncryptor<C> {
    fn new(cipher: C) -> Self {
        Self { cipher, pending: Zeroizing::new(Vec::new()) }
    }

    fn update(&mut self, input: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(input);
        let bs = C::block_size();
        let full = self.pending.len() / bs * bs;
        let mut out = self.pending[..full].to_vec();
        for block in out.chunks_exact_mut(bs) {
            self.cipher.encrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        self.pending.drain(..full);
        out
    }

    fn finalize(mut self) -> Vec<u8> {
        let bs = C::block_size();
        let pad = bs - self.pending.len();
        let mut block = self.pending.to_vec();
        // Safe cast: pad is in 1..=block_size
        #[allow(clippy::cast_possible_truncation)]
        block.resize(bs, pad as u8);
        self.cipher.encrypt_block_mut(GenericArray::from_mut_slice(&mut block));
        block
    }
}

/// Streaming PKCS#7 CBC decryptor. Holds back one block so padding can
/// be stripped when the stream ends.
struct CbcDecryptor<C: BlockDecryptMut> {
    cipher: C,
    pending: Vec<u8>,
}

impl<C: BlockDecryptMut> CbcDecryptor<C> {
    fn new(cipher: C) -> Self {
        Self { cipher, pending: Vec::new() }
    }

    fn update(&mut self, input: &[u8]) -> Vec<u8> {
        self.pending.extend_from_slice(input);
        let bs = C::block_size();
        let keep = if self.pending.len() % bs == 0 { bs } else { self.pending.len() % bs };
        let process = self.pending.len().saturating_sub(keep);
        let mut out: Vec<u8> = self.pending.drain(..process).collect();
        for block in out.chunks_exact_mut(bs) {
            self.cipher.decrypt_block_mut(GenericArray::from_mut_slice(block));
        }
        out
    }

    fn finalize(mut self) -> Result<Vec<u8>, Error> {
        if self.pending.is_empty() {
            // No input at all decrypts to no output.
            return Ok(Vec::new());
        }
        let bs = C::block_size();
        if self.pending.len() != bs {
            return Err(Error::DecryptionFailed(format!(
                "ciphertext length is not a multiple of the {bs}-byte block size"
            )));
        }
        let mut block = std::mem::take(&mut self.pending);
        self.cipher.decrypt_block_mut(GenericArray::from_mut_slice(&mut block));

        let pad = usize::from(*block.last().unwrap_or(&0));
        if pad == 0 || pad > bs || block[bs - pad..].iter().any(|&b| b != block[bs - 1]) {
            return Err(Error::DecryptionFailed("invalid padding".to_string()));
        }
        block.truncate(bs - pad);
        Ok(block)
    }
}

/// Buffering engine for AES-256-GCM. The nonce travels in the header IV
/// slot; the authentication tag is appended to the ciphertext by the
/// AEAD implementation.
struct GcmBuffer {
    key: Zeroizing<Vec<u8>>,
    nonce: Vec<u8>,
    buffer: Zeroizing<Vec<u8>>,
}

impl GcmBuffer {
    fn new(key: &[u8], nonce: &[u8]) -> Self {
        Self {
            key: Zeroizing::new(key.to_vec()),
            nonce: nonce.to_vec(),
            buffer: Zeroizing::new(Vec::new()),
        }
    }

    fn seal(self) -> Result<Vec<u8>, Error> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| Error::EncryptionFailed(format!("invalid key: {e}")))?;
        cipher
            .encrypt(Nonce::from_slice(&self.nonce), self.buffer.as_slice())
            .map_err(|e| Error::EncryptionFailed(format!("AES-GCM encryption failed: {e}")))
    }

    fn open(self) -> Result<Vec<u8>, Error> {
        let cipher = Aes256Gcm::new_from_slice(&self.key)
            .map_err(|e| Error::DecryptionFailed(format!("invalid key: {e}")))?;
        cipher
            .decrypt(Nonce::from_slice(&self.nonce), self.buffer.as_slice())
            .map_err(|_| Error::DecryptionFailed("authentication failed".to_string()))
    }
}

fn check_lengths(name: CipherName, key: &[u8], iv: &[u8], encrypt: bool) -> Result<(), Error> {
    if key.len() == name.key_len() && iv.len() == name.iv_len() {
        return Ok(());
    }
    let msg = format!(
        "{name} requires a {}-byte key and {}-byte IV (got {} and {})",
        name.key_len(),
        name.iv_len(),
        key.len(),
        iv.len()
    );
    if encrypt {
        Err(Error::EncryptionFailed(msg))
    } else {
        Err(Error::DecryptionFailed(msg))
    }
}

/// Incremental encryption under one (algorithm, key, IV) triple.
pub(crate) enum EncryptEngine {
    Aes128Cbc(CbcEncryptor<Aes128CbcEnc>),
    Aes192Cbc(CbcEncryptor<Aes192CbcEnc>),
    Aes256Cbc(CbcEncryptor<Aes256CbcEnc>),
    Aes256Gcm(GcmBuffer),
}

impl EncryptEngine {
    pub(crate) fn new(name: CipherName, key: &[u8], iv: &[u8]) -> Result<Self, Error> {
        check_lengths(name, key, iv, true)?;
        Ok(match name {
            CipherName::Aes128Cbc => {
                Self::Aes128Cbc(CbcEncryptor::new(Aes128CbcEnc::new_from_slices(key, iv).map_err(
                    |e| Error::EncryptionFailed(format!("cipher init failed: {e}")),
                )?))
            }
            CipherName::Aes192Cbc => {
                Self::Aes192Cbc(CbcEncryptor::new(Aes192CbcEnc::new_from_slices(key, iv).map_err(
                    |e| Error::EncryptionFailed(format!("cipher init failed: {e}")),
                )?))
            }
            CipherName::Aes256Cbc => {
                Self::Aes256Cbc(CbcEncryptor::new(Aes256CbcEnc::new_from_slices(key, iv).map_err(
                    |e| Error::EncryptionFailed(format!("cipher init failed: {e}")),
                )?))
            }
            CipherName::Aes256Gcm => Self::Aes256Gcm(GcmBuffer::new(key, iv)),
        })
    }

    /// Absorbs plaintext and returns any ciphertext produced so far.
    pub(crate) fn update(&mut self, input: &[u8]) -> Vec<u8> {
        match self {
            Self::Aes128Cbc(enc) => enc.update(input),
            Self::Aes192Cbc(enc) => enc.update(input),
            Self::Aes256Cbc(enc) => enc.update(input),
            Self::Aes256Gcm(buf) => {
                buf.buffer.extend_from_slice(input);
                Vec::new()
            }
        }
    }

    /// Emits the final (padded or sealed) ciphertext bytes.
    pub(crate) fn finalize(self) -> Result<Vec<u8>, Error> {
        match self {
            Self::Aes128Cbc(enc) => Ok(enc.finalize()),
            Self::Aes192Cbc(enc) => Ok(enc.finalize()),
            Self::Aes256Cbc(enc) => Ok(enc.finalize()),
            Self::Aes256Gcm(buf) => buf.seal(),
        }
    }
}

/// Incremental decryption under one (algorithm, key, IV) triple.
pub(crate) enum DecryptEngine {
    Aes128Cbc(CbcDecryptor<Aes128CbcDec>),
    Aes192Cbc(CbcDecryptor<Aes192CbcDec>),
    Aes256Cbc(CbcDecryptor<Aes256CbcDec>),
    Aes256Gcm(GcmBuffer),
}

impl DecryptEngine {
    pub(crate) fn new(name: CipherName, key: &[u8], iv: &[u8]) -> Result<Self, Error> {
        check_lengths(name, key, iv, false)?;
        Ok(match name {
            CipherName::Aes128Cbc => {
                Self::Aes128Cbc(CbcDecryptor::new(Aes128CbcDec::new_from_slices(key, iv).map_err(
                    |e| Error::DecryptionFailed(format!("cipher init failed: {e}")),
                )?))
            }
            CipherName::Aes192Cbc => {
                Self::Aes192Cbc(CbcDecryptor::new(Aes192CbcDec::new_from_slices(key, iv).map_err(
                    |e| Error::DecryptionFailed(format!("cipher init failed: {e}")),
                )?))
            }
            CipherName::Aes256Cbc => {
                Self::Aes256Cbc(CbcDecryptor::new(Aes256CbcDec::new_from_slices(key, iv).map_err(
                    |e| Error::DecryptionFailed(format!("cipher init failed: {e}")),
                )?))
            }
            CipherName::Aes256Gcm => Self::Aes256Gcm(GcmBuffer::new(key, iv)),
        })
    }

    /// Absorbs ciphertext and returns any plaintext recovered so far.
    pub(crate) fn update(&mut self, input: &[u8]) -> Vec<u8> {
        match self {
            Self::Aes128Cbc(dec) => dec.update(input),
            Self::Aes192Cbc(dec) => dec.update(input),
            Self::Aes256Cbc(dec) => dec.update(input),
            Self::Aes256Gcm(buf) => {
                buf.buffer.extend_from_slice(input);
                Vec::new()
            }
        }
    }

    /// Emits trailing plaintext, verifying padding or the auth tag.
    pub(crate) fn finalize(self) -> Result<Vec<u8>, Error> {
        match self {
            Self::Aes128Cbc(dec) => dec.finalize(),
            Self::Aes192Cbc(dec) => dec.finalize(),
            Self::Aes256Cbc(dec) => dec.finalize(),
            Self::Aes256Gcm(buf) => buf.open(),
        }
    }
}
