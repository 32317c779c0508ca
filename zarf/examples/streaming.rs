//! Streaming example: compressed, encrypted log file with per-stream key.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::io::Write as _;
use zarf::config::{CipherConfig, EnvironmentConfig};
use zarf::keystore::{generate_data_key, MemoryKeystore};
use zarf::prelude::*;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let kek = KeyEncryptingKey::generate()?;
    let store = MemoryKeystore::new(Vec::new());
    generate_data_key(&store, &kek, CipherName::Aes256Cbc)?;

    let mut entry = CipherConfig::new(1);
    entry.encrypted_key = Some(store.to_base64());
    entry.encrypted_iv = Some(STANDARD.encode(kek.wrap(&[3u8; 16])?));
    entry.key_encrypting_key = Some(kek.to_pem()?.to_string());

    let registry = Registry::load(&EnvironmentConfig { ciphers: vec![entry] })?;

    let path = std::env::temp_dir().join("zarf-streaming-demo.enc");
    let options = WriterOptions::new()
        .with_compress(true)
        .with_random_key(true)
        .with_random_iv(true);

    // Writer::scoped guarantees the final cipher block on every exit path
    let written = Writer::scoped(std::fs::File::create(&path)?, &registry, options, |writer| {
        for i in 0..10_000 {
            writeln!(writer, "event {i} happened").map_err(zarf::error::Error::Io)?;
        }
        Ok(writer.bytes_in())
    })?;
    let on_disk = std::fs::metadata(&path)?.len();
    println!("{written} plaintext bytes -> {on_disk} encrypted bytes at {}", path.display());

    let reader = Reader::new(std::fs::File::open(&path)?, &registry, ReaderOptions::new())?;
    let lines = reader.lines().count();
    println!("decrypted {lines} lines");

    std::fs::remove_file(&path)?;
    Ok(())
}
