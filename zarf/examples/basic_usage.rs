//! Basic usage example for `zarf`.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use zarf::config::{CipherConfig, Config, EnvironmentConfig};
use zarf::keystore::{generate_data_key, MemoryKeystore};
use zarf::prelude::*;
use zarf::rotation::rotate;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("zarf Basic Usage Example");
    println!("========================\n");

    // Generate a key-encrypting key (normally done once by `zarf keygen`)
    let kek = KeyEncryptingKey::generate()?;
    println!("✓ RSA-2048 KEK generated\n");

    // Generate a DEK, wrapped by the KEK, held inline for this demo
    let store = MemoryKeystore::new(Vec::new());
    generate_data_key(&store, &kek, CipherName::Aes256Cbc)?;

    let mut entry = CipherConfig::new(1);
    entry.encrypted_key = Some(store.to_base64());
    entry.encrypted_iv = Some(STANDARD.encode(kek.wrap(&[7u8; 16])?));
    entry.key_encrypting_key = Some(kek.to_pem()?.to_string());

    let mut config = Config::default();
    config
        .environments
        .insert("development".to_string(), EnvironmentConfig { ciphers: vec![entry] });
    println!("✓ Configuration built (memory keystore, cipher v1)\n");

    // Load and install the process-wide registry
    let handle = registry::install(Registry::load(config.environment("development")?)?);
    println!("✓ Registry installed, primary v{}\n", handle.primary().version());

    // Encrypt and decrypt a string
    let token = handle.encrypt_text("alice@example.com")?;
    println!("Encrypted: {token}");
    let plaintext = handle.decrypt_text(&token)?;
    println!("Decrypted: {plaintext}");
    assert_eq!(plaintext, "alice@example.com");
    println!("✓ Round-trip verification successful\n");

    // Rotate: a v2 cipher becomes the primary, v1 stays for decryption
    let rotated = rotate(&config, &["development"], "demo", false)?;
    let handle = registry::install(Registry::load(rotated.environment("development")?)?);
    println!("✓ Rotated, primary now v{}", handle.primary().version());

    let plaintext = handle.decrypt_text(&token)?;
    assert_eq!(plaintext, "alice@example.com");
    println!("✓ Pre-rotation ciphertext still decrypts\n");

    println!("========================");
    println!("All operations successful");
    Ok(())
}
