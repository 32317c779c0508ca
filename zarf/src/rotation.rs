//! Key rotation: insert a new (DEK, KEK) pair ahead of the existing
//! ciphers.
//!
//! Rotation never touches prior entries and never rewrites ciphertext;
//! data encrypted under older versions stays decryptable through the
//! registry, and callers re-encrypt lazily during ordinary writes.

use crate::cipher::random_bytes;
use crate::config::{CipherConfig, Config, KeystoreSelector};
use crate::error::Error;
use crate::kek::KeyEncryptingKey;
use crate::keystore::{generate_data_key, EnvKeystore, FileKeystore, Keystore, MemoryKeystore};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use std::path::Path;

/// Produces a new configuration with a freshly rotated cipher in every
/// selected environment.
///
/// For each selected environment whose top cipher carries KEK material:
/// the next version is `max(existing) + 1`; a new KEK is generated with
/// the top entry's wrap scheme; a new DEK (and IV, when the top entry
/// has one) is generated and persisted through the same keystore
/// variant; and the new entry lands at position 0, or position 1 when
/// `rolling_deploy` stages it as a secondary until every node can
/// decrypt under it.
///
/// An empty `environments` slice selects every environment. The input
/// configuration is left untouched so tooling can diff before writing
/// back.
///
/// # Errors
///
/// Returns [`Error::Config`] when the version space is exhausted or an
/// entry is invalid, [`Error::Keystore`] when persistence fails.
pub fn rotate(
    config: &Config,
    environments: &[&str],
    app_name: &str,
    rolling_deploy: bool,
) -> Result<Config, Error> {
    let mut rotated = config.clone();

    for (env_name, env_config) in &mut rotated.environments {
        if !environments.is_empty() && !environments.contains(&env_name.as_str()) {
            continue;
        }
        let Some(top) = env_config.ciphers.first() else {
            continue;
        };
        if !top.has_kek() {
            tracing::debug!(environment = %env_name, "skipped: top cipher has no KEK reference");
            continue;
        }

        let next_version = env_config
            .ciphers
            .iter()
            .map(|c| c.version)
            .max()
            .unwrap_or(0)
            .checked_add(1)
            .ok_or_else(|| {
                Error::Config(format!("environment {env_name}: cipher version space exhausted"))
            })?;

        let kek = KeyEncryptingKey::generate_with(KeyEncryptingKey::DEFAULT_BITS, top.key_wrap)?;
        let name = top.cipher_name;

        let mut entry = CipherConfig::new(next_version);
        entry.cipher_name = name;
        entry.encoding = top.encoding;
        entry.always_add_header = top.always_add_header;
        entry.key_wrap = top.key_wrap;
        entry.key_encrypting_key = Some(kek.to_pem()?.to_string());

        match top.selector()? {
            KeystoreSelector::File { key, iv } => {
                let directory = key.parent().unwrap_or_else(|| Path::new("."));
                let key_path =
                    directory.join(format!("{app_name}_{env_name}_v{next_version}.key"));
                generate_data_key(&FileKeystore::new(&key_path), &kek, name)?;
                entry.key_filename = Some(key_path);

                if iv.is_some() {
                    let iv_path =
                        directory.join(format!("{app_name}_{env_name}_v{next_version}.iv"));
                    FileKeystore::new(&iv_path).write(&kek.wrap(&random_bytes(name.iv_len()))?)?;
                    entry.iv_filename = Some(iv_path);
                }
            }
            KeystoreSelector::Environment(_) => {
                let variable = env_var_name(app_name, env_name, next_version);
                generate_data_key(&EnvKeystore::new(&variable), &kek, name)?;
                entry.key_env_var = Some(variable);
            }
            KeystoreSelector::Memory { iv, .. } => {
                let store = MemoryKeystore::new(Vec::new());
                let (wrapped, _clear) = generate_data_key(&store, &kek, name)?;
                entry.encrypted_key = Some(STANDARD.encode(wrapped));

                if iv.is_some() {
                    entry.encrypted_iv =
                        Some(STANDARD.encode(kek.wrap(&random_bytes(name.iv_len()))?));
                }
            }
        }

        let slot = usize::from(rolling_deploy);
        env_config.ciphers.insert(slot, entry);
        tracing::info!(
            environment = %env_name,
            version = next_version,
            rolling_deploy,
            "cipher rotated"
        );
    }

    Ok(rotated)
}

fn env_var_name(app_name: &str, env_name: &str, version: u8) -> String {
    format!("{app_name}_{env_name}_v{version}")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_uppercase() } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::CipherName;
    use crate::config::{memory_entry, EnvironmentConfig};
    use crate::kek::shared_kek;
    use crate::registry::Registry;

    fn memory_config(env: &str) -> Config {
        let mut config = Config::default();
        config.environments.insert(
            env.to_string(),
            EnvironmentConfig {
                ciphers: vec![memory_entry(1, CipherName::Aes256Cbc, &shared_kek())],
            },
        );
        config
    }

    #[test]
    fn test_rotation_prepends_next_version() {
        let config = memory_config("production");
        let rotated = rotate(&config, &["production"], "app", false).expect("rotation failed");

        let ciphers = &rotated.environments["production"].ciphers;
        assert_eq!(ciphers.len(), 2);
        assert_eq!(ciphers[0].version, 2);
        assert_eq!(ciphers[1].version, 1);
        assert!(ciphers[0].encrypted_key.is_some());
        assert!(ciphers[0].encrypted_iv.is_some());
        assert!(ciphers[0].has_kek());
    }

    #[test]
    fn test_rotation_leaves_prior_entries_untouched() {
        let config = memory_config("production");
        let before = serde_json::to_string(&config.environments["production"].ciphers[0]).unwrap();

        let rotated = rotate(&config, &[], "app", false).unwrap();
        let after =
            serde_json::to_string(&rotated.environments["production"].ciphers[1]).unwrap();
        assert_eq!(before, after);

        // Input config untouched too.
        assert_eq!(config.environments["production"].ciphers.len(), 1);
    }

    #[test]
    fn test_repeated_rotation_is_monotonic() {
        let config = memory_config("production");
        let once = rotate(&config, &[], "app", false).unwrap();
        let twice = rotate(&once, &[], "app", false).unwrap();

        let versions: Vec<u8> =
            twice.environments["production"].ciphers.iter().map(|c| c.version).collect();
        assert_eq!(versions, vec![3, 2, 1]);
    }

    #[test]
    fn test_rolling_deploy_stages_as_secondary() {
        let config = memory_config("production");
        let rotated = rotate(&config, &[], "app", true).unwrap();

        let versions: Vec<u8> =
            rotated.environments["production"].ciphers.iter().map(|c| c.version).collect();
        assert_eq!(versions, vec![1, 2]);
    }

    #[test]
    fn test_environment_without_kek_skipped() {
        let mut config = memory_config("production");
        config
            .environments
            .get_mut("production")
            .unwrap()
            .ciphers[0]
            .key_encrypting_key = None;

        let rotated = rotate(&config, &[], "app", false).unwrap();
        assert_eq!(rotated.environments["production"].ciphers.len(), 1);
    }

    #[test]
    fn test_unselected_environment_skipped() {
        let config = memory_config("development");
        let rotated = rotate(&config, &["production"], "app", false).unwrap();
        assert_eq!(rotated.environments["development"].ciphers.len(), 1);
    }

    #[test]
    fn test_rotated_config_loads_and_decrypts_old_data() {
        let config = memory_config("production");
        let registry = Registry::load(&config.environments["production"]).unwrap();
        let ciphertext = registry.encrypt(b"pre-rotation data").unwrap();

        let rotated = rotate(&config, &[], "app", false).unwrap();
        let registry = Registry::load(&rotated.environments["production"]).unwrap();

        assert_eq!(registry.primary().version(), 2);
        assert_eq!(registry.decrypt(&ciphertext).unwrap(), b"pre-rotation data");
    }

    #[test]
    fn test_version_space_exhaustion() {
        let mut config = memory_config("production");
        config.environments.get_mut("production").unwrap().ciphers[0].version = 255;

        assert!(matches!(rotate(&config, &[], "app", false), Err(Error::Config(_))));
    }

    #[test]
    fn test_env_var_name_sanitized() {
        assert_eq!(env_var_name("my-app", "pre prod", 3), "MY_APP_PRE_PROD_V3");
    }

    #[test]
    fn test_file_variant_rotation_writes_key_files() {
        use tempfile::TempDir;

        let dir = TempDir::new().unwrap();
        let kek = shared_kek();

        let key_path = dir.path().join("app_staging_v1.key");
        generate_data_key(&FileKeystore::new(&key_path), &kek, CipherName::Aes256Cbc).unwrap();

        let mut entry = CipherConfig::new(1);
        entry.key_filename = Some(key_path);
        entry.key_encrypting_key = Some(kek.to_pem().unwrap().to_string());

        let mut config = Config::default();
        config
            .environments
            .insert("staging".to_string(), EnvironmentConfig { ciphers: vec![entry] });

        let rotated = rotate(&config, &[], "app", false).unwrap();
        let top = &rotated.environments["staging"].ciphers[0];

        assert_eq!(top.version, 2);
        let new_key = top.key_filename.as_ref().unwrap();
        assert_eq!(new_key, &dir.path().join("app_staging_v2.key"));
        assert!(new_key.exists());
        assert!(top.iv_filename.is_none());
    }
}
