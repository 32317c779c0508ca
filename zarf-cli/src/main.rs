//! `zarf` CLI tool for key generation and rotation.
//!
//! Configuration parsing lives here, not in the core: the library
//! consumes typed [`Config`] values, and this tool is the collaborator
//! that reads and writes the YAML form.

#![warn(clippy::pedantic, clippy::nursery)]

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::PathBuf;
use zarf::prelude::*;

#[derive(Parser)]
#[command(name = "zarf")]
#[command(about = "zarf key management CLI", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a new key-encrypting key as PKCS#8 PEM on stdout
    Keygen {
        /// DEK wrap scheme recorded for the new KEK (oaep | pkcs1v15)
        #[arg(long, default_value = "oaep")]
        scheme: String,
    },
    /// Insert a new (DEK, KEK) pair ahead of each environment's ciphers
    Rotate {
        /// Configuration file to rotate
        #[arg(short, long, default_value = "zarf.yml")]
        config: PathBuf,
        /// Environments to rotate; omit to rotate all of them
        #[arg(short, long)]
        environment: Vec<String>,
        /// Application name used in generated key file and variable names
        #[arg(long, default_value = "zarf")]
        app_name: String,
        /// Stage the new cipher as a secondary instead of the primary
        #[arg(long)]
        rolling_deploy: bool,
        /// Write the rotated configuration here instead of in place
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    match Cli::parse().command {
        Commands::Keygen { scheme } => keygen(&scheme),
        Commands::Rotate { config, environment, app_name, rolling_deploy, output } => {
            run_rotate(&config, &environment, &app_name, rolling_deploy, output)
        }
    }
}

fn keygen(scheme: &str) -> Result<()> {
    let scheme = match scheme {
        "oaep" => WrapScheme::Oaep,
        "pkcs1v15" => WrapScheme::Pkcs1v15,
        other => bail!("unknown wrap scheme: {other} (expected oaep or pkcs1v15)"),
    };
    let kek = KeyEncryptingKey::generate_with(KeyEncryptingKey::DEFAULT_BITS, scheme)?;
    print!("{}", *kek.to_pem()?);
    Ok(())
}

fn run_rotate(
    config_path: &PathBuf,
    environments: &[String],
    app_name: &str,
    rolling_deploy: bool,
    output: Option<PathBuf>,
) -> Result<()> {
    let raw = fs::read_to_string(config_path)
        .with_context(|| format!("cannot read {}", config_path.display()))?;
    let config: Config = serde_yaml::from_str(&raw)
        .with_context(|| format!("cannot parse {}", config_path.display()))?;

    let selected: Vec<&str> = environments.iter().map(String::as_str).collect();
    let rotated = rotate(&config, &selected, app_name, rolling_deploy)?;

    let destination = output.as_ref().unwrap_or(config_path);
    fs::write(destination, serde_yaml::to_string(&rotated)?)
        .with_context(|| format!("cannot write {}", destination.display()))?;
    println!("Rotated configuration written to {}", destination.display());
    Ok(())
}
