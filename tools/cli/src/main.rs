//! VaultSync CLI - Command line access to key derivation and key wrapping.
//!
//! Every secret operation runs inside the isolated key worker; the CLI only
//! prompts for the password and prints base64 results.

use std::sync::Arc;

use anyhow::{Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{debug, info, Level};
use tracing_subscriber::FmtSubscriber;
use zeroize::Zeroizing;

use vaultsync_crypto::{KdfParams, Salt, WrappedKey};
use vaultsync_keyworker::{KeyWorker, ProgressCallback, WorkerConfig};

#[derive(Parser)]
#[command(name = "vaultsync")]
#[command(about = "VaultSync - Key derivation and key wrapping")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long)]
    verbose: bool,

    /// KDF strength: "interactive", "moderate", or "sensitive".
    #[arg(short, long, global = true, default_value = "interactive")]
    strength: String,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate random salts.
    GenSalt {
        /// Number of salts to generate.
        #[arg(short, long, default_value_t = 1)]
        count: usize,
    },

    /// Derive the server authentication hash.
    AuthHash {
        /// Base64 salt.
        #[arg(long)]
        salt: String,
    },

    /// Derive the auth hash and the key-encryption key in one pass.
    DeriveKeys {
        /// Base64 salt for the auth hash.
        #[arg(long)]
        auth_salt: String,

        /// Base64 salt for the key-encryption key.
        #[arg(long)]
        kek_salt: String,
    },

    /// Wrap a key under the password-derived key-encryption key.
    Wrap {
        /// Base64 salt for the key-encryption key.
        #[arg(long)]
        kek_salt: String,

        /// Base64 key to wrap. A random 32-byte key is generated if omitted.
        #[arg(long)]
        key: Option<String>,
    },

    /// Unwrap a key with the password-derived key-encryption key.
    Unwrap {
        /// Base64 salt for the key-encryption key.
        #[arg(long)]
        kek_salt: String,

        /// Base64 wrapped key.
        #[arg(long)]
        wrapped: String,

        /// Base64 nonce.
        #[arg(long)]
        iv: String,
    },
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct WrapOutput {
    wrapped_key: String,
    iv: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let kdf = KdfParams::from_preset(&cli.strength).context("Invalid strength")?;
    let worker = KeyWorker::new(WorkerConfig::default().with_kdf(kdf));

    let result = match cli.command {
        Commands::GenSalt { count } => cmd_gen_salt(count, cli.json),
        Commands::AuthHash { salt } => cmd_auth_hash(&worker, &salt, cli.json).await,
        Commands::DeriveKeys {
            auth_salt,
            kek_salt,
        } => cmd_derive_keys(&worker, &auth_salt, &kek_salt, cli.json).await,
        Commands::Wrap { kek_salt, key } => {
            cmd_wrap(&worker, &kek_salt, key.as_deref(), cli.json).await
        }
        Commands::Unwrap {
            kek_salt,
            wrapped,
            iv,
        } => cmd_unwrap(&worker, &kek_salt, &wrapped, &iv, cli.json).await,
    };

    worker.lock().await;
    result
}

/// Prompt for password securely.
fn prompt_password(prompt: &str) -> Result<Zeroizing<Vec<u8>>> {
    let password = rpassword::prompt_password(prompt).context("Failed to read password")?;
    if password.is_empty() {
        anyhow::bail!("Password cannot be empty");
    }
    Ok(Zeroizing::new(password.into_bytes()))
}

fn parse_salt(label: &str, encoded: &str) -> Result<Salt> {
    Salt::from_base64(encoded).with_context(|| format!("Invalid {}", label))
}

/// Progress reporter logging percentages at debug level.
fn progress_printer() -> ProgressCallback {
    Arc::new(|fraction| debug!("Key derivation {:.0}%", fraction * 100.0))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Generate random salts.
fn cmd_gen_salt(count: usize, json: bool) -> Result<()> {
    let salts: Vec<String> = (0..count).map(|_| Salt::generate().to_base64()).collect();
    if json {
        return print_json(&salts);
    }
    for salt in salts {
        println!("{}", salt);
    }
    Ok(())
}

/// Derive and print the auth hash.
async fn cmd_auth_hash(worker: &KeyWorker, salt: &str, json: bool) -> Result<()> {
    let salt = parse_salt("salt", salt)?;
    let password = prompt_password("Enter password: ")?;

    info!("Deriving auth hash");
    let hash = worker
        .derive_auth_hash(&password, &salt, Some(progress_printer()))
        .await
        .context("Failed to derive auth hash")?;

    if json {
        return print_json(&serde_json::json!({ "authHash": hash.to_base64() }));
    }
    println!("{}", hash.to_base64());
    Ok(())
}

/// Derive both keys; the KEK stays inside the worker.
async fn cmd_derive_keys(
    worker: &KeyWorker,
    auth_salt: &str,
    kek_salt: &str,
    json: bool,
) -> Result<()> {
    let auth_salt = parse_salt("auth salt", auth_salt)?;
    let kek_salt = parse_salt("KEK salt", kek_salt)?;
    let password = prompt_password("Enter password: ")?;

    info!("Deriving keys");
    let keys = worker
        .derive_keys(&password, &auth_salt, &kek_salt, Some(progress_printer()))
        .await
        .context("Failed to derive keys")?;
    let auth_hash = keys.auth_hash.to_base64();
    worker
        .cache_kek(keys.kek)
        .await
        .context("Failed to cache key-encryption key")?;
    let cached = worker.has_cached_kek().await?;

    if json {
        return print_json(&serde_json::json!({
            "authHash": auth_hash,
            "kekCached": cached,
        }));
    }
    println!("Auth hash: {}", auth_hash);
    println!("Key-encryption key cached: {}", cached);
    Ok(())
}

/// Derive the KEK from the password and hand it to the worker.
async fn unlock_worker(worker: &KeyWorker, kek_salt: &str) -> Result<()> {
    let kek_salt = parse_salt("KEK salt", kek_salt)?;
    let password = prompt_password("Enter password: ")?;

    let kek = worker
        .derive_kek(&password, &kek_salt, Some(progress_printer()))
        .await
        .context("Failed to derive key-encryption key")?;
    worker
        .cache_kek(kek)
        .await
        .context("Failed to cache key-encryption key")?;
    Ok(())
}

/// Wrap a key under the cached KEK.
async fn cmd_wrap(
    worker: &KeyWorker,
    kek_salt: &str,
    key: Option<&str>,
    json: bool,
) -> Result<()> {
    let key = match key {
        Some(encoded) => Zeroizing::new(STANDARD.decode(encoded).context("Invalid base64 key")?),
        None => Zeroizing::new(vaultsync_crypto::KeyEncryptionKey::generate().as_bytes().to_vec()),
    };

    unlock_worker(worker, kek_salt).await?;
    let wrapped = worker
        .wrap_key(&key, None)
        .await
        .context("Failed to wrap key")?;

    let (wrapped_key, iv) = wrapped.to_base64();
    if json {
        return print_json(&WrapOutput { wrapped_key, iv });
    }
    println!("Wrapped key: {}", wrapped_key);
    println!("IV: {}", iv);
    Ok(())
}

/// Unwrap a key with the cached KEK and print it.
async fn cmd_unwrap(
    worker: &KeyWorker,
    kek_salt: &str,
    wrapped: &str,
    iv: &str,
    json: bool,
) -> Result<()> {
    let wrapped = WrappedKey::from_base64(wrapped, iv).context("Invalid wrapped key")?;

    unlock_worker(worker, kek_salt).await?;
    let key = worker
        .unwrap_key(&wrapped, None)
        .await
        .context("Failed to unwrap key (wrong password or salt?)")?;

    let encoded = Zeroizing::new(STANDARD.encode(key.as_bytes()));
    if json {
        return print_json(&serde_json::json!({ "key": encoded.as_str() }));
    }
    println!("{}", encoded.as_str());
    Ok(())
}
