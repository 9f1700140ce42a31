//! Configuration and credential storage.
//!
//! Everything lives in one application directory (`--app-dir`, default
//! `~/.punchdrop`):
//!
//! ```text
//! config.toml   settings, written with defaults on first run
//! cert.der      client/server certificate (DER)
//! key.der       matching PKCS#8 private key (DER)
//! ```
//!
//! Values are resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `PUNCHDROP_RENDEZVOUS_HOST`,
//!    `PUNCHDROP_RENDEZVOUS_PORT`, `PUNCHDROP_RENDEZVOUS_FINGERPRINT`
//! 2. **Config file**: `config.toml` in the application directory
//! 3. **Compiled defaults**: see each field's default value below
//!
//! ```toml
//! [rendezvous]
//! host = "127.0.0.1"
//! port = 50977
//! # fingerprint = "…"       # sha-256 of the service certificate, as printed by `puncher`
//!
//! [transfer]
//! chunk_size = 65536
//! max_file_size = 0          # 0 = unlimited
//!
//! [connect]
//! max_attempts = 10
//! initial_delay_ms = 1000
//! max_delay_ms = 16000
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, Result, bail};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::tls::{self, CertKeyPair};

const APP_DIR_NAME: &str = ".punchdrop";
const CONFIG_FILE_NAME: &str = "config.toml";
const CERT_FILE_NAME: &str = "cert.der";
const KEY_FILE_NAME: &str = "key.der";

/// Largest chunk a peer may be configured to send; keeps every chunk frame
/// below the frame payload limit.
pub const MAX_CHUNK_SIZE: usize = 512 * 1024;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub rendezvous: RendezvousConfig,
    #[serde(default)]
    pub transfer: TransferConfig,
    #[serde(default)]
    pub connect: ConnectConfig,
}

/// Where the rendezvous service ("puncher") lives.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RendezvousConfig {
    /// Host name or IP address (default `127.0.0.1`).
    #[serde(default = "default_rendezvous_host")]
    pub host: String,
    /// UDP port (default 50977).
    #[serde(default = "default_rendezvous_port")]
    pub port: u16,
    /// Hex SHA-256 fingerprint the service's certificate must match.  Unset
    /// means any certificate is accepted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fingerprint: Option<String>,
}

/// Chunking and acceptance limits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Bytes per chunk on the sending side (default 64 KiB).
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Largest file the receiving side accepts, 0 for no limit (default 0).
    #[serde(default)]
    pub max_file_size: u64,
}

/// Bounds of the peer dial loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectConfig {
    /// Dial attempts before giving up (default 10).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    /// Delay after the first failed attempt (default 1000 ms).
    #[serde(default = "default_initial_delay_ms")]
    pub initial_delay_ms: u64,
    /// Ceiling for the doubling backoff (default 16000 ms).
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

fn default_rendezvous_host() -> String {
    "127.0.0.1".to_string()
}

fn default_rendezvous_port() -> u16 {
    50977
}

fn default_chunk_size() -> usize {
    64 * 1024
}

fn default_max_attempts() -> u32 {
    10
}

fn default_initial_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    16_000
}

impl Default for RendezvousConfig {
    fn default() -> Self {
        Self {
            host: default_rendezvous_host(),
            port: default_rendezvous_port(),
            fingerprint: None,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_file_size: 0,
        }
    }
}

impl Default for ConnectConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_ms: default_initial_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

impl RendezvousConfig {
    /// `host:port`, ready for address resolution.
    #[must_use]
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl ConnectConfig {
    #[must_use]
    pub fn initial_delay(&self) -> Duration {
        Duration::from_millis(self.initial_delay_ms)
    }

    #[must_use]
    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

impl Config {
    /// Parses a TOML document and checks the values for consistency.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid TOML or out-of-range values.
    pub fn from_toml(content: &str) -> Result<Self> {
        let config: Self = toml::from_str(content).context("failed to parse configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Overrides file values with environment variables, looked up through
    /// `var` so callers decide where the environment comes from.
    ///
    /// # Errors
    ///
    /// Returns an error if the port override is not a valid port number or
    /// the fingerprint override is not a SHA-256 hex digest.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(host) = var("PUNCHDROP_RENDEZVOUS_HOST") {
            self.rendezvous.host = host;
        }
        if let Some(port) = var("PUNCHDROP_RENDEZVOUS_PORT") {
            self.rendezvous.port = port
                .parse()
                .with_context(|| format!("invalid PUNCHDROP_RENDEZVOUS_PORT: {port}"))?;
        }
        if let Some(fingerprint) = var("PUNCHDROP_RENDEZVOUS_FINGERPRINT") {
            self.rendezvous.fingerprint = Some(fingerprint);
        }
        self.validate()
    }

    fn validate(&self) -> Result<()> {
        if self.transfer.chunk_size == 0 || self.transfer.chunk_size > MAX_CHUNK_SIZE {
            bail!(
                "transfer.chunk_size must be between 1 and {MAX_CHUNK_SIZE}, got {}",
                self.transfer.chunk_size
            );
        }
        if self.connect.max_attempts == 0 {
            bail!("connect.max_attempts must be at least 1");
        }
        if let Some(fingerprint) = &self.rendezvous.fingerprint {
            if fingerprint.len() != 64 || !fingerprint.bytes().all(|b| b.is_ascii_hexdigit()) {
                bail!("rendezvous.fingerprint must be 64 hex digits, got {fingerprint:?}");
            }
        }
        Ok(())
    }
}

/// The application directory holding configuration and credentials.
#[derive(Debug, Clone)]
pub struct Storage {
    dir: PathBuf,
}

impl Storage {
    /// Uses `custom_dir` when given, `~/.punchdrop` otherwise.
    ///
    /// # Errors
    ///
    /// Returns an error if no directory was given and the home directory
    /// cannot be determined.
    pub fn new(custom_dir: Option<PathBuf>) -> Result<Self> {
        let dir = match custom_dir {
            Some(dir) => dir,
            None => dirs::home_dir()
                .context("cannot determine home directory; pass --app-dir")?
                .join(APP_DIR_NAME),
        };
        Ok(Self { dir })
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Loads `config.toml`, writing the defaults out first if it does not
    /// exist yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory or file cannot be created, read
    /// or parsed.
    pub fn load_config(&self) -> Result<Config> {
        let path = self.dir.join(CONFIG_FILE_NAME);
        if !path.exists() {
            std::fs::create_dir_all(&self.dir)
                .with_context(|| format!("failed to create {}", self.dir.display()))?;
            let defaults = Config::default();
            let content =
                toml::to_string_pretty(&defaults).context("failed to serialize default config")?;
            std::fs::write(&path, content)
                .with_context(|| format!("failed to write {}", path.display()))?;
            info!(path = %path.display(), "Wrote default configuration");
            return Ok(defaults);
        }

        let content = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Config::from_toml(&content).with_context(|| format!("in {}", path.display()))
    }

    /// Loads the certificate pair, generating and saving a self-signed one
    /// on first use.
    ///
    /// # Errors
    ///
    /// Returns an error if only one of the two files exists, or on I/O and
    /// generation failures.
    pub fn certificate(&self) -> Result<CertKeyPair> {
        let cert_path = self.dir.join(CERT_FILE_NAME);
        let key_path = self.dir.join(KEY_FILE_NAME);

        match (cert_path.exists(), key_path.exists()) {
            (true, true) => {
                let cert_der = std::fs::read(&cert_path)
                    .with_context(|| format!("failed to read {}", cert_path.display()))?;
                let private_key_pkcs8_der = std::fs::read(&key_path)
                    .with_context(|| format!("failed to read {}", key_path.display()))?;
                debug!(path = %cert_path.display(), "Loaded certificate");
                Ok(CertKeyPair {
                    cert_der,
                    private_key_pkcs8_der,
                })
            }
            (false, false) => {
                std::fs::create_dir_all(&self.dir)
                    .with_context(|| format!("failed to create {}", self.dir.display()))?;
                let pair = tls::generate_self_signed_cert(&["punchdrop"])?;
                std::fs::write(&cert_path, &pair.cert_der)
                    .with_context(|| format!("failed to write {}", cert_path.display()))?;
                std::fs::write(&key_path, &pair.private_key_pkcs8_der)
                    .with_context(|| format!("failed to write {}", key_path.display()))?;
                info!(fingerprint = %pair.fingerprint(), "Generated new certificate");
                Ok(pair)
            }
            _ => bail!(
                "found only one of {} and {}; remove it to regenerate the pair",
                cert_path.display(),
                key_path.display()
            ),
        }
    }
}

/// Configuration and identity, built once at start-up and passed by
/// reference to everything that dials or listens.
#[derive(Clone)]
pub struct Context {
    pub config: Config,
    pub identity: CertKeyPair,
}

impl Context {
    /// Loads both halves from `storage` and applies environment overrides.
    ///
    /// # Errors
    ///
    /// See [`Storage::load_config`] and [`Storage::certificate`].
    pub fn load(storage: &Storage) -> Result<Self> {
        let mut config = storage.load_config()?;
        config.apply_env(|name| std::env::var(name).ok())?;
        let identity = storage.certificate()?;
        Ok(Self { config, identity })
    }
}
