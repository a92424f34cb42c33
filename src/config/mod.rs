// SPDX-License-Identifier: MIT
//! Engine configuration.
//!
//! Resolution order (highest wins):
//!   1. CLI flags / `DRIFTMAIL_*` env vars
//!   2. TOML file at `{data_dir}/config.toml` (or `--config` path)
//!   3. Built-in defaults
//!
//! Credentials and connection details live here, never in engine logic.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::error;

const DEFAULT_DATA_DIR: &str = "driftmail-data";
const DEFAULT_IMAP_PORT: u16 = 993;
const DEFAULT_TTL_SECS: u64 = 3600;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_SWEEP_INTERVAL_SECS: u64 = 300;
const DEFAULT_MAX_INBOX: u32 = 5;
const DEFAULT_RETENTION_DAYS: u32 = 30;

// ─── ImapConfig ───────────────────────────────────────────────────────────────

/// Mail source connection settings (`[imap]` in config.toml).
///
/// The engine polls a single shared INBOX that receives all mail for the
/// disposable domain.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ImapConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Connect over TLS (default: true). Plaintext is for local test servers.
    pub use_tls: bool,
    pub folder: String,
    /// TCP connect + login budget in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for ImapConfig {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: DEFAULT_IMAP_PORT,
            username: String::new(),
            password: String::new(),
            use_tls: true,
            folder: "INBOX".to_string(),
            connect_timeout_secs: 30,
        }
    }
}

// ─── AddressConfig ────────────────────────────────────────────────────────────

/// Disposable address shape (`[addresses]` in config.toml).
///
/// Addresses look like `{prefix}_{suffix}@{domain}`.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AddressConfig {
    /// Domain all disposable addresses are qualified with. Required.
    pub domain: String,
    /// Fixed prefix length after sanitation.
    pub prefix_len: usize,
    /// Random suffix length.
    pub suffix_len: usize,
    /// Alphabet for random prefix/suffix characters.
    pub alphabet: String,
    /// Generation retry cap before reporting exhaustion.
    pub max_attempts: u32,
    /// Minimum length a caller-supplied prefix must have before sanitation.
    pub min_requested_len: usize,
}

impl Default for AddressConfig {
    fn default() -> Self {
        Self {
            domain: String::new(),
            prefix_len: 6,
            suffix_len: 8,
            alphabet: "abcdefghijklmnopqrstuvwxyz0123456789".to_string(),
            max_attempts: 10,
            min_requested_len: 3,
        }
    }
}

// ─── PollingConfig ────────────────────────────────────────────────────────────

/// Background task cadence (`[polling]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct PollingConfig {
    /// Seconds between poll cycles.
    pub poll_interval_secs: u64,
    /// Seconds between expiry sweeps.
    pub sweep_interval_secs: u64,
    /// Wall-clock budget for one poll cycle. Exceeding it aborts the cycle;
    /// checkpoint progress up to the last processed reference is kept.
    pub cycle_timeout_secs: u64,
    /// Wall-clock budget for one sweep run.
    pub sweep_timeout_secs: u64,
    /// Initial backoff after a connection-level poll failure (milliseconds).
    pub backoff_base_ms: u64,
    /// Backoff cap (milliseconds).
    pub backoff_max_ms: u64,
    /// Final warning window before expiry; one `ExpiringSoon` event per
    /// mailbox (0 disables warnings).
    pub expiry_warn_secs: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            sweep_interval_secs: DEFAULT_SWEEP_INTERVAL_SECS,
            cycle_timeout_secs: 120,
            sweep_timeout_secs: 60,
            backoff_base_ms: 500,
            backoff_max_ms: 300_000,
            expiry_warn_secs: 600,
        }
    }
}

// ─── LimitsConfig ─────────────────────────────────────────────────────────────

/// What happens when an owner with an active mailbox asks for another one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OnExisting {
    /// Deactivate and purge the old mailbox, then create the new one
    /// (single atomic operation from the caller's point of view).
    Replace,
    /// Fail with `DuplicateActiveMailboxError`; the caller must delete the
    /// old mailbox or let it expire first.
    Reject,
}

/// Mailbox limits and lifecycle policy (`[limits]` in config.toml).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Mailbox TTL in seconds.
    pub ttl_secs: u64,
    /// Inbox cap; oldest messages are evicted first past this.
    pub max_inbox_size: u32,
    /// Second-create policy. Default: replace (the historical behavior).
    pub on_existing: OnExisting,
    /// Days a deactivated mailbox is retained before hard deletion. This is
    /// also the window over which address uniqueness is guaranteed.
    pub retention_days: u32,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            ttl_secs: DEFAULT_TTL_SECS,
            max_inbox_size: DEFAULT_MAX_INBOX,
            on_existing: OnExisting::Replace,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

// ─── EngineConfig ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Data directory for the SQLite database.
    pub data_dir: PathBuf,
    /// Log filter (trace, debug, info, warn, error).
    pub log: String,
    /// Log output format: "pretty" (default) | "json".
    pub log_format: String,
    pub imap: ImapConfig,
    pub addresses: AddressConfig,
    pub polling: PollingConfig,
    pub limits: LimitsConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            log: "info".to_string(),
            log_format: "pretty".to_string(),
            imap: ImapConfig::default(),
            addresses: AddressConfig::default(),
            polling: PollingConfig::default(),
            limits: LimitsConfig::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration: TOML file (if present) overlaid with CLI/env
    /// overrides.
    pub fn load(
        config_path: Option<&Path>,
        data_dir: Option<PathBuf>,
        log: Option<String>,
    ) -> Self {
        let mut config = match config_path {
            Some(path) => load_toml(path).unwrap_or_default(),
            None => {
                // No explicit path — look inside the (possibly overridden)
                // data dir.
                let dir = data_dir
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR));
                load_toml(&dir.join("config.toml")).unwrap_or_default()
            }
        };

        if let Some(dir) = data_dir {
            config.data_dir = dir;
        }
        if let Some(level) = log {
            config.log = level;
        }
        config
    }

    /// Reject configurations the engine cannot run with. Called once at
    /// startup, before any connection attempt.
    pub fn validate(&self) -> Result<(), String> {
        let mut errors = Vec::new();

        if self.addresses.domain.trim().is_empty() {
            errors.push("addresses.domain is not set");
        }
        if self.addresses.prefix_len == 0 || self.addresses.suffix_len == 0 {
            errors.push("addresses.prefix_len and suffix_len must be non-zero");
        }
        if self.addresses.alphabet.is_empty() {
            errors.push("addresses.alphabet must not be empty");
        }
        if self.imap.host.trim().is_empty()
            || self.imap.username.trim().is_empty()
            || self.imap.password.is_empty()
        {
            errors.push("imap host/username/password are not fully configured");
        }
        if self.limits.max_inbox_size == 0 {
            errors.push("limits.max_inbox_size must be at least 1");
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

fn load_toml(path: &Path) -> Option<EngineConfig> {
    let contents = std::fs::read_to_string(path).ok()?;
    match toml::from_str::<EngineConfig>(&contents) {
        Ok(c) => Some(c),
        Err(e) => {
            error!(path = %path.display(), err = %e, "failed to parse config.toml — using defaults");
            None
        }
    }
}
