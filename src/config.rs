//! Configuration for elevatr-sync

use anyhow::{Context, Result};
use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Full configuration: the document store server plus the client-side tiers
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub tokens: Vec<TokenConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind address
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite document store served by `serve`
    #[serde(default = "default_db_path")]
    pub path: PathBuf,
}

/// Local tiers of a client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Embedded cache holding guest snapshots, cached users and the sync queue
    #[serde(default = "default_cache_path")]
    pub cache_path: PathBuf,

    /// Flat key/value store for the fully-local mode
    #[serde(default = "default_local_storage_path")]
    pub local_storage_path: PathBuf,
}

/// Where a client finds the remote document store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    #[serde(default = "default_remote_url")]
    pub url: String,

    #[serde(default)]
    pub token: String,

    /// Per-request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Attempts before a queued write is dropped
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Wait `backoff_base_secs * 2^(attempts - 1)` between attempts
    #[serde(default)]
    pub exponential_backoff: bool,

    #[serde(default = "default_backoff_base")]
    pub backoff_base_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Upper bound for the remote calls of a sign-in transition
    #[serde(default = "default_auth_timeout")]
    pub auth_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenConfig {
    /// Human-readable name for the token
    pub name: String,
    /// The hashed API token (argon2 hash)
    pub token_hash: String,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    3040
}

fn default_db_path() -> PathBuf {
    PathBuf::from("elevatr-documents.sqlite")
}

fn default_cache_path() -> PathBuf {
    PathBuf::from("elevatr-cache.sqlite")
}

fn default_local_storage_path() -> PathBuf {
    PathBuf::from("elevatr-local.sqlite")
}

fn default_remote_url() -> String {
    "http://127.0.0.1:3040".to_string()
}

fn default_request_timeout() -> u64 {
    10
}

fn default_max_retries() -> u32 {
    5
}

fn default_backoff_base() -> u64 {
    2
}

fn default_auth_timeout() -> u64 {
    15
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            cache_path: default_cache_path(),
            local_storage_path: default_local_storage_path(),
        }
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            url: default_remote_url(),
            token: String::new(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            exponential_backoff: false,
            backoff_base_secs: default_backoff_base(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            auth_timeout_secs: default_auth_timeout(),
        }
    }
}

impl RemoteConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

impl SyncConfig {
    /// Delay before the next attempt of an item that already failed `attempts` times
    pub fn backoff_delay(&self, attempts: u32) -> Duration {
        if !self.exponential_backoff || attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 2u64.saturating_pow(attempts - 1);
        Duration::from_secs(self.backoff_base_secs.saturating_mul(factor))
    }
}

impl SessionConfig {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_secs)
    }
}

impl Config {
    /// Default config path
    pub fn default_path() -> Result<PathBuf> {
        // Check environment variable first
        if let Ok(env_path) = std::env::var("ELEVATR_SYNC_CONFIG") {
            return Ok(PathBuf::from(env_path));
        }

        // Check for config in current directory
        let local = PathBuf::from("config.toml");
        if local.exists() {
            return Ok(local);
        }

        // Check /data/config.toml (Docker default)
        let data_config = PathBuf::from("/data/config.toml");
        if data_config.exists() {
            return Ok(data_config);
        }

        // Then check XDG config
        let config_dir = dirs::config_dir()
            .context("Could not determine config directory")?
            .join("elevatr-sync");

        Ok(config_dir.join("config.toml"))
    }

    /// Load config from default path
    pub fn load() -> Result<Self> {
        let path = Self::default_path()?;
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    /// Load config from specific path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).context("Failed to read config file")?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save config to specific path
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let content = toml::to_string_pretty(self).context("Failed to serialize config")?;

        let with_comments = format!(
            "# elevatr-sync configuration\n\n\
             {}\n\n\
             # Add tokens with: elevatr-sync token --name <device-name>\n",
            content
        );

        std::fs::write(path, with_comments).context("Failed to write config file")?;

        Ok(())
    }

    /// Check a bearer token against the configured argon2 hashes
    pub fn validate_token(&self, token: &str) -> bool {
        let argon2 = Argon2::default();

        self.tokens.iter().any(|t| {
            PasswordHash::new(&t.token_hash)
                .map(|parsed| argon2.verify_password(token.as_bytes(), &parsed).is_ok())
                .unwrap_or(false)
        })
    }
}

/// Hash a token using argon2
pub fn hash_token(token: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(token.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("Failed to hash token: {}", e))?;
    Ok(hash.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_sync_policy() {
        let cfg = Config::default();
        assert_eq!(cfg.sync.max_retries, 5);
        assert!(!cfg.sync.exponential_backoff);
        assert_eq!(cfg.session.auth_timeout(), Duration::from_secs(15));
    }

    #[test]
    fn partial_file_fills_defaults() {
        let cfg: Config = toml::from_str(
            r#"
            [sync]
            exponential_backoff = true
            "#,
        )
        .unwrap();
        assert!(cfg.sync.exponential_backoff);
        assert_eq!(cfg.sync.max_retries, 5);
        assert_eq!(cfg.server.port, 3040);
    }

    #[test]
    fn backoff_doubles_when_enabled() {
        let mut sync = SyncConfig::default();
        assert_eq!(sync.backoff_delay(3), Duration::ZERO);

        sync.exponential_backoff = true;
        assert_eq!(sync.backoff_delay(0), Duration::ZERO);
        assert_eq!(sync.backoff_delay(1), Duration::from_secs(2));
        assert_eq!(sync.backoff_delay(3), Duration::from_secs(8));
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut cfg = Config::default();
        cfg.session.auth_timeout_secs = 30;
        cfg.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.session.auth_timeout_secs, 30);
    }

    #[test]
    fn hashed_tokens_validate() {
        let mut cfg = Config::default();
        cfg.tokens.push(TokenConfig {
            name: "laptop".into(),
            token_hash: hash_token("els_secret").unwrap(),
        });

        assert!(cfg.validate_token("els_secret"));
        assert!(!cfg.validate_token("els_wrong"));
    }
}
