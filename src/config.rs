//! Process configuration, loaded from TOML with per-field defaults.
//!
//! Mirrors the load-with-fallback pattern the admin surface would otherwise
//! drive (out of scope here, see spec §1): a missing or unparseable file
//! yields `Config::default()` rather than failing startup.

use serde::Deserialize;
use std::fs;
use std::path::PathBuf;

const DEFAULT_CONFIG_PATH: &str = "/etc/priskv/priskv.toml";
const ENV_CONFIG_PATH: &str = "PRISKV_CONFIG";

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub arena: ArenaConfig,
    #[serde(default)]
    pub threadpool: ThreadPoolConfig,
    #[serde(default)]
    pub tiering: TieringConfig,
    #[serde(default)]
    pub acl: AclConfig,
    #[serde(default)]
    pub expiry: ExpiryConfig,
}

impl Config {
    /// Load configuration from file. The path can be overridden with the
    /// `PRISKV_CONFIG` environment variable. If the file is missing or
    /// fails to parse, defaults are returned.
    pub fn load() -> Self {
        let path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        let path = PathBuf::from(path);
        match fs::read_to_string(&path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_default(),
            Err(_) => Config::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ArenaConfig {
    #[serde(default = "default_arena_path")]
    pub path: String,
    #[serde(default = "default_max_key_length")]
    pub max_key_length: u16,
    #[serde(default = "default_max_keys")]
    pub max_keys: u32,
    #[serde(default = "default_value_block_size")]
    pub value_block_size: u32,
    #[serde(default = "default_value_blocks")]
    pub value_blocks: u64,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            path: default_arena_path(),
            max_key_length: default_max_key_length(),
            max_keys: default_max_keys(),
            value_block_size: default_value_block_size(),
            value_blocks: default_value_blocks(),
        }
    }
}

fn default_arena_path() -> String {
    String::new()
}
fn default_max_key_length() -> u16 {
    128
}
fn default_max_keys() -> u32 {
    16 * 1024
}
fn default_value_block_size() -> u32 {
    4096
}
fn default_value_blocks() -> u64 {
    1024 * 1024
}

/// Hard caps a loaded `ArenaConfig` must respect (§3.1 of SPEC_FULL.md).
pub const MAX_KEY_LENGTH_CAP: u16 = 1024;
pub const MAX_KEYS_CAP: u32 = 1 << 30;
pub const VALUE_BLOCK_SIZE_CAP: u32 = 1 << 20;
pub const VALUE_BLOCKS_CAP: u64 = 1 << 30;

impl ArenaConfig {
    /// Validate sizing parameters against the hard caps and the
    /// power-of-two invariant (§4.1).
    pub fn validate(&self) -> Result<(), crate::error::EngineError> {
        use crate::error::EngineError;

        if self.max_key_length == 0 || self.max_key_length > MAX_KEY_LENGTH_CAP {
            return Err(EngineError::Config(format!(
                "max_key_length {} out of range (1..={})",
                self.max_key_length, MAX_KEY_LENGTH_CAP
            )));
        }
        if !self.max_keys.is_power_of_two() || self.max_keys > MAX_KEYS_CAP {
            return Err(EngineError::Config(format!(
                "max_keys {} must be a power of two and <= {}",
                self.max_keys, MAX_KEYS_CAP
            )));
        }
        if !self.value_block_size.is_power_of_two() || self.value_block_size > VALUE_BLOCK_SIZE_CAP
        {
            return Err(EngineError::Config(format!(
                "value_block_size {} must be a power of two and <= {}",
                self.value_block_size, VALUE_BLOCK_SIZE_CAP
            )));
        }
        if !self.value_blocks.is_power_of_two() || self.value_blocks > VALUE_BLOCKS_CAP {
            return Err(EngineError::Config(format!(
                "value_blocks {} must be a power of two and <= {}",
                self.value_blocks, VALUE_BLOCKS_CAP
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ThreadPoolConfig {
    #[serde(default = "default_n_io_threads")]
    pub n_io_threads: usize,
    #[serde(default = "default_n_bg_threads")]
    pub n_bg_threads: usize,
    #[serde(default)]
    pub busy_poll: bool,
}

impl Default for ThreadPoolConfig {
    fn default() -> Self {
        Self {
            n_io_threads: default_n_io_threads(),
            n_bg_threads: default_n_bg_threads(),
            busy_poll: false,
        }
    }
}

fn default_n_io_threads() -> usize {
    4
}
fn default_n_bg_threads() -> usize {
    1
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct TieringConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub backend_address: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct AclConfig {
    #[serde(default)]
    pub rules: Vec<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ExpiryConfig {
    #[serde(default = "default_sweep_interval_ms")]
    pub sweep_interval_ms: u64,
    #[serde(default = "default_sweep_batch")]
    pub sweep_batch: usize,
}

impl Default for ExpiryConfig {
    fn default() -> Self {
        Self {
            sweep_interval_ms: default_sweep_interval_ms(),
            sweep_batch: default_sweep_batch(),
        }
    }
}

fn default_sweep_interval_ms() -> u64 {
    1000
}
fn default_sweep_batch() -> usize {
    4096
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_config_defaults() {
        let toml = r#"
[arena]
path = "/dev/hugepages/priskv.arena"
max_key_length = 128
max_keys = 16384
value_block_size = 4096
value_blocks = 1048576
[threadpool]
n_io_threads = 4
n_bg_threads = 1
[tiering]
enabled = false
[acl]
rules = ["10.0.0.0/8"]
"#;
        let cfg: Config = toml::from_str(toml).unwrap();
        assert_eq!(cfg.arena.max_key_length, 128);
        assert_eq!(cfg.arena.max_keys, 16384);
        assert!(cfg.arena.validate().is_ok());
        assert_eq!(cfg.threadpool.n_io_threads, 4);
        assert!(!cfg.tiering.enabled);
        assert_eq!(cfg.acl.rules, vec!["10.0.0.0/8".to_string()]);
        assert_eq!(cfg.expiry.sweep_interval_ms, 1000);
    }

    #[test]
    fn rejects_non_power_of_two() {
        let cfg = ArenaConfig {
            max_keys: 100,
            ..ArenaConfig::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn env_override() {
        use std::io::Write;
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[threadpool]\nn_io_threads = 8").unwrap();
        unsafe {
            std::env::set_var(ENV_CONFIG_PATH, file.path());
        }
        let cfg = Config::load();
        assert_eq!(cfg.threadpool.n_io_threads, 8);
        unsafe {
            std::env::remove_var(ENV_CONFIG_PATH);
        }
    }
}
