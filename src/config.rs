//! Configuration for spotgate.
//!
//! Settings come from a TOML file (`--config <PATH>`, else
//! `~/.spotgate/config.toml`), then environment overrides for the bridge,
//! then command line flags. Every section falls back to built-in defaults.
//!
//! ```toml
//! log_level = "info"
//!
//! [server]
//! port = 7300
//!
//! [program]
//! command = "/spider/perl/console.pl"
//! cwd = "/spider/perl"
//!
//! [normalizer]
//! prompt_literal = "dxspider >"
//!
//! [bridge]
//! callsign = "POTA-2"
//! check_interval_secs = 60
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Default log filter when RUST_LOG is unset
    pub log_level: String,
    /// Append logs here instead of stderr
    pub log_file: Option<PathBuf>,
    pub server: ServerConfig,
    pub program: ProgramConfig,
    pub normalizer: NormalizerConfig,
    pub bridge: BridgeConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            log_file: None,
            server: ServerConfig::default(),
            program: ProgramConfig::default(),
            normalizer: NormalizerConfig::default(),
            bridge: BridgeConfig::default(),
        }
    }
}

/// Client-facing listener
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub port: u16,
    pub login_prompt: String,
    pub login_timeout_secs: u64,
    pub max_callsign_len: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0".to_string(),
            port: 7300,
            login_prompt: "login: ".to_string(),
            login_timeout_secs: 30,
            max_callsign_len: 20,
        }
    }
}

impl ServerConfig {
    pub fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.login_timeout_secs)
    }
}

/// The console program each session runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgramConfig {
    /// Executable; the callsign is appended after `args`
    pub command: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// TERM exported to the program
    pub term: String,
    pub poll_interval_ms: u64,
    pub read_chunk: usize,
    pub kill_grace_secs: u64,
}

impl Default for ProgramConfig {
    fn default() -> Self {
        Self {
            command: "/spider/perl/console.pl".to_string(),
            args: Vec::new(),
            cwd: Some(PathBuf::from("/spider/perl")),
            term: "vt100".to_string(),
            poll_interval_ms: 100,
            read_chunk: 4096,
            kill_grace_secs: 2,
        }
    }
}

impl ProgramConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }
}

/// Output cleanup rules
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NormalizerConfig {
    /// Written after every completed line
    pub line_ending: String,
    /// Literal that starts a live announcement
    pub announcement_prefix: String,
    /// Session prompt; text glued after it starts a new line
    pub prompt_literal: String,
    /// Banner endings; text glued after them starts a new line
    pub banner_fragments: Vec<String>,
    /// Leaked sequence residue removed from line ends
    pub artifact_literals: Vec<String>,
    /// Drop bulk listing rows instead of reformatting them
    pub suppress_listings: bool,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            line_ending: "\r\n".to_string(),
            announcement_prefix: "DX de ".to_string(),
            prompt_literal: "dxspider >".to_string(),
            banner_fragments: vec!["running DXSpider".to_string()],
            artifact_literals: vec!["[K".to_string()],
            suppress_listings: true,
        }
    }
}

/// Activation-spot bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub api_url: String,
    pub cluster_host: String,
    pub cluster_port: u16,
    /// Login used on the cluster
    pub callsign: String,
    pub check_interval_secs: u64,
    pub min_freq_mhz: f64,
    pub max_freq_mhz: f64,
    pub max_seen: usize,
    pub connect_retries: u32,
    pub retry_delay_secs: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.pota.app/spot/activator".to_string(),
            cluster_host: "localhost".to_string(),
            cluster_port: 7300,
            callsign: "POTA-2".to_string(),
            check_interval_secs: 60,
            min_freq_mhz: 1.8,
            max_freq_mhz: 54.0,
            max_seen: 1000,
            connect_retries: 5,
            retry_delay_secs: 5,
        }
    }
}

impl BridgeConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_secs(self.retry_delay_secs)
    }

    /// Apply overrides from an environment lookup
    pub fn apply_env<F>(&mut self, var: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(call) = var("CALLSIGN") {
            self.callsign = call;
        }
        if let Some(host) = var("CLUSTER_HOST") {
            self.cluster_host = host;
        }
        override_parsed(&var, "CLUSTER_PORT", &mut self.cluster_port);
        override_parsed(&var, "CHECK_INTERVAL", &mut self.check_interval_secs);
        override_parsed(&var, "MIN_FREQ", &mut self.min_freq_mhz);
        override_parsed(&var, "MAX_FREQ", &mut self.max_freq_mhz);
    }
}

fn override_parsed<F, T>(var: &F, name: &str, slot: &mut T)
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = var(name) {
        match raw.trim().parse() {
            Ok(value) => *slot = value,
            Err(_) => warn!("Ignoring malformed {}={:?}", name, raw),
        }
    }
}

impl Config {
    /// Load configuration from the default location, falling back to defaults
    pub fn load() -> Self {
        if let Some(path) = Self::get_config_path() {
            if path.exists() {
                match Self::load_from(&path) {
                    Ok(config) => return config,
                    Err(e) => warn!("{}; using defaults", e),
                }
            }
        }
        Self::default()
    }

    /// Load configuration from an explicit file
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Apply process environment overrides
    pub fn apply_env(&mut self) {
        self.bridge.apply_env(|name| std::env::var(name).ok());
    }

    /// Get config file path
    fn get_config_path() -> Option<PathBuf> {
        home_dir().map(|home| home.join(".spotgate").join("config.toml"))
    }
}

// Get home directory
fn home_dir() -> Option<PathBuf> {
    std::env::var_os("HOME")
        .or_else(|| std::env::var_os("USERPROFILE"))
        .map(PathBuf::from)
}
