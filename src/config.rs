// src/config.rs
use serde::Deserialize;
use std::fs;
use std::io;
use std::path::Path;
use thiserror::Error;

pub const DEFAULT_SETTINGS_PATH: &str = "httpfilter.json";
pub const SETTINGS_ENV: &str = "HTTPFILTER_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("usage: {0} <port> <target-host> <replacement-host> <loopback: true|false>\n  e.g. {0} 80 www.qq.com www.my_host.com false")]
    Usage(String),
    #[error("invalid port {0:?}")]
    InvalidPort(String),
    #[error("failed to read settings: {0}")]
    Io(#[from] io::Error),
    #[error("failed to parse settings: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid settings: {0}")]
    Invalid(&'static str),
}

/// What to match and where to send the client instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetRule {
    pub port: u16,
    pub target_host: String,
    pub replacement_host: String,
    pub include_loopback: bool,
}

impl TargetRule {
    /// Builds the rule from `<port> <target> <replacement> <loopback>`.
    /// `args[0]` is the program name.
    pub fn from_args(args: &[String]) -> Result<Self, ConfigError> {
        let program = args.first().map(String::as_str).unwrap_or("httpfilter");
        if args.len() != 5 {
            return Err(ConfigError::Usage(program.to_string()));
        }

        let port = args[1]
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort(args[1].clone()))?;

        Ok(Self {
            port,
            target_host: args[2].clone(),
            replacement_host: args[3].clone(),
            include_loopback: parse_flag(&args[4]),
        })
    }
}

// Anything starting with "true" in any case enables the flag.
fn parse_flag(value: &str) -> bool {
    value
        .get(..4)
        .map(|prefix| prefix.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub queue_num: u16,
    pub mtu: usize,
    pub ttl: u8,
    pub manage_iptables: bool,
    /// Fixed value for the redirect's `Date` header. Startup time when unset.
    pub date: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            queue_num: 0,
            mtu: 1500,
            ttl: 64,
            manage_iptables: true,
            date: None,
        }
    }
}

impl Settings {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        let settings: Settings = serde_json::from_str(&content)?;
        settings.validate()?;
        Ok(settings)
    }

    /// Loads `path`, falling back to defaults only when the file does not exist.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        match Self::load(path.as_ref()) {
            Err(ConfigError::Io(e)) if e.kind() == io::ErrorKind::NotFound => {
                log::warn!(
                    "Settings file {} not found, using defaults",
                    path.as_ref().display()
                );
                Ok(Settings::default())
            }
            other => other,
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        // 20 byte IPv4 header + 20 byte TCP header
        if self.mtu < 40 {
            return Err(ConfigError::Invalid("mtu must be at least 40"));
        }
        if self.ttl == 0 {
            return Err(ConfigError::Invalid("ttl must be non-zero"));
        }
        Ok(())
    }
}

/// Everything the process needs, built once in `main`.
#[derive(Debug, Clone)]
pub struct Config {
    pub rule: TargetRule,
    pub settings: Settings,
}

impl Config {
    pub fn new(rule: TargetRule, settings: Settings) -> Self {
        Self { rule, settings }
    }
}
