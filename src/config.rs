//! Server configuration (C1).
//!
//! Typed key/value settings persisted as a JSON file named `config` in the
//! data directory. Getters take a brief read lock; setters write through and
//! are persisted explicitly via `save` (the `CONFIG REWRITE` path) or
//! implicitly by the commands that mutate them.
//!
//! Properties exposed through `CONFIG GET`/`CONFIG SET`:
//! `requirepass`, `leaderauth`, `protected-mode`, `maxmemory`, `autogc`,
//! `keepalive`. The follow target and read-only flag are persisted in the
//! same file but are driven by the `FOLLOW` and `READONLY` commands.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use thiserror::Error;

/// The set of property names accepted by `CONFIG GET`/`CONFIG SET`.
pub const PROPERTIES: &[&str] = &[
    "requirepass",
    "leaderauth",
    "protected-mode",
    "maxmemory",
    "autogc",
    "keepalive",
];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Unsupported CONFIG parameter: {0}")]
    UnknownProperty(String),

    #[error("Invalid argument '{0}'")]
    InvalidValue(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("config file is corrupt: {0}")]
    Corrupt(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ConfigData {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    requirepass: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    leaderauth: String,

    #[serde(rename = "protected-mode", default, skip_serializing_if = "String::is_empty")]
    protected_mode: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    maxmemory: String,

    #[serde(default, skip_serializing_if = "is_zero")]
    autogc: u64,

    #[serde(default, skip_serializing_if = "is_zero")]
    keepalive: u64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    appendonly: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    follow_host: String,

    #[serde(default, skip_serializing_if = "is_zero")]
    follow_port: u64,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    follow_id: String,

    #[serde(default, skip_serializing_if = "is_zero")]
    follow_pos: u64,

    #[serde(rename = "read-only", default, skip_serializing_if = "std::ops::Not::not")]
    read_only: bool,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

/// The live configuration store.
#[derive(Debug)]
pub struct Config {
    path: PathBuf,
    data: RwLock<ConfigData>,
}

impl Config {
    /// Loads the config file from the data directory, or starts from
    /// defaults when the file does not exist yet.
    pub fn load(dir: &Path) -> Result<Config, ConfigError> {
        let path = dir.join("config");
        let data = match std::fs::read_to_string(&path) {
            Ok(body) => serde_json::from_str(&body)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => ConfigData::default(),
            Err(e) => return Err(e.into()),
        };
        Ok(Config {
            path,
            data: RwLock::new(data),
        })
    }

    /// Persists the current settings to disk.
    pub fn save(&self) -> Result<(), ConfigError> {
        let body = {
            let data = self.data.read().unwrap();
            serde_json::to_string_pretty(&*data)?
        };
        std::fs::write(&self.path, body)?;
        Ok(())
    }

    pub fn require_pass(&self) -> String {
        self.data.read().unwrap().requirepass.clone()
    }

    pub fn leader_auth(&self) -> String {
        self.data.read().unwrap().leaderauth.clone()
    }

    /// `yes` unless explicitly disabled.
    pub fn protected_mode(&self) -> String {
        let v = self.data.read().unwrap().protected_mode.clone();
        if v.is_empty() {
            "yes".to_string()
        } else {
            v
        }
    }

    /// The memory ceiling in bytes; 0 means unlimited.
    pub fn max_memory(&self) -> u64 {
        parse_mem_size(&self.data.read().unwrap().maxmemory).unwrap_or(0)
    }

    pub fn auto_gc(&self) -> u64 {
        self.data.read().unwrap().autogc
    }

    pub fn keepalive(&self) -> u64 {
        self.data.read().unwrap().keepalive
    }

    pub fn append_only(&self) -> bool {
        self.data.read().unwrap().appendonly != "no"
    }

    pub fn set_append_only(&self, yes: bool) {
        self.data.write().unwrap().appendonly = if yes { "yes" } else { "no" }.to_string();
    }

    pub fn follow_host(&self) -> String {
        self.data.read().unwrap().follow_host.clone()
    }

    pub fn follow_port(&self) -> u64 {
        self.data.read().unwrap().follow_port
    }

    pub fn set_follow(&self, host: &str, port: u64) {
        let mut data = self.data.write().unwrap();
        data.follow_host = host.to_string();
        data.follow_port = port;
    }

    pub fn follow_pos(&self) -> u64 {
        self.data.read().unwrap().follow_pos
    }

    pub fn set_follow_pos(&self, pos: u64) {
        self.data.write().unwrap().follow_pos = pos;
    }

    pub fn read_only(&self) -> bool {
        self.data.read().unwrap().read_only
    }

    pub fn set_read_only(&self, yes: bool) {
        self.data.write().unwrap().read_only = yes;
    }

    /// Reads one `CONFIG GET`-visible property as a string.
    pub fn get_property(&self, name: &str) -> Option<String> {
        let data = self.data.read().unwrap();
        match name {
            "requirepass" => Some(data.requirepass.clone()),
            "leaderauth" => Some(data.leaderauth.clone()),
            "protected-mode" => Some(if data.protected_mode.is_empty() {
                "yes".to_string()
            } else {
                data.protected_mode.clone()
            }),
            "maxmemory" => Some(data.maxmemory.clone()),
            "autogc" => Some(if data.autogc == 0 {
                String::new()
            } else {
                data.autogc.to_string()
            }),
            "keepalive" => Some(if data.keepalive == 0 {
                String::new()
            } else {
                data.keepalive.to_string()
            }),
            _ => None,
        }
    }

    /// Sets one property from its string form, validating per property.
    pub fn set_property(&self, name: &str, value: &str) -> Result<(), ConfigError> {
        let mut data = self.data.write().unwrap();
        match name {
            "requirepass" => data.requirepass = value.to_string(),
            "leaderauth" => data.leaderauth = value.to_string(),
            "protected-mode" => match value {
                "" | "yes" | "no" => data.protected_mode = value.to_string(),
                other => return Err(ConfigError::InvalidValue(other.to_string())),
            },
            "maxmemory" => {
                if !value.is_empty() {
                    parse_mem_size(value)
                        .ok_or_else(|| ConfigError::InvalidValue(value.to_string()))?;
                }
                data.maxmemory = value.to_string();
            }
            "autogc" => {
                data.autogc = if value.is_empty() {
                    0
                } else {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue(value.to_string()))?
                }
            }
            "keepalive" => {
                data.keepalive = if value.is_empty() {
                    0
                } else {
                    value
                        .parse()
                        .map_err(|_| ConfigError::InvalidValue(value.to_string()))?
                }
            }
            other => return Err(ConfigError::UnknownProperty(other.to_string())),
        }
        Ok(())
    }
}

/// Parses a memory size: plain bytes or a `kb`/`mb`/`gb` suffix.
fn parse_mem_size(s: &str) -> Option<u64> {
    if s.is_empty() {
        return Some(0);
    }
    let lower = s.trim().to_ascii_lowercase();
    let (num, mult) = if let Some(stripped) = lower.strip_suffix("kb") {
        (stripped, 1024)
    } else if let Some(stripped) = lower.strip_suffix("mb") {
        (stripped, 1024 * 1024)
    } else if let Some(stripped) = lower.strip_suffix("gb") {
        (stripped, 1024 * 1024 * 1024)
    } else {
        (lower.as_str(), 1)
    };
    num.trim().parse::<u64>().ok().map(|n| n * mult)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.require_pass(), "");
        assert_eq!(config.protected_mode(), "yes");
        assert_eq!(config.max_memory(), 0);
        assert!(config.append_only());
        assert!(!config.read_only());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path()).unwrap();
        config.set_property("requirepass", "secret").unwrap();
        config.set_property("maxmemory", "100mb").unwrap();
        config.set_follow("10.0.0.1", 9851);
        config.set_read_only(true);
        config.save().unwrap();

        let again = Config::load(dir.path()).unwrap();
        assert_eq!(again.require_pass(), "secret");
        assert_eq!(again.max_memory(), 100 * 1024 * 1024);
        assert_eq!(again.follow_host(), "10.0.0.1");
        assert_eq!(again.follow_port(), 9851);
        assert!(again.read_only());
    }

    #[test]
    fn test_set_property_validation() {
        let dir = TempDir::new().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert!(config.set_property("protected-mode", "maybe").is_err());
        assert!(config.set_property("maxmemory", "lots").is_err());
        assert!(config.set_property("autogc", "nope").is_err());
        assert!(config.set_property("nonsense", "1").is_err());
    }

    #[test]
    fn test_parse_mem_size() {
        assert_eq!(parse_mem_size("1024"), Some(1024));
        assert_eq!(parse_mem_size("1kb"), Some(1024));
        assert_eq!(parse_mem_size("100mb"), Some(100 * 1024 * 1024));
        assert_eq!(parse_mem_size("2gb"), Some(2 * 1024 * 1024 * 1024));
        assert_eq!(parse_mem_size(""), Some(0));
        assert_eq!(parse_mem_size("abc"), None);
    }
}
