//! Load directory server config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;

/// Daemon configuration. File: ~/.config/pigeon/directory.toml or
/// /etc/pigeon/directory.toml. Env overrides: PIGEON_DIRECTORY_HOST,
/// PIGEON_DIRECTORY_PORT, PIGEON_DIRECTORY_DATA_DIR.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Listen host (default 0.0.0.0).
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port (default 5000).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Directory for the registry snapshot and event logs (default directory_data).
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    5000
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("directory_data")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: default_data_dir(),
        }
    }
}

impl Config {
    /// Path of the registry snapshot file.
    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir.join("registry.json")
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    if let Ok(s) = std::env::var("PIGEON_DIRECTORY_HOST") {
        if !s.is_empty() {
            c.host = s;
        }
    }
    if let Ok(s) = std::env::var("PIGEON_DIRECTORY_PORT") {
        if let Ok(p) = s.parse::<u16>() {
            c.port = p;
        }
    }
    if let Ok(s) = std::env::var("PIGEON_DIRECTORY_DATA_DIR") {
        if !s.is_empty() {
            c.data_dir = PathBuf::from(s);
        }
    }
    c
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/pigeon/directory.toml"));
    }
    out.push(PathBuf::from("/etc/pigeon/directory.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            if let Ok(s) = std::fs::read_to_string(&p) {
                if let Ok(c) = toml::from_str::<Config>(&s) {
                    return Some(c);
                }
            }
            break;
        }
    }
    None
}
