//! Node configuration: defaults, optional TOML file, environment overrides.

use std::path::PathBuf;

use serde::Deserialize;

/// Peer node settings. `port = 0` lets the acceptor pick a free port.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_directory_host")]
    pub directory_host: String,
    #[serde(default = "default_directory_port")]
    pub directory_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    0
}

fn default_directory_host() -> String {
    "127.0.0.1".to_string()
}

fn default_directory_port() -> u16 {
    5000
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("node_data")
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            directory_host: default_directory_host(),
            directory_port: default_directory_port(),
            data_dir: default_data_dir(),
        }
    }
}

impl Config {
    pub fn profile_path(&self, username: &str) -> PathBuf {
        self.data_dir.join(format!("{username}_profile.json"))
    }

    pub fn history_path(&self, username: &str) -> PathBuf {
        self.data_dir.join(format!("{username}_history.json"))
    }

    pub fn contacts_path(&self, username: &str) -> PathBuf {
        self.data_dir.join(format!("{username}_contacts.json"))
    }
}

/// Defaults, then the first config file found, then environment variables.
pub fn load() -> Config {
    let mut cfg = Config::default();

    for path in config_paths() {
        if let Ok(raw) = std::fs::read_to_string(&path) {
            match toml::from_str::<Config>(&raw) {
                Ok(parsed) => {
                    tracing::info!(path = %path.display(), "loaded config file");
                    cfg = parsed;
                    break;
                }
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "ignoring bad config file");
                }
            }
        }
    }

    if let Ok(host) = std::env::var("PIGEON_NODE_HOST") {
        cfg.host = host;
    }
    if let Ok(port) = std::env::var("PIGEON_NODE_PORT") {
        if let Ok(port) = port.parse() {
            cfg.port = port;
        }
    }
    if let Ok(host) = std::env::var("PIGEON_DIRECTORY_HOST") {
        cfg.directory_host = host;
    }
    if let Ok(port) = std::env::var("PIGEON_DIRECTORY_PORT") {
        if let Ok(port) = port.parse() {
            cfg.directory_port = port;
        }
    }
    if let Ok(dir) = std::env::var("PIGEON_NODE_DATA_DIR") {
        cfg.data_dir = PathBuf::from(dir);
    }

    cfg
}

fn config_paths() -> Vec<PathBuf> {
    let mut paths = Vec::new();
    if let Ok(home) = std::env::var("HOME") {
        paths.push(PathBuf::from(home).join(".config/pigeon/node.toml"));
    }
    paths.push(PathBuf::from("/etc/pigeon/node.toml"));
    paths
}
