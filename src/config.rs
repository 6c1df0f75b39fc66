use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{
    error::{ArchiveError, Result},
    mapper::PrefixMap,
    pipeline,
};

pub const DEFAULT_ETCD_ENDPOINT: &str = "http://localhost:4001";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub etcd_endpoint: String,
    pub archive_path: PathBuf,
    pub window: u64,
    #[serde(default = "PrefixMap::cluster_defaults")]
    pub prefixes: PrefixMap,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            etcd_endpoint: DEFAULT_ETCD_ENDPOINT.to_string(),
            archive_path: default_archive_path(),
            window: pipeline::DEFAULT_WINDOW,
            prefixes: PrefixMap::cluster_defaults(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ConfigUpdate {
    pub etcd_endpoint: Option<String>,
    pub archive_path: Option<PathBuf>,
    pub window: Option<u64>,
}

pub fn default_config_path() -> Result<PathBuf> {
    let mut path = env::current_dir().map_err(|err| ArchiveError::Config(err.to_string()))?;
    path.push(".etcd-archive");
    path.push("config.toml");
    Ok(path)
}

fn default_archive_path() -> PathBuf {
    PathBuf::from(".etcd-archive").join("archive.db")
}

pub fn load_or_default(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let config_path = if let Some(path) = path {
        path
    } else {
        default_config_path()?
    };

    if config_path.exists() {
        let contents = fs::read_to_string(&config_path)?;
        let cfg: Config = toml::from_str(&contents)?;
        Ok((cfg, config_path))
    } else {
        let cfg = Config::default();
        cfg.save(&config_path)?;
        Ok((cfg, config_path))
    }
}

impl Config {
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let contents = toml::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    pub fn apply_update(&mut self, update: ConfigUpdate) {
        if let Some(endpoint) = update.etcd_endpoint {
            self.etcd_endpoint = endpoint;
        }
        if let Some(path) = update.archive_path {
            self.archive_path = path;
        }
        if let Some(window) = update.window {
            self.window = window;
        }
    }
}
