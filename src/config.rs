use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::{fs, io};

use crate::hash::HashAlgorithm;

/// Persistent downloader configuration. Fields are optional so that
/// unspecified values can fall back to command line flags or code defaults.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct Config {
    pub destination: Option<PathBuf>,
    /// Comma separated protocol tags, e.g. `S3,HTTP,FTP`
    pub endpoint_priority: Option<String>,
    pub block_size: Option<usize>,
    pub retries: Option<u32>,
    pub max_concurrent_downloads: Option<usize>,
    pub checksum_algorithm: Option<HashAlgorithm>,
    pub disable_validation: Option<bool>,
    /// connect timeout in seconds (can be fractional)
    pub connect_timeout_secs: Option<f64>,
    /// seconds without data after which a stream counts as stalled
    pub read_timeout_secs: Option<f64>,
    /// Path-style S3 endpoint used instead of `<bucket>.s3.amazonaws.com`
    pub s3_endpoint: Option<String>,
    pub gcs_endpoint: Option<String>,
    pub ascp_path: Option<PathBuf>,
    pub ascp_rate_limit: Option<String>,
    pub ascp_keyfile: Option<PathBuf>,
    pub aspera_user: Option<String>,
}

impl Config {
    /// `<config_dir>/mdl`, if the platform has a config directory.
    pub fn default_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("mdl"))
    }

    /// Path to the config file inside the provided dir.
    pub fn config_path_for_dir<P: AsRef<Path>>(config_dir: P) -> PathBuf {
        let mut p = config_dir.as_ref().to_path_buf();
        p.push("config.toml");
        p
    }

    /// Load configuration from the given directory's `config.toml`.
    /// If file does not exist, returns Ok(Default::default()).
    pub fn load_from_dir<P: AsRef<Path>>(config_dir: P) -> Result<Config, io::Error> {
        let path = Config::config_path_for_dir(config_dir);
        if !path.exists() {
            return Ok(Config::default());
        }
        let s = fs::read_to_string(&path)?;
        let cfg: Config =
            toml::from_str(&s).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        Ok(cfg)
    }

    /// Loads from [`Config::default_dir`], or defaults when there is none.
    pub fn load_default() -> Result<Config, io::Error> {
        match Config::default_dir() {
            Some(dir) => Config::load_from_dir(dir),
            None => Ok(Config::default()),
        }
    }

    /// Save configuration to `config_dir/config.toml`. Creates parent dir if needed.
    pub fn save_to_dir<P: AsRef<Path>>(&self, config_dir: P) -> Result<(), io::Error> {
        let cfg_path = Config::config_path_for_dir(config_dir);
        if let Some(p) = cfg_path.parent() {
            fs::create_dir_all(p)?;
        }
        let s = toml::to_string_pretty(&self).map_err(io::Error::other)?;
        fs::write(cfg_path, s)?;
        Ok(())
    }
}
