//! Admin configuration.
//!
//! Stored as TOML at `~/.config/resumable/admin.toml` unless `--config`
//! names another file. Engine tunables sit at the top level next to
//! `work_dir`:
//!
//! ```toml
//! work_dir = "/srv/uploads"
//! log_level = "debug"
//! buffer_size = 131072
//! sync_writes = false
//! ```

use std::path::{Path, PathBuf};

use resumable_engine::EngineOptions;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Work directory holding the session index and staged chunks.
    #[serde(default = "default_work_dir")]
    pub work_dir: PathBuf,

    /// Log filter used when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(flatten)]
    pub engine: EngineOptions,
}

fn home() -> PathBuf {
    PathBuf::from(std::env::var("HOME").unwrap_or_else(|_| "/tmp".into()))
}

fn default_work_dir() -> PathBuf {
    home().join(".local").join("share").join("resumable")
}

fn default_log_level() -> String {
    "info".into()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            work_dir: default_work_dir(),
            log_level: default_log_level(),
            engine: EngineOptions::default(),
        }
    }
}

impl Config {
    /// Loads `path`, or the default location when `None`. A missing file
    /// yields the defaults.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let path = path.map_or_else(config_path, Path::to_path_buf);
        Self::load_from(&path)
    }

    fn load_from(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Config::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        Ok(config)
    }
}

/// Default configuration file path.
fn config_path() -> PathBuf {
    home().join(".config").join("resumable").join("admin.toml")
}
