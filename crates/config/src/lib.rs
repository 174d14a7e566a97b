//! Layered configuration for drivefs.
//!
//! Sources, later ones overriding earlier ones:
//! 1. Built-in defaults.
//! 2. `drivefs.{toml,yaml,json}` in the platform config directory.
//! 3. An explicitly given file (format picked by extension).
//! 4. `DRIVEFS_`-prefixed environment variables, e.g. `DRIVEFS_CACHE_ROOT`.
//!
//! Configuration is read once at startup.

pub mod error;

use crate::error::{ErrorKind, Result};
use directories::ProjectDirs;
use exn::ResultExt;
use figment::Figment;
use figment::providers::{Env, Format, Json, Serialized, Toml, Yaml};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const APPLICATION: &str = "drivefs";
const ENV_PREFIX: &str = "DRIVEFS_";
const DEFAULT_MIN_FREE_SPACE: u64 = 512 * 1024 * 1024;
const DEFAULT_SEARCH_MAX_RESULTS: usize = 10;

#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Config {
    /// Root directory of the content cache. The metadata databases live in
    /// its `meta` partition.
    pub cache_root: PathBuf,
    /// Bytes that must stay free on the cache's file system.
    pub min_free_space: u64,
    /// Results returned by a search unless asked otherwise.
    pub search_max_results: usize,
}

impl Default for Config {
    fn default() -> Self {
        let cache_root = project_dirs()
            .map(|dirs| dirs.cache_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".drivefs"));
        Self { cache_root, min_free_space: DEFAULT_MIN_FREE_SPACE, search_max_results: DEFAULT_SEARCH_MAX_RESULTS }
    }
}

impl Config {
    /// Load from every source, see the module documentation.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));
        if let Some(dirs) = project_dirs() {
            let dir = dirs.config_dir();
            figment = figment
                .merge(Toml::file(dir.join("drivefs.toml")))
                .merge(Yaml::file(dir.join("drivefs.yaml")))
                .merge(Json::file(dir.join("drivefs.json")));
        }
        if let Some(path) = explicit {
            figment = merge_file(figment, path)?;
        }
        Self::from_figment(figment.merge(Env::prefixed(ENV_PREFIX)))
    }

    /// Extract and validate a configuration from an assembled figment.
    pub fn from_figment(figment: Figment) -> Result<Self> {
        let config: Config = figment.extract().or_raise(|| ErrorKind::Load)?;
        config.validate()?;
        tracing::debug!(cache_root = %config.cache_root.display(), "Loaded configuration");
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.cache_root.as_os_str().is_empty() {
            exn::bail!(ErrorKind::Invalid("cache_root must not be empty"));
        }
        if self.search_max_results == 0 {
            exn::bail!(ErrorKind::Invalid("search_max_results must be at least 1"));
        }
        Ok(())
    }
}

fn project_dirs() -> Option<ProjectDirs> {
    ProjectDirs::from("", "", APPLICATION)
}

fn merge_file(figment: Figment, path: &Path) -> Result<Figment> {
    if !path.is_file() {
        exn::bail!(ErrorKind::Invalid("configuration file does not exist"));
    }
    let extension = path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase);
    Ok(match extension.as_deref() {
        Some("toml") => figment.merge(Toml::file_exact(path)),
        Some("yaml" | "yml") => figment.merge(Yaml::file_exact(path)),
        Some("json") => figment.merge(Json::file_exact(path)),
        _ => exn::bail!(ErrorKind::Invalid("configuration file must be .toml, .yaml or .json")),
    })
}
