//! Generic JSON5 config file loader, used for the one ambient,
//! optional piece of configuration the XML benchmark format has no
//! room for: per-user defaults (default cluster-client path, default
//! thread count). See SPEC_FULL.md §11.3.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, bail, Result};
use serde::de::DeserializeOwned;

/// Returns `None` if the file does not exist.
pub fn try_load_json5_file<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match std::fs::read_to_string(path) {
        Ok(s) => Ok(Some(serde_json5::from_str(&s).map_err(|e| {
            anyhow!("decoding JSON5 from config file {path:?}: {e}")
        })?)),
        Err(e) => match e.kind() {
            std::io::ErrorKind::NotFound => Ok(None),
            _ => bail!("loading config file from {path:?}: {e}"),
        },
    }
}

pub trait LoadConfigFile: Default + DeserializeOwned {
    fn default_config_path() -> Result<Option<PathBuf>>;

    /// If `path` is given, the file must exist or an error is
    /// returned. Otherwise, a default location is checked
    /// (`default_config_path`) and loaded if it exists; if it
    /// doesn't, a `Default` instance is generated.
    fn load_config<P: AsRef<Path>>(path: Option<P>) -> Result<Self> {
        if let Some(path) = path {
            let path = path.as_ref();
            try_load_json5_file(path)?
                .ok_or_else(|| anyhow!("file with specified location {path:?} does not exist"))
        } else if let Some(path) = Self::default_config_path()? {
            Ok(try_load_json5_file(&path)?.unwrap_or_else(Self::default))
        } else {
            Ok(Self::default())
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
#[serde(default, deny_unknown_fields)]
pub struct BencheckConfig {
    /// Default path to the cluster-client binary used by the remote
    /// adapter when `--cloud` is given without an explicit path.
    pub cloud_master: Option<String>,
    /// Default worker-thread count when a benchmark XML and the CLI
    /// both leave it unset.
    pub default_num_threads: Option<u32>,
}

impl Default for BencheckConfig {
    fn default() -> Self {
        Self {
            cloud_master: None,
            default_num_threads: None,
        }
    }
}

impl LoadConfigFile for BencheckConfig {
    fn default_config_path() -> Result<Option<PathBuf>> {
        let Some(home) = dirs_home() else {
            return Ok(None);
        };
        Ok(Some(home.join(".bencheck.json5")))
    }
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
