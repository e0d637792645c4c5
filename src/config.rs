use common::types::config::Config;
use log::{debug, info};
use std::fmt;
use std::fmt::Display;
use std::fs;
use std::path::{Path, PathBuf};

pub(super) fn load_config(config_file: Option<&str>) -> Result<Config, ConfigError> {
    let Some(config_file) = config_file else {
        debug!(target: "main", "No config file given, only the built-in backends are available");
        return Ok(Config::default());
    };
    let path: &Path = Path::new(config_file);

    let content = fs::read_to_string(path).map_err(|err| ConfigError::Io(path.to_path_buf(), err))?;
    let config: Config = serde_yml::from_str(&content)
        .map_err(|err| ConfigError::Yaml(path.to_path_buf(), err))?;

    info!(target: "main", "Config read successfully from '{}'", path.display());

    Ok(config)
}

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    Io(PathBuf, #[source] std::io::Error),
    Yaml(PathBuf, #[source] serde_yml::Error),
    InvalidArgument(String),
}

impl Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::Io(path, err) => write!(f, "Could not open '{}': {}", path.display(), err),
            ConfigError::Yaml(path, err) => write!(f, "Could not read '{}': {}", path.display(), err),
            ConfigError::InvalidArgument(message) => write!(f, "{}", message),
        }
    }
}
