use crate::types::backend::BackendConfig;
use crate::types::dataset::DatasetColumns;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
#[serde(tag = "version")]
pub enum Config {
    #[serde(rename = "1")]
    Version1 {
        #[serde(default)]
        backends: Vec<BackendConfig>,
        dataset_columns: Option<DatasetColumns>,
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::Version1 {
            backends: vec![],
            dataset_columns: None,
        }
    }
}

impl Config {
    /// All usable backends: the configured ones, followed by the built-in ones whose names are not
    /// taken by a configured backend
    pub fn backends(&self) -> Vec<BackendConfig> {
        match self {
            Config::Version1 { backends, .. } => {
                let mut all = backends.clone();
                all.extend(
                    BackendConfig::builtin()
                        .into_iter()
                        .filter(|builtin| !backends.iter().any(|b| b.name == builtin.name)),
                );
                all
            }
        }
    }

    pub fn backend(&self, name: &str) -> Option<BackendConfig> {
        self.backends().into_iter().find(|backend| backend.name == name)
    }

    pub fn dataset_columns(&self) -> DatasetColumns {
        match self {
            Config::Version1 { dataset_columns, .. } => dataset_columns.clone().unwrap_or_default(),
        }
    }
}
