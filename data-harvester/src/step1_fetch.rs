use std::fmt;
use std::fmt::Display;
use std::io::Cursor;
use std::time::{SystemTime, UNIX_EPOCH};
use common::types::dataset::{Dataset, DataSource};
use log::{debug, info};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::fs::{create_dir_all, File};
use std::path::{Path, PathBuf};

pub async fn fetch_dataset(
    dataset: Dataset
) -> Result<FetchStepOutput, FetchError> {
    match dataset.clone().src {
        DataSource::URL { url, headers } => {
            let timestamp = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|since| since.as_millis())
                .unwrap_or_default();
            let path_str = format!("./data/datasets/{}/imports/{}", dataset.id, timestamp);
            let path = Path::new(&path_str);
            if let Some(parent) = path.parent() {
                create_dir_all(parent)?;
            }

            info!(target: "loader", "Downloading dataset '{}' from {}", dataset.id, url);
            let response = reqwest::Client::new()
                .get(url.clone())
                .headers(to_header_map(&headers)?)
                .send()
                .await?
                .error_for_status()?;

            let mut file = File::create(path)?;
            let mut content = Cursor::new(response.bytes().await?);
            std::io::copy(&mut content, &mut file)?;
            debug!(target: "loader", "Dataset '{}' stored at {}", dataset.id, path_str);

            Ok(FetchStepOutput {
                dataset,
                path: path.to_path_buf(),
            })
        },
        DataSource::File { path } => {
            let path = PathBuf::from(path);
            if !path.is_file() {
                return Err(FetchError::NotFound(path));
            }

            Ok(FetchStepOutput {
                dataset,
                path,
            })
        }
    }
}

fn to_header_map(
    headers: &std::collections::HashMap<String, String>
) -> Result<HeaderMap, FetchError> {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        let name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|_| FetchError::InvalidHeader(name.clone()))?;
        let value = HeaderValue::from_str(value)
            .map_err(|_| FetchError::InvalidHeader(name.to_string()))?;
        map.insert(name, value);
    }
    Ok(map)
}

#[derive(thiserror::Error, Debug)]
pub enum FetchError {
    Reqwest(#[from] reqwest::Error),
    File(#[from] std::io::Error),
    NotFound(PathBuf),
    InvalidHeader(String),
}

impl Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            FetchError::Reqwest(err) => write!(f, "{}", err),
            FetchError::File(err) => write!(f, "{}", err),
            FetchError::NotFound(path) => write!(f, "Dataset file {:?} does not exist", path),
            FetchError::InvalidHeader(name) => write!(f, "Invalid request header '{}'", name),
        }
    }
}



pub struct FetchStepOutput {
    pub(crate) dataset: Dataset,
    pub(crate) path: PathBuf
}
