pub mod step1_fetch;
pub mod step2_import;
pub mod step3_validate;

use common::types::dataset::Dataset;
use common::types::OdPair;
use std::fmt;
use std::fmt::Display;
use step1_fetch::{fetch_dataset, FetchError};
use step2_import::{import_data, ImportError};
use step3_validate::{validate_data, ValidateError};

/// Fetches, imports and validates a dataset. The returned pairs have continuous ids.
pub async fn load_dataset(dataset: Dataset) -> Result<Vec<OdPair>, LoadError> {
    let fetched = fetch_dataset(dataset).await?;
    let imported = import_data(fetched).await?;
    let validated = validate_data(imported).await?;

    Ok(validated.pairs)
}

#[derive(thiserror::Error, Debug)]
pub enum LoadError {
    Fetch(#[from] FetchError),
    Import(#[from] ImportError),
    Validate(#[from] ValidateError),
}

impl Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let err: &dyn Display = match self {
            LoadError::Fetch(err) => err,
            LoadError::Import(err) => err,
            LoadError::Validate(err) => err,
        };
        let prefix = match self {
            LoadError::Fetch(_) => "Fetching dataset",
            LoadError::Import(_) => "Importing dataset",
            LoadError::Validate(_) => "Validating dataset",
        };
        write!(f, "{}: {}", prefix, err)
    }
}
