mod csv;
mod desire_lines;

use crate::step1_fetch::FetchStepOutput;
use crate::step2_import::csv::import_csv;
use crate::step2_import::desire_lines::import_geojson;
use common::types::dataset::{Dataset, DatasetFormat};
use log::debug;
use polars::frame::DataFrame;
use std::fmt::Display;
use std::{fmt, io};

// Columns of the normalized pair table every importer produces
pub(crate) const ORIGIN_ID: &str = "origin_id";
pub(crate) const DESTINATION_ID: &str = "destination_id";
pub(crate) const ORIGIN_LON: &str = "origin_lon";
pub(crate) const ORIGIN_LAT: &str = "origin_lat";
pub(crate) const DESTINATION_LON: &str = "destination_lon";
pub(crate) const DESTINATION_LAT: &str = "destination_lat";
pub(crate) const WEIGHT: &str = "weight";

pub async fn import_data(
    prev_step_out: FetchStepOutput
) -> Result<ImportStepOutput, ImportError> {
    let format = prev_step_out.dataset.resolved_format()
        .ok_or_else(|| ImportError::UnknownFormat(prev_step_out.dataset.id.clone()))?;

    let result = match format {
        DatasetFormat::Csv => import_csv(prev_step_out)?,
        DatasetFormat::GeoJson => import_geojson(prev_step_out)?,
    };

    debug!(target: "loader", "Imported {} rows from dataset '{}'", result.pairs.height(), result.dataset.id);

    Ok(result)
}

#[derive(thiserror::Error, Debug)]
pub enum ImportError {
    File(#[from] io::Error),
    Polars(#[from] polars::error::PolarsError),
    GeoJson(#[from] geojson::Error),
    UnknownFormat(String),
    MissingColumn(String),
    NotAFeatureCollection,
}

impl Display for ImportError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ImportError::File(err) => write!(f, "{}", err),
            ImportError::Polars(err) => write!(f, "{}", err),
            ImportError::GeoJson(err) => write!(f, "{}", err),
            ImportError::UnknownFormat(id) => write!(f, "Unable to determine the format of dataset '{}'. Please specify it explicitly", id),
            ImportError::MissingColumn(name) => write!(f, "Missing column '{}'", name),
            ImportError::NotAFeatureCollection => write!(f, "GeoJSON dataset must be a FeatureCollection"),
        }
    }
}

/// Pairs of a dataset, normalized to the columns above. Weights may be null.
pub struct ImportStepOutput {
    pub(crate) dataset: Dataset,
    pub(crate) pairs: DataFrame,
}
