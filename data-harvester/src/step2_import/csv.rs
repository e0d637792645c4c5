use polars::datatypes::DataType;
use polars::prelude::{col, lit, LazyCsvReader, LazyFileListReader};

use crate::step1_fetch::FetchStepOutput;
use crate::step2_import::{
    ImportError, ImportStepOutput, DESTINATION_ID, DESTINATION_LAT, DESTINATION_LON, ORIGIN_ID,
    ORIGIN_LAT, ORIGIN_LON, WEIGHT,
};

pub(crate) fn import_csv(
    FetchStepOutput {
        path,
        dataset
    }: FetchStepOutput
) -> Result<ImportStepOutput, ImportError> {
    let reader = LazyCsvReader::new(path.as_path()).with_has_header(true);
    let schema = reader.clone().finish()?.collect_schema()?;

    let columns = &dataset.columns;
    let required = [
        (&columns.origin_id, ORIGIN_ID, DataType::String),
        (&columns.destination_id, DESTINATION_ID, DataType::String),
        (&columns.origin_lon, ORIGIN_LON, DataType::Float64),
        (&columns.origin_lat, ORIGIN_LAT, DataType::Float64),
        (&columns.destination_lon, DESTINATION_LON, DataType::Float64),
        (&columns.destination_lat, DESTINATION_LAT, DataType::Float64),
    ];

    let mut selection = Vec::with_capacity(required.len() + 1);
    for (source, target, dtype) in required {
        if !schema.contains(source.as_str()) {
            return Err(ImportError::MissingColumn(source.clone()));
        }
        selection.push(col(source.as_str()).cast(dtype).alias(target));
    }

    // Datasets without weights count every pair once
    let weight = if schema.contains(columns.weight.as_str()) {
        col(columns.weight.as_str()).cast(DataType::Float64)
    } else {
        lit(1.0f64)
    };
    selection.push(weight.alias(WEIGHT));

    let pairs = reader
        .finish()?
        .select(selection)
        .collect()?;

    Ok(ImportStepOutput {
        dataset,
        pairs,
    })
}
