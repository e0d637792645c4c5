use geojson::{Feature, GeoJson, Value};
use polars::df;
use serde_json::Value as JsonValue;
use std::fs;

use crate::step1_fetch::FetchStepOutput;
use crate::step2_import::{
    ImportError, ImportStepOutput, DESTINATION_ID, DESTINATION_LAT, DESTINATION_LON, ORIGIN_ID,
    ORIGIN_LAT, ORIGIN_LON, WEIGHT,
};

/// Imports desire lines: every feature is a line from the origin (first vertex) to the destination
/// (last vertex), ids and weight are read from the feature properties.
pub(crate) fn import_geojson(
    FetchStepOutput {
        path,
        dataset
    }: FetchStepOutput
) -> Result<ImportStepOutput, ImportError> {
    let content = fs::read_to_string(path)?;
    let features = match content.parse::<GeoJson>()? {
        GeoJson::FeatureCollection(collection) => collection.features,
        _ => return Err(ImportError::NotAFeatureCollection),
    };

    let columns = &dataset.columns;
    let len = features.len();
    let mut origin_ids = Vec::with_capacity(len);
    let mut destination_ids = Vec::with_capacity(len);
    let mut origin_lons = Vec::with_capacity(len);
    let mut origin_lats = Vec::with_capacity(len);
    let mut destination_lons = Vec::with_capacity(len);
    let mut destination_lats = Vec::with_capacity(len);
    let mut weights = Vec::with_capacity(len);

    for feature in &features {
        let (origin, destination) = match endpoints(feature) {
            Some((origin, destination)) => (Some(origin), Some(destination)),
            // Kept as nulls, so that validation reports them
            None => (None, None),
        };

        origin_ids.push(property_as_string(feature, &columns.origin_id));
        destination_ids.push(property_as_string(feature, &columns.destination_id));
        origin_lons.push(origin.map(|(lon, _)| lon));
        origin_lats.push(origin.map(|(_, lat)| lat));
        destination_lons.push(destination.map(|(lon, _)| lon));
        destination_lats.push(destination.map(|(_, lat)| lat));
        weights.push(feature.property(&columns.weight).and_then(JsonValue::as_f64));
    }

    if len > 0 && origin_ids.iter().all(Option::is_none) {
        return Err(ImportError::MissingColumn(columns.origin_id.clone()));
    }
    if len > 0 && destination_ids.iter().all(Option::is_none) {
        return Err(ImportError::MissingColumn(columns.destination_id.clone()));
    }

    let pairs = df![
        ORIGIN_ID => origin_ids,
        DESTINATION_ID => destination_ids,
        ORIGIN_LON => origin_lons,
        ORIGIN_LAT => origin_lats,
        DESTINATION_LON => destination_lons,
        DESTINATION_LAT => destination_lats,
        WEIGHT => weights,
    ]?;

    Ok(ImportStepOutput {
        dataset,
        pairs,
    })
}

fn endpoints(feature: &Feature) -> Option<((f64, f64), (f64, f64))> {
    let geometry = feature.geometry.as_ref()?;

    let (first, last) = match &geometry.value {
        Value::LineString(positions) => (positions.first()?, positions.last()?),
        Value::MultiLineString(lines) => (lines.first()?.first()?, lines.last()?.last()?),
        _ => return None,
    };

    Some((position(first)?, position(last)?))
}

fn position(position: &[f64]) -> Option<(f64, f64)> {
    match position {
        [lon, lat, ..] => Some((*lon, *lat)),
        _ => None,
    }
}

fn property_as_string(feature: &Feature, name: &str) -> Option<String> {
    match feature.property(name)? {
        JsonValue::String(value) => Some(value.clone()),
        JsonValue::Number(value) => Some(value.to_string()),
        _ => None,
    }
}
