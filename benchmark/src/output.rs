use crate::aggregator::{BenchmarkSummary, PairOutput};
use common::util::df::{prepare_file, write_df_to_file, write_geoarrow_to_file, FileType};
use common::util::geoarrow_lines;
use common::util::geoarrow_lines::{build_geoarrow_lines, LineColumn};
use geo::LineString;
use geoarrow::error::GeoArrowError;
use geojson::{Feature, FeatureCollection, Geometry, JsonObject, JsonValue};
use itertools::Itertools;
use log::info;
use polars::df;
use polars::error::PolarsError;
use polars::frame::DataFrame;
use routing::ErrorKind;
use std::fmt;
use std::fmt::Display;
use std::io::BufWriter;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Routes and desire lines of failed pairs with all properties, summaries as foreign member
    GeoJson,
    /// Successful routes only
    GeoArrow,
    /// One row per pair without geometry
    Csv,
}

impl OutputFormat {
    pub fn from_path(path: &Path) -> Result<Self, OutputError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("geojson") | Some("json") => Ok(OutputFormat::GeoJson),
            Some("arrow") | Some("ipc") => Ok(OutputFormat::GeoArrow),
            Some("csv") => Ok(OutputFormat::Csv),
            _ => Err(OutputError::UnknownFormat(path.to_path_buf())),
        }
    }
}

/// `results/leeds.geojson` -> `results/leeds.summary.csv`
pub fn summary_path(path: &Path) -> PathBuf {
    let stem = path.file_stem().and_then(|stem| stem.to_str()).unwrap_or("results");
    path.with_file_name(format!("{stem}.summary.csv"))
}

/// Writes the per pair results in the format given by the file extension and the summary table
/// next to them. Returns the path of the summary table.
pub fn write_results(
    path: &Path,
    outputs: &[PairOutput],
    summaries: &[BenchmarkSummary],
) -> Result<PathBuf, OutputError> {
    match OutputFormat::from_path(path)? {
        OutputFormat::GeoJson => write_geojson(path, outputs, summaries)?,
        OutputFormat::GeoArrow => write_geoarrow(path, outputs)?,
        OutputFormat::Csv => write_df_to_file(path.to_path_buf(), FileType::CSV, pairs_frame(outputs)?)?,
    }
    info!(target: "output", "Wrote {} results to {}", outputs.len(), path.display());

    let summary_path = summary_path(path);
    write_summary_csv(&summary_path, summaries)?;
    Ok(summary_path)
}

pub fn write_geojson(
    path: &Path,
    outputs: &[PairOutput],
    summaries: &[BenchmarkSummary],
) -> Result<(), OutputError> {
    let features = outputs.iter().map(feature).collect_vec();

    let mut foreign_members = JsonObject::new();
    foreign_members.insert("summaries".to_string(), serde_json::to_value(summaries)?);
    let collection = FeatureCollection {
        bbox: None,
        features,
        foreign_members: Some(foreign_members),
    };

    let writer = BufWriter::new(prepare_file(path.to_path_buf())?);
    serde_json::to_writer(writer, &collection)?;
    Ok(())
}

fn feature(output: &PairOutput) -> Feature {
    let (pair, result) = (output.pair, output.result);
    let mut properties = JsonObject::new();
    properties.insert("pair_id".to_string(), JsonValue::from(pair.id.0));
    properties.insert("origin".to_string(), JsonValue::from(pair.origin_id.clone()));
    properties.insert("destination".to_string(), JsonValue::from(pair.destination_id.clone()));
    properties.insert("weight".to_string(), JsonValue::from(pair.weight));
    properties.insert("backend".to_string(), JsonValue::from(result.backend.clone()));
    properties.insert("profile".to_string(), JsonValue::from(result.profile.as_str()));
    properties.insert("attempts".to_string(), JsonValue::from(result.attempts));
    properties.insert("latency".to_string(), JsonValue::from(result.latency.as_secs_f64()));

    let geometry = match &result.outcome {
        Ok(route) => {
            properties.insert("status".to_string(), JsonValue::from("ok"));
            properties.insert("distance".to_string(), JsonValue::from(route.distance));
            properties.insert("duration".to_string(), JsonValue::from(route.duration));
            let attributes: JsonObject = route.attributes.iter()
                .map(|(name, value)| (name.clone(), JsonValue::from(*value)))
                .collect();
            properties.insert("attributes".to_string(), JsonValue::Object(attributes));
            line_geometry(&route.geometry)
        }
        Err(failure) => {
            properties.insert("status".to_string(), JsonValue::from("failed"));
            properties.insert("error_kind".to_string(), JsonValue::from(failure.kind.as_str()));
            properties.insert("error".to_string(), JsonValue::from(failure.message.clone()));
            line_geometry(&LineString::new(vec![pair.origin, pair.destination]))
        }
    };

    Feature {
        bbox: None,
        geometry: Some(geometry),
        id: None,
        properties: Some(properties),
        foreign_members: None,
    }
}

fn line_geometry(line: &LineString<f64>) -> Geometry {
    let positions = line.coords().map(|coord| vec![coord.x, coord.y]).collect_vec();
    Geometry::new(geojson::Value::LineString(positions))
}

pub fn write_geoarrow(path: &Path, outputs: &[PairOutput]) -> Result<(), OutputError> {
    let routed = outputs.iter()
        .filter_map(|output| output.result.route().map(|route| (output, route)))
        .collect_vec();

    let columns = vec![
        LineColumn::Count("pair_id".into(), routed.iter().map(|(output, _)| output.pair.id.0).collect()),
        LineColumn::Text("origin".into(), routed.iter().map(|(output, _)| output.pair.origin_id.clone()).collect()),
        LineColumn::Text("destination".into(), routed.iter().map(|(output, _)| output.pair.destination_id.clone()).collect()),
        LineColumn::Text("backend".into(), routed.iter().map(|(output, _)| output.result.backend.clone()).collect()),
        LineColumn::Text("profile".into(), routed.iter().map(|(output, _)| output.result.profile.to_string()).collect()),
        LineColumn::Number("weight".into(), routed.iter().map(|(output, _)| Some(output.pair.weight)).collect()),
        LineColumn::Number("distance".into(), routed.iter().map(|(_, route)| Some(route.distance)).collect()),
        LineColumn::Number("duration".into(), routed.iter().map(|(_, route)| Some(route.duration)).collect()),
        LineColumn::Number("latency".into(), routed.iter().map(|(output, _)| Some(output.result.latency.as_secs_f64())).collect()),
    ];
    let lines = routed.iter().map(|(_, route)| route.geometry.clone()).collect_vec();

    let table = build_geoarrow_lines(lines, columns)?;
    write_geoarrow_to_file(path.to_path_buf(), table)?;
    Ok(())
}

/// Per pair results without geometry
pub fn pairs_frame(outputs: &[PairOutput]) -> Result<DataFrame, PolarsError> {
    let failure = |output: &PairOutput| output.result.outcome.as_ref().err().cloned();

    df![
        "pair_id" => outputs.iter().map(|output| output.pair.id.0).collect_vec(),
        "origin" => outputs.iter().map(|output| output.pair.origin_id.clone()).collect_vec(),
        "destination" => outputs.iter().map(|output| output.pair.destination_id.clone()).collect_vec(),
        "weight" => outputs.iter().map(|output| output.pair.weight).collect_vec(),
        "backend" => outputs.iter().map(|output| output.result.backend.clone()).collect_vec(),
        "profile" => outputs.iter().map(|output| output.result.profile.to_string()).collect_vec(),
        "status" => outputs.iter().map(|output| if output.result.is_success() { "ok" } else { "failed" }).collect_vec(),
        "error_kind" => outputs.iter().map(|output| failure(output).map(|failure| failure.kind.to_string())).collect_vec(),
        "error" => outputs.iter().map(|output| failure(output).map(|failure| failure.message)).collect_vec(),
        "distance" => outputs.iter().map(|output| output.result.route().map(|route| route.distance)).collect_vec(),
        "duration" => outputs.iter().map(|output| output.result.route().map(|route| route.duration)).collect_vec(),
        "latency" => outputs.iter().map(|output| output.result.latency.as_secs_f64()).collect_vec(),
        "attempts" => outputs.iter().map(|output| output.result.attempts).collect_vec(),
    ]
}

pub fn summary_frame(summaries: &[BenchmarkSummary]) -> Result<DataFrame, PolarsError> {
    let count = |kind: ErrorKind| summaries.iter().map(|summary| summary.failures_of(kind) as u64).collect_vec();
    let latency = |pick: fn(&BenchmarkSummary) -> Option<f64>| summaries.iter().map(pick).collect_vec();

    df![
        "backend" => summaries.iter().map(|summary| summary.backend.clone()).collect_vec(),
        "profile" => summaries.iter().map(|summary| summary.profile.to_string()).collect_vec(),
        "attempted" => summaries.iter().map(|summary| summary.attempted as u64).collect_vec(),
        "succeeded" => summaries.iter().map(|summary| summary.succeeded as u64).collect_vec(),
        "failed_transient" => count(ErrorKind::Transient),
        "failed_rate_limit" => count(ErrorKind::RateLimit),
        "failed_permanent" => count(ErrorKind::Permanent),
        "failed_timeout" => count(ErrorKind::Timeout),
        "retries" => summaries.iter().map(|summary| summary.retries).collect_vec(),
        "elapsed_s" => summaries.iter().map(|summary| summary.elapsed_secs).collect_vec(),
        "routes_per_s" => summaries.iter().map(|summary| summary.throughput).collect_vec(),
        "success_rate" => summaries.iter().map(|summary| summary.success_rate).collect_vec(),
        "mean_latency_s" => latency(|summary| summary.latency.map(|latency| latency.mean)),
        "median_latency_s" => latency(|summary| summary.latency.map(|latency| latency.median)),
        "p95_latency_s" => latency(|summary| summary.latency.map(|latency| latency.p95)),
        "total_distance_m" => summaries.iter().map(|summary| summary.total_distance).collect_vec(),
        "total_duration_s" => summaries.iter().map(|summary| summary.total_duration).collect_vec(),
    ]
}

pub fn write_summary_csv(path: &Path, summaries: &[BenchmarkSummary]) -> Result<(), OutputError> {
    write_df_to_file(path.to_path_buf(), FileType::CSV, summary_frame(summaries)?)?;
    info!(target: "output", "Wrote summary to {}", path.display());
    Ok(())
}

/// Logs the summaries as a table, in the given order
pub fn log_summary_table(summaries: &[&BenchmarkSummary]) {
    let mut table = format!(
        "\n{:<20} {:<12} {:>8} {:>8} {:>9} {:>9} {:>9} {:>8} {:>8} {:>10} {:>10} {:>10}",
        "backend", "profile", "pairs", "ok", "transient", "ratelimit", "permanent", "timeout",
        "retries", "routes/s", "median s", "p95 s"
    );
    for summary in summaries {
        let (median, p95) = summary.latency
            .map(|latency| (format!("{:.3}", latency.median), format!("{:.3}", latency.p95)))
            .unwrap_or_else(|| ("-".into(), "-".into()));
        table.push_str(&format!(
            "\n{:<20} {:<12} {:>8} {:>8} {:>9} {:>9} {:>9} {:>8} {:>8} {:>10.2} {:>10} {:>10}",
            summary.backend, summary.profile.as_str(), summary.attempted, summary.succeeded,
            summary.failures_of(ErrorKind::Transient), summary.failures_of(ErrorKind::RateLimit),
            summary.failures_of(ErrorKind::Permanent), summary.failures_of(ErrorKind::Timeout),
            summary.retries, summary.throughput, median, p95
        ));
    }
    info!(target: "output", "{}", table);
}

#[derive(thiserror::Error, Debug)]
pub enum OutputError {
    Io(#[from] std::io::Error),
    Polars(#[from] PolarsError),
    GeoArrow(#[from] GeoArrowError),
    Lines(#[from] geoarrow_lines::Error),
    Json(#[from] serde_json::Error),
    UnknownFormat(PathBuf),
}

impl Display for OutputError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            OutputError::Io(err) => write!(f, "{}", err),
            OutputError::Polars(err) => write!(f, "{}", err),
            OutputError::GeoArrow(err) => write!(f, "{}", err),
            OutputError::Lines(err) => write!(f, "{}", err),
            OutputError::Json(err) => write!(f, "{}", err),
            OutputError::UnknownFormat(path) => write!(
                f, "Don't know how to write {}. Use .geojson, .arrow or .csv", path.display()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregator::{pair_outputs, summarize};
    use crate::result::{RouteFailure, RouteResult};
    use chrono::Utc;
    use common::types::{OdPair, PairId, Profile};
    use geo::Coord;
    use polars::prelude::{CsvReadOptions, SerReader};
    use routing::Route;
    use std::time::Duration;

    fn fixture() -> (Vec<OdPair>, Vec<RouteResult>) {
        let pairs = (0..2)
            .map(|id| OdPair {
                id: PairId(id),
                origin_id: format!("O{id}"),
                destination_id: format!("D{id}"),
                origin: Coord { x: -1.55, y: 53.80 },
                destination: Coord { x: -1.54, y: 53.81 },
                weight: 3.0,
            })
            .collect_vec();
        let route = Route::new(
            LineString::new(vec![Coord { x: -1.55, y: 53.80 }, Coord { x: -1.545, y: 53.805 }, Coord { x: -1.54, y: 53.81 }]),
            1_500.0,
            320.0,
        ).with_attribute("quietness", 70.0);
        let now = Utc::now();
        let result = |id: u32, outcome| RouteResult {
            request_id: PairId(id),
            backend: "osrm".into(),
            profile: Profile::from("bike"),
            weight: 3.0,
            outcome,
            attempts: 1,
            latency: Duration::from_millis(120),
            started_at: now,
            finished_at: now + chrono::TimeDelta::milliseconds(120),
        };
        let results = vec![
            result(1, Err(RouteFailure { kind: ErrorKind::Permanent, message: "no route".into() })),
            result(0, Ok(route)),
        ];
        (pairs, results)
    }

    #[test]
    fn test_output_format_from_path() {
        assert_eq!(OutputFormat::from_path(Path::new("out.geojson")).unwrap(), OutputFormat::GeoJson);
        assert_eq!(OutputFormat::from_path(Path::new("out.arrow")).unwrap(), OutputFormat::GeoArrow);
        assert_eq!(OutputFormat::from_path(Path::new("out.csv")).unwrap(), OutputFormat::Csv);
        assert!(OutputFormat::from_path(Path::new("out.shp")).is_err());
    }

    #[test]
    fn test_summary_path() {
        assert_eq!(summary_path(Path::new("results/leeds.geojson")), PathBuf::from("results/leeds.summary.csv"));
    }

    #[test]
    fn test_write_geojson() {
        let (pairs, results) = fixture();
        let outputs = pair_outputs(&pairs, &results);
        let summaries = summarize(&results);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.geojson");

        write_geojson(&path, &outputs, &summaries).unwrap();

        let written: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
        let features = written["features"].as_array().unwrap();
        assert_eq!(features.len(), 2);
        assert_eq!(features[0]["properties"]["status"], "ok");
        assert_eq!(features[0]["properties"]["attributes"]["quietness"], 70.0);
        assert_eq!(features[0]["geometry"]["coordinates"].as_array().unwrap().len(), 3);
        assert_eq!(features[1]["properties"]["status"], "failed");
        assert_eq!(features[1]["properties"]["error_kind"], "permanent");
        assert_eq!(features[1]["geometry"]["coordinates"].as_array().unwrap().len(), 2);
        assert_eq!(written["summaries"][0]["succeeded"], 1);
    }

    #[test]
    fn test_write_results_with_summary() {
        let (pairs, results) = fixture();
        let outputs = pair_outputs(&pairs, &results);
        let summaries = summarize(&results);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("routes.csv");

        let summary_path = write_results(&path, &outputs, &summaries).unwrap();

        let read = |path: PathBuf| CsvReadOptions::default()
            .with_has_header(true)
            .try_into_reader_with_file_path(Some(path))
            .unwrap()
            .finish()
            .unwrap();
        let pairs_frame = read(path);
        let summary_frame = read(summary_path);
        assert_eq!(pairs_frame.height(), 2);
        assert_eq!(pairs_frame.width(), 13);
        assert_eq!(summary_frame.height(), 1);
        assert_eq!(summary_frame.column("succeeded").unwrap().get(0).unwrap().try_extract::<i64>().unwrap(), 1);
    }

    #[test]
    fn test_write_geoarrow() {
        let (pairs, results) = fixture();
        let outputs = pair_outputs(&pairs, &results);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("routes.arrow");

        write_geoarrow(&path, &outputs).unwrap();

        assert!(path.metadata().unwrap().len() > 0);
    }
}
