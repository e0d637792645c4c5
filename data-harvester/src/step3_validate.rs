use std::collections::HashSet;
use std::fmt::Display;
use common::types::dataset::Dataset;
use common::types::{OdPair, PairId};
use geo::coord;
use itertools::izip;
use log::{info, warn};
use polars::frame::DataFrame;
use polars::prelude::{col, lit, Expr, IntoLazy};
use crate::step2_import::{
    ImportStepOutput, DESTINATION_ID, DESTINATION_LAT, DESTINATION_LON, ORIGIN_ID, ORIGIN_LAT,
    ORIGIN_LON, WEIGHT,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    /// Violating pairs are removed from the dataset
    Drop,
    /// Violating pairs are kept, but reported
    Warn,
}

/// A rule every OD pair is checked against
pub trait Rule {
    fn name(&self) -> &'static str;
    fn severity(&self) -> Severity;
    /// Expression that is true for every row violating this rule
    fn violations(&self) -> Expr;
}

struct MissingIds;

impl Rule for MissingIds {
    fn name(&self) -> &'static str { "missing origin or destination id" }
    fn severity(&self) -> Severity { Severity::Drop }
    fn violations(&self) -> Expr {
        col(ORIGIN_ID).is_null().or(col(DESTINATION_ID).is_null())
    }
}

/// Trips within a zone cannot be routed between zone centroids
struct IntrazonalPair;

impl Rule for IntrazonalPair {
    fn name(&self) -> &'static str { "origin equals destination" }
    fn severity(&self) -> Severity { Severity::Drop }
    fn violations(&self) -> Expr {
        col(ORIGIN_ID).eq(col(DESTINATION_ID)).fill_null(lit(false))
    }
}

struct InvalidCoordinates;

impl Rule for InvalidCoordinates {
    fn name(&self) -> &'static str { "invalid coordinates" }
    fn severity(&self) -> Severity { Severity::Drop }
    fn violations(&self) -> Expr {
        within(ORIGIN_LON, 180.0)
            .and(within(ORIGIN_LAT, 90.0))
            .and(within(DESTINATION_LON, 180.0))
            .and(within(DESTINATION_LAT, 90.0))
            .not()
    }
}

// NaN compares greater than every number in polars, nulls are treated as outside
fn within(column: &str, limit: f64) -> Expr {
    col(column).gt_eq(lit(-limit))
        .and(col(column).lt_eq(lit(limit)))
        .fill_null(lit(false))
}

struct InvalidWeight;

impl Rule for InvalidWeight {
    fn name(&self) -> &'static str { "negative or non-finite weight" }
    fn severity(&self) -> Severity { Severity::Drop }
    fn violations(&self) -> Expr {
        col(WEIGHT).gt_eq(lit(0.0)).and(col(WEIGHT).lt(lit(f64::INFINITY))).not()
    }
}

struct ZeroWeight;

impl Rule for ZeroWeight {
    fn name(&self) -> &'static str { "zero weight" }
    fn severity(&self) -> Severity { Severity::Warn }
    fn violations(&self) -> Expr {
        col(WEIGHT).eq(lit(0.0))
    }
}

pub fn od_rules() -> Vec<Box<dyn Rule + Send + Sync>> {
    vec![
        Box::new(MissingIds),
        Box::new(IntrazonalPair),
        Box::new(InvalidCoordinates),
        Box::new(InvalidWeight),
        Box::new(ZeroWeight),
    ]
}

pub async fn validate_data(
    ImportStepOutput { dataset, pairs }: ImportStepOutput
) -> Result<ValidateStepOutput, ValidateError> {
    let total = pairs.height();

    // Pairs without a weight count once
    let mut pairs = pairs.lazy()
        .with_column(col(WEIGHT).fill_null(lit(1.0f64)))
        .collect()?;

    let mut violations = Vec::new();
    for rule in od_rules() {
        let count = pairs.clone().lazy().filter(rule.violations()).collect()?.height();
        if count == 0 {
            continue;
        }

        match rule.severity() {
            Severity::Drop => {
                warn!(target: "validation", "Dropping {} pair(s) of dataset '{}': {}", count, dataset.id, rule.name());
                pairs = pairs.lazy().filter(rule.violations().not()).collect()?;
            }
            Severity::Warn => {
                warn!(target: "validation", "{} pair(s) of dataset '{}': {}", count, dataset.id, rule.name());
            }
        }
        violations.push(RuleViolation { rule: rule.name(), severity: rule.severity(), count });
    }

    let (pairs, duplicates) = to_od_pairs(&pairs, dataset.limit)?;
    if duplicates > 0 {
        warn!(target: "validation", "Dropping {} duplicate pair(s) of dataset '{}'", duplicates, dataset.id);
        violations.push(RuleViolation { rule: "duplicate pair", severity: Severity::Drop, count: duplicates });
    }

    if pairs.is_empty() {
        return Err(ValidateError::NoValidPairs(dataset.id));
    }

    info!(target: "validation", "Dataset '{}': {} of {} pairs are valid", dataset.id, pairs.len(), total);

    Ok(ValidateStepOutput {
        dataset,
        pairs,
        violations,
    })
}

/// Turns the validated table into pairs with continuous ids. Pairs are identified by origin and
/// destination id, so only the first occurrence of each is kept.
fn to_od_pairs(frame: &DataFrame, limit: Option<usize>) -> Result<(Vec<OdPair>, usize), ValidateError> {
    let origin_ids = frame.column(ORIGIN_ID)?.as_materialized_series().str()?;
    let destination_ids = frame.column(DESTINATION_ID)?.as_materialized_series().str()?;
    let origin_lons = frame.column(ORIGIN_LON)?.as_materialized_series().f64()?;
    let origin_lats = frame.column(ORIGIN_LAT)?.as_materialized_series().f64()?;
    let destination_lons = frame.column(DESTINATION_LON)?.as_materialized_series().f64()?;
    let destination_lats = frame.column(DESTINATION_LAT)?.as_materialized_series().f64()?;
    let weights = frame.column(WEIGHT)?.as_materialized_series().f64()?;

    let limit = limit.unwrap_or(usize::MAX);
    let mut seen = HashSet::new();
    let mut duplicates = 0;
    let mut pairs = Vec::new();

    let rows = izip!(
        origin_ids, destination_ids, origin_lons, origin_lats, destination_lons, destination_lats, weights
    );
    for (origin_id, destination_id, o_lon, o_lat, d_lon, d_lat, weight) in rows {
        if pairs.len() >= limit {
            break;
        }
        // Rows with nulls have been dropped by the rules already
        let (Some(origin_id), Some(destination_id), Some(o_lon), Some(o_lat), Some(d_lon), Some(d_lat)) =
            (origin_id, destination_id, o_lon, o_lat, d_lon, d_lat) else { continue };

        if !seen.insert((origin_id, destination_id)) {
            duplicates += 1;
            continue;
        }

        pairs.push(OdPair {
            id: PairId(pairs.len() as u32),
            origin_id: origin_id.to_string(),
            destination_id: destination_id.to_string(),
            origin: coord! { x: o_lon, y: o_lat },
            destination: coord! { x: d_lon, y: d_lat },
            weight: weight.unwrap_or(1.0),
        });
    }

    Ok((pairs, duplicates))
}

#[derive(thiserror::Error, Debug)]
pub enum ValidateError {
    Polars(#[from] polars::error::PolarsError),
    NoValidPairs(String),
}

impl Display for ValidateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ValidateError::Polars(e) => write!(f, "{e}"),
            ValidateError::NoValidPairs(id) => write!(f, "Dataset '{id}' does not contain a single valid OD pair"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleViolation {
    pub rule: &'static str,
    pub severity: Severity,
    pub count: usize,
}

pub struct ValidateStepOutput {
    pub dataset: Dataset,
    pub pairs: Vec<OdPair>,
    pub violations: Vec<RuleViolation>,
}
