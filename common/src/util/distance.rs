use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::str::FromStr;
use std::sync::OnceLock;
use either::Either;
use geo::{Coord, HaversineDistance, Point};
use regex::Regex;

/// Distance in meters
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
#[serde(try_from = "SerializedDistance")]
pub struct Distance(pub f32);

impl Distance {
    /// Great circle distance between two WGS84 coordinates (x = lon, y = lat)
    pub fn between(a: &Coord<f64>, b: &Coord<f64>) -> Self {
        Self(Point::from(*a).haversine_distance(&Point::from(*b)) as f32)
    }
}

/// Serialized representation of a Distance
/// Either 10.42 (float, meters), "10.42m" or "1.5km" (String)
#[derive(Debug, Deserialize, Clone)]
#[serde(transparent)]
struct SerializedDistance {
    #[serde(with = "either::serde_untagged")]
    meters: Either<f32, String>
}

#[derive(thiserror::Error, Debug)]
pub struct DistanceError;

impl Display for DistanceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "Wrong distance format. Examples of valid formats: 42.1m, 3km")
    }
}

fn distance_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| Regex::new(r"^(\d+\.?\d*)\s*(m|km)?$").unwrap())
}

impl FromStr for Distance {
    type Err = DistanceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let caps = distance_regex().captures(value.trim()).ok_or(DistanceError)?;
        let number = f32::from_str(&caps[1]).map_err(|_| DistanceError)?;

        let meters = match caps.get(2).map(|unit| unit.as_str()) {
            Some("km") => number * 1_000.0,
            _ => number,
        };

        Ok(Self(meters))
    }
}

impl TryFrom<SerializedDistance> for Distance {
    type Error = DistanceError;

    fn try_from(value: SerializedDistance) -> Result<Self, Self::Error> {
        match value.meters {
            Either::Right(value) => Distance::from_str(&value),
            Either::Left(value) => Ok(Self(value)),
        }
    }
}
