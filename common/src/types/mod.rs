use std::fmt;
use std::fmt::Formatter;
use geo::Coord;
use serde::{Deserialize, Serialize};

pub mod backend;
pub mod config;
pub mod dataset;

// a continuous pair id
// "continuous" means that if we have n OD pairs, all ids are from 0,...,n-1 and no number in that
// range is unused
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PairId(pub u32);

impl fmt::Display for PairId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single origin-destination pair of a dataset. Coordinates are WGS84 with `x` being the
/// longitude and `y` the latitude.
#[derive(Debug, Clone, PartialEq)]
pub struct OdPair {
    pub id: PairId,
    pub origin_id: String,
    pub destination_id: String,
    pub origin: Coord<f64>,
    pub destination: Coord<f64>,
    /// Usually the number of trips between origin and destination
    pub weight: f64,
}

/// A named routing weighting like "fastest", "quietest" or a mode like "foot". Backends decide
/// which names they understand.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Profile(pub String);

impl Profile {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for Profile {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}
