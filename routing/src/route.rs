use common::types::{OdPair, PairId, Profile};
use geo::LineString;
use std::collections::BTreeMap;

/// Route the pair with the given profile. One request is created per pair and benchmark run.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRequest {
    pub pair: OdPair,
    pub profile: Profile,
}

impl RouteRequest {
    pub fn new(pair: OdPair, profile: Profile) -> Self {
        Self { pair, profile }
    }

    pub fn id(&self) -> PairId {
        self.pair.id
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Route {
    pub geometry: LineString<f64>,
    /// in meters
    pub distance: f64,
    /// in seconds
    pub duration: f64,
    /// Profile specific values reported by the backend, e.g. quietness or gradient
    pub attributes: BTreeMap<String, f64>,
}

impl Route {
    pub fn new(geometry: LineString<f64>, distance: f64, duration: f64) -> Self {
        Self { geometry, distance, duration, attributes: BTreeMap::new() }
    }

    pub fn with_attribute(mut self, name: &str, value: f64) -> Self {
        self.attributes.insert(name.to_string(), value);
        self
    }
}
