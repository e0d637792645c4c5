use crate::backend::cyclestreets_batch::BatchJobs;
use crate::backend::http::{endpoint, send_json};
use crate::errors::{BackendError, RoutingError};
use crate::quota::QuotaTracker;
use crate::route::{Route, RouteRequest};
use common::types::PairId;
use geo::{Coord, LineString};
use serde::Deserialize;
use serde_json::Value;
use tokio::time::timeout;
use std::collections::HashMap;
use url::Url;

/// The CycleStreets journey planner. Needs an API key. With batch jobs, batches are routed on
/// the CycleStreets servers instead of one journey request per pair.
pub struct CycleStreetsProvider {
    client: reqwest::Client,
    journey_url: Url,
    api_key: String,
    batch_jobs: Option<BatchJobs>,
}

impl CycleStreetsProvider {
    pub fn new(client: reqwest::Client, base_url: &Url, api_key: String) -> Result<Self, BackendError> {
        let journey_url = endpoint(base_url, "api/journey.json")
            .ok_or_else(|| BackendError::InvalidConfig(format!("Not a base URL: {base_url}")))?;
        Ok(Self { client, journey_url, api_key, batch_jobs: None })
    }

    pub fn with_batch_jobs(mut self, batch_jobs: BatchJobs) -> Self {
        self.batch_jobs = Some(batch_jobs);
        self
    }

    pub fn runs_jobs(&self) -> bool {
        self.batch_jobs.is_some()
    }

    pub fn max_batch_size(&self) -> usize {
        self.batch_jobs.as_ref().map_or(1, BatchJobs::batch_size)
    }

    pub(crate) async fn route(&self, request: &RouteRequest, quota: &QuotaTracker) -> Result<Route, RoutingError> {
        let response: JourneyResponse = send_json(
            self.client.get(self.journey_url.clone()).query(&self.query(request)?),
            quota,
        ).await?;

        response.into_route()
    }

    pub(crate) async fn route_batch(
        &self,
        requests: &[RouteRequest],
        quota: &QuotaTracker,
    ) -> Vec<(PairId, Result<Route, RoutingError>)> {
        match &self.batch_jobs {
            Some(batch_jobs) if requests.len() > 1 => batch_jobs.route_batch(requests, quota).await,
            // Nobody else bounds the call
            Some(batch_jobs) => {
                let request_timeout = batch_jobs.request_timeout();
                let mut results = Vec::with_capacity(requests.len());
                for request in requests {
                    let route = timeout(request_timeout, self.route(request, quota)).await
                        .unwrap_or_else(|_| Err(RoutingError::Transient(format!("No answer within {:?}", request_timeout))));
                    results.push((request.id(), route));
                }
                results
            }
            None => {
                let mut results = Vec::with_capacity(requests.len());
                for request in requests {
                    results.push((request.id(), self.route(request, quota).await));
                }
                results
            }
        }
    }

    fn query(&self, request: &RouteRequest) -> Result<[(&'static str, String); 4], RoutingError> {
        let (origin, destination) = (request.pair.origin, request.pair.destination);
        Ok([
            ("key", self.api_key.clone()),
            ("plan", plan(request.profile.as_str())?.to_string()),
            ("itinerarypoints", format!("{},{}|{},{}", origin.x, origin.y, destination.x, destination.y)),
            ("reporterrors", "1".to_string()),
        ])
    }
}

pub(super) fn plan(profile: &str) -> Result<&str, RoutingError> {
    match profile {
        "fastest" | "quietest" | "balanced" | "shortest" => Ok(profile),
        other => Err(RoutingError::Permanent(format!("CycleStreets has no plan '{other}'"))),
    }
}

#[derive(Debug, Deserialize)]
pub(super) struct JourneyResponse {
    marker: Option<OneOrMany<Marker>>,
    error: Option<String>,
}

/// A single marker is not wrapped in a list
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    One(T),
    Many(Vec<T>),
}

#[derive(Debug, Deserialize)]
struct Marker {
    #[serde(rename = "@attributes")]
    attributes: HashMap<String, Value>,
}

impl Marker {
    fn kind(&self) -> Option<&str> {
        self.attributes.get("type")?.as_str()
    }

    fn number(&self, name: &str) -> Option<f64> {
        match self.attributes.get(name)? {
            Value::Number(number) => number.as_f64(),
            Value::String(text) => text.trim().parse().ok(),
            _ => None,
        }
    }

    fn numbers(&self, name: &str) -> Vec<f64> {
        self.attributes.get(name)
            .and_then(Value::as_str)
            .map(|text| text.split(',').filter_map(|value| value.trim().parse().ok()).collect())
            .unwrap_or_default()
    }
}

impl JourneyResponse {
    pub(super) fn into_route(self) -> Result<Route, RoutingError> {
        if let Some(error) = self.error {
            return Err(RoutingError::Permanent(error));
        }
        let markers = match self.marker {
            Some(OneOrMany::One(marker)) => vec![marker],
            Some(OneOrMany::Many(markers)) => markers,
            None => Vec::new(),
        };
        let Some(summary) = markers.iter().find(|marker| marker.kind() == Some("route")) else {
            return Err(RoutingError::Permanent("CycleStreets returned no route".into()));
        };

        let geometry = parse_coordinates(summary.attributes.get("coordinates").and_then(Value::as_str))?;
        let (Some(length), Some(time)) = (summary.number("length"), summary.number("time")) else {
            return Err(RoutingError::Permanent("CycleStreets route without length or time".into()));
        };

        let mut route = Route::new(geometry, length, time);
        for attribute in ["quietness", "calories", "co2saved"] {
            if let Some(value) = summary.number(attribute) {
                route = route.with_attribute(attribute, value);
            }
        }
        let segments = markers.iter().filter(|marker| marker.kind() == Some("segment"));
        if let Some(gradient) = mean_gradient(segments) {
            route = route.with_attribute("gradient", gradient);
        }
        Ok(route)
    }
}

/// "lon,lat lon,lat ..."
fn parse_coordinates(coordinates: Option<&str>) -> Result<LineString<f64>, RoutingError> {
    let Some(coordinates) = coordinates else {
        return Err(RoutingError::Permanent("CycleStreets route without coordinates".into()));
    };

    coordinates.split_whitespace()
        .map(|point| {
            let (x, y) = point.split_once(',')
                .ok_or_else(|| RoutingError::Permanent(format!("Invalid coordinate '{point}'")))?;
            match (x.parse(), y.parse()) {
                (Ok(x), Ok(y)) => Ok(Coord { x, y }),
                _ => Err(RoutingError::Permanent(format!("Invalid coordinate '{point}'"))),
            }
        })
        .collect()
}

/// Climbed and descended height divided by distance over all segments. Each segment lists the
/// elevation of its points and the distance from the previous point.
fn mean_gradient<'a>(segments: impl Iterator<Item = &'a Marker>) -> Option<f64> {
    let mut height = 0.0;
    let mut distance = 0.0;

    for segment in segments {
        let elevations = segment.numbers("elevations");
        let distances = segment.numbers("distances");
        for (i, pair) in elevations.windows(2).enumerate() {
            let Some(step) = distances.get(i + 1) else { break };
            height += (pair[1] - pair[0]).abs();
            distance += step;
        }
    }

    (distance > 0.0).then(|| height / distance)
}
