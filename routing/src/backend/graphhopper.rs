use crate::backend::http::{endpoint, send_json};
use crate::errors::{BackendError, RoutingError};
use crate::quota::QuotaTracker;
use crate::route::{Route, RouteRequest};
use geo::{Coord, LineString};
use serde::Deserialize;
use url::Url;

/// The GraphHopper routing API. The hosted API reports its credit quota with every response, a
/// self-hosted server usually runs without key and quota.
pub struct GraphHopperProvider {
    client: reqwest::Client,
    route_url: Url,
    api_key: Option<String>,
}

impl GraphHopperProvider {
    pub fn new(client: reqwest::Client, base_url: &Url, api_key: Option<String>) -> Result<Self, BackendError> {
        let route_url = endpoint(base_url, "route")
            .ok_or_else(|| BackendError::InvalidConfig(format!("Not a base URL: {base_url}")))?;
        Ok(Self { client, route_url, api_key })
    }

    pub(crate) async fn route(&self, request: &RouteRequest, quota: &QuotaTracker) -> Result<Route, RoutingError> {
        let response: GraphHopperResponse = send_json(
            self.client.get(self.route_url.clone()).query(&self.query(request)?),
            quota,
        ).await?;

        response.into_route()
    }

    fn query(&self, request: &RouteRequest) -> Result<Vec<(&'static str, String)>, RoutingError> {
        let (origin, destination) = (request.pair.origin, request.pair.destination);
        let mut query = vec![
            ("point", format!("{},{}", origin.y, origin.x)),
            ("point", format!("{},{}", destination.y, destination.x)),
            ("profile", graphhopper_profile(request.profile.as_str())?.to_string()),
            ("points_encoded", "false".to_string()),
            ("instructions", "false".to_string()),
        ];
        if let Some(key) = &self.api_key {
            query.push(("key", key.clone()));
        }
        Ok(query)
    }
}

fn graphhopper_profile(profile: &str) -> Result<&str, RoutingError> {
    match profile {
        "fastest" | "car" | "driving" => Ok("car"),
        "bike" | "bicycle" | "cycling" => Ok("bike"),
        "foot" | "walking" => Ok("foot"),
        "mtb" | "racingbike" | "hike" | "scooter" | "small_truck" | "truck" => Ok(profile),
        other => Err(RoutingError::Permanent(format!("GraphHopper does not support profile '{other}'"))),
    }
}

#[derive(Debug, Deserialize)]
struct GraphHopperResponse {
    #[serde(default)]
    paths: Vec<GraphHopperPath>,
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GraphHopperPath {
    /// in meters
    distance: f64,
    /// in milliseconds
    time: u64,
    ascend: Option<f64>,
    descend: Option<f64>,
    points: GraphHopperPoints,
}

#[derive(Debug, Deserialize)]
struct GraphHopperPoints {
    coordinates: Vec<Vec<f64>>,
}

impl GraphHopperResponse {
    fn into_route(self) -> Result<Route, RoutingError> {
        let Some(path) = self.paths.into_iter().next() else {
            return Err(RoutingError::Permanent(
                self.message.unwrap_or_else(|| "GraphHopper returned no path".into())
            ));
        };

        // Coordinates may carry an elevation as third value
        let geometry: LineString<f64> = path.points.coordinates.iter()
            .filter(|coordinate| coordinate.len() >= 2)
            .map(|coordinate| Coord { x: coordinate[0], y: coordinate[1] })
            .collect();

        let mut route = Route::new(geometry, path.distance, path.time as f64 / 1_000.0);
        if let Some(ascend) = path.ascend {
            route = route.with_attribute("ascend", ascend);
        }
        if let Some(descend) = path.descend {
            route = route.with_attribute("descend", descend);
        }
        Ok(route)
    }
}
