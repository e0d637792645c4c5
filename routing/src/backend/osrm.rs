use crate::backend::http::{endpoint, send_json};
use crate::errors::{BackendError, RoutingError};
use crate::quota::QuotaTracker;
use crate::route::{Route, RouteRequest};
use geo::{Coord, LineString};
use serde::Deserialize;
use url::Url;

/// An OSRM server, e.g. the public demo server or a local `osrm-routed`
pub struct OsrmProvider {
    client: reqwest::Client,
    base_url: Url,
}

impl OsrmProvider {
    pub fn new(client: reqwest::Client, base_url: &Url) -> Result<Self, BackendError> {
        if base_url.cannot_be_a_base() {
            return Err(BackendError::InvalidConfig(format!("Not a base URL: {base_url}")));
        }
        Ok(Self { client, base_url: base_url.clone() })
    }

    pub(crate) async fn route(&self, request: &RouteRequest, quota: &QuotaTracker) -> Result<Route, RoutingError> {
        let url = self.url(request)?;
        let response: OsrmResponse = send_json(
            self.client.get(url).query(&[("overview", "full"), ("geometries", "geojson")]),
            quota,
        ).await?;

        response.into_route()
    }

    fn url(&self, request: &RouteRequest) -> Result<Url, RoutingError> {
        let profile = osrm_profile(request.profile.as_str())?;
        let (origin, destination) = (request.pair.origin, request.pair.destination);
        let path = format!(
            "route/v1/{}/{},{};{},{}",
            profile, origin.x, origin.y, destination.x, destination.y
        );

        endpoint(&self.base_url, &path)
            .ok_or_else(|| RoutingError::Permanent(format!("Invalid OSRM URL {}", self.base_url)))
    }
}

/// OSRM servers are started with one Lua profile. The name in the URL has to be one of the
/// default ones. OSRM always returns the fastest route of its profile, so `fastest` is driving.
fn osrm_profile(profile: &str) -> Result<&'static str, RoutingError> {
    match profile {
        "fastest" | "car" | "driving" => Ok("car"),
        "bike" | "bicycle" | "cycling" => Ok("bike"),
        "foot" | "walking" => Ok("foot"),
        other => Err(RoutingError::Permanent(format!("OSRM does not support profile '{other}'"))),
    }
}

#[derive(Debug, Deserialize)]
struct OsrmResponse {
    code: String,
    message: Option<String>,
    #[serde(default)]
    routes: Vec<OsrmRoute>,
}

#[derive(Debug, Deserialize)]
struct OsrmRoute {
    geometry: OsrmGeometry,
    distance: f64,
    duration: f64,
}

#[derive(Debug, Deserialize)]
struct OsrmGeometry {
    coordinates: Vec<[f64; 2]>,
}

impl OsrmResponse {
    fn into_route(self) -> Result<Route, RoutingError> {
        if self.code != "Ok" {
            return Err(RoutingError::Permanent(format!(
                "{}: {}", self.code, self.message.unwrap_or_default()
            )));
        }
        let Some(route) = self.routes.into_iter().next() else {
            return Err(RoutingError::Permanent("OSRM returned no route".into()));
        };

        let geometry: LineString<f64> = route.geometry.coordinates.into_iter()
            .map(|[x, y]| Coord { x, y })
            .collect();
        Ok(Route::new(geometry, route.distance, route.duration))
    }
}
