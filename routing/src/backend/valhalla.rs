use crate::backend::http::{endpoint, send_json};
use crate::errors::{BackendError, RoutingError};
use crate::quota::QuotaTracker;
use crate::route::{Route, RouteRequest};
use common::util::polyline;
use geo::LineString;
use serde::{Deserialize, Serialize};
use url::Url;

const SHAPE_PRECISION: u32 = 6;

pub struct ValhallaProvider {
    client: reqwest::Client,
    route_url: Url,
}

impl ValhallaProvider {
    pub fn new(client: reqwest::Client, base_url: &Url) -> Result<Self, BackendError> {
        let route_url = endpoint(base_url, "route")
            .ok_or_else(|| BackendError::InvalidConfig(format!("Not a base URL: {base_url}")))?;
        Ok(Self { client, route_url })
    }

    pub(crate) async fn route(&self, request: &RouteRequest, quota: &QuotaTracker) -> Result<Route, RoutingError> {
        let body = ValhallaRequest::new(request)?;
        let response: ValhallaResponse = send_json(
            self.client.post(self.route_url.clone()).json(&body),
            quota,
        ).await?;

        response.into_route()
    }
}

fn costing(profile: &str) -> Result<&str, RoutingError> {
    match profile {
        "fastest" | "car" | "driving" | "auto" => Ok("auto"),
        "bike" | "bicycle" | "cycling" => Ok("bicycle"),
        "foot" | "walking" | "pedestrian" => Ok("pedestrian"),
        "bus" | "truck" | "motor_scooter" | "motorcycle" => Ok(profile),
        other => Err(RoutingError::Permanent(format!("Valhalla has no costing for profile '{other}'"))),
    }
}

#[derive(Debug, Serialize)]
struct ValhallaRequest<'a> {
    locations: [ValhallaLocation; 2],
    costing: &'a str,
    units: &'static str,
    directions_type: &'static str,
}

#[derive(Debug, Serialize)]
struct ValhallaLocation {
    lat: f64,
    lon: f64,
}

impl<'a> ValhallaRequest<'a> {
    fn new(request: &'a RouteRequest) -> Result<Self, RoutingError> {
        let (origin, destination) = (request.pair.origin, request.pair.destination);
        Ok(Self {
            locations: [
                ValhallaLocation { lat: origin.y, lon: origin.x },
                ValhallaLocation { lat: destination.y, lon: destination.x },
            ],
            costing: costing(request.profile.as_str())?,
            units: "kilometers",
            directions_type: "none",
        })
    }
}

#[derive(Debug, Deserialize)]
struct ValhallaResponse {
    trip: ValhallaTrip,
}

#[derive(Debug, Deserialize)]
struct ValhallaTrip {
    status: i32,
    status_message: Option<String>,
    legs: Vec<ValhallaLeg>,
    summary: ValhallaSummary,
}

#[derive(Debug, Deserialize)]
struct ValhallaLeg {
    shape: String,
}

#[derive(Debug, Deserialize)]
struct ValhallaSummary {
    /// in kilometers
    length: f64,
    /// in seconds
    time: f64,
}

impl ValhallaResponse {
    fn into_route(self) -> Result<Route, RoutingError> {
        let trip = self.trip;
        if trip.status != 0 {
            return Err(RoutingError::Permanent(format!(
                "Valhalla status {}: {}", trip.status, trip.status_message.unwrap_or_default()
            )));
        }

        let mut coords = Vec::new();
        for leg in &trip.legs {
            let shape = polyline::decode(&leg.shape, SHAPE_PRECISION)
                .map_err(|err| RoutingError::Permanent(format!("Invalid route shape: {err}")))?;
            // Legs share their connecting point
            let skip = usize::from(!coords.is_empty());
            coords.extend(shape.0.into_iter().skip(skip));
        }

        Ok(Route::new(
            LineString::new(coords),
            trip.summary.length * 1_000.0,
            trip.summary.time,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use crate::test_server::{CannedResponse, TestServer};
    use common::types::{OdPair, PairId, Profile};
    use geo::Coord;

    const TRIP: &str = r#"{
        "trip": {
            "locations": [],
            "legs": [{"shape": "_p~iF~ps|U_ulLnnqC_mqNvxq`@", "summary": {}}],
            "summary": {"length": 2.35, "time": 512.4},
            "status_message": "Found route between points",
            "status": 0,
            "units": "kilometers"
        }
    }"#;

    fn request(profile: &str) -> RouteRequest {
        let pair = OdPair {
            id: PairId(0),
            origin_id: "S02001616".into(),
            destination_id: "S02001620".into(),
            origin: Coord { x: -3.19, y: 55.95 },
            destination: Coord { x: -3.17, y: 55.94 },
            weight: 4.0,
        };
        RouteRequest::new(pair, Profile::from(profile))
    }

    #[test]
    fn test_request_body() {
        let request = request("bike");

        let body = serde_json::to_value(ValhallaRequest::new(&request).unwrap()).unwrap();

        assert_eq!(body["costing"], "bicycle");
        assert_eq!(body["locations"][0]["lat"], 55.95);
        assert_eq!(body["locations"][1]["lon"], -3.17);
    }

    #[test]
    fn test_default_profile_is_auto() {
        let request = request("fastest");

        assert_eq!(ValhallaRequest::new(&request).unwrap().costing, "auto");
    }

    #[test]
    fn test_unknown_costing_is_permanent() {
        let request = request("quietest");

        assert_eq!(ValhallaRequest::new(&request).unwrap_err().kind(), ErrorKind::Permanent);
    }

    #[test]
    fn test_parse_trip() {
        let route = serde_json::from_str::<ValhallaResponse>(TRIP).unwrap().into_route().unwrap();

        assert!((route.distance - 2350.0).abs() < 1e-6);
        assert_eq!(route.duration, 512.4);
        assert_eq!(route.geometry.0.len(), 3);
        assert!((route.geometry.0[0].x - -12.02).abs() < 1e-9);
        assert!((route.geometry.0[0].y - 3.85).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_route_over_http() {
        let server = TestServer::start(vec![CannedResponse::json(200, TRIP)]).await;
        let provider = ValhallaProvider::new(reqwest::Client::new(), &server.url()).unwrap();

        let route = provider.route(&request("walking"), &QuotaTracker::unknown()).await.unwrap();

        assert_eq!(route.duration, 512.4);
        let requests = server.requests();
        assert_eq!(requests[0].method, "POST");
        assert_eq!(requests[0].path, "/route");
        let body: serde_json::Value = serde_json::from_str(&requests[0].body).unwrap();
        assert_eq!(body["costing"], "pedestrian");
        assert_eq!(body["locations"][0]["lon"], -3.19);
    }

    #[tokio::test]
    async fn test_error_status_over_http() {
        let server = TestServer::start(vec![
            CannedResponse::json(429, r#"{"error": "Too many requests"}"#),
            CannedResponse::json(503, r#"{"error": "Service unavailable"}"#),
        ]).await;
        let provider = ValhallaProvider::new(reqwest::Client::new(), &server.url()).unwrap();

        let rate_limited = provider.route(&request("bike"), &QuotaTracker::unknown()).await.unwrap_err();
        let unavailable = provider.route(&request("bike"), &QuotaTracker::unknown()).await.unwrap_err();

        assert_eq!(rate_limited.kind(), ErrorKind::RateLimit);
        assert_eq!(unavailable.kind(), ErrorKind::Transient);
    }
}
