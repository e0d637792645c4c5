use crate::errors::RoutingError;
use crate::route::{Route, RouteRequest};
use common::util::distance::Distance;
use common::util::speed::Speed;
use geo::LineString;

/// A pretty stupid router, that draws a straight line between origin and destination and travels
/// it at the typical speed of the profile's mode.
/// It basically always underestimates distance and duration, which makes it a useful baseline.
#[derive(Debug, Clone, Copy, Default)]
pub struct CrowFlyProvider;

impl CrowFlyProvider {
    pub fn route(&self, request: &RouteRequest) -> Result<Route, RoutingError> {
        let pair = &request.pair;
        let distance = Distance::between(&pair.origin, &pair.destination);
        let duration = Speed::for_profile(request.profile.as_str()).time_to_travel_distance(distance.0);

        Ok(Route::new(
            LineString::new(vec![pair.origin, pair.destination]),
            distance.0 as f64,
            duration.num_milliseconds() as f64 / 1_000.0,
        ))
    }
}
