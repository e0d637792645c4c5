use chrono::{Duration, TimeDelta};

#[derive(Copy, Clone, Debug, PartialEq)]
pub struct Speed(pub f64); // in km/h

pub const WALKING_SPEED: Speed = Speed(5f64);
pub const CYCLING_SPEED: Speed = Speed(15f64);
pub const DRIVING_SPEED: Speed = Speed(40f64);

impl Speed {
    pub fn time_to_travel_distance(&self, meters: f32) -> Duration {
        let hours = (1.0 / self.0) * (meters as f64 / 1_000.0);
        TimeDelta::milliseconds((hours * 60.0 * 60.0 * 1_000.0) as i64)
    }

    /// Typical travel speed for the mode a profile name refers to. Cycling plans like "fastest"
    /// or "quietest" fall back to cycling speed.
    pub fn for_profile(profile: &str) -> Self {
        match profile {
            "foot" | "walk" | "walking" | "pedestrian" => WALKING_SPEED,
            "car" | "driving" | "auto" => DRIVING_SPEED,
            _ => CYCLING_SPEED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_speed_to_distance() {
        assert_eq!(Duration::seconds(36), Speed(10.0).time_to_travel_distance(100.));
        assert_eq!(Duration::seconds(18), Speed(200.0).time_to_travel_distance(1_000.));
    }

    #[test]
    fn test_speed_for_profile() {
        assert_eq!(Speed::for_profile("foot"), WALKING_SPEED);
        assert_eq!(Speed::for_profile("driving"), DRIVING_SPEED);
        assert_eq!(Speed::for_profile("quietest"), CYCLING_SPEED);
    }
}
