use crate::util::distance::Distance;
use geo::Coord;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fmt::{Debug, Display, Formatter};
use url::Url;

pub const OSRM_DEMO_SERVER: &str = "https://router.project-osrm.org";
pub const CYCLESTREETS_API: &str = "https://www.cyclestreets.net";
pub const CYCLESTREETS_BATCH_API: &str = "https://api.cyclestreets.net";
pub const GRAPHHOPPER_API: &str = "https://graphhopper.com/api/1";

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BackendConfig {
    pub name: String,
    #[serde(flatten)]
    pub kind: BackendKind,
    /// Requests with a coordinate outside these bounds are rejected without calling the backend
    pub bounds: Option<Bounds>,
    /// Requests for pairs further apart (in a straight line) than this are rejected
    pub max_distance: Option<Distance>,
    /// Number of calls the backend may receive. Exhaustion is treated like rate limiting.
    pub quota: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendKind {
    #[serde(rename = "cyclestreets")]
    CycleStreets {
        #[serde(default = "cyclestreets_url")]
        base_url: Url,
        api_key: ApiKey,
        /// Route batches as jobs on the CycleStreets servers instead of one journey per pair
        #[serde(default)]
        batch: Option<CycleStreetsBatch>,
    },
    Osrm {
        #[serde(default = "osrm_url")]
        base_url: Url,
    },
    Valhalla {
        base_url: Url,
    },
    #[serde(rename = "graphhopper")]
    GraphHopper {
        #[serde(default = "graphhopper_url")]
        base_url: Url,
        api_key: Option<ApiKey>,
    },
    /// A local routing engine that reads requests as JSON lines on stdin and answers with one JSON
    /// line per request on stdout
    Command {
        program: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default = "default_command_batch_size")]
        batch_size: usize,
    },
    CrowFly,
}

/// Access to the CycleStreets batch routing API, which needs an account with batch routing enabled
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CycleStreetsBatch {
    #[serde(default = "cyclestreets_batch_url")]
    pub base_url: Url,
    pub username: ApiKey,
    pub password: ApiKey,
    /// Pairs per job
    #[serde(default = "default_cyclestreets_batch_size")]
    pub batch_size: usize,
    /// Seconds between two status requests of a running job
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,
    /// Seconds a single call to the batch API may take
    #[serde(default = "default_batch_request_timeout")]
    pub request_timeout: u64,
    /// Seconds a job may take from start to results. A job still running after that is
    /// terminated.
    #[serde(default = "default_job_timeout")]
    pub job_timeout: u64,
    /// Routing server the jobs run on
    pub server_id: Option<u32>,
}

impl BackendKind {
    pub fn label(&self) -> &'static str {
        match self {
            BackendKind::CycleStreets { .. } => "cyclestreets",
            BackendKind::Osrm { .. } => "osrm",
            BackendKind::Valhalla { .. } => "valhalla",
            BackendKind::GraphHopper { .. } => "graphhopper",
            BackendKind::Command { .. } => "command",
            BackendKind::CrowFly => "crow_fly",
        }
    }
}

fn cyclestreets_url() -> Url {
    Url::parse(CYCLESTREETS_API).expect("Constant URL is valid")
}

fn cyclestreets_batch_url() -> Url {
    Url::parse(CYCLESTREETS_BATCH_API).expect("Constant URL is valid")
}

fn default_cyclestreets_batch_size() -> usize {
    1_000
}

fn default_poll_interval() -> u64 {
    10
}

fn default_batch_request_timeout() -> u64 {
    30
}

fn default_job_timeout() -> u64 {
    3_600
}

fn osrm_url() -> Url {
    Url::parse(OSRM_DEMO_SERVER).expect("Constant URL is valid")
}

fn graphhopper_url() -> Url {
    Url::parse(GRAPHHOPPER_API).expect("Constant URL is valid")
}

fn default_command_batch_size() -> usize {
    1
}

impl BackendConfig {
    /// Backends that are available without a config file
    pub fn builtin() -> Vec<BackendConfig> {
        vec![
            BackendConfig {
                name: "crow-fly".into(),
                kind: BackendKind::CrowFly,
                bounds: None,
                max_distance: None,
                quota: None,
            },
            BackendConfig {
                name: "osrm".into(),
                kind: BackendKind::Osrm { base_url: osrm_url() },
                bounds: None,
                max_distance: None,
                quota: None,
            },
        ]
    }
}

/// An API key, either given directly or read from an environment variable when the backend is
/// built
#[derive(Deserialize, Serialize, Clone)]
#[serde(
    untagged,
    expecting = "Invalid API key. Specify either the key itself or `env:` with the name of an environment variable holding it"
)]
pub enum ApiKey {
    Env { env: String },
    Literal(String),
}

impl ApiKey {
    pub fn resolve(&self) -> Result<String, ApiKeyError> {
        match self {
            ApiKey::Literal(key) => Ok(key.clone()),
            ApiKey::Env { env } => std::env::var(env).map_err(|_| ApiKeyError(env.clone())),
        }
    }
}

impl Debug for ApiKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            ApiKey::Literal(_) => write!(f, "ApiKey(***)"),
            ApiKey::Env { env } => write!(f, "ApiKey(env: {env})"),
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub struct ApiKeyError(pub String);

impl Display for ApiKeyError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Environment variable '{}' holding the API key is not set", self.0)
    }
}

/// WGS84 bounding box
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq)]
pub struct Bounds {
    pub min_lon: f64,
    pub min_lat: f64,
    pub max_lon: f64,
    pub max_lat: f64,
}

impl Bounds {
    pub fn contains(&self, coord: &Coord<f64>) -> bool {
        coord.x >= self.min_lon
            && coord.x <= self.max_lon
            && coord.y >= self.min_lat
            && coord.y <= self.max_lat
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bounds_contains() {
        // Roughly West Yorkshire
        let bounds = Bounds { min_lon: -2.2, min_lat: 53.5, max_lon: -1.2, max_lat: 54.0 };

        assert!(bounds.contains(&Coord { x: -1.55, y: 53.8 }));
        assert!(bounds.contains(&Coord { x: -2.2, y: 53.5 }));
        assert!(!bounds.contains(&Coord { x: 0.1, y: 53.8 }));
        assert!(!bounds.contains(&Coord { x: -1.55, y: 51.5 }));
    }

    #[test]
    fn test_parse_backend_config() {
        let yaml = r#"
name: cyclestreets-leeds
kind: cyclestreets
api_key:
  env: CYCLESTREETS_API_KEY
bounds: { min_lon: -2.2, min_lat: 53.5, max_lon: -1.2, max_lat: 54.0 }
max_distance: 30km
"#;
        let config: BackendConfig = serde_yml::from_str(yaml).unwrap();

        assert_eq!(config.name, "cyclestreets-leeds");
        assert!(matches!(config.kind, BackendKind::CycleStreets { batch: None, .. }));
        assert_eq!(config.max_distance.unwrap().0, 30_000.0);
        assert!(config.bounds.is_some());
        assert!(config.quota.is_none());
    }

    #[test]
    fn test_parse_cyclestreets_batch() {
        let yaml = r#"
name: cyclestreets-batch
kind: cyclestreets
api_key: secret
batch:
  username: { env: CYCLESTREETS_USERNAME }
  password: { env: CYCLESTREETS_PASSWORD }
  poll_interval: 30
"#;
        let config: BackendConfig = serde_yml::from_str(yaml).unwrap();

        match config.kind {
            BackendKind::CycleStreets { batch: Some(batch), .. } => {
                assert_eq!(batch.base_url.as_str(), "https://api.cyclestreets.net/");
                assert_eq!(batch.batch_size, 1_000);
                assert_eq!(batch.poll_interval, 30);
                assert_eq!(batch.request_timeout, 30);
                assert_eq!(batch.job_timeout, 3_600);
                assert!(batch.server_id.is_none());
            }
            other => panic!("Unexpected backend kind {}", other.label()),
        }
    }

    #[test]
    fn test_parse_command_backend_defaults() {
        let yaml = r#"
name: local-engine
kind: command
program: ./route-pairs
"#;
        let config: BackendConfig = serde_yml::from_str(yaml).unwrap();

        match config.kind {
            BackendKind::Command { program, args, batch_size } => {
                assert_eq!(program, "./route-pairs");
                assert!(args.is_empty());
                assert_eq!(batch_size, 1);
            }
            other => panic!("Unexpected backend kind {}", other.label()),
        }
    }

    #[test]
    fn test_literal_api_key_resolves_and_is_hidden() {
        let key = ApiKey::Literal("secret".into());

        assert_eq!(key.resolve().unwrap(), "secret");
        assert!(!format!("{key:?}").contains("secret"));
    }
}
