use chrono::{DateTime, Utc};
use common::types::{PairId, Profile};
use routing::{ErrorKind, Route, RoutingError};
use serde::Serialize;
use std::fmt;
use std::fmt::Display;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RouteFailure {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<RoutingError> for RouteFailure {
    fn from(err: RoutingError) -> Self {
        Self { kind: err.kind(), message: err.to_string() }
    }
}

impl Display for RouteFailure {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

/// The outcome of one routing request
#[derive(Debug, Clone, PartialEq)]
pub struct RouteResult {
    pub request_id: PairId,
    pub backend: String,
    pub profile: Profile,
    /// Weight of the routed pair
    pub weight: f64,
    pub outcome: Result<Route, RouteFailure>,
    /// Number of backend calls made for this request. 0 if none was made, because the
    /// budget ran out or the quota was exhausted before the first one.
    pub attempts: u32,
    /// Duration of the last attempt. For batches, the duration of the whole batch call.
    pub latency: Duration,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RouteResult {
    pub fn is_success(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn failure_kind(&self) -> Option<ErrorKind> {
        self.outcome.as_ref().err().map(|failure| failure.kind)
    }

    pub fn route(&self) -> Option<&Route> {
        self.outcome.as_ref().ok()
    }
}
