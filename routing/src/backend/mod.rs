mod command;
mod crow_fly;
mod cyclestreets;
mod cyclestreets_batch;
mod graphhopper;
pub(crate) mod http;
mod osrm;
mod valhalla;

pub use command::CommandProvider;
pub use crow_fly::CrowFlyProvider;
pub use cyclestreets::CycleStreetsProvider;
pub use cyclestreets_batch::BatchJobs;
pub use graphhopper::GraphHopperProvider;
pub use osrm::OsrmProvider;
pub use valhalla::ValhallaProvider;

use crate::errors::{BackendError, RoutingError};
use crate::quota::{QuotaSnapshot, QuotaTracker};
use crate::route::{Route, RouteRequest};
use async_trait::async_trait;
use common::types::backend::{BackendConfig, BackendKind, Bounds};
use common::types::PairId;
use common::util::distance::Distance;
use log::debug;
use std::time::{Duration, Instant};

/// Uniform access to a routing engine. Implementations only route; retries, timeouts and
/// throttling are up to the caller.
#[async_trait]
pub trait RoutingBackend: Send + Sync {
    fn name(&self) -> &str;

    async fn route(&self, request: &RouteRequest) -> Result<Route, RoutingError>;

    /// How many requests a single `route_batch` call handles efficiently
    fn max_batch_size(&self) -> usize {
        1
    }

    /// Routes several requests. Returns one result per request, a failing request does not fail
    /// the others.
    async fn route_batch(&self, requests: &[RouteRequest]) -> Vec<(PairId, Result<Route, RoutingError>)> {
        let mut results = Vec::with_capacity(requests.len());
        for request in requests {
            results.push((request.id(), self.route(request).await));
        }
        results
    }

    /// How long the caller lets a single `route_batch` call run. `None` if the backend bounds its
    /// batches itself, e.g. jobs on the server with their own timeouts.
    fn batch_timeout(&self, request_timeout: Duration) -> Option<Duration> {
        Some(request_timeout)
    }

    fn quota(&self) -> Option<QuotaSnapshot> {
        None
    }
}

/// The supported routing engines
pub enum Provider {
    CycleStreets(CycleStreetsProvider),
    Osrm(OsrmProvider),
    Valhalla(ValhallaProvider),
    GraphHopper(GraphHopperProvider),
    Command(CommandProvider),
    CrowFly(CrowFlyProvider),
}

impl Provider {
    async fn route(&self, request: &RouteRequest, quota: &QuotaTracker) -> Result<Route, RoutingError> {
        match self {
            Provider::CycleStreets(provider) => provider.route(request, quota).await,
            Provider::Osrm(provider) => provider.route(request, quota).await,
            Provider::Valhalla(provider) => provider.route(request, quota).await,
            Provider::GraphHopper(provider) => provider.route(request, quota).await,
            Provider::Command(provider) => provider.route(request).await,
            Provider::CrowFly(provider) => provider.route(request),
        }
    }

    fn max_batch_size(&self) -> usize {
        match self {
            Provider::Command(provider) => provider.batch_size(),
            Provider::CycleStreets(provider) => provider.max_batch_size(),
            _ => 1,
        }
    }

    fn batch_timeout(&self, request_timeout: Duration) -> Option<Duration> {
        match self {
            Provider::CycleStreets(provider) if provider.runs_jobs() => None,
            _ => Some(request_timeout),
        }
    }
}

/// A configured routing engine. Requests the engine can't answer (outside its bounds, too long,
/// quota used up) are rejected before the engine is contacted.
pub struct Backend {
    name: String,
    bounds: Option<Bounds>,
    max_distance: Option<Distance>,
    quota: QuotaTracker,
    provider: Provider,
}

impl Backend {
    pub fn new(name: &str, provider: Provider) -> Self {
        Self {
            name: name.to_string(),
            bounds: None,
            max_distance: None,
            quota: QuotaTracker::unknown(),
            provider,
        }
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = Some(bounds);
        self
    }

    pub fn with_max_distance(mut self, max_distance: Distance) -> Self {
        self.max_distance = Some(max_distance);
        self
    }

    pub fn with_quota(mut self, limit: u64) -> Self {
        self.quota = QuotaTracker::with_limit(limit);
        self
    }

    pub fn from_config(config: &BackendConfig, client: reqwest::Client) -> Result<Self, BackendError> {
        let provider = match &config.kind {
            BackendKind::CycleStreets { base_url, api_key, batch } => {
                let api_key = api_key.resolve()?;
                let mut provider = CycleStreetsProvider::new(client.clone(), base_url, api_key.clone())?;
                if let Some(batch) = batch {
                    provider = provider.with_batch_jobs(BatchJobs::new(client, batch, api_key)?);
                }
                Provider::CycleStreets(provider)
            }
            BackendKind::Osrm { base_url } => Provider::Osrm(OsrmProvider::new(client, base_url)?),
            BackendKind::Valhalla { base_url } => Provider::Valhalla(ValhallaProvider::new(client, base_url)?),
            BackendKind::GraphHopper { base_url, api_key } => {
                let api_key = api_key.as_ref().map(|key| key.resolve()).transpose()?;
                Provider::GraphHopper(GraphHopperProvider::new(client, base_url, api_key)?)
            }
            BackendKind::Command { program, args, batch_size } => {
                if *batch_size == 0 {
                    return Err(BackendError::InvalidConfig(format!("{}: batch_size must be at least 1", config.name)));
                }
                Provider::Command(CommandProvider::new(program, args.clone(), *batch_size))
            }
            BackendKind::CrowFly => Provider::CrowFly(CrowFlyProvider),
        };
        debug!(target: "backend", "Configured backend {} ({})", config.name, config.kind.label());

        let mut backend = Backend::new(&config.name, provider);
        if let Some(bounds) = config.bounds {
            backend = backend.with_bounds(bounds);
        }
        if let Some(max_distance) = config.max_distance {
            backend = backend.with_max_distance(max_distance);
        }
        if let Some(quota) = config.quota {
            backend = backend.with_quota(quota);
        }
        Ok(backend)
    }

    pub fn provider(&self) -> &Provider {
        &self.provider
    }

    fn admit(&self, request: &RouteRequest) -> Result<(), RoutingError> {
        let pair = &request.pair;
        if let Some(bounds) = &self.bounds {
            if !bounds.contains(&pair.origin) || !bounds.contains(&pair.destination) {
                return Err(RoutingError::Permanent(format!(
                    "Pair {} ({} -> {}) is outside the area supported by {}",
                    pair.id, pair.origin_id, pair.destination_id, self.name
                )));
            }
        }
        if let Some(max_distance) = self.max_distance {
            let distance = Distance::between(&pair.origin, &pair.destination);
            if distance.0 > max_distance.0 {
                return Err(RoutingError::Permanent(format!(
                    "Pair {} is {:.0}m apart, {} routes at most {:.0}m",
                    pair.id, distance.0, self.name, max_distance.0
                )));
            }
        }
        if !self.quota.try_acquire() {
            let retry_after = self.quota.snapshot()
                .and_then(|snapshot| snapshot.reset_at)
                .map(|reset_at| reset_at.saturating_duration_since(Instant::now()));
            return Err(RoutingError::RateLimited {
                retry_after,
                message: format!("Quota of {} is exhausted", self.name),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl RoutingBackend for Backend {
    fn name(&self) -> &str {
        &self.name
    }

    async fn route(&self, request: &RouteRequest) -> Result<Route, RoutingError> {
        self.admit(request)?;
        self.provider.route(request, &self.quota).await
    }

    fn max_batch_size(&self) -> usize {
        self.provider.max_batch_size()
    }

    fn batch_timeout(&self, request_timeout: Duration) -> Option<Duration> {
        self.provider.batch_timeout(request_timeout)
    }

    async fn route_batch(&self, requests: &[RouteRequest]) -> Vec<(PairId, Result<Route, RoutingError>)> {
        let mut results = Vec::with_capacity(requests.len());
        let mut admitted = Vec::with_capacity(requests.len());
        for request in requests {
            match self.admit(request) {
                Ok(()) => admitted.push(request.clone()),
                Err(err) => results.push((request.id(), Err(err))),
            }
        }
        if admitted.is_empty() {
            return results;
        }

        match &self.provider {
            Provider::Command(provider) => results.extend(provider.route_batch(&admitted).await),
            Provider::CycleStreets(provider) => results.extend(provider.route_batch(&admitted, &self.quota).await),
            provider => {
                for request in &admitted {
                    results.push((request.id(), provider.route(request, &self.quota).await));
                }
            }
        }
        results
    }

    fn quota(&self) -> Option<QuotaSnapshot> {
        self.quota.snapshot()
    }
}
