use crate::aggregator::{summarize, BenchmarkSummary};
use crate::result::{RouteFailure, RouteResult};
use chrono::{DateTime, Utc};
use common::types::{OdPair, PairId, Profile};
use common::util::logging::run_with_pb_async;
use futures::FutureExt;
use hashbrown::{HashMap, HashSet};
use itertools::Itertools;
use log::{debug, error, info, warn};
use routing::{Route, RouteRequest, RoutingBackend, RoutingError};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;
use tokio::time::{sleep, sleep_until, timeout, timeout_at, Instant};

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Maximum number of backend calls in flight. Shrinks when the backend rate limits.
    pub concurrency: usize,
    /// Retries per request after transient errors and rate limiting
    pub max_retries: u32,
    /// Wait before the first retry, doubled for every further retry
    pub initial_backoff: Duration,
    /// Timeout of a single backend call
    pub request_timeout: Duration,
    /// Wall-clock budget for the whole run. Requests still running when it is used up are
    /// cancelled.
    pub budget: Option<Duration>,
    /// Pairs per backend call, if the backend supports batches
    pub batch_size: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            request_timeout: Duration::from_secs(30),
            budget: None,
            batch_size: 1,
        }
    }
}

pub struct RunReport {
    /// One result per pair, in no particular order
    pub results: Vec<RouteResult>,
    /// `None` if there were no pairs
    pub summary: Option<BenchmarkSummary>,
    pub final_concurrency: usize,
}

/// Routes all pairs with the backend and profile
pub async fn run<B: RoutingBackend + 'static>(
    backend: Arc<B>,
    pairs: &[OdPair],
    profile: &Profile,
    config: &RunnerConfig,
) -> RunReport {
    let batch_size = if config.batch_size > 1 {
        config.batch_size.min(backend.max_batch_size()).max(1)
    } else {
        1
    };
    let context = Arc::new(Context {
        limit: AdaptiveLimit::new(config.concurrency.max(1)),
        // A budget too large to be represented is no budget
        deadline: config.budget.and_then(|budget| Instant::now().checked_add(budget)),
        batched: batch_size > 1,
        backend,
        config: config.clone(),
    });
    let requests = pairs.iter()
        .map(|pair| RouteRequest::new(pair.clone(), profile.clone()))
        .collect_vec();
    let task = format!("Routing {} pairs with {} ({})", pairs.len(), context.backend.name(), profile);

    let results = run_with_pb_async("runner", &task, pairs.len() as u64, true, |pb| {
        let context = context.clone();
        async move {
            let mut workers = JoinSet::new();
            for chunk in requests.chunks(batch_size) {
                workers.spawn(run_chunk_guarded(context.clone(), chunk.to_vec()));
            }

            let mut results = Vec::with_capacity(pairs.len());
            while let Some(joined) = workers.join_next().await {
                match joined {
                    Ok(chunk_results) => {
                        pb.inc(chunk_results.len() as u64);
                        results.extend(chunk_results);
                    }
                    Err(err) => error!(target: "runner", "Worker failed: {}", err),
                }
            }
            results
        }
    }).await;

    let results = complete(results, pairs, &context, profile);
    let summary = summarize(&results).into_iter().next();
    if let Some(summary) = &summary {
        info!(
            target: "runner",
            "{} ({}): {}/{} routes in {:.2}s, {:.2} routes/s",
            summary.backend, summary.profile, summary.succeeded, summary.attempted,
            summary.elapsed_secs, summary.throughput
        );
    }

    RunReport { results, summary, final_concurrency: context.limit.current() }
}

/// Adds a failure for every pair whose worker got lost
fn complete<B: RoutingBackend>(
    mut results: Vec<RouteResult>,
    pairs: &[OdPair],
    context: &Context<B>,
    profile: &Profile,
) -> Vec<RouteResult> {
    let seen: HashSet<PairId> = results.iter().map(|result| result.request_id).collect();
    let now = Utc::now();
    for pair in pairs.iter().filter(|pair| !seen.contains(&pair.id)) {
        results.push(RouteResult {
            request_id: pair.id,
            backend: context.backend.name().to_string(),
            profile: profile.clone(),
            weight: pair.weight,
            outcome: Err(RouteFailure::from(RoutingError::Permanent("Worker failed".into()))),
            attempts: 0,
            latency: Duration::ZERO,
            started_at: now,
            finished_at: now,
        });
    }
    results
}

struct Context<B> {
    backend: Arc<B>,
    config: RunnerConfig,
    limit: AdaptiveLimit,
    deadline: Option<Instant>,
    batched: bool,
}

impl<B> Context<B> {
    fn budget_spent(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// A concurrency limit that can shrink while permits are handed out. Permits that can't be taken
/// away right now are forgotten when they are released.
struct AdaptiveLimit {
    semaphore: Arc<Semaphore>,
    limit: AtomicUsize,
    debt: AtomicUsize,
}

impl AdaptiveLimit {
    fn new(limit: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(limit)),
            limit: AtomicUsize::new(limit),
            debt: AtomicUsize::new(0),
        }
    }

    fn current(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    async fn acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.semaphore.clone().acquire_owned().await.ok()
    }

    fn release(&self, permit: OwnedSemaphorePermit) {
        let owed = self.debt
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |debt| debt.checked_sub(1))
            .is_ok();
        if owed {
            permit.forget();
        }
    }

    /// Never below 1. Returns the new limit.
    fn halve(&self) -> usize {
        let current = self.current();
        self.shrink_to(current / 2);
        self.current()
    }

    fn shrink_to(&self, target: usize) -> bool {
        let target = target.max(1);
        let Ok(previous) = self.limit.fetch_update(Ordering::AcqRel, Ordering::Acquire, |limit| {
            (target < limit).then_some(target)
        }) else {
            return false;
        };

        let surplus = previous - target;
        let forgotten = self.semaphore.forget_permits(surplus);
        self.debt.fetch_add(surplus - forgotten, Ordering::AcqRel);
        true
    }
}

struct PairState {
    request: RouteRequest,
    attempts: u32,
    latency: Duration,
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
    outcome: Option<Result<Route, RoutingError>>,
}

impl PairState {
    fn new(request: RouteRequest) -> Self {
        Self { request, attempts: 0, latency: Duration::ZERO, started_at: None, finished_at: None, outcome: None }
    }

    fn finish(&mut self, outcome: Result<Route, RoutingError>) {
        self.outcome = Some(outcome);
        self.finished_at = Some(Utc::now());
    }

    fn into_result(self, backend: &str) -> RouteResult {
        let now = Utc::now();
        let outcome = self.outcome.unwrap_or(Err(RoutingError::Timeout));
        RouteResult {
            request_id: self.request.id(),
            backend: backend.to_string(),
            weight: self.request.pair.weight,
            profile: self.request.profile,
            outcome: outcome.map_err(RouteFailure::from),
            attempts: self.attempts,
            latency: self.latency,
            started_at: self.started_at.unwrap_or(now),
            finished_at: self.finished_at.unwrap_or(now),
        }
    }
}

/// A panicking backend fails its pairs, not the run
async fn run_chunk_guarded<B: RoutingBackend + 'static>(
    context: Arc<Context<B>>,
    chunk: Vec<RouteRequest>,
) -> Vec<RouteResult> {
    let fallback = chunk.iter().map(|request| (request.id(), request.pair.weight, request.profile.clone())).collect_vec();
    let started_at = Utc::now();

    match AssertUnwindSafe(run_chunk(context.clone(), chunk)).catch_unwind().await {
        Ok(results) => results,
        Err(_) => {
            error!(target: "runner", "{} panicked while routing {} pairs", context.backend.name(), fallback.len());
            let finished_at = Utc::now();
            fallback.into_iter()
                .map(|(request_id, weight, profile)| RouteResult {
                    request_id,
                    backend: context.backend.name().to_string(),
                    profile,
                    weight,
                    outcome: Err(RouteFailure::from(RoutingError::Permanent("Backend panicked".into()))),
                    attempts: 1,
                    latency: Duration::ZERO,
                    started_at,
                    finished_at,
                })
                .collect()
        }
    }
}

async fn run_chunk<B: RoutingBackend>(context: Arc<Context<B>>, chunk: Vec<RouteRequest>) -> Vec<RouteResult> {
    let mut states = chunk.into_iter().map(PairState::new).collect_vec();

    let work = route_chunk(&context, &mut states);
    match context.deadline {
        Some(deadline) => {
            if timeout_at(deadline, work).await.is_err() {
                let cancelled = states.iter().filter(|state| state.outcome.is_none()).count();
                debug!(target: "runner", "Budget used up, cancelled {} requests", cancelled);
            }
        }
        None => work.await,
    }

    let backend = context.backend.name();
    states.into_iter().map(|state| state.into_result(backend)).collect()
}

/// Routes the pairs of a chunk until each one has an outcome
async fn route_chunk<B: RoutingBackend>(context: &Context<B>, states: &mut [PairState]) {
    let config = &context.config;
    let mut round = 0u32;

    loop {
        let pending = (0..states.len()).filter(|&i| states[i].outcome.is_none()).collect_vec();
        if pending.is_empty() {
            return;
        }
        let Some(permit) = context.limit.acquire().await else {
            return;
        };
        // Pairs left without outcome are recorded as timeouts
        if context.budget_spent() {
            context.limit.release(permit);
            return;
        }

        if let Some(quota) = context.backend.quota() {
            if quota.remaining < context.limit.current() as u64 && context.limit.shrink_to(quota.remaining as usize) {
                debug!(target: "runner", "Only {} calls left, concurrency reduced to {}", quota.remaining, context.limit.current());
            }
            if quota.exhausted() {
                let now = std::time::Instant::now();
                let within_budget = |reset: std::time::Instant| {
                    context.deadline.map_or(true, |deadline| reset < deadline.into_std())
                };
                match quota.reset_at {
                    // Stale information, let the backend decide
                    Some(reset) if reset <= now => {}
                    Some(reset) if within_budget(reset) => {
                        context.limit.release(permit);
                        info!(target: "runner", "Quota of {} exhausted, waiting {:?} for the reset", context.backend.name(), reset - now);
                        sleep_until(Instant::from_std(reset)).await;
                        continue;
                    }
                    _ => {
                        context.limit.release(permit);
                        for &i in &pending {
                            states[i].finish(Err(RoutingError::RateLimited {
                                retry_after: None,
                                message: format!("Quota of {} exhausted", context.backend.name()),
                            }));
                        }
                        return;
                    }
                }
            }
        }

        let requests = pending.iter().map(|&i| states[i].request.clone()).collect_vec();
        let call_started_at = Utc::now();
        for &i in &pending {
            states[i].attempts += 1;
            states[i].started_at.get_or_insert(call_started_at);
        }
        let call_started = Instant::now();
        let mut replies: HashMap<PairId, Result<Route, RoutingError>> = call(context, &requests).await
            .into_iter()
            .collect();
        let latency = call_started.elapsed();
        context.limit.release(permit);

        let mut rate_limited = false;
        let mut wait = Duration::ZERO;
        for &i in &pending {
            let state = &mut states[i];
            state.latency = latency;
            let reply = replies.remove(&state.request.id()).unwrap_or_else(|| {
                Err(RoutingError::Permanent(format!("No reply for pair {}", state.request.id())))
            });

            match reply {
                Err(err) if err.is_retryable() && state.attempts <= config.max_retries => {
                    let backoff = config.initial_backoff.saturating_mul(1 << round.min(16));
                    let pause = match &err {
                        RoutingError::RateLimited { retry_after, .. } => {
                            rate_limited = true;
                            retry_after.unwrap_or(backoff)
                        }
                        _ => backoff,
                    };
                    debug!(target: "runner", "Retrying pair {} after {:?}: {}", state.request.id(), pause, err);
                    wait = wait.max(pause);
                }
                Err(err) => {
                    debug!(target: "runner", "Pair {} failed after {} attempts: {}", state.request.id(), state.attempts, err);
                    state.finish(Err(err));
                }
                Ok(route) => state.finish(Ok(route)),
            }
        }

        if rate_limited {
            let concurrency = context.limit.halve();
            warn!(target: "runner", "{} is rate limiting, concurrency reduced to {}", context.backend.name(), concurrency);
        }
        if states.iter().any(|state| state.outcome.is_none()) {
            sleep(wait).await;
            round += 1;
        }
    }
}

async fn call<B: RoutingBackend>(context: &Context<B>, requests: &[RouteRequest]) -> Vec<(PairId, Result<Route, RoutingError>)> {
    let request_timeout = context.config.request_timeout;
    let timed_out = || RoutingError::Transient(format!("No answer within {:?}", request_timeout));

    if context.batched {
        let batch = context.backend.route_batch(requests);
        // Still bounded by the budget
        let Some(batch_timeout) = context.backend.batch_timeout(request_timeout) else {
            return batch.await;
        };
        match timeout(batch_timeout, batch).await {
            Ok(replies) => replies,
            Err(_) => requests.iter().map(|request| (request.id(), Err(timed_out()))).collect(),
        }
    } else {
        let mut replies = Vec::with_capacity(requests.len());
        for request in requests {
            let reply = timeout(request_timeout, context.backend.route(request)).await
                .unwrap_or_else(|_| Err(timed_out()));
            replies.push((request.id(), reply));
        }
        replies
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::types::backend::{ApiKey, Bounds, CycleStreetsBatch};
    use geo::{Coord, LineString};
    use routing::backend::{BatchJobs, CrowFlyProvider, CycleStreetsProvider, OsrmProvider, Provider};
    use routing::quota::QuotaSnapshot;
    use routing::test_server::{CannedResponse, TestServer};
    use routing::{Backend, ErrorKind};
    use std::sync::atomic::AtomicU32;
    use std::time::Instant as StdInstant;

    fn pairs(n: u32) -> Vec<OdPair> {
        (0..n)
            .map(|id| OdPair {
                id: PairId(id),
                origin_id: format!("O{id}"),
                destination_id: format!("D{id}"),
                origin: Coord { x: -1.55, y: 53.80 },
                destination: Coord { x: -1.54 + id as f64 * 0.001, y: 53.81 },
                weight: 1.0,
            })
            .collect()
    }

    fn config(concurrency: usize) -> RunnerConfig {
        RunnerConfig {
            concurrency,
            max_retries: 3,
            initial_backoff: Duration::from_millis(1),
            request_timeout: Duration::from_secs(5),
            budget: None,
            batch_size: 1,
        }
    }

    fn route() -> Route {
        Route::new(LineString::new(vec![Coord { x: 0.0, y: 0.0 }, Coord { x: 0.01, y: 0.0 }]), 1_000.0, 200.0)
    }

    /// Answers after `delay`, failing the calls `fail_on` returns an error for
    struct MockBackend {
        delay: Duration,
        calls: AtomicU32,
        in_flight: AtomicUsize,
        max_in_flight: AtomicUsize,
        fail_on: Box<dyn Fn(u32, &RouteRequest) -> Option<RoutingError> + Send + Sync>,
    }

    impl MockBackend {
        fn new(delay: Duration, fail_on: impl Fn(u32, &RouteRequest) -> Option<RoutingError> + Send + Sync + 'static) -> Self {
            Self {
                delay,
                calls: AtomicU32::new(0),
                in_flight: AtomicUsize::new(0),
                max_in_flight: AtomicUsize::new(0),
                fail_on: Box::new(fail_on),
            }
        }

        fn succeeding(delay: Duration) -> Self {
            Self::new(delay, |_, _| None)
        }
    }

    #[async_trait]
    impl RoutingBackend for MockBackend {
        fn name(&self) -> &str {
            "mock"
        }

        async fn route(&self, request: &RouteRequest) -> Result<Route, RoutingError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let in_flight = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(in_flight, Ordering::SeqCst);
            sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            match (self.fail_on)(call, request) {
                Some(err) => Err(err),
                None => Ok(route()),
            }
        }
    }

    fn assert_one_result_per_pair(results: &[RouteResult], n: u32) {
        let ids = results.iter().map(|result| result.request_id.0).sorted().collect_vec();
        assert_eq!(ids, (0..n).collect_vec());
    }

    #[tokio::test]
    async fn test_one_result_per_request() {
        let backend = Arc::new(MockBackend::succeeding(Duration::from_millis(1)));

        let report = run(backend, &pairs(25), &Profile::from("fastest"), &config(4)).await;

        assert_one_result_per_pair(&report.results, 25);
        let summary = report.summary.unwrap();
        assert_eq!(summary.succeeded, 25);
        assert_eq!(summary.retries, 0);
        assert_eq!(report.final_concurrency, 4);
    }

    #[tokio::test]
    async fn test_no_pairs() {
        let backend = Arc::new(MockBackend::succeeding(Duration::ZERO));

        let report = run(backend, &[], &Profile::from("fastest"), &config(4)).await;

        assert!(report.results.is_empty());
        assert!(report.summary.is_none());
    }

    #[tokio::test]
    async fn test_permanent_errors_complete_the_run() {
        let backend = Arc::new(MockBackend::new(Duration::ZERO, |_, _| {
            Some(RoutingError::Permanent("bad request".into()))
        }));

        let report = run(backend.clone(), &pairs(10), &Profile::from("fastest"), &config(3)).await;

        let summary = report.summary.unwrap();
        assert_eq!(summary.attempted, 10);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.failures_of(ErrorKind::Permanent), 10);
        assert_eq!(summary.retries, 0);
        assert_eq!(backend.calls.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_respected() {
        let backend = Arc::new(MockBackend::succeeding(Duration::from_millis(10)));

        run(backend.clone(), &pairs(20), &Profile::from("fastest"), &config(3)).await;

        assert_eq!(backend.max_in_flight.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_sequential_run_takes_sum_of_latencies() {
        let delay = Duration::from_millis(20);
        let sequential = Arc::new(MockBackend::succeeding(delay));
        let parallel = Arc::new(MockBackend::succeeding(delay));

        let started = StdInstant::now();
        let report = run(sequential, &pairs(5), &Profile::from("fastest"), &config(1)).await;
        let sequential_time = started.elapsed();
        let started = StdInstant::now();
        run(parallel, &pairs(5), &Profile::from("fastest"), &config(5)).await;
        let parallel_time = started.elapsed();

        assert!(sequential_time >= delay * 5);
        assert!(report.summary.unwrap().elapsed_secs >= 0.1);
        assert!(parallel_time < sequential_time);
    }

    #[tokio::test]
    async fn test_pair_outside_bounds() {
        let bounds = Bounds { min_lon: -1.6, min_lat: 53.7, max_lon: -1.5, max_lat: 53.9 };
        let backend = Arc::new(Backend::new("crow-fly", Provider::CrowFly(CrowFlyProvider)).with_bounds(bounds));
        let mut pairs = pairs(3);
        pairs[1].destination = Coord { x: -0.12, y: 51.5 };

        let report = run(backend, &pairs, &Profile::from("foot"), &config(2)).await;

        let summary = report.summary.unwrap();
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failures_of(ErrorKind::Permanent), 1);
        assert!((summary.success_rate - 2.0 / 3.0).abs() < 1e-9);
        if summary.elapsed_secs > 0.0 {
            assert_eq!(summary.throughput, 2.0 / summary.elapsed_secs);
        }
        let outside = report.results.iter().find(|result| result.request_id == PairId(1)).unwrap();
        assert_eq!(outside.attempts, 1);
    }

    #[tokio::test]
    async fn test_rate_limit_reduces_concurrency() {
        let backend = Arc::new(MockBackend::new(Duration::from_millis(5), |call, _| {
            (call == 2).then(|| RoutingError::RateLimited {
                retry_after: Some(Duration::from_millis(10)),
                message: "429 Too Many Requests".into(),
            })
        }));

        let report = run(backend, &pairs(5), &Profile::from("fastest"), &config(4)).await;

        assert_one_result_per_pair(&report.results, 5);
        let summary = report.summary.unwrap();
        assert_eq!(summary.succeeded, 5);
        assert!(report.final_concurrency < 4);
        assert!(summary.retries <= 3);
        assert_eq!(summary.retries, 1);
    }

    #[tokio::test]
    async fn test_transient_error_is_retried() {
        let backend = Arc::new(MockBackend::new(Duration::ZERO, |call, _| {
            (call == 1).then(|| RoutingError::Transient("connection reset".into()))
        }));

        let report = run(backend, &pairs(1), &Profile::from("fastest"), &config(1)).await;

        assert!(report.results[0].is_success());
        assert_eq!(report.results[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_retries_are_bounded() {
        let backend = Arc::new(MockBackend::new(Duration::ZERO, |_, _| {
            Some(RoutingError::Transient("503 Service Unavailable".into()))
        }));

        let report = run(backend.clone(), &pairs(2), &Profile::from("fastest"), &config(2)).await;

        for result in &report.results {
            assert_eq!(result.attempts, 4);
            assert_eq!(result.failure_kind(), Some(ErrorKind::Transient));
        }
        assert_eq!(backend.calls.load(Ordering::SeqCst), 8);
    }

    #[tokio::test]
    async fn test_slow_calls_time_out_as_transient() {
        let backend = Arc::new(MockBackend::succeeding(Duration::from_millis(200)));
        let config = RunnerConfig { request_timeout: Duration::from_millis(10), max_retries: 1, ..config(1) };

        let report = run(backend, &pairs(1), &Profile::from("fastest"), &config).await;

        assert_eq!(report.results[0].failure_kind(), Some(ErrorKind::Transient));
        assert_eq!(report.results[0].attempts, 2);
    }

    #[tokio::test]
    async fn test_budget_expiry_marks_timeouts() {
        let backend = Arc::new(MockBackend::succeeding(Duration::from_secs(10)));
        let config = RunnerConfig { budget: Some(Duration::from_millis(50)), ..config(2) };

        let started = StdInstant::now();
        let report = run(backend, &pairs(6), &Profile::from("fastest"), &config).await;

        assert!(started.elapsed() < Duration::from_secs(5));
        assert_one_result_per_pair(&report.results, 6);
        let summary = report.summary.unwrap();
        assert_eq!(summary.failures_of(ErrorKind::Timeout), 6);
        let never_started = report.results.iter().filter(|result| result.attempts == 0).count();
        assert_eq!(never_started, 4);
    }

    /// The first two calls hang, every later call answers at once
    struct StallingBackend {
        calls: AtomicU32,
    }

    #[async_trait]
    impl RoutingBackend for StallingBackend {
        fn name(&self) -> &str {
            "stalling"
        }

        async fn route(&self, _request: &RouteRequest) -> Result<Route, RoutingError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) < 2 {
                sleep(Duration::from_secs(10)).await;
            }
            Ok(route())
        }
    }

    #[tokio::test]
    async fn test_nothing_starts_after_budget_expiry() {
        let backend = Arc::new(StallingBackend { calls: AtomicU32::new(0) });
        let config = RunnerConfig { budget: Some(Duration::from_millis(50)), ..config(2) };

        let report = run(backend.clone(), &pairs(6), &Profile::from("fastest"), &config).await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 2);
        let summary = report.summary.unwrap();
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.failures_of(ErrorKind::Timeout), 6);
        let never_started = report.results.iter().filter(|result| result.attempts == 0).count();
        assert_eq!(never_started, 4);
    }

    #[tokio::test]
    async fn test_unrepresentable_budget_is_unlimited() {
        let backend = Arc::new(MockBackend::succeeding(Duration::ZERO));
        let config = RunnerConfig { budget: Some(Duration::MAX), ..config(2) };

        let report = run(backend, &pairs(3), &Profile::from("fastest"), &config).await;

        assert_eq!(report.summary.unwrap().succeeded, 3);
    }

    #[tokio::test]
    async fn test_panicking_backend_fails_its_pair() {
        let backend = Arc::new(MockBackend::new(Duration::ZERO, |call, _| {
            if call == 1 {
                panic!("engine crashed");
            }
            None
        }));

        let report = run(backend, &pairs(3), &Profile::from("fastest"), &config(1)).await;

        assert_one_result_per_pair(&report.results, 3);
        let summary = report.summary.unwrap();
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failures_of(ErrorKind::Permanent), 1);
    }

    struct ExhaustedBackend {
        calls: AtomicU32,
    }

    #[async_trait]
    impl RoutingBackend for ExhaustedBackend {
        fn name(&self) -> &str {
            "exhausted"
        }

        async fn route(&self, _request: &RouteRequest) -> Result<Route, RoutingError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(route())
        }

        fn quota(&self) -> Option<QuotaSnapshot> {
            Some(QuotaSnapshot { limit: Some(100), remaining: 0, reset_at: None })
        }
    }

    #[tokio::test]
    async fn test_exhausted_quota_is_not_called() {
        let backend = Arc::new(ExhaustedBackend { calls: AtomicU32::new(0) });

        let report = run(backend.clone(), &pairs(4), &Profile::from("fastest"), &config(4)).await;

        assert_eq!(backend.calls.load(Ordering::SeqCst), 0);
        assert_eq!(report.summary.unwrap().failures_of(ErrorKind::RateLimit), 4);
        assert!(report.results.iter().all(|result| result.attempts == 0));
        assert_eq!(report.final_concurrency, 1);
    }

    /// Fails odd pairs, drops pair 4 from its reply and fails pair 2 once transiently
    struct BatchBackend {
        batches: AtomicU32,
        pair_2_calls: AtomicU32,
    }

    #[async_trait]
    impl RoutingBackend for BatchBackend {
        fn name(&self) -> &str {
            "batch"
        }

        async fn route(&self, _request: &RouteRequest) -> Result<Route, RoutingError> {
            panic!("Batches only");
        }

        fn max_batch_size(&self) -> usize {
            4
        }

        async fn route_batch(&self, requests: &[RouteRequest]) -> Vec<(PairId, Result<Route, RoutingError>)> {
            self.batches.fetch_add(1, Ordering::SeqCst);
            requests.iter()
                .filter(|request| request.id() != PairId(4))
                .map(|request| {
                    let result = match request.id().0 {
                        2 if self.pair_2_calls.fetch_add(1, Ordering::SeqCst) == 0 => {
                            Err(RoutingError::Transient("partial outage".into()))
                        }
                        id if id % 2 == 1 => Err(RoutingError::Permanent("no route".into())),
                        _ => Ok(route()),
                    };
                    (request.id(), result)
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn test_batches_with_partial_failures() {
        let backend = Arc::new(BatchBackend { batches: AtomicU32::new(0), pair_2_calls: AtomicU32::new(0) });
        let config = RunnerConfig { batch_size: 10, ..config(2) };

        let report = run(backend.clone(), &pairs(8), &Profile::from("fastest"), &config).await;

        assert_one_result_per_pair(&report.results, 8);
        let by_id: HashMap<u32, &RouteResult> = report.results.iter().map(|result| (result.request_id.0, result)).collect();
        assert!(by_id[&0].is_success());
        assert!(by_id[&2].is_success());
        assert_eq!(by_id[&2].attempts, 2);
        assert_eq!(by_id[&1].failure_kind(), Some(ErrorKind::Permanent));
        assert_eq!(by_id[&4].failure_kind(), Some(ErrorKind::Permanent));
        assert!(by_id[&6].is_success());
        // Two chunks of four plus one smaller retry batch for pair 2
        assert_eq!(backend.batches.load(Ordering::SeqCst), 3);
    }

    const OSRM_ROUTE: &str = r#"{
        "code": "Ok",
        "routes": [{"geometry": {"type": "LineString", "coordinates": [[-1.55, 53.8], [-1.54, 53.81]]}, "distance": 1310.0, "duration": 280.0}]
    }"#;

    #[tokio::test]
    async fn test_http_rate_limit_is_retried() {
        let server = TestServer::start(vec![
            CannedResponse::json(429, r#"{"message": "Too Many Requests"}"#).with_header("retry-after", "0"),
            CannedResponse::json(200, OSRM_ROUTE)
                .with_header("x-ratelimit-limit", "100")
                .with_header("x-ratelimit-remaining", "98"),
        ]).await;
        let provider = OsrmProvider::new(reqwest::Client::new(), &server.url()).unwrap();
        let backend = Arc::new(Backend::new("osrm-local", Provider::Osrm(provider)));

        let report = run(backend.clone(), &pairs(1), &Profile::from("fastest"), &config(2)).await;

        let result = &report.results[0];
        assert!(result.is_success());
        assert_eq!(result.attempts, 2);
        assert_eq!(result.retries(), 1);
        assert_eq!(result.route().unwrap().distance, 1310.0);
        assert_eq!(report.final_concurrency, 1);
        assert_eq!(server.requests().len(), 2);
        assert_eq!(backend.quota().unwrap().remaining, 98);
    }

    #[tokio::test]
    async fn test_batch_job_outlives_request_timeout() {
        let server = TestServer::start(vec![
            CannedResponse::json(200, r#"{"id": 77}"#),
            CannedResponse::json(200, r#"{}"#),
            CannedResponse::json(200, r#"{"id": 77, "status": "running"}"#),
        ]).await;
        let batch = CycleStreetsBatch {
            base_url: server.url(),
            username: ApiKey::Literal("leeds".into()),
            password: ApiKey::Literal("hunter2".into()),
            batch_size: 10,
            poll_interval: 1,
            request_timeout: 5,
            job_timeout: 3_600,
            server_id: None,
        };
        let client = reqwest::Client::new();
        let provider = CycleStreetsProvider::new(client.clone(), &server.url(), "secret".into()).unwrap()
            .with_batch_jobs(BatchJobs::new(client, &batch, "secret".into()).unwrap());
        let backend = Arc::new(Backend::new("cyclestreets-batch", Provider::CycleStreets(provider)));
        let config = RunnerConfig {
            request_timeout: Duration::from_millis(200),
            budget: Some(Duration::from_millis(600)),
            batch_size: 10,
            ..config(2)
        };

        let report = run(backend, &pairs(3), &Profile::from("quietest"), &config).await;
        // Termination of the abandoned job is sent in the background
        sleep(Duration::from_millis(300)).await;

        assert_one_result_per_pair(&report.results, 3);
        for result in &report.results {
            assert_eq!(result.failure_kind(), Some(ErrorKind::Timeout));
            assert_eq!(result.attempts, 1);
        }
        let requests = server.requests();
        assert_eq!(requests.iter().filter(|request| request.path == "/v2/batchroutes.createjob").count(), 1);
        let terminated = requests.iter()
            .filter(|request| request.form_value("action").as_deref() == Some("terminate"))
            .count();
        assert_eq!(terminated, 1);
    }
}
