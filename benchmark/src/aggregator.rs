use crate::result::RouteResult;
use common::types::{OdPair, PairId, Profile};
use hashbrown::HashMap;
use itertools::Itertools;
use log::warn;
use ordered_float::OrderedFloat;
use routing::ErrorKind;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// Statistics of one backend and profile. Latencies are in seconds and only cover successful
/// requests, failures are counted separately.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BenchmarkSummary {
    pub backend: String,
    pub profile: Profile,
    pub attempted: usize,
    pub succeeded: usize,
    /// Failed requests per error kind. Every kind is present.
    pub failures: BTreeMap<ErrorKind, usize>,
    pub retries: u64,
    /// From the first request started to the last one finished
    pub elapsed_secs: f64,
    /// Successful routes per second
    pub throughput: f64,
    pub success_rate: f64,
    pub error_rate: f64,
    pub latency: Option<LatencyStats>,
    /// in meters
    pub total_distance: f64,
    /// in seconds
    pub total_duration: f64,
    /// Sum of distance times pair weight, e.g. the distance travelled by all trips
    pub weighted_distance: f64,
    pub weighted_duration: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct LatencyStats {
    pub mean: f64,
    pub median: f64,
    pub p95: f64,
}

impl BenchmarkSummary {
    pub fn failed(&self) -> usize {
        self.failures.values().sum()
    }

    pub fn failures_of(&self, kind: ErrorKind) -> usize {
        self.failures.get(&kind).copied().unwrap_or(0)
    }
}

/// One summary per backend and profile, ordered by backend, then profile. The input order of the
/// results doesn't matter.
pub fn summarize(results: &[RouteResult]) -> Vec<BenchmarkSummary> {
    let mut groups: BTreeMap<(&str, &Profile), Vec<&RouteResult>> = BTreeMap::new();
    for result in results {
        groups.entry((result.backend.as_str(), &result.profile)).or_default().push(result);
    }

    groups.into_iter()
        .map(|((backend, profile), mut group)| {
            group.sort_by_key(|result| result.request_id);
            summarize_group(backend, profile, &group)
        })
        .collect()
}

fn summarize_group(backend: &str, profile: &Profile, group: &[&RouteResult]) -> BenchmarkSummary {
    let attempted = group.len();
    let succeeded = group.iter().filter(|result| result.is_success()).count();

    let mut failures: BTreeMap<ErrorKind, usize> = ErrorKind::ALL.iter().map(|kind| (*kind, 0)).collect();
    for kind in group.iter().filter_map(|result| result.failure_kind()) {
        *failures.entry(kind).or_default() += 1;
    }

    let elapsed_secs = match (
        group.iter().map(|result| result.started_at).min(),
        group.iter().map(|result| result.finished_at).max(),
    ) {
        (Some(start), Some(end)) => (end - start).num_microseconds()
            .map(|micros| micros.max(0) as f64 / 1_000_000.0)
            .unwrap_or(0.0),
        _ => 0.0,
    };
    let throughput = if elapsed_secs > 0.0 { succeeded as f64 / elapsed_secs } else { 0.0 };
    let success_rate = if attempted > 0 { succeeded as f64 / attempted as f64 } else { 0.0 };

    let successes = group.iter()
        .filter_map(|result| result.route().map(|route| (*result, route)))
        .collect_vec();
    let latencies = successes.iter().map(|(result, _)| result.latency.as_secs_f64()).collect_vec();

    BenchmarkSummary {
        backend: backend.to_string(),
        profile: profile.clone(),
        attempted,
        succeeded,
        failures,
        retries: group.iter().map(|result| result.retries() as u64).sum(),
        elapsed_secs,
        throughput,
        success_rate,
        error_rate: if attempted > 0 { 1.0 - success_rate } else { 0.0 },
        latency: latency_stats(latencies),
        total_distance: successes.iter().map(|(_, route)| route.distance).sum(),
        total_duration: successes.iter().map(|(_, route)| route.duration).sum(),
        weighted_distance: successes.iter().map(|(result, route)| route.distance * result.weight).sum(),
        weighted_duration: successes.iter().map(|(result, route)| route.duration * result.weight).sum(),
    }
}

fn latency_stats(latencies: Vec<f64>) -> Option<LatencyStats> {
    if latencies.is_empty() {
        return None;
    }
    let mean = latencies.iter().sum::<f64>() / latencies.len() as f64;
    let sorted = latencies.into_iter().map(OrderedFloat).sorted().collect_vec();

    Some(LatencyStats {
        mean,
        median: percentile(&sorted, 0.5),
        p95: percentile(&sorted, 0.95),
    })
}

/// Linear interpolation between the closest ranks
fn percentile(sorted: &[OrderedFloat<f64>], quantile: f64) -> f64 {
    let position = quantile * (sorted.len() - 1) as f64;
    let lower = position.floor() as usize;
    let upper = position.ceil() as usize;
    let fraction = position - lower as f64;

    sorted[lower].0 + (sorted[upper].0 - sorted[lower].0) * fraction
}

/// A result next to the pair it belongs to
#[derive(Debug, Clone, Copy)]
pub struct PairOutput<'a> {
    pub pair: &'a OdPair,
    pub result: &'a RouteResult,
}

/// Joins results with their pairs by id, sorted by backend, profile and pair id. Results of
/// unknown pairs are skipped.
pub fn pair_outputs<'a>(pairs: &'a [OdPair], results: &'a [RouteResult]) -> Vec<PairOutput<'a>> {
    let pairs_by_id: HashMap<PairId, &OdPair> = pairs.iter().map(|pair| (pair.id, pair)).collect();

    results.iter()
        .filter_map(|result| match pairs_by_id.get(&result.request_id) {
            Some(&pair) => Some(PairOutput { pair, result }),
            None => {
                warn!(target: "output", "Result for unknown pair {} of {}", result.request_id, result.backend);
                None
            }
        })
        .sorted_by(|a, b| {
            (&a.result.backend, &a.result.profile, a.pair.id)
                .cmp(&(&b.result.backend, &b.result.profile, b.pair.id))
        })
        .collect()
}

/// Best first. Reliability comes before speed, so a fast backend that fails a lot never ranks
/// above a slower, reliable one.
pub fn rank(summaries: &[BenchmarkSummary]) -> Vec<&BenchmarkSummary> {
    summaries.iter()
        .sorted_by(|a, b| compare_summaries(a, b))
        .collect()
}

fn compare_summaries(a: &BenchmarkSummary, b: &BenchmarkSummary) -> Ordering {
    OrderedFloat(b.success_rate).cmp(&OrderedFloat(a.success_rate))
        .then_with(|| OrderedFloat(b.throughput).cmp(&OrderedFloat(a.throughput)))
        .then_with(|| (&a.backend, &a.profile).cmp(&(&b.backend, &b.profile)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::result::RouteFailure;
    use chrono::{DateTime, TimeDelta, Utc};
    use geo::{Coord, LineString};
    use routing::Route;
    use std::time::Duration;

    fn start() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    fn success(id: u32, backend: &str, offset_ms: i64, latency_ms: u64, distance: f64) -> RouteResult {
        let geometry = LineString::new(vec![Coord { x: 0.0, y: 0.0 }, Coord { x: 0.01, y: 0.0 }]);
        RouteResult {
            request_id: PairId(id),
            backend: backend.into(),
            profile: Profile::from("fastest"),
            weight: 2.0,
            outcome: Ok(Route::new(geometry, distance, distance / 5.0)),
            attempts: 1,
            latency: Duration::from_millis(latency_ms),
            started_at: start() + TimeDelta::milliseconds(offset_ms),
            finished_at: start() + TimeDelta::milliseconds(offset_ms + latency_ms as i64),
        }
    }

    fn failure(id: u32, backend: &str, kind: ErrorKind, attempts: u32, offset_ms: i64) -> RouteResult {
        RouteResult {
            request_id: PairId(id),
            backend: backend.into(),
            profile: Profile::from("fastest"),
            weight: 1.0,
            outcome: Err(RouteFailure { kind, message: "failed".into() }),
            attempts,
            latency: Duration::from_millis(10),
            started_at: start() + TimeDelta::milliseconds(offset_ms),
            finished_at: start() + TimeDelta::milliseconds(offset_ms + 10),
        }
    }

    fn pair(id: u32) -> OdPair {
        OdPair {
            id: PairId(id),
            origin_id: format!("O{id}"),
            destination_id: format!("D{id}"),
            origin: Coord { x: 0.0, y: 0.0 },
            destination: Coord { x: 0.01, y: 0.0 },
            weight: 1.0,
        }
    }

    #[test]
    fn test_summarize_counts_and_rates() {
        let results = vec![
            success(0, "osrm", 0, 200, 1_000.0),
            success(1, "osrm", 100, 400, 3_000.0),
            failure(2, "osrm", ErrorKind::Permanent, 1, 1_990),
        ];

        let summaries = summarize(&results);

        assert_eq!(summaries.len(), 1);
        let summary = &summaries[0];
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.succeeded, 2);
        assert_eq!(summary.failures_of(ErrorKind::Permanent), 1);
        assert_eq!(summary.failures_of(ErrorKind::Timeout), 0);
        assert_eq!(summary.failed(), 1);
        assert!((summary.elapsed_secs - 2.0).abs() < 1e-9);
        assert!((summary.throughput - 1.0).abs() < 1e-9);
        assert!((summary.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((summary.error_rate - 1.0 / 3.0).abs() < 1e-9);
        assert_eq!(summary.total_distance, 4_000.0);
        assert_eq!(summary.weighted_distance, 8_000.0);
        let latency = summary.latency.unwrap();
        assert!((latency.mean - 0.3).abs() < 1e-9);
        assert!((latency.median - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_summarize_groups_by_backend_and_profile() {
        let mut walking = success(0, "osrm", 0, 100, 500.0);
        walking.profile = Profile::from("foot");
        let results = vec![
            success(0, "osrm", 0, 100, 500.0),
            success(0, "crow-fly", 0, 1, 400.0),
            walking,
        ];

        let summaries = summarize(&results);

        let groups = summaries.iter().map(|s| (s.backend.as_str(), s.profile.as_str())).collect_vec();
        assert_eq!(groups, vec![("crow-fly", "fastest"), ("osrm", "fastest"), ("osrm", "foot")]);
    }

    #[test]
    fn test_summarize_is_deterministic() {
        let mut results = vec![
            success(0, "osrm", 0, 120, 1_000.0),
            failure(1, "osrm", ErrorKind::Transient, 4, 50),
            success(2, "osrm", 70, 90, 2_500.0),
            failure(3, "osrm", ErrorKind::RateLimit, 3, 20),
        ];

        let first = summarize(&results);
        let second = summarize(&results);
        results.reverse();
        let reversed = summarize(&results);

        assert_eq!(first, second);
        assert_eq!(first, reversed);
        assert_eq!(first[0].retries, 5);
    }

    #[test]
    fn test_all_failures_have_no_latency_stats() {
        let results = (0..4).map(|id| failure(id, "osrm", ErrorKind::Permanent, 1, 0)).collect_vec();

        let summary = &summarize(&results)[0];

        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.attempted, 4);
        assert_eq!(summary.throughput, 0.0);
        assert_eq!(summary.error_rate, 1.0);
        assert!(summary.latency.is_none());
    }

    #[test]
    fn test_percentile() {
        let sorted = (1..=20).map(|value| OrderedFloat(value as f64)).collect_vec();

        assert_eq!(percentile(&sorted, 0.5), 10.5);
        assert!((percentile(&sorted, 0.95) - 19.05).abs() < 1e-9);
        assert_eq!(percentile(&sorted[..1], 0.95), 1.0);
    }

    #[test]
    fn test_pair_outputs_join_by_id() {
        let pairs = vec![pair(0), pair(1), pair(2)];
        let results = vec![
            success(2, "osrm", 0, 100, 500.0),
            failure(0, "osrm", ErrorKind::Permanent, 1, 0),
            success(1, "crow-fly", 0, 1, 400.0),
            success(7, "osrm", 0, 1, 400.0),
        ];

        let outputs = pair_outputs(&pairs, &results);

        assert_eq!(outputs.len(), 3);
        for output in &outputs {
            assert_eq!(output.pair.id, output.result.request_id);
        }
        assert_eq!(outputs[0].result.backend, "crow-fly");
        assert_eq!(outputs[1].pair.id, PairId(0));
        assert_eq!(outputs[2].pair.id, PairId(2));
    }

    #[test]
    fn test_rank_prefers_reliable_backends() {
        let fast_unreliable = vec![
            success(0, "fast", 0, 1, 100.0),
            failure(1, "fast", ErrorKind::Transient, 4, 1),
        ];
        let slow_reliable = vec![
            success(0, "slow", 0, 1_000, 100.0),
            success(1, "slow", 1_000, 1_000, 100.0),
        ];
        let summaries = summarize(&[fast_unreliable, slow_reliable].concat());

        let ranked = rank(&summaries);

        assert!(summaries[0].throughput > summaries[1].throughput);
        assert_eq!(ranked[0].backend, "slow");
        assert_eq!(ranked[1].backend, "fast");
    }
}
