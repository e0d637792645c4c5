pub mod aggregator;
pub mod output;
pub mod result;
pub mod runner;

pub use aggregator::{pair_outputs, rank, summarize, BenchmarkSummary, PairOutput};
pub use result::{RouteFailure, RouteResult};
pub use runner::{run, RunReport, RunnerConfig};

use routing::ErrorKind;

/// A backend is unreachable if nothing could be routed and every failure looks like a network
/// problem
pub fn is_unreachable(summary: &BenchmarkSummary) -> bool {
    summary.succeeded == 0
        && summary.attempted > 0
        && summary.failures_of(ErrorKind::Transient) == summary.attempted
}
