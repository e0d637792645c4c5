pub mod bootstrap_config;
mod config;

use crate::config::{load_config, ConfigError};
use benchmark::output::{log_summary_table, write_results, OutputError};
use benchmark::{is_unreachable, pair_outputs, rank, summarize, RunnerConfig};
use bootstrap_config::{BootstrapConfig, Command, RunArgs};
use common::types::config::Config;
use common::types::dataset::Dataset;
use common::types::Profile;
use common::util::logging;
use data_harvester::{load_dataset, LoadError};
use itertools::Itertools;
use log::{debug, error, info, warn, SetLoggerError};
use routing::{Backend, BackendError, RoutingBackend};
use std::fmt::{Display, Formatter};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[tokio::main]
async fn main() -> ExitCode {
    run()
        .await
        .inspect_err(|err| error!(target: "main", "{}", err))
        .unwrap_or(ExitCode::FAILURE)
}

async fn run() -> Result<ExitCode, RouteBenchError> {
    let bootstrap_config = BootstrapConfig::read();

    logging::init(bootstrap_config.log_level.clone().into())?;

    let config = load_config(bootstrap_config.config_file.as_deref())?;

    match bootstrap_config.command {
        Command::Run(args) => run_benchmark(&config, args).await,
        Command::Backends => {
            list_backends(&config);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_benchmark(config: &Config, args: RunArgs) -> Result<ExitCode, RouteBenchError> {
    let runner_config = runner_config(&args)?;
    let backend_names = distinct(&args.backends);
    let profiles = distinct(&args.profiles).iter().map(|profile| Profile::from(profile.as_str())).collect_vec();

    // All backends are built before anything is loaded, so a typo fails fast
    let client = reqwest::Client::builder()
        .user_agent(concat!("routebench/", env!("CARGO_PKG_VERSION")))
        .build()
        .map_err(BackendError::from)?;
    let backends = backend_names.iter()
        .map(|name| {
            let backend_config = config.backend(name)
                .ok_or_else(|| BackendError::UnknownBackend(name.clone()))?;
            Backend::from_config(&backend_config, client.clone()).map(Arc::new)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let mut dataset = Dataset::from_location(&args.dataset);
    dataset.columns = config.dataset_columns();
    dataset.format = args.format.map(Into::into);
    dataset.limit = args.limit;
    let dataset_id = dataset.id.clone();

    let pairs = logging::run_with_spinner_async("main", &format!("Loading dataset {}", dataset_id), load_dataset(dataset))
        .await?;
    info!(target: "main", "Loaded {} pairs from {}", pairs.len(), dataset_id);

    let mut results = Vec::with_capacity(pairs.len() * backends.len() * profiles.len());
    for backend in &backends {
        for profile in &profiles {
            let report = benchmark::run(backend.clone(), &pairs, profile, &runner_config).await;
            if report.final_concurrency < runner_config.concurrency {
                info!(
                    target: "main",
                    "Concurrency for {} ({}) was reduced to {} because of rate limiting",
                    backend.name(), profile, report.final_concurrency
                );
            }
            if report.summary.as_ref().is_some_and(is_unreachable) {
                warn!(target: "main", "{} ({}) did not answer a single request", backend.name(), profile);
            }
            results.extend(report.results);
        }
    }

    let summaries = summarize(&results);
    let outputs = pair_outputs(&pairs, &results);
    let summary_path = logging::run_with_spinner("output", "Writing results", || {
        write_results(&args.output, &outputs, &summaries)
    })?;
    debug!(target: "main", "Summary written to {}", summary_path.display());

    log_summary_table(&rank(&summaries));

    // Failed pairs are part of the result. Only a run that reached no backend at all has failed.
    if !summaries.is_empty() && summaries.iter().all(is_unreachable) {
        return Err(RouteBenchError::Unreachable(backend_names));
    }

    Ok(ExitCode::SUCCESS)
}

fn runner_config(args: &RunArgs) -> Result<RunnerConfig, ConfigError> {
    if args.concurrency == 0 {
        return Err(ConfigError::InvalidArgument("--concurrency must be at least 1".into()));
    }
    if args.batch_size == 0 {
        return Err(ConfigError::InvalidArgument("--batch-size must be at least 1".into()));
    }
    let request_timeout = seconds("--timeout", args.timeout)?;
    let budget = args.budget.map(|budget| seconds("--budget", budget)).transpose()?;

    Ok(RunnerConfig {
        concurrency: args.concurrency,
        max_retries: args.retries,
        request_timeout,
        budget,
        batch_size: args.batch_size,
        ..RunnerConfig::default()
    })
}

/// Repeated names would benchmark the same pairs twice
fn distinct(names: &[String]) -> Vec<String> {
    names.iter().unique().cloned().collect()
}

fn seconds(argument: &str, value: f64) -> Result<Duration, ConfigError> {
    match Duration::try_from_secs_f64(value) {
        Ok(duration) if duration.is_zero() => Err(ConfigError::InvalidArgument(format!(
            "{} must be a positive number of seconds, got {}", argument, value
        ))),
        Ok(duration) if Instant::now().checked_add(duration).is_none() => Err(ConfigError::InvalidArgument(format!(
            "{} of {} seconds is too large", argument, value
        ))),
        Ok(duration) => Ok(duration),
        Err(_) => Err(ConfigError::InvalidArgument(format!(
            "{} must be a positive number of seconds, got {}", argument, value
        ))),
    }
}

fn list_backends(config: &Config) {
    for backend in config.backends() {
        let mut line = format!("{:<24} {}", backend.name, backend.kind.label());
        if let Some(bounds) = backend.bounds {
            line.push_str(&format!(
                ", bounds [{}, {}, {}, {}]", bounds.min_lon, bounds.min_lat, bounds.max_lon, bounds.max_lat
            ));
        }
        if let Some(max_distance) = backend.max_distance {
            line.push_str(&format!(", max distance {}m", max_distance.0));
        }
        if let Some(quota) = backend.quota {
            line.push_str(&format!(", quota {}", quota));
        }
        info!(target: "main", "{}", line);
    }
}

#[derive(thiserror::Error, Debug)]
enum RouteBenchError {
    Logging(#[from] SetLoggerError),
    Config(#[from] ConfigError),
    Backend(#[from] BackendError),
    Load(#[from] LoadError),
    Output(#[from] OutputError),
    Unreachable(Vec<String>),
}

impl Display for RouteBenchError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let (prefix, err): (&str, &dyn Display) = match self {
            RouteBenchError::Logging(err) => ("Initializing logging", err),
            RouteBenchError::Config(err) => ("Reading configuration", err),
            RouteBenchError::Backend(err) => ("Setting up backend", err),
            RouteBenchError::Load(err) => ("Loading dataset", err),
            RouteBenchError::Output(err) => ("Writing results", err),
            RouteBenchError::Unreachable(backends) => {
                return write!(f, "None of the backends could be reached: {}", backends.join(", "));
            }
        };
        write!(f, "{}: {}", prefix, err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn run_args(extra: &[&str]) -> RunArgs {
        let mut argv = vec!["routebench", "run", "--dataset", "od.csv", "--backend", "crow-fly", "--output", "out.csv"];
        argv.extend_from_slice(extra);
        match BootstrapConfig::try_parse_from(argv).unwrap().command {
            Command::Run(args) => args,
            Command::Backends => panic!("Expected run command"),
        }
    }

    #[test]
    fn test_runner_config_from_args() {
        let config = runner_config(&run_args(&["--timeout", "1.5", "--budget", "60", "--retries", "5"])).unwrap();

        assert_eq!(config.request_timeout, Duration::from_millis(1500));
        assert_eq!(config.budget, Some(Duration::from_secs(60)));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.concurrency, 4);
    }

    #[test]
    fn test_invalid_runner_config() {
        assert!(runner_config(&run_args(&["--concurrency", "0"])).is_err());
        assert!(runner_config(&run_args(&["--timeout", "0"])).is_err());
        assert!(runner_config(&run_args(&["--timeout=-3"])).is_err());
        assert!(runner_config(&run_args(&["--batch-size", "0"])).is_err());
    }

    #[test]
    fn test_repeated_names_run_once() {
        let args = run_args(&["--backend", "osrm", "--backend", "crow-fly", "--profile", "foot", "--profile", "foot"]);

        assert_eq!(distinct(&args.backends), vec!["crow-fly", "osrm"]);
        assert_eq!(distinct(&args.profiles), vec!["foot"]);
    }

    #[test]
    fn test_huge_budget_is_rejected() {
        let err = runner_config(&run_args(&["--budget", "1e19"])).unwrap_err();

        assert!(err.to_string().contains("too large"));
        assert!(runner_config(&run_args(&["--timeout", "1e19"])).is_err());
    }

    #[test]
    fn test_error_message_prefix() {
        let err = RouteBenchError::from(BackendError::UnknownBackend("teleport".into()));

        assert_eq!(err.to_string(), "Setting up backend: Unknown backend 'teleport'");
        assert_eq!(
            RouteBenchError::Unreachable(vec!["osrm".into()]).to_string(),
            "None of the backends could be reached: osrm"
        );
    }
}
