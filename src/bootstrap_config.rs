use clap::{Args, Parser, Subcommand};
use common::types::dataset::DatasetFormat;
use log::LevelFilter;
use std::path::PathBuf;

#[derive(Parser, Clone)]
#[command(version, about)]
pub struct BootstrapConfig {
    /// YAML file with backend definitions. Without it only the built-in backends are available.
    #[clap(short('c'), long("config"), env("ROUTEBENCH_CONFIG"), global = true)]
    pub config_file: Option<String>,
    #[clap(short('l'), long("log-level"), env("ROUTEBENCH_LOG_LEVEL"), default_value_t, value_enum, global = true)]
    pub log_level: LogLevel,
    #[command(subcommand)]
    pub command: Command,
}

impl BootstrapConfig {
    pub fn read() -> Self {
        BootstrapConfig::parse()
    }
}

#[derive(Subcommand, Clone)]
pub enum Command {
    /// Route every pair of a dataset with each backend and profile
    Run(RunArgs),
    /// List the available backends
    Backends,
}

#[derive(Args, Clone)]
pub struct RunArgs {
    /// Path or URL of the OD dataset
    #[arg(long)]
    pub dataset: String,
    /// Backend name, can be repeated
    #[arg(long("backend"), required = true)]
    pub backends: Vec<String>,
    /// Routing profile, can be repeated
    #[arg(long("profile"), default_value = "fastest")]
    pub profiles: Vec<String>,
    /// Maximum number of requests in flight per backend
    #[arg(long, default_value_t = 4)]
    pub concurrency: usize,
    /// Timeout of a single request in seconds
    #[arg(long, default_value_t = 30.0)]
    pub timeout: f64,
    /// Time in seconds each backend and profile may take at most
    #[arg(long)]
    pub budget: Option<f64>,
    /// Retries after transient errors or rate limiting
    #[arg(long, default_value_t = 3)]
    pub retries: u32,
    /// Pairs per request for backends that route batches
    #[arg(long, default_value_t = 1)]
    pub batch_size: usize,
    /// Only route the first N valid pairs
    #[arg(long)]
    pub limit: Option<usize>,
    /// Dataset format, inferred from the file extension if not set
    #[arg(long, value_enum)]
    pub format: Option<InputFormat>,
    /// Results file (.geojson, .arrow or .csv). The summary is written next to it.
    #[arg(long)]
    pub output: PathBuf,
}

#[derive(clap::ValueEnum, Clone, Copy)]
pub enum InputFormat {
    Csv,
    Geojson,
}

impl From<InputFormat> for DatasetFormat {
    fn from(value: InputFormat) -> Self {
        match value {
            InputFormat::Csv => DatasetFormat::Csv,
            InputFormat::Geojson => DatasetFormat::GeoJson,
        }
    }
}

#[derive(clap::ValueEnum, Clone, Default)]
pub enum LogLevel {
    Off,
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl From<LogLevel> for LevelFilter {
    fn from(value: LogLevel) -> Self {
        match value {
            LogLevel::Off => Self::Off,
            LogLevel::Error => Self::Error,
            LogLevel::Warn => Self::Warn,
            LogLevel::Info => Self::Info,
            LogLevel::Debug => Self::Debug,
            LogLevel::Trace => Self::Trace,
        }
    }
}
