use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use indicatif_log_bridge::LogWrapper;
use log::{info, LevelFilter, SetLoggerError};
use std::future::Future;
use std::sync::OnceLock;
use std::time::{Duration, Instant};

static MULTI: OnceLock<MultiProgress> = OnceLock::new();


pub fn init(log_level: LevelFilter) -> Result<(), SetLoggerError> {
    let logger = env_logger::builder()
        .filter_level(log_level)
        .parse_default_env() // Allow overriding log level through RUST_LOG env var
        .build();

    let multi = MultiProgress::new();

    let wrapper = LogWrapper::new(multi.clone(), logger);
    wrapper.try_init()?;

    let _ = MULTI.set(multi);

    Ok(())
}

// Progress bars are only attached when logging was initialized, so log lines don't tear them.
// Without it (e.g. in tests) they are drawn on their own.
fn attach(pb: &ProgressBar) {
    if let Some(multi) = MULTI.get() {
        multi.add(pb.clone());
    }
}

fn detach(pb: &ProgressBar) {
    if let Some(multi) = MULTI.get() {
        multi.remove(pb);
    }
}


pub fn run_with_spinner<'a, F, Out>(
    target: &'a str, task_desc: &'a str, function: F,
) -> Out where
    F: FnOnce() -> Out,
{
    let start_time = Instant::now();

    let pb = ProgressBar::new_spinner()
        .with_message(format!("{}...", task_desc))
        .with_style(spinner_style());
    pb.enable_steady_tick(Duration::from_millis(100));
    attach(&pb);

    let out = function();

    pb.finish_and_clear();
    detach(&pb);
    let elapsed = indicatif::HumanDuration(start_time.elapsed());
    info!(target: target, "{} finished (took {})", task_desc, elapsed);

    out
}

pub async fn run_with_spinner_async<'a, F, Out>(
    target: &'a str, task_desc: &'a str, future: F,
) -> Out where
    F: Future<Output = Out>,
{
    let start_time = Instant::now();

    let pb = ProgressBar::new_spinner()
        .with_message(format!("{}...", task_desc))
        .with_style(spinner_style());
    pb.enable_steady_tick(Duration::from_millis(100));
    attach(&pb);

    let out = future.await;

    pb.finish_and_clear();
    detach(&pb);
    let elapsed = indicatif::HumanDuration(start_time.elapsed());
    info!(target: target, "{} finished (took {})", task_desc, elapsed);

    out
}

/// Runs a future while showing a progress bar with `total` steps. The future receives the bar and
/// is responsible for advancing it.
pub async fn run_with_pb_async<'a, F, Fut, Out>(
    target: &'a str, task_desc: &'a str, total: u64, print_message: bool, function: F,
) -> Out where
    F: FnOnce(ProgressBar) -> Fut,
    Fut: Future<Output = Out>,
{
    let start_time = Instant::now();

    let pb = ProgressBar::new(total)
        .with_message(format!("{}...", task_desc))
        .with_style(bar_style());
    pb.enable_steady_tick(Duration::from_secs(1));
    attach(&pb);

    let out = function(pb.clone()).await;

    pb.finish_and_clear();
    detach(&pb);
    if print_message {
        let elapsed = indicatif::HumanDuration(start_time.elapsed());
        info!(target: target, "{} finished (took {})", task_desc, elapsed);
    }

    out
}

fn spinner_style() -> ProgressStyle {
    ProgressStyle::with_template("{spinner:.white} [{elapsed:.green}] {msg}")
        .unwrap_or_else(|_| ProgressStyle::default_spinner())
}

fn bar_style() -> ProgressStyle {
    ProgressStyle::with_template("[{elapsed:.green}] {msg} [{wide_bar:.cyan/blue}] {human_pos}/{human_len} [{eta}]")
        .map(|style| style.progress_chars("=> "))
        .unwrap_or_else(|_| ProgressStyle::default_bar())
}
