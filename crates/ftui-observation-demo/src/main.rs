#![forbid(unsafe_code)]

//! Observation counter: a text-mode view that re-renders only when the
//! properties it read have changed.

mod app;
mod cli;

use std::env;

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

/// Env var with a log filter that takes precedence over `RUST_LOG`.
const ENV_LOG: &str = "FTUI_OBSERVE_LOG";

fn init_tracing() {
    let filter = env::var(ENV_LOG)
        .ok()
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .or_else(|| EnvFilter::try_from_default_env().ok())
        .unwrap_or_else(|| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() {
    let opts = cli::Opts::parse();
    init_tracing();

    let report = app::run(&opts, |frame| println!("{frame}"));
    println!(
        "-- {} frames, {} mutations, {} observers discharged",
        report.frames.len(),
        report.stats.mutations,
        report.stats.discharged
    );
}
