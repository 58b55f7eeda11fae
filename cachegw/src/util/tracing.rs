// (c) 2025 The cachegw authors

//! Tracing setup
//!
//! Always logs to stderr, filtered by `RUST_LOG` (defaulting to our own
//! events at `info`, or `debug` when `--debug` is given). With `--debug` a
//! second layer appends everything to a timestamped `*_CLIENT_LOG` file in
//! the current directory (by then the executable's directory, where the
//! compiler-cache client expects to find helper logs).

use std::fs::OpenOptions;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use anyhow::Context as _;
use tracing_subscriber::{
    layer::SubscriberExt as _, util::SubscriberInitExt as _, EnvFilter, Layer as _,
};

static TRACING_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Environment variable controlling the stderr filter.
const STANDARD_ENV_VAR: &str = "RUST_LOG";

/// Has [`setup_tracing`] run?
pub fn tracing_is_initialised() -> bool {
    TRACING_INITIALIZED.load(Ordering::Relaxed)
}

fn filter_for(trace_level: &str) -> anyhow::Result<EnvFilter> {
    EnvFilter::try_from_env(STANDARD_ENV_VAR).or_else(|e| {
        if std::env::var(STANDARD_ENV_VAR).is_ok() {
            anyhow::bail!("{STANDARD_ENV_VAR} (set in environment) was not understood: {e}");
        }
        Ok(EnvFilter::new(format!("cachegw={trace_level}")))
    })
}

/// One-shot tracing initialization. Returns the log file name, if one was
/// opened.
pub fn setup_tracing(debug: bool) -> anyhow::Result<Option<String>> {
    let trace_level = if debug { "debug" } else { "info" };
    let stderr_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_filter(filter_for(trace_level)?);

    let mut log_file_name = None;
    let file_layer = if debug {
        let filename = format!("{}_CLIENT_LOG", chrono::Local::now().format("%Y-%m-%d_%H-%M-%S"));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&filename)
            .with_context(|| format!("opening log file {filename}"))?;
        log_file_name = Some(filename);
        Some(
            tracing_subscriber::fmt::layer()
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .with_filter(filter_for("debug")?),
        )
    } else {
        None
    };

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .try_init()
        .context("initialising tracing")?;
    TRACING_INITIALIZED.store(true, Ordering::Relaxed);
    Ok(log_file_name)
}
