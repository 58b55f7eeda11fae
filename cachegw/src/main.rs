//! cachegw daemon - main entrypoint
// (c) 2025 The cachegw authors

use std::process::ExitCode;

fn main() -> ExitCode {
    if cachegw::cli().unwrap_or_else(|e| {
        if cachegw::util::tracing_is_initialised() {
            tracing::error!("{e:#}");
        } else {
            eprintln!("Error: {e:#}");
        }
        false
    }) {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}
