// (c) 2025 The cachegw authors

//! CLI entrypoint
//!
//! The daemon is not meant to be run by hand: the compiler-cache client
//! spawns it with the `_CCACHE_*` environment set. The only flag is
//! `--debug`, which mirrors all logging into a timestamped file next to
//! the executable.

use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser;
use tracing::info;

use crate::config::Config;
use crate::server::Server;

#[derive(Debug, Parser)]
#[command(
    about,
    version,
    after_help = "Configuration comes from the environment: _CCACHE_SOCKET_PATH, \
                  _CCACHE_BUFFER_SIZE, _CCACHE_REMOTE_URL and optionally \
                  _CCACHE_NUM_ATTR with _CCACHE_ATTR_KEY_i/_CCACHE_ATTR_VALUE_i pairs."
)]
struct CliArgs {
    /// Log debug detail to a <timestamp>_CLIENT_LOG file in the executable directory
    #[arg(long)]
    debug: bool,
}

/// Main CLI entrypoint. Call this from `main`; it reads argv and the
/// environment.
///
/// # Return
/// `true` is a clean shutdown. Errors indicate configuration or bind
/// failures and warrant a non-zero exit.
pub fn cli() -> anyhow::Result<bool> {
    let args = CliArgs::parse();

    // Log files belong next to the executable, where the client looks for
    // them; move there before tracing opens anything.
    let exe = std::env::current_exe().context("locating executable")?;
    if let Some(dir) = exe.parent() {
        std::env::set_current_dir(dir)
            .with_context(|| format!("changing directory to {}", dir.display()))?;
    }
    if let Some(log_file) = crate::util::setup_tracing(args.debug)? {
        // Deliberately on stdout: the launching client captures it.
        println!("Helper logs on {log_file}");
    }

    let config = Arc::new(Config::from_env(args.debug)?);
    info!(
        "gateway for {} starting on {}",
        config.remote_url,
        config.socket_path.display()
    );
    serve(config)
}

#[tokio::main]
async fn serve(config: Arc<Config>) -> anyhow::Result<bool> {
    let server = Server::bind(config).await?;
    server.run().await?;
    Ok(true)
}
