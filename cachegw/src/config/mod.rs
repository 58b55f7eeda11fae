// (c) 2025 The cachegw authors

//! Daemon configuration
//!
//! The compiler-cache client launches one gateway per session and passes
//! everything through `_CCACHE_*` environment variables; there are no
//! config files. [`Config`] is built once at startup and threaded through
//! the process as a shared immutable handle.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context as _;
use tracing::warn;

use crate::backend::Attribute;

/// Smallest socket read buffer we will operate with.
pub const MIN_BUFFER_SIZE: usize = 1024;
/// Fallback operation timeout offered during Setup negotiation.
pub const DEFAULT_OPERATION_TIMEOUT_MS: u32 = 10_000;
/// Shut down after this long without a connection or request.
pub const DEFAULT_INACTIVITY_TIMEOUT: Duration = Duration::from_secs(300);
/// Upper bound on concurrently served connections.
pub const DEFAULT_MAX_PARALLEL_CLIENTS: usize = 64;

/// Immutable process configuration.
#[derive(Clone, Debug)]
pub struct Config {
    /// Filesystem path of the Unix stream socket to serve.
    pub socket_path: PathBuf,
    /// Socket read buffer size (bytes).
    pub buffer_size: usize,
    /// Remote store URL, including any `|key=value` attribute suffix.
    pub remote_url: String,
    /// Backend attributes passed through the environment.
    pub attributes: Vec<Attribute>,
    /// File logging enabled?
    pub debug: bool,
    /// Idle period after which the daemon exits.
    pub inactivity_timeout: Duration,
    /// Admission bound for concurrent connections.
    pub max_parallel_clients: usize,
    /// Operation timeout offered during Setup negotiation (ms).
    pub operation_timeout_ms: u32,
}

impl Config {
    /// Builds the configuration from the `_CCACHE_*` environment variables.
    ///
    /// `_CCACHE_SOCKET_PATH`, `_CCACHE_BUFFER_SIZE` and `_CCACHE_REMOTE_URL`
    /// are required; `_CCACHE_NUM_ATTR` announces how many
    /// `_CCACHE_ATTR_KEY_i`/`_CCACHE_ATTR_VALUE_i` pairs follow.
    pub fn from_env(debug: bool) -> anyhow::Result<Self> {
        let socket_path = required_var("_CCACHE_SOCKET_PATH")?;
        let remote_url = required_var("_CCACHE_REMOTE_URL")?;
        let buffer_size: usize = required_var("_CCACHE_BUFFER_SIZE")?
            .parse()
            .context("_CCACHE_BUFFER_SIZE is not a decimal byte count")?;
        let buffer_size = if buffer_size < MIN_BUFFER_SIZE {
            warn!("buffer size {buffer_size} below minimum, using {MIN_BUFFER_SIZE}");
            MIN_BUFFER_SIZE
        } else {
            buffer_size
        };

        let mut attributes = Vec::new();
        if let Ok(raw_count) = std::env::var("_CCACHE_NUM_ATTR") {
            let count: usize = raw_count
                .parse()
                .context("_CCACHE_NUM_ATTR is not a decimal count")?;
            for i in 0..count {
                let key = std::env::var(format!("_CCACHE_ATTR_KEY_{i}"));
                let value = std::env::var(format!("_CCACHE_ATTR_VALUE_{i}"));
                match (key, value) {
                    (Ok(key), Ok(value)) => attributes.push(Attribute::new(key, value)),
                    _ => warn!("attribute pair {i} incomplete, skipping"),
                }
            }
        }

        Ok(Self {
            socket_path: PathBuf::from(socket_path),
            buffer_size,
            remote_url,
            attributes,
            debug,
            inactivity_timeout: DEFAULT_INACTIVITY_TIMEOUT,
            max_parallel_clients: DEFAULT_MAX_PARALLEL_CLIENTS,
            operation_timeout_ms: DEFAULT_OPERATION_TIMEOUT_MS,
        })
    }

    /// Session parameters the Setup exchange will accept.
    #[must_use]
    pub fn setup_params(&self) -> crate::protocol::SetupParams {
        crate::protocol::SetupParams {
            version: crate::protocol::PROTOCOL_VERSION,
            buffer_size: u32::try_from(self.buffer_size).unwrap_or(u32::MAX),
            operation_timeout_ms: self.operation_timeout_ms,
        }
    }
}

fn required_var(name: &str) -> anyhow::Result<String> {
    match std::env::var(name) {
        Ok(value) if !value.is_empty() => Ok(value),
        _ => anyhow::bail!(
            "{name} must be set (this daemon is launched by the compiler-cache client)"
        ),
    }
}
