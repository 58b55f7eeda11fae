// (c) 2025 The cachegw authors

//! Session server: socket lifecycle, admission and shutdown
//!
//! One daemon instance serves one compiler-cache session over a Unix stream
//! socket. The accept loop admits up to `max_parallel_clients` concurrent
//! connections through a semaphore; a monitor task watches a monotonic
//! last-activity timestamp and triggers a cooperative shutdown after the
//! inactivity timeout, as do SIGINT/SIGTERM. On any exit path the socket
//! filesystem entry is removed.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Context as _;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::backend::{self, Backend};
use crate::config::Config;

mod connection;
pub use connection::ConnectionHandler;

/// Monotonic record of the most recent client activity.
///
/// Reset is a plain store; the idle monitor polls the deadline, so there is
/// no stop/reset window for an expiry to race into.
#[derive(Debug)]
pub struct Activity {
    last: Mutex<Instant>,
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

impl Activity {
    #[must_use]
    pub fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
        }
    }

    /// Marks "now" as the most recent activity.
    pub fn touch(&self) {
        *self.last.lock().expect("activity lock poisoned") = Instant::now();
    }

    fn last(&self) -> Instant {
        *self.last.lock().expect("activity lock poisoned")
    }
}

/// The session server. See the [module docs](self).
pub struct Server {
    config: Arc<Config>,
    backend: Arc<dyn Backend>,
    listener: UnixListener,
    activity: Arc<Activity>,
    shutdown: CancellationToken,
    admission: Arc<Semaphore>,
}

impl Server {
    /// Binds the listener, constructing the backend selected by the
    /// configured remote URL.
    pub async fn bind(config: Arc<Config>) -> anyhow::Result<Self> {
        let backend = backend::from_url(&config.remote_url, &config.attributes).await?;
        Self::bind_with_backend(config, backend).await
    }

    /// Binds the listener with an externally supplied backend.
    pub async fn bind_with_backend(
        config: Arc<Config>,
        backend: Arc<dyn Backend>,
    ) -> anyhow::Result<Self> {
        reclaim_stale_socket(&config.socket_path).await?;
        let listener = UnixListener::bind(&config.socket_path)
            .with_context(|| format!("binding {}", config.socket_path.display()))?;
        info!("listening on {}", config.socket_path.display());

        Ok(Self {
            admission: Arc::new(Semaphore::new(config.max_parallel_clients)),
            backend,
            listener,
            activity: Arc::new(Activity::new()),
            shutdown: CancellationToken::new(),
            config,
        })
    }

    /// The shutdown token; cancelling it drains the server.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Serves until idle expiry, signal, or external cancellation, then
    /// drains workers and removes the socket entry.
    pub async fn run(self) -> anyhow::Result<()> {
        info!(
            "serving at most {} parallel clients, idling out after {:?}",
            self.config.max_parallel_clients, self.config.inactivity_timeout
        );
        let _monitor = tokio::spawn(monitor_inactivity(
            Arc::clone(&self.activity),
            self.config.inactivity_timeout,
            self.shutdown.clone(),
        ));
        let _signals = tokio::spawn(watch_signals(self.shutdown.clone()));

        let mut workers = JoinSet::new();
        let mut next_id = 0u64;

        loop {
            let accepted = tokio::select! {
                () = self.shutdown.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let stream = match accepted {
                Ok((stream, _)) => stream,
                Err(e) => {
                    if self.shutdown.is_cancelled() {
                        break;
                    }
                    warn!("accept error: {e}, continuing");
                    continue;
                }
            };
            self.activity.touch();

            // Admission: hold the accept loop until a worker slot frees up.
            let permit = tokio::select! {
                () = self.shutdown.cancelled() => break,
                permit = Arc::clone(&self.admission).acquire_owned() => {
                    permit.expect("admission semaphore closed")
                }
            };

            next_id += 1;
            let id = next_id;
            debug!("accepted connection {id}");
            let handler = ConnectionHandler::new(
                id,
                stream,
                Arc::clone(&self.backend),
                self.config.setup_params(),
                self.config.buffer_size,
                Arc::clone(&self.activity),
                self.shutdown.clone(),
            );
            let _abort = workers.spawn(async move {
                let _permit = permit;
                if let Err(e) = handler.run().await {
                    debug!("connection {id} terminated: {e:#}");
                }
            });

            // Opportunistically reap finished workers so the set stays small.
            while workers.try_join_next().is_some() {}
        }

        // Close the listener before draining so late connectors fail fast.
        drop(self.listener);
        debug!("draining {} workers", workers.len());
        while workers.join_next().await.is_some() {}

        remove_socket(&self.config.socket_path).await;
        info!("shut down cleanly");
        Ok(())
    }
}

/// A socket path left behind by a dead instance is reclaimed; a live one
/// refuses startup.
async fn reclaim_stale_socket(path: &Path) -> anyhow::Result<()> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        return Ok(());
    }
    match UnixStream::connect(path).await {
        Ok(_) => anyhow::bail!(
            "socket {} already in use by another instance",
            path.display()
        ),
        Err(e) => {
            debug!("reclaiming stale socket {} ({e})", path.display());
            tokio::fs::remove_file(path)
                .await
                .with_context(|| format!("removing stale socket {}", path.display()))
        }
    }
}

async fn remove_socket(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            warn!("could not remove socket {}: {e}", path.display());
        }
    }
}

/// Cancels the token once `timeout` passes with no [`Activity::touch`].
async fn monitor_inactivity(
    activity: Arc<Activity>,
    timeout: Duration,
    shutdown: CancellationToken,
) {
    loop {
        let deadline = activity.last() + timeout;
        tokio::select! {
            () = shutdown.cancelled() => return,
            () = tokio::time::sleep_until(deadline) => {
                // A touch may have moved the deadline while we slept.
                if activity.last() + timeout <= Instant::now() {
                    info!("no activity for {timeout:?}, shutting down");
                    shutdown.cancel();
                    return;
                }
            }
        }
    }
}

/// SIGINT/SIGTERM trigger the same cooperative shutdown as idle expiry.
async fn watch_signals(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};
    let (mut interrupt, mut terminate) =
        match (signal(SignalKind::interrupt()), signal(SignalKind::terminate())) {
            (Ok(i), Ok(t)) => (i, t),
            _ => {
                warn!("signal handlers unavailable; only idle shutdown will work");
                return;
            }
        };
    tokio::select! {
        () = shutdown.cancelled() => return,
        _ = interrupt.recv() => info!("received SIGINT, shutting down"),
        _ = terminate.recv() => info!("received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}
