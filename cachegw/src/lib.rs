// (c) 2025 The cachegw authors

//! `cachegw` is a remote-cache gateway daemon: it bridges a compiler-cache
//! client speaking a compact TLV protocol over a local Unix socket to a
//! remote blob store (a plain HTTP object store, or a cloud bucket).
//!
//! ## Overview
//!
//! One deployed instance serves one client session. The client launches the
//! daemon with its configuration in `_CCACHE_*` environment variables; the
//! daemon binds the session socket (reclaiming a stale entry if the
//! previous instance died), serves Get/Put/Delete traffic against the
//! configured backend, and exits by itself once the session goes quiet.
//!
//! - [protocol]: the wire format, with zero-copy frame parsing, pooled
//!   serializers, and the typed request/response model.
//! - [backend]: the object-store adapters ([`backend::http`] and
//!   [`backend::gcs`]) behind a uniform get/put/remove trait.
//! - [server]: listener, admission, idle shutdown, per-connection loop.
//! - [config]: the immutable environment-derived configuration.
//!
//! ## Behavior notes
//!
//! - Large Get payloads are streamed from the backend to the socket; peak
//!   memory per response is bounded by the response prefix, not the object.
//! - A malformed frame terminates only the offending connection. Backend
//!   failures are normalized into a seven-valued status code and reported
//!   in-band; the connection stays open.
//! - Shutdown (idle timeout, SIGINT, SIGTERM) is cooperative: in-flight
//!   responses complete, workers drain, and the socket entry is removed.

pub mod backend;
pub(crate) mod cli;
pub use cli::cli;
pub mod config;
pub use config::Config;
pub mod protocol;
pub mod server;
pub mod util;
