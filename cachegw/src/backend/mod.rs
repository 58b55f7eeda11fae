// (c) 2025 The cachegw authors

//! Remote object-store adapters
//!
//! A [`Backend`] provides a uniform get/put/remove capability over a
//! concrete store. Two implementations exist: [`http::HttpBackend`] for
//! plain HTTP object stores and [`gcs::GcsBackend`] for a Google-style
//! cloud object store. Which one serves a session is selected by the remote
//! URL scheme (`http`/`https` → HTTP, `gs` → cloud).
//!
//! Backend-specific outcomes are reported as a [`BackendFailure`] carrying
//! an HTTP-shaped protocol code, which
//! [`resolve_protocol_code`](Backend::resolve_protocol_code) folds into the
//! wire-level [`StatusCode`].

use std::sync::Arc;

use async_trait::async_trait;
use data_encoding::{BASE32_NOPAD, HEXLOWER};
use tokio::io::AsyncRead;
use tracing::warn;
use url::Url;

use crate::protocol::StatusCode;

pub mod gcs;
pub mod http;

/// Streaming object payload handed back by [`Backend::get`].
///
/// Dropping the stream releases the underlying connection.
pub type ByteStream = Box<dyn AsyncRead + Send + Unpin>;

/// A failed backend operation, carrying an HTTP-shaped protocol code for
/// status normalization.
#[derive(Debug, thiserror::Error)]
#[error("{message} (protocol code {code})")]
pub struct BackendFailure {
    /// Human-readable diagnostic, surfaced in error responses and logs.
    pub message: String,
    /// HTTP status code, or 0 for failures local to this process.
    pub code: u16,
}

impl BackendFailure {
    pub(crate) fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }

    /// A failure that never reached the remote store.
    pub(crate) fn local(message: impl Into<String>) -> Self {
        Self::new(0, message)
    }
}

/// One backend configuration attribute.
///
/// Attributes arrive from the `|key=value` suffix of the remote URL and
/// from the environment; unknown keys are logged and ignored, never fatal.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attribute {
    pub key: String,
    pub value: String,
}

impl Attribute {
    #[must_use]
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Uniform capability over a remote object store.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Opens the object for `key`, returning a payload stream and its exact
    /// size in bytes. The payload is not buffered.
    async fn get(&self, key: &[u8]) -> Result<(ByteStream, u64), BackendFailure>;

    /// Stores `value` under `key`. With `only_if_missing`, an existing
    /// object is left untouched and `Ok(false)` is returned; otherwise the
    /// write is unconditional. `Ok(true)` means the object was written.
    async fn put(
        &self,
        key: &[u8],
        value: &[u8],
        only_if_missing: bool,
    ) -> Result<bool, BackendFailure>;

    /// Deletes the object for `key`. `Ok(true)` on removal.
    async fn remove(&self, key: &[u8]) -> Result<bool, BackendFailure>;

    /// Folds a backend protocol code into the seven-valued wire status.
    fn resolve_protocol_code(&self, code: u16) -> StatusCode {
        resolve_http_code(code)
    }
}

/// HTTP-shaped status normalization shared by both backends.
#[must_use]
pub fn resolve_http_code(code: u16) -> StatusCode {
    match code {
        0..=99 => StatusCode::LocalError,
        404 => StatusCode::NoFile,
        408 => StatusCode::Timeout,
        100..=199 => StatusCode::SigWait,
        200..=299 => StatusCode::Success,
        300..=399 => StatusCode::Redirect,
        _ => StatusCode::Error,
    }
}

/// A remote URL split into its store location and trailing attributes.
///
/// Grammar: `scheme://[user@]host[:port][/path][|attr=value[|attr=value…]]`.
#[derive(Debug)]
pub struct RemoteUrl {
    pub url: Url,
    pub attributes: Vec<Attribute>,
}

impl RemoteUrl {
    /// Parses the raw remote URL string, separating `|`-delimited attribute
    /// pairs from the store location.
    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        let mut parts = raw.split('|');
        let location = parts.next().unwrap_or_default();
        let url = Url::parse(location)
            .map_err(|e| anyhow::anyhow!("malformed remote URL {location:?}: {e}"))?;

        let mut attributes = Vec::new();
        for pair in parts.filter(|p| !p.is_empty()) {
            match pair.split_once('=') {
                Some((key, value)) => attributes.push(Attribute::new(key, value)),
                None => warn!("ignoring malformed URL attribute {pair:?}"),
            }
        }
        Ok(Self { url, attributes })
    }
}

/// Builds the backend selected by the remote URL scheme.
///
/// `extra_attributes` (from the environment) are appended after the URL's
/// own attributes, so the environment wins where a key is consulted
/// last-match and loses where first-match; both backends take the last
/// occurrence.
pub async fn from_url(
    raw_url: &str,
    extra_attributes: &[Attribute],
) -> anyhow::Result<Arc<dyn Backend>> {
    let mut remote = RemoteUrl::parse(raw_url)?;
    remote.attributes.extend_from_slice(extra_attributes);
    match remote.url.scheme() {
        "http" | "https" => Ok(Arc::new(http::HttpBackend::new(
            &remote.url,
            &remote.attributes,
        )?)),
        "gs" => Ok(Arc::new(
            gcs::GcsBackend::new(&remote.url, &remote.attributes).await?,
        )),
        other => anyhow::bail!("no backend implemented for URL scheme {other:?}"),
    }
}

/// Minimum key length [`format_digest`] accepts.
pub const DIGEST_MIN_KEY_LEN: usize = 2;

/// Formats a raw cache key as a deterministic object name: the first two
/// bytes hex-encoded, then the remainder as lowercase unpadded base32.
pub fn format_digest(key: &[u8]) -> Result<String, BackendFailure> {
    if key.len() < DIGEST_MIN_KEY_LEN {
        return Err(BackendFailure::local(format!(
            "cache key must be at least {DIGEST_MIN_KEY_LEN} bytes, got {}",
            key.len()
        )));
    }
    let mut digest = HEXLOWER.encode(&key[..DIGEST_MIN_KEY_LEN]);
    digest.push_str(&BASE32_NOPAD.encode(&key[DIGEST_MIN_KEY_LEN..]).to_ascii_lowercase());
    Ok(digest)
}

/// Parses a timeout attribute value: integral milliseconds.
pub(crate) fn parse_timeout_ms(key: &str, value: &str) -> Option<std::time::Duration> {
    match value.parse::<u64>() {
        Ok(ms) => Some(std::time::Duration::from_millis(ms)),
        Err(_) => {
            warn!("attribute {key}={value:?} is not a millisecond count; ignored");
            None
        }
    }
}
