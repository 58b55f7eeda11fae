// (c) 2025 The cachegw authors

//! HTTP object-store backend
//!
//! Objects live under the remote URL at a layout-dependent path. The client
//! keeps connections alive with a bounded idle pool; Get payloads are
//! returned as a body stream, never buffered here.

use std::time::Duration;

use base64::Engine as _;
use futures_util::TryStreamExt as _;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use reqwest::{Method, RequestBuilder};
use tokio_util::io::StreamReader;
use tracing::{debug, warn};
use url::Url;

use super::{format_digest, parse_timeout_ms, Attribute, Backend, BackendFailure, ByteStream};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_OPERATION_TIMEOUT: Duration = Duration::from_secs(10);
const POOL_IDLE_TIMEOUT: Duration = Duration::from_secs(90);
const POOL_MAX_IDLE_PER_HOST: usize = 50;

/// How object names are arranged under the base URL.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Layout {
    /// `prefix/digest`
    #[default]
    Flat,
    /// `prefix/digest[0:2]/digest[2:]`
    Subdirs,
    /// `prefix/ac/<hex digest zero-padded to 64>`, mimicking a Bazel action cache.
    Bazel,
}

/// Backend speaking plain HTTP to an object store.
#[derive(Debug)]
pub struct HttpBackend {
    client: reqwest::Client,
    /// Store location with credentials, query and fragment stripped.
    base: String,
    bearer: Option<String>,
    layout: Layout,
    operation_timeout: Option<Duration>,
}

impl HttpBackend {
    /// Builds the backend from the store URL and its attributes.
    pub fn new(url: &Url, attributes: &[Attribute]) -> anyhow::Result<Self> {
        // A credential embedded in the URL takes effect unless overridden
        // by an explicit bearer-token attribute.
        let mut bearer = match (url.username(), url.password()) {
            ("", _) => None,
            (user, None) => Some(user.to_string()),
            (user, Some(pass)) => Some(format!("{user}:{pass}")),
        };
        let mut layout = Layout::default();
        let mut connect_timeout = DEFAULT_CONNECT_TIMEOUT;
        let mut operation_timeout = None;
        let mut keep_alive = true;
        let mut headers = HeaderMap::new();

        for attr in attributes {
            match attr.key.as_str() {
                "bearer-token" => bearer = Some(attr.value.clone()),
                "connect-timeout" => {
                    if let Some(t) = parse_timeout_ms(&attr.key, &attr.value) {
                        connect_timeout = t;
                    }
                }
                "operation-timeout" => {
                    operation_timeout = parse_timeout_ms(&attr.key, &attr.value);
                }
                "layout" => match attr.value.parse() {
                    Ok(l) => layout = l,
                    Err(_) => {
                        warn!("unknown layout {:?}, using {}", attr.value, Layout::default());
                        layout = Layout::default();
                    }
                },
                "header" => match parse_header(&attr.value) {
                    Some((name, value)) => {
                        let _ = headers.insert(name, value);
                    }
                    None => warn!("malformed header attribute {:?}", attr.value),
                },
                "keep-alive" => keep_alive = attr.value != "false",
                other => warn!("HTTP attribute {other:?} not known, ignoring"),
            }
        }

        let mut builder = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .default_headers(headers);
        builder = if keep_alive {
            builder
                .pool_idle_timeout(POOL_IDLE_TIMEOUT)
                .pool_max_idle_per_host(POOL_MAX_IDLE_PER_HOST)
        } else {
            builder.pool_max_idle_per_host(0)
        };

        let mut base = url.clone();
        let _ = base.set_username("");
        let _ = base.set_password(None);
        base.set_query(None);
        base.set_fragment(None);

        Ok(Self {
            client: builder.build()?,
            base: base.to_string().trim_end_matches('/').to_string(),
            bearer,
            layout,
            operation_timeout,
        })
    }

    fn entry_path(&self, key: &[u8]) -> Result<String, BackendFailure> {
        match self.layout {
            Layout::Bazel => {
                // Present the key as a hex SHA256-alike, zero-padded to 64.
                const SHA256_HEX_SIZE: usize = 64;
                let mut hex = data_encoding::HEXLOWER.encode(key);
                while hex.len() < SHA256_HEX_SIZE {
                    hex.push('0');
                }
                Ok(format!("{}/ac/{hex}", self.base))
            }
            Layout::Flat => Ok(format!("{}/{}", self.base, format_digest(key)?)),
            Layout::Subdirs => {
                let digest = format_digest(key)?;
                let (head, tail) = digest.split_at(2);
                Ok(format!("{}/{head}/{tail}", self.base))
            }
        }
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let mut req = self.client.request(method, url);
        if let Some(bearer) = &self.bearer {
            let encoded = base64::engine::general_purpose::STANDARD.encode(bearer);
            req = req.header(AUTHORIZATION, format!("Basic {encoded}"));
        }
        req
    }

    /// Request builder with the operation timeout applied. Used for the
    /// bounded verbs; GET bodies stream for as long as they need to.
    fn bounded_request(&self, method: Method, url: &str) -> RequestBuilder {
        self.request(method, url)
            .timeout(self.operation_timeout.unwrap_or(DEFAULT_OPERATION_TIMEOUT))
    }

    fn transport_failure(verb: &str, url: &str, e: &reqwest::Error) -> BackendFailure {
        let code = if e.is_timeout() { 408 } else { 500 };
        BackendFailure::new(code, format!("HTTP {verb} {url} failed: {e}"))
    }
}

#[async_trait::async_trait]
impl Backend for HttpBackend {
    async fn get(&self, key: &[u8]) -> Result<(ByteStream, u64), BackendFailure> {
        let url = self.entry_path(key)?;
        let resp = self
            .request(Method::GET, &url)
            .send()
            .await
            .map_err(|e| Self::transport_failure("GET", &url, &e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BackendFailure::new(
                status.as_u16(),
                format!("GET {url} returned {status}"),
            ));
        }
        let size = resp.content_length().ok_or_else(|| {
            BackendFailure::local(format!("GET {url} response carries no Content-Length"))
        })?;
        debug!("GET {url}: {size} bytes");
        let stream = resp.bytes_stream().map_err(std::io::Error::other);
        Ok((Box::new(StreamReader::new(stream)), size))
    }

    async fn put(
        &self,
        key: &[u8],
        value: &[u8],
        only_if_missing: bool,
    ) -> Result<bool, BackendFailure> {
        let url = self.entry_path(key)?;

        if only_if_missing {
            let resp = self
                .bounded_request(Method::HEAD, &url)
                .send()
                .await
                .map_err(|e| Self::transport_failure("HEAD", &url, &e))?;
            if resp.status().is_success() {
                debug!("HEAD {url}: present, skipping store");
                return Ok(false);
            }
        }

        let resp = self
            .bounded_request(Method::PUT, &url)
            .body(value.to_vec())
            .send()
            .await
            .map_err(|e| Self::transport_failure("PUT", &url, &e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BackendFailure::new(
                status.as_u16(),
                format!("PUT {url} returned {status}"),
            ));
        }
        debug!("PUT {url}: {} bytes", value.len());
        Ok(true)
    }

    async fn remove(&self, key: &[u8]) -> Result<bool, BackendFailure> {
        let url = self.entry_path(key)?;
        let resp = self
            .bounded_request(Method::DELETE, &url)
            .send()
            .await
            .map_err(|e| Self::transport_failure("DELETE", &url, &e))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BackendFailure::new(
                status.as_u16(),
                format!("DELETE {url} returned {status}"),
            ));
        }
        Ok(true)
    }
}

fn parse_header(raw: &str) -> Option<(HeaderName, HeaderValue)> {
    let (name, value) = raw.split_once('=')?;
    if value.is_empty() {
        return None;
    }
    let name = name.parse::<HeaderName>().ok()?;
    let value = HeaderValue::from_str(value).ok()?;
    Some((name, value))
}
