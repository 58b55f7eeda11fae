// (c) 2025 The cachegw authors

//! Cloud object-store backend (`gs://` URLs)
//!
//! Speaks the storage JSON API directly over the shared reqwest stack.
//! Authentication is a service-account JWT bearer grant when a credentials
//! file is available (attribute or `GOOGLE_APPLICATION_CREDENTIALS`),
//! falling back to the instance metadata server for ambient credentials.
//! Access tokens are cached until shortly before expiry.
//!
//! Every stored object carries a custom-time stamp, and Get refreshes it in
//! the background; the store's lifecycle rules can then evict LRU-style.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use serde::Deserialize;
use tokio::time::Instant;
use tokio_util::io::StreamReader;
use tracing::{debug, warn};
use url::Url;

use futures_util::TryStreamExt as _;

use super::{format_digest, parse_timeout_ms, Attribute, Backend, BackendFailure, ByteStream};

const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const STORAGE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";
/// Refresh margin so a token never expires mid-request.
const TOKEN_EXPIRY_SLACK: Duration = Duration::from_secs(60);

/// Storage classes the store accepts for new objects.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, strum_macros::Display, strum_macros::EnumString)]
#[strum(serialize_all = "UPPERCASE")]
pub enum StorageClass {
    #[default]
    Standard,
    Nearline,
    Coldline,
    Archive,
}

/// Service-account credentials file, as written by the cloud console.
#[derive(Clone, Deserialize)]
struct ServiceAccountKey {
    client_email: String,
    private_key: String,
    #[serde(default = "default_token_uri")]
    token_uri: String,
}

fn default_token_uri() -> String {
    "https://oauth2.googleapis.com/token".into()
}

#[derive(serde::Serialize)]
struct JwtClaims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

enum Credentials {
    ServiceAccount(Box<ServiceAccountKey>),
    MetadataServer,
}

/// Bearer-token source with caching. Shared with background tasks.
struct TokenAuth {
    credentials: Credentials,
    cached: Mutex<Option<(String, Instant)>>,
}

impl TokenAuth {
    async fn token(&self, client: &reqwest::Client) -> Result<String, BackendFailure> {
        if let Some((token, expires)) = self.cached.lock().expect("token cache poisoned").clone() {
            if Instant::now() < expires {
                return Ok(token);
            }
        }

        let (token, lifetime) = match &self.credentials {
            Credentials::ServiceAccount(key) => Self::service_account_grant(client, key).await?,
            Credentials::MetadataServer => Self::metadata_server_grant(client).await?,
        };
        let expires = Instant::now() + lifetime.saturating_sub(TOKEN_EXPIRY_SLACK);
        *self.cached.lock().expect("token cache poisoned") = Some((token.clone(), expires));
        Ok(token)
    }

    async fn service_account_grant(
        client: &reqwest::Client,
        key: &ServiceAccountKey,
    ) -> Result<(String, Duration), BackendFailure> {
        let now = Utc::now().timestamp();
        let claims = JwtClaims {
            iss: &key.client_email,
            scope: STORAGE_SCOPE,
            aud: &key.token_uri,
            iat: now,
            exp: now + 3600,
        };
        let signing_key = jsonwebtoken::EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| BackendFailure::local(format!("unusable service-account key: {e}")))?;
        let assertion = jsonwebtoken::encode(
            &jsonwebtoken::Header::new(jsonwebtoken::Algorithm::RS256),
            &claims,
            &signing_key,
        )
        .map_err(|e| BackendFailure::local(format!("signing token grant: {e}")))?;

        let resp = client
            .post(&key.token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(|e| BackendFailure::new(500, format!("token grant failed: {e}")))?;
        if !resp.status().is_success() {
            return Err(BackendFailure::new(
                resp.status().as_u16(),
                format!("token endpoint returned {}", resp.status()),
            ));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| BackendFailure::new(500, format!("token response unreadable: {e}")))?;
        Ok((token.access_token, token_lifetime(token.expires_in)))
    }

    async fn metadata_server_grant(
        client: &reqwest::Client,
    ) -> Result<(String, Duration), BackendFailure> {
        let resp = client
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| {
                BackendFailure::new(500, format!("metadata server unreachable: {e}"))
            })?;
        if !resp.status().is_success() {
            return Err(BackendFailure::new(
                resp.status().as_u16(),
                format!("metadata server returned {}", resp.status()),
            ));
        }
        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| BackendFailure::new(500, format!("token response unreadable: {e}")))?;
        Ok((token.access_token, token_lifetime(token.expires_in)))
    }
}

fn token_lifetime(expires_in: u64) -> Duration {
    if expires_in == 0 {
        Duration::from_secs(300)
    } else {
        Duration::from_secs(expires_in)
    }
}

/// Backend storing objects in a cloud bucket.
///
/// Bucket comes from the URL host, the object-name prefix from its path.
pub struct GcsBackend {
    client: reqwest::Client,
    auth: Arc<TokenAuth>,
    endpoint: String,
    bucket: String,
    prefix: String,
    storage_class: StorageClass,
    timeout: Duration,
}

impl GcsBackend {
    /// Builds the backend from the `gs://` URL and its attributes.
    pub async fn new(url: &Url, attributes: &[Attribute]) -> anyhow::Result<Self> {
        let bucket = url
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("gs URL has no bucket name"))?
            .to_string();
        let mut prefix = url.path().trim_start_matches('/').to_string();
        if !prefix.is_empty() && !prefix.ends_with('/') {
            prefix.push('/');
        }

        let mut credentials_file = std::env::var("GOOGLE_APPLICATION_CREDENTIALS").ok();
        let mut project_id = None;
        let mut endpoint = DEFAULT_ENDPOINT.to_string();
        let mut timeout = DEFAULT_TIMEOUT;
        let mut storage_class = StorageClass::default();

        for attr in attributes {
            match attr.key.as_str() {
                "credentials-file" => credentials_file = Some(attr.value.clone()),
                "project-id" => project_id = Some(attr.value.clone()),
                "endpoint" => endpoint = attr.value.trim_end_matches('/').to_string(),
                "timeout" => {
                    if let Some(t) = parse_timeout_ms(&attr.key, &attr.value) {
                        timeout = t;
                    }
                }
                "storage-class" => match attr.value.parse() {
                    Ok(sc) => storage_class = sc,
                    Err(_) => {
                        warn!(
                            "unknown storage class {:?}, defaulting to {}",
                            attr.value,
                            StorageClass::default()
                        );
                    }
                },
                "location" => debug!("bucket location hint: {}", attr.value),
                other => warn!("cloud attribute {other:?} not known, ignoring"),
            }
        }

        let credentials = match credentials_file {
            Some(path) => {
                let raw = tokio::fs::read(&path)
                    .await
                    .map_err(|e| anyhow::anyhow!("reading credentials file {path}: {e}"))?;
                let key: ServiceAccountKey = serde_json::from_slice(&raw)
                    .map_err(|e| anyhow::anyhow!("parsing credentials file {path}: {e}"))?;
                Credentials::ServiceAccount(Box::new(key))
            }
            None => Credentials::MetadataServer,
        };

        let mut headers = reqwest::header::HeaderMap::new();
        if let Some(project) = project_id {
            if let Ok(v) = project.parse() {
                let _ = headers.insert("x-goog-user-project", v);
            }
        }
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .default_headers(headers)
            .build()?;

        Ok(Self {
            client,
            auth: Arc::new(TokenAuth {
                credentials,
                cached: Mutex::new(None),
            }),
            endpoint,
            bucket,
            prefix,
            storage_class,
            timeout,
        })
    }

    fn object_name(&self, key: &[u8]) -> Result<String, BackendFailure> {
        Ok(format!("{}{}", self.prefix, format_digest(key)?))
    }

    fn object_url(&self, object: &str) -> String {
        format!(
            "{}/storage/v1/b/{}/o/{}",
            self.endpoint,
            self.bucket,
            utf8_percent_encode(object, NON_ALPHANUMERIC)
        )
    }

    fn upload_url(&self) -> String {
        format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=multipart",
            self.endpoint, self.bucket
        )
    }

    async fn bearer(&self) -> Result<String, BackendFailure> {
        self.auth.token(&self.client).await
    }

    /// Stamps the object's custom time with "now". Spawned in the
    /// background after a Get; failures are logged, never propagated.
    fn refresh_custom_time(&self, object: String) {
        let client = self.client.clone();
        let auth = Arc::clone(&self.auth);
        let url = self.object_url(&object);
        let timeout = self.timeout;
        drop(tokio::spawn(async move {
            let result = async {
                let token = auth.token(&client).await?;
                let resp = client
                    .patch(&url)
                    .bearer_auth(token)
                    .timeout(timeout)
                    .json(&serde_json::json!({ "customTime": now_rfc3339() }))
                    .send()
                    .await
                    .map_err(|e| BackendFailure::new(500, e.to_string()))?;
                if !resp.status().is_success() {
                    return Err(BackendFailure::new(
                        resp.status().as_u16(),
                        format!("custom-time update returned {}", resp.status()),
                    ));
                }
                Ok::<(), BackendFailure>(())
            }
            .await;
            match result {
                Ok(()) => debug!("updated custom time for {object}"),
                Err(e) => warn!("custom-time update for {object} failed: {e}"),
            }
        }));
    }
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait::async_trait]
impl Backend for GcsBackend {
    async fn get(&self, key: &[u8]) -> Result<(ByteStream, u64), BackendFailure> {
        let object = self.object_name(key)?;
        let url = format!("{}?alt=media", self.object_url(&object));
        let token = self.bearer().await?;
        let resp = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| BackendFailure::new(500, format!("fetching {object}: {e}")))?;
        let status = resp.status();
        if status.as_u16() == 404 {
            return Err(BackendFailure::new(
                404,
                format!("object {object} not found in bucket {}", self.bucket),
            ));
        }
        if !status.is_success() {
            return Err(BackendFailure::new(
                status.as_u16(),
                format!("fetching {object} returned {status}"),
            ));
        }
        let size = resp.content_length().ok_or_else(|| {
            BackendFailure::local(format!("media response for {object} has no length"))
        })?;

        self.refresh_custom_time(object);

        let stream = resp.bytes_stream().map_err(std::io::Error::other);
        Ok((Box::new(StreamReader::new(stream)), size))
    }

    async fn put(
        &self,
        key: &[u8],
        value: &[u8],
        only_if_missing: bool,
    ) -> Result<bool, BackendFailure> {
        let object = self.object_name(key)?;
        let token = self.bearer().await?;

        if only_if_missing {
            let resp = self
                .client
                .get(self.object_url(&object))
                .bearer_auth(&token)
                .timeout(self.timeout)
                .send()
                .await
                .map_err(|e| BackendFailure::new(500, format!("checking {object}: {e}")))?;
            match resp.status().as_u16() {
                200..=299 => return Ok(false),
                404 => (),
                code => {
                    return Err(BackendFailure::new(
                        code,
                        format!("existence check for {object} returned {code}"),
                    ))
                }
            }
        }

        let metadata = serde_json::json!({
            "name": object,
            "storageClass": self.storage_class.to_string(),
            // Required for LRU-style eviction via lifecycle rules.
            "customTime": now_rfc3339(),
        });
        let (content_type, body) = multipart_related(&metadata, value);
        let resp = self
            .client
            .post(self.upload_url())
            .bearer_auth(&token)
            .timeout(self.timeout)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .body(body)
            .send()
            .await
            .map_err(|e| BackendFailure::new(500, format!("storing {object}: {e}")))?;
        let status = resp.status();
        if !status.is_success() {
            return Err(BackendFailure::new(
                status.as_u16(),
                format!("storing {object} returned {status}"),
            ));
        }
        debug!("stored {object} ({} bytes)", value.len());
        Ok(true)
    }

    async fn remove(&self, key: &[u8]) -> Result<bool, BackendFailure> {
        let object = self.object_name(key)?;
        let token = self.bearer().await?;
        let resp = self
            .client
            .delete(self.object_url(&object))
            .bearer_auth(token)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| BackendFailure::new(500, format!("deleting {object}: {e}")))?;
        match resp.status().as_u16() {
            200..=299 => Ok(true),
            404 => Err(BackendFailure::new(
                404,
                format!("object {object} does not exist in bucket {}", self.bucket),
            )),
            code => Err(BackendFailure::new(
                code,
                format!("deleting {object} returned {code}"),
            )),
        }
    }
}

/// Builds a `multipart/related` upload body: JSON metadata part, then the
/// media part.
fn multipart_related(metadata: &serde_json::Value, media: &[u8]) -> (String, Vec<u8>) {
    const BOUNDARY: &str = "cachegw_upload_boundary";
    let mut body = Vec::with_capacity(media.len() + 256);
    body.extend_from_slice(format!("--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(metadata.to_string().as_bytes());
    body.extend_from_slice(format!("\r\n--{BOUNDARY}\r\n").as_bytes());
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(media);
    body.extend_from_slice(format!("\r\n--{BOUNDARY}--\r\n").as_bytes());
    (
        format!("multipart/related; boundary={BOUNDARY}"),
        body,
    )
}
