//! Object-store client for shipping tiles.
//!
//! The trait is the seam the uploader works against; the HTTP
//! implementation speaks the store's JSON metadata and media-upload
//! endpoints. Checksums use CRC32C (Castagnoli), which the store reports
//! base64-encoded on every object.

use async_trait::async_trait;
use base64::Engine;
use reqwest::Client;
use tracing::debug;

use crate::error::PipelineError;

/// Default service endpoint.
const STORAGE_BASE_URL: &str = "https://storage.googleapis.com";

/// Env var holding the bearer token for store requests, when required.
const TOKEN_ENV: &str = "HONEYCOMB_STORAGE_TOKEN";

/// A bucketed blob store addressed by `<bucket>`/`<key>`.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch the CRC32C of an object, or `None` if it does not exist.
    async fn crc32c(&self, bucket: &str, key: &str) -> Result<Option<u32>, PipelineError>;

    /// Write an object, overwriting any existing content.
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), PipelineError>;
}

/// HTTP client for the object store's JSON API.
#[derive(Debug, Clone)]
pub struct HttpObjectStore {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl HttpObjectStore {
    /// Create a client against the production endpoint, picking up the
    /// bearer token from the environment when present.
    pub fn new() -> Result<Self, PipelineError> {
        Self::with_base_url(STORAGE_BASE_URL.to_string())
    }

    /// Create a client against a custom endpoint (tests, emulators).
    pub fn with_base_url(base_url: String) -> Result<Self, PipelineError> {
        let client = Client::builder()
            .build()
            .map_err(|err| PipelineError::internal(format!("failed to create HTTP client: {}", err)))?;

        Ok(Self {
            client,
            base_url,
            token: std::env::var(TOKEN_ENV).ok(),
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn crc32c(&self, bucket: &str, key: &str) -> Result<Option<u32>, PipelineError> {
        let url = format!(
            "{}/storage/v1/b/{}/o/{}?fields=crc32c",
            self.base_url,
            bucket,
            encode_object_name(key)
        );

        let response = self.authorize(self.client.get(&url)).send().await?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Ok(None);
        }
        if !status.is_success() {
            return Err(classify_status(status, &url));
        }

        let body: serde_json::Value = response.json().await?;
        let encoded = body
            .get("crc32c")
            .and_then(|value| value.as_str())
            .ok_or_else(|| PipelineError::upload(format!("no crc32c in metadata for {}", key)))?;

        Ok(Some(decode_crc32c(encoded)?))
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> Result<(), PipelineError> {
        let url = format!(
            "{}/upload/storage/v1/b/{}/o?uploadType=media&name={}",
            self.base_url,
            bucket,
            encode_object_name(key)
        );

        debug!("uploading {} bytes to {}/{}", data.len(), bucket, key);

        let response = self
            .authorize(self.client.post(&url))
            .header("Content-Type", content_type)
            .body(data)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(classify_status(status, &url));
        }

        Ok(())
    }
}

/// Percent-encode an object name for use in a URL path or query value.
/// Tile keys contain only slashes beyond unreserved characters.
fn encode_object_name(key: &str) -> String {
    key.replace('/', "%2F")
}

/// Decode the store's base64 big-endian CRC32C field.
fn decode_crc32c(encoded: &str) -> Result<u32, PipelineError> {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|err| PipelineError::upload(format!("bad crc32c encoding: {}", err)))?;

    let bytes: [u8; 4] = bytes
        .try_into()
        .map_err(|_| PipelineError::upload("crc32c is not 4 bytes"))?;

    Ok(u32::from_be_bytes(bytes))
}

/// Encode a CRC32C the way the store reports it.
pub fn encode_crc32c(checksum: u32) -> String {
    base64::engine::general_purpose::STANDARD.encode(checksum.to_be_bytes())
}

fn classify_status(status: reqwest::StatusCode, url: &str) -> PipelineError {
    if status.is_server_error() || status.as_u16() == 429 {
        PipelineError::transient(format!("store returned {} for {}", status, url))
    } else {
        PipelineError::upload(format!("store returned {} for {}", status, url))
    }
}
