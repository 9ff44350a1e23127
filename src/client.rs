use std::sync::Arc;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::Client;
use serde::Deserialize;
use tracing::instrument;

use crate::cache::{CacheKey, ResultCache};
use crate::config::ClientConfig;
use crate::error::{ProcessingError, Result};
use crate::imaging::{self, UploadPayload};
use crate::signing;
use crate::types::*;
use crate::ImageProcessor;

const DEFAULT_CACHE_CAPACITY: usize = 256;

#[derive(Debug, Deserialize)]
struct ErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// Pull the human-readable message out of an error response body.
fn error_message(body: &str) -> String {
    match serde_json::from_str::<ErrorBody>(body) {
        Ok(parsed) => parsed.error.or(parsed.message).unwrap_or_default(),
        Err(_) => body.trim().chars().take(200).collect(),
    }
}

/// Async client for the background-removal service.
///
/// Every request is signed with the configured key pair and retried on
/// transient failures. Results are memoized per file identity, model and
/// output spec, so asking twice for the same image costs one network call.
///
/// # Example
/// ```no_run
/// use bgremove_batch::{ClientConfig, RemoteClient, SourceImage, ProcessingConfig};
///
/// # async fn example() -> bgremove_batch::Result<()> {
/// let client = RemoteClient::new(ClientConfig::from_env()?)?;
/// let source = SourceImage::from_path("photo.jpg".as_ref()).await?;
/// let result = client
///     .remove_background(&source, "bria", &ProcessingConfig::default().output_spec())
///     .await?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct RemoteClient {
    http: Client,
    config: ClientConfig,
    cache: Arc<ResultCache>,
}

impl RemoteClient {
    /// Create a client. Fails if the credentials are missing.
    pub fn new(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let http = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ProcessingError::Network {
                context: "Failed to build HTTP client".into(),
                source: e,
            })?;
        Ok(Self {
            http,
            config,
            cache: Arc::new(ResultCache::new(DEFAULT_CACHE_CAPACITY)),
        })
    }

    /// Use a custom `reqwest::Client` (for connection pooling, proxies, TLS).
    pub fn with_http_client(mut self, client: Client) -> Self {
        self.http = client;
        self
    }

    /// Replace the result cache with a fresh one holding `capacity` entries.
    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.cache = Arc::new(ResultCache::new(capacity));
        self
    }

    /// Share a cache between several clients.
    pub fn with_cache(mut self, cache: Arc<ResultCache>) -> Self {
        self.cache = cache;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.config.base_url
    }

    pub fn cache(&self) -> &ResultCache {
        &self.cache
    }

    fn unreachable(&self, e: reqwest::Error) -> ProcessingError {
        if e.is_timeout() {
            ProcessingError::Timeout(self.config.base_url.clone())
        } else {
            ProcessingError::Network {
                context: format!(
                    "Cannot connect to processing service at {}",
                    self.config.base_url
                ),
                source: e,
            }
        }
    }

    /// Check whether the service answers on `/health`.
    pub async fn health(&self) -> Result<bool> {
        let url = format!("{}/health", self.config.base_url);
        let resp = self
            .http
            .get(&url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;
        Ok(resp.status().is_success())
    }

    /// Remove the background of `source` (and resize or crop per `spec.mode`).
    ///
    /// With a target size the returned image is fitted into that box on a
    /// transparent canvas.
    #[instrument(skip(self, source, spec), fields(file = %source.name, size = source.size))]
    pub async fn remove_background(
        &self,
        source: &SourceImage,
        model: &str,
        spec: &OutputSpec,
    ) -> Result<ProcessedImage> {
        let key = CacheKey::new(source, model, spec);
        if let Some(hit) = self.cache.get(&key) {
            tracing::debug!("Result cache hit");
            return Ok(hit);
        }

        let handle = source.data.clone();
        let name = source.name.clone();
        let max_bytes = self.config.max_upload_bytes;
        let payload = run_blocking(move || {
            let bytes = handle
                .bytes()
                .ok_or_else(|| ProcessingError::Other(format!("Source image {} was released", name)))?;
            imaging::prepare_upload(bytes, &name, max_bytes)
        })
        .await?;

        let policy = self.config.retry_policy();
        let payload_ref = &payload;
        let raw = policy
            .run(move |attempt| self.send_once(payload_ref, model, spec.mode, attempt))
            .await?;

        let target = spec.target;
        let result = run_blocking(move || imaging::finish_result(raw, target)).await?;
        tracing::debug!(width = result.width, height = result.height, "Background removed");

        self.cache.insert(key, result.clone());
        Ok(result)
    }

    async fn send_once(
        &self,
        payload: &UploadPayload,
        model: &str,
        mode: Option<ProcessingMode>,
        attempt: u32,
    ) -> Result<Vec<u8>> {
        let url = format!("{}/remove-background", self.config.base_url);
        let headers = signing::sign(&self.config.api_key, &self.config.api_secret);

        let mut form = Form::new()
            .part("image", image_part(payload)?)
            .text("model", model.to_string());
        if let Some(mode) = mode {
            form = form.text("mode", mode.as_str());
        }

        tracing::debug!(attempt, bytes = payload.bytes.len(), "POST {}", url);
        let resp = self
            .http
            .post(&url)
            .header("X-API-Key", &headers.api_key)
            .header("X-Timestamp", &headers.timestamp)
            .header("X-Signature", &headers.signature)
            .header("Origin", self.config.origin())
            .multipart(form)
            .send()
            .await
            .map_err(|e| self.unreachable(e))?;

        let status = resp.status();
        if !status.is_success() {
            let code = status.as_u16();
            let body = resp.text().await.unwrap_or_default();
            let message = error_message(&body);
            return Err(match code {
                401 | 403 => ProcessingError::Auth {
                    status: code,
                    message,
                },
                _ => ProcessingError::Remote {
                    status: code,
                    message,
                },
            });
        }

        let bytes = resp.bytes().await.map_err(|e| self.unreachable(e))?;
        Ok(bytes.to_vec())
    }
}

impl ImageProcessor for RemoteClient {
    async fn process(
        &self,
        source: &SourceImage,
        model: &str,
        spec: &OutputSpec,
    ) -> Result<ProcessedImage> {
        self.remove_background(source, model, spec).await
    }
}

/// Multipart file part for the upload. A bad MIME type is permanent, not retried.
fn image_part(payload: &UploadPayload) -> Result<Part> {
    Part::bytes(payload.bytes.clone())
        .file_name(payload.file_name.clone())
        .mime_str(&payload.mime)
        .map_err(|e| ProcessingError::Other(format!("Invalid MIME type {}: {}", payload.mime, e)))
}

async fn run_blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ProcessingError::Other(format!("Image task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_message_extraction() {
        assert_eq!(error_message(r#"{"error":"Invalid file"}"#), "Invalid file");
        assert_eq!(error_message(r#"{"message":"Unauthorized"}"#), "Unauthorized");
        assert_eq!(error_message(r#"{"status":"error"}"#), "");
        assert_eq!(error_message("  Bad Gateway\n"), "Bad Gateway");
    }

    #[test]
    fn test_invalid_mime_is_not_retryable() {
        let payload = UploadPayload {
            bytes: vec![1, 2, 3],
            file_name: "cat.png".into(),
            mime: "bogus".into(),
        };
        let err = image_part(&payload).unwrap_err();
        assert!(matches!(err, ProcessingError::Other(_)));
        assert!(!err.is_transient());

        let payload = UploadPayload {
            mime: "image/png".into(),
            ..payload
        };
        assert!(image_part(&payload).is_ok());
    }

    #[test]
    fn test_new_requires_credentials() {
        let err = RemoteClient::new(ClientConfig::default()).unwrap_err();
        assert!(matches!(err, ProcessingError::Configuration(_)));

        let config = ClientConfig::builder()
            .with_credentials("key", "secret")
            .with_base_url("http://127.0.0.1:1/")
            .build()
            .unwrap();
        let client = RemoteClient::new(config).unwrap().with_cache_capacity(4);
        assert_eq!(client.base_url(), "http://127.0.0.1:1");
        assert!(client.cache().is_empty());
    }
}
