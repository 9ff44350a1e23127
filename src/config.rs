use std::str::FromStr;
use std::time::Duration;

use crate::error::{ProcessingError, Result};
use crate::retry::RetryPolicy;

pub const DEFAULT_API_URL: &str = "http://localhost:5000";
pub const DEFAULT_MAX_FREE_IMAGES: u32 = 5;

/// Connection and signing settings for [`RemoteClient`](crate::RemoteClient).
///
/// Use [`ClientConfig::builder()`] in code, or [`ClientConfig::from_env()`] at
/// startup. Credentials have no default: a config without them is rejected by
/// [`ClientConfig::validate`].
#[derive(Clone)]
pub struct ClientConfig {
    /// Base URL of the processing service, without a trailing slash.
    pub base_url: String,

    pub api_key: String,
    pub api_secret: String,

    /// Value of the `Origin` header. Defaults to the base URL.
    pub origin: Option<String>,

    /// Total attempts per request, including the first.
    pub max_retries: u32,

    /// Base delay between attempts; attempt `n` waits `retry_delay * n`.
    pub retry_delay: Duration,

    /// Per-request timeout.
    pub timeout: Duration,

    /// Uploads above this size are recompressed before sending.
    pub max_upload_bytes: usize,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientConfig")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key)
            .field("api_secret", &"<redacted>")
            .field("origin", &self.origin)
            .field("max_retries", &self.max_retries)
            .field("retry_delay", &self.retry_delay)
            .field("timeout", &self.timeout)
            .field("max_upload_bytes", &self.max_upload_bytes)
            .finish()
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_API_URL.to_string(),
            api_key: String::new(),
            api_secret: String::new(),
            origin: None,
            max_retries: 3,
            retry_delay: Duration::from_millis(1000),
            timeout: Duration::from_secs(60),
            max_upload_bytes: 10 * 1024 * 1024,
        }
    }
}

impl ClientConfig {
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::default()
    }

    /// Read the configuration from `BGREMOVE_*` environment variables.
    ///
    /// `BGREMOVE_API_KEY` and `BGREMOVE_API_SECRET` are required.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            base_url: lookup("BGREMOVE_API_URL")
                .map(normalize)
                .unwrap_or(defaults.base_url),
            api_key: lookup("BGREMOVE_API_KEY").unwrap_or_default(),
            api_secret: lookup("BGREMOVE_API_SECRET").unwrap_or_default(),
            origin: lookup("BGREMOVE_ORIGIN"),
            max_retries: parse_var(&lookup, "BGREMOVE_MAX_RETRIES")?
                .unwrap_or(defaults.max_retries),
            retry_delay: parse_var(&lookup, "BGREMOVE_RETRY_DELAY_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.retry_delay),
            timeout: parse_var(&lookup, "BGREMOVE_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.timeout),
            max_upload_bytes: parse_var::<usize, _>(&lookup, "BGREMOVE_MAX_UPLOAD_MB")?
                .map(|mb| mb * 1024 * 1024)
                .unwrap_or(defaults.max_upload_bytes),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject configs that cannot sign requests.
    pub fn validate(&self) -> Result<()> {
        if self.api_key.trim().is_empty() || self.api_secret.trim().is_empty() {
            return Err(ProcessingError::Configuration(
                "API credentials are not configured (BGREMOVE_API_KEY / BGREMOVE_API_SECRET)"
                    .into(),
            ));
        }
        if self.base_url.is_empty() {
            return Err(ProcessingError::Configuration("API URL is empty".into()));
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.max_retries, self.retry_delay)
    }

    pub fn origin(&self) -> &str {
        self.origin.as_deref().unwrap_or(&self.base_url)
    }
}

/// Builder for [`ClientConfig`].
#[derive(Default)]
pub struct ClientConfigBuilder {
    config: ClientConfig,
}

impl ClientConfigBuilder {
    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.base_url = normalize(url.into());
        self
    }

    pub fn with_credentials(mut self, api_key: impl Into<String>, api_secret: impl Into<String>) -> Self {
        self.config.api_key = api_key.into();
        self.config.api_secret = api_secret.into();
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.config.origin = Some(origin.into());
        self
    }

    pub fn with_max_retries(mut self, max: u32) -> Self {
        self.config.max_retries = max;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay = delay;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    pub fn with_max_upload_bytes(mut self, bytes: usize) -> Self {
        self.config.max_upload_bytes = bytes;
        self
    }

    /// Build and validate.
    pub fn build(self) -> Result<ClientConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Settings for [`BatchOrchestrator`](crate::BatchOrchestrator).
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Free operations allowed for an anonymous session.
    pub max_free_images: u32,

    /// How long the cancellation flag stays set after "delete all".
    pub cancel_reset_delay: Duration,

    /// Result cache entries kept by the remote client.
    pub cache_capacity: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_free_images: DEFAULT_MAX_FREE_IMAGES,
            cancel_reset_delay: Duration::from_millis(1000),
            cache_capacity: 256,
        }
    }
}

impl OrchestratorConfig {
    pub fn builder() -> OrchestratorConfigBuilder {
        OrchestratorConfigBuilder::default()
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        Ok(Self {
            max_free_images: parse_var(&lookup, "BGREMOVE_MAX_FREE_IMAGES")?
                .unwrap_or(defaults.max_free_images),
            cancel_reset_delay: parse_var(&lookup, "BGREMOVE_CANCEL_RESET_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.cancel_reset_delay),
            cache_capacity: parse_var(&lookup, "BGREMOVE_CACHE_CAPACITY")?
                .unwrap_or(defaults.cache_capacity),
        })
    }
}

/// Builder for [`OrchestratorConfig`].
#[derive(Default)]
pub struct OrchestratorConfigBuilder {
    config: OrchestratorConfig,
}

impl OrchestratorConfigBuilder {
    pub fn with_max_free_images(mut self, max: u32) -> Self {
        self.config.max_free_images = max;
        self
    }

    pub fn with_cancel_reset_delay(mut self, delay: Duration) -> Self {
        self.config.cancel_reset_delay = delay;
        self
    }

    pub fn with_cache_capacity(mut self, capacity: usize) -> Self {
        self.config.cache_capacity = capacity;
        self
    }

    pub fn build(self) -> OrchestratorConfig {
        self.config
    }
}

fn normalize(url: String) -> String {
    url.trim().trim_end_matches('/').to_string()
}

fn parse_var<T, F>(lookup: &F, name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|e| {
            ProcessingError::Configuration(format!("Invalid value for {}: {:?} ({})", name, raw, e))
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn test_missing_credentials_is_fatal() {
        let err = ClientConfig::from_lookup(env(&[])).unwrap_err();
        assert!(matches!(err, ProcessingError::Configuration(_)));

        let err = ClientConfig::from_lookup(env(&[("BGREMOVE_API_KEY", "k")])).unwrap_err();
        assert!(matches!(err, ProcessingError::Configuration(_)));
    }

    #[test]
    fn test_env_defaults_and_overrides() {
        let config = ClientConfig::from_lookup(env(&[
            ("BGREMOVE_API_KEY", "key"),
            ("BGREMOVE_API_SECRET", "secret"),
            ("BGREMOVE_API_URL", "https://api.example.com/"),
            ("BGREMOVE_MAX_RETRIES", "5"),
            ("BGREMOVE_MAX_UPLOAD_MB", "2"),
        ]))
        .unwrap();

        assert_eq!(config.base_url, "https://api.example.com");
        assert_eq!(config.origin(), "https://api.example.com");
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.retry_delay, Duration::from_millis(1000));
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.max_upload_bytes, 2 * 1024 * 1024);
    }

    #[test]
    fn test_invalid_number_is_reported() {
        let err = ClientConfig::from_lookup(env(&[
            ("BGREMOVE_API_KEY", "key"),
            ("BGREMOVE_API_SECRET", "secret"),
            ("BGREMOVE_MAX_RETRIES", "lots"),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("BGREMOVE_MAX_RETRIES"));
    }

    #[test]
    fn test_builder() {
        let config = ClientConfig::builder()
            .with_base_url("http://127.0.0.1:9000/")
            .with_credentials("k", "s")
            .with_origin("https://app.example.com")
            .with_max_retries(2)
            .with_retry_delay(Duration::from_millis(10))
            .build()
            .unwrap();
        assert_eq!(config.base_url, "http://127.0.0.1:9000");
        assert_eq!(config.origin(), "https://app.example.com");
        assert_eq!(config.retry_policy().max_attempts, 2);
        assert!(!format!("{:?}", config).contains("\"s\""));

        assert!(ClientConfig::builder().build().is_err());
    }

    #[test]
    fn test_orchestrator_config() {
        let defaults = OrchestratorConfig::from_lookup(env(&[])).unwrap();
        assert_eq!(defaults.max_free_images, DEFAULT_MAX_FREE_IMAGES);
        assert_eq!(defaults.cancel_reset_delay, Duration::from_secs(1));
        assert_eq!(defaults.cache_capacity, 256);

        let custom = OrchestratorConfig::from_lookup(env(&[
            ("BGREMOVE_MAX_FREE_IMAGES", "12"),
            ("BGREMOVE_CANCEL_RESET_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(custom.max_free_images, 12);
        assert_eq!(custom.cancel_reset_delay, Duration::from_millis(250));

        let built = OrchestratorConfig::builder()
            .with_max_free_images(3)
            .with_cache_capacity(8)
            .build();
        assert_eq!(built.max_free_images, 3);
        assert_eq!(built.cache_capacity, 8);
    }
}
