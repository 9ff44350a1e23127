use sha2::{Digest, Sha256};

/// Headers attached to every call to the processing endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedHeaders {
    pub api_key: String,
    pub timestamp: String,
    pub signature: String,
}

/// Lowercase hex SHA-256 of `"{api_key}:{timestamp}:{api_secret}"`.
pub fn signature(api_key: &str, timestamp: &str, api_secret: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(format!("{}:{}:{}", api_key, timestamp, api_secret).as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Sign a request at the given Unix time (seconds).
pub fn sign_at(api_key: &str, api_secret: &str, unix_seconds: i64) -> SignedHeaders {
    let timestamp = unix_seconds.to_string();
    SignedHeaders {
        api_key: api_key.to_string(),
        signature: signature(api_key, &timestamp, api_secret),
        timestamp,
    }
}

/// Sign a request now.
pub fn sign(api_key: &str, api_secret: &str) -> SignedHeaders {
    sign_at(api_key, api_secret, chrono::Utc::now().timestamp())
}
