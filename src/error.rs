use thiserror::Error;

/// Failures of the payload codec. Decrypt failures drop a single message; they never end a session.
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key length {0}, expected 32 bytes")]
    InvalidKey(usize),
    #[error("encryption failed")]
    Encrypt,
    #[error("ciphertext is not valid base64: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("ciphertext truncated ({0} bytes)")]
    Truncated(usize),
    #[error("ciphertext failed authentication")]
    Authentication,
    #[error("plaintext is not valid utf-8")]
    Utf8,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[cfg(feature = "redis")]
    #[error(transparent)]
    Redis(#[from] redis::RedisError),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum PubSubError {
    #[error("publisher closed")]
    Closed,
    #[error("publish backlog full, envelope dropped")]
    Backlog,
    #[error("failed to encode envelope: {0}")]
    Encode(#[from] prost::EncodeError),
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("connection closed")]
    Closed,
    #[error("protocol error: {0}")]
    Protocol(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required setting {0}")]
    Missing(&'static str),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
}
