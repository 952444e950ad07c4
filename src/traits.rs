use async_trait::async_trait;
use thiserror::Error;

/// Raw HTTP reply as seen by the fetcher.
#[derive(Debug, Clone)]
pub struct HttpReply {
    pub status: u16,
    pub body: Vec<u8>,
}

/// Failure below the HTTP status layer. Always transient.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    #[error("Request timed out")]
    Timeout,
    #[error("Connection error: {0}")]
    Connect(String),
}

/// Terminal outcome of a fetch that produced no body.
///
/// Every variant means "no data" for the caller.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    #[error("Resource not found")]
    NotFound,
    #[error("Unexpected HTTP status {0}")]
    Status(u16),
    #[error("Gave up after {attempts} attempts")]
    RetriesExhausted { attempts: u32 },
}

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("Malformed payload: {0}")]
    Malformed(String),
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Issues one GET request. No retries at this layer.
    async fn get(&self, url: &str) -> Result<HttpReply, TransportError>;
}
