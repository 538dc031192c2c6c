//! Error types for the proxy.

use thiserror::Error;

/// Proxy error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// CA certificate error.
    #[error("CA error: {0}")]
    Ca(#[from] CaManagerError),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),
}

/// CA manager error type.
#[derive(Debug, Error)]
pub enum CaManagerError {
    /// Failed to generate CA certificate.
    #[error("Failed to generate CA: {0}")]
    Generation(String),

    /// Failed to read CA certificate.
    #[error("Failed to read CA: {0}")]
    Read(#[from] std::io::Error),

    /// Failed to parse CA certificate.
    #[error("Failed to parse CA: {0}")]
    Parse(String),

    /// Failed to write CA certificate.
    #[error("Failed to write CA: {0}")]
    Write(String),
}

/// Reasons a response capture is abandoned.
///
/// These never reach the proxy client; the transaction continues as
/// pass-through.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ReassemblyError {
    /// Malformed chunked transfer framing.
    #[error("Malformed chunked framing: {0}")]
    Framing(String),

    /// The body ended before the terminal chunk.
    #[error("Body ended before the terminal chunk")]
    Truncated,

    /// Content coding the decoder does not handle.
    #[error("Unsupported content coding: {0}")]
    UnsupportedCoding(String),

    /// Corrupt compressed stream.
    #[error("Failed to decode body: {0}")]
    Decode(String),

    /// Decoded body is larger than the buffer bound.
    #[error("Decoded body exceeds {max} bytes")]
    Overflow { max: usize },
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
