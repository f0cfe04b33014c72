//! Crate error types.

use thiserror::Error;

/// Errors from encoding or decoding snapshot DTOs.
#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot JSON encoding failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("snapshot JSON decoding failed: {0}")]
    Decode(#[source] serde_json::Error),
}
