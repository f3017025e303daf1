//! Error type for the culling/rasterization core.
//!
//! Almost all runtime failure handling in this crate is local and silent
//! (graceful degradation); errors are only surfaced from registration and
//! readback paths. Caller contract violations are asserted instead.

use thiserror::Error;

/// Errors surfaced by fallible construction, registration, and readback.
#[derive(Debug, Error)]
pub enum Error {
    /// The raster pipeline registry is at its configured bin capacity.
    #[error("raster bin capacity exhausted ({registered} of {capacity} bins)")]
    BinCapacityExhausted {
        /// Number of bins already registered.
        registered: usize,
        /// Configured capacity.
        capacity: usize,
    },

    /// A GPU readback (stats or streaming feedback) failed to map.
    #[error("buffer readback failed: {0}")]
    Readback(String),

    /// Scene buffers are inconsistent with the culling context configuration.
    #[error("scene mismatch: {0}")]
    SceneMismatch(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, Error>;
