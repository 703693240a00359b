//! Error types for the Tellus terrain kernel.

use thiserror::Error;

/// Top-level error type for Tellus operations.
#[derive(Debug, Error)]
pub enum TellusError {
    /// GPU-related errors
    #[error("GPU error: {0}")]
    Gpu(#[from] GpuError),

    /// World/chunk errors
    #[error("World error: {0}")]
    World(#[from] WorldError),

    /// Configuration validation errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// GPU-specific errors.
#[derive(Debug, Error)]
pub enum GpuError {
    /// Failed to initialize GPU
    #[error("GPU initialization failed: {0}")]
    InitFailed(String),

    /// Buffer allocation failed
    #[error("Buffer allocation failed: {0}")]
    BufferAlloc(String),

    /// Device→host transfer reported a fault
    #[error("GPU readback failed: {0}")]
    ReadbackFault(String),
}

/// World and chunk errors.
#[derive(Debug, Error)]
pub enum WorldError {
    /// Chunk not found
    #[error("Chunk not found at ({x}, {z})")]
    ChunkNotFound {
        /// X coordinate
        x: i32,
        /// Z coordinate
        z: i32,
    },

    /// Chunk load failed
    #[error("Failed to load chunk: {0}")]
    LoadFailed(String),

    /// Chunk save failed
    #[error("Failed to save chunk: {0}")]
    SaveFailed(String),

    /// Invalid chunk data
    #[error("Invalid chunk data: {0}")]
    InvalidData(String),
}

/// Result type alias for Tellus operations.
pub type TellusResult<T> = Result<T, TellusError>;
