//! # Tellus Common
//!
//! Common types, utilities, and shared abstractions for the Tellus terrain
//! kernel.
//!
//! This crate provides foundational types used across all Tellus subsystems:
//! - Chunk coordinate types and world-space conversions
//! - Common error types
//! - Prelude for convenient imports

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

pub mod coords;
pub mod error;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::coords::*;
    pub use crate::error::*;
}

pub use prelude::*;

#[cfg(test)]
mod tests {
    use super::*;
    use glam::Vec3;

    #[test]
    fn test_chunk_coord_round_trip() {
        let dims = Vec3::new(32.0, 32.0, 32.0);
        let coord = ChunkCoord::new(3, -2);
        let center = coord.world_position(dims);
        assert_eq!(ChunkCoord::from_world_position(center, dims), coord);
    }
}
