//! Coordinate types for the chunked terrain grid.
//!
//! Terrain is column based: chunks tile the world along the x and z axes and
//! the y component of a chunk coordinate is always zero. Chunk coordinates
//! are derived from world positions by dividing by the chunk dimensions and
//! rounding to the nearest integer, so a chunk's world position is the center
//! of its volume rather than a corner.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use serde::{Deserialize, Serialize};

/// Coordinate of a chunk in the terrain grid.
///
/// Uniquely keys one chunk. The y component exists for forward compatibility
/// with stacked terrain but is always zero today.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Pod, Zeroable)]
#[repr(C)]
pub struct ChunkCoord {
    /// X coordinate in chunk grid space
    pub x: i32,
    /// Y coordinate in chunk grid space (always zero)
    pub y: i32,
    /// Z coordinate in chunk grid space
    pub z: i32,
}

impl ChunkCoord {
    /// Creates a new chunk coordinate in the ground plane.
    #[must_use]
    pub const fn new(x: i32, z: i32) -> Self {
        Self { x, y: 0, z }
    }

    /// Returns the chunk coordinate containing the given world position.
    ///
    /// Positions are divided by the chunk dimensions and rounded, matching
    /// the convention that a chunk's world position is its center.
    #[must_use]
    pub fn from_world_position(position: Vec3, chunk_dimensions: Vec3) -> Self {
        Self::new(
            (position.x / chunk_dimensions.x).round() as i32,
            (position.z / chunk_dimensions.z).round() as i32,
        )
    }

    /// Returns the world-space position of this chunk (its center).
    #[must_use]
    pub fn world_position(self, chunk_dimensions: Vec3) -> Vec3 {
        Vec3::new(
            self.x as f32 * chunk_dimensions.x,
            0.0,
            self.z as f32 * chunk_dimensions.z,
        )
    }

    /// Returns the squared distance from this chunk's world position to a
    /// point.
    #[must_use]
    pub fn distance_squared(self, chunk_dimensions: Vec3, point: Vec3) -> f32 {
        self.world_position(chunk_dimensions).distance_squared(point)
    }

    /// Returns the four cardinal neighbor coordinates (no diagonals).
    #[must_use]
    pub const fn cardinal_neighbors(self) -> [ChunkCoord; 4] {
        [
            ChunkCoord::new(self.x + 1, self.z),
            ChunkCoord::new(self.x - 1, self.z),
            ChunkCoord::new(self.x, self.z + 1),
            ChunkCoord::new(self.x, self.z - 1),
        ]
    }
}

impl std::fmt::Display for ChunkCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Chunk({}, {}, {})", self.x, self.y, self.z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_world_position_rounds() {
        let dims = Vec3::new(32.0, 32.0, 32.0);

        assert_eq!(
            ChunkCoord::from_world_position(Vec3::ZERO, dims),
            ChunkCoord::new(0, 0)
        );
        // 15.9 rounds down to chunk 0, 16.1 rounds up to chunk 1.
        assert_eq!(
            ChunkCoord::from_world_position(Vec3::new(15.9, 0.0, 0.0), dims),
            ChunkCoord::new(0, 0)
        );
        assert_eq!(
            ChunkCoord::from_world_position(Vec3::new(16.1, 0.0, 0.0), dims),
            ChunkCoord::new(1, 0)
        );
        assert_eq!(
            ChunkCoord::from_world_position(Vec3::new(-16.1, 0.0, -48.0), dims),
            ChunkCoord::new(-1, -2)
        );
    }

    #[test]
    fn test_world_position_is_center() {
        let dims = Vec3::new(30.0, 30.0, 30.0);
        let coord = ChunkCoord::new(2, -1);
        assert_eq!(coord.world_position(dims), Vec3::new(60.0, 0.0, -30.0));
    }

    #[test]
    fn test_cardinal_neighbors() {
        let neighbors = ChunkCoord::new(0, 0).cardinal_neighbors();
        assert_eq!(neighbors.len(), 4);
        assert!(neighbors.contains(&ChunkCoord::new(1, 0)));
        assert!(neighbors.contains(&ChunkCoord::new(-1, 0)));
        assert!(neighbors.contains(&ChunkCoord::new(0, 1)));
        assert!(neighbors.contains(&ChunkCoord::new(0, -1)));
        // No diagonals.
        assert!(!neighbors.contains(&ChunkCoord::new(1, 1)));
    }

    #[test]
    fn test_distance_squared() {
        let dims = Vec3::new(10.0, 10.0, 10.0);
        let coord = ChunkCoord::new(1, 0);
        let d2 = coord.distance_squared(dims, Vec3::ZERO);
        assert!((d2 - 100.0).abs() < f32::EPSILON);
    }

    proptest::proptest! {
        #[test]
        fn prop_world_position_round_trips(x in -10_000i32..10_000, z in -10_000i32..10_000) {
            let dims = Vec3::new(24.0, 24.0, 24.0);
            let coord = ChunkCoord::new(x, z);
            let back = ChunkCoord::from_world_position(coord.world_position(dims), dims);
            proptest::prop_assert_eq!(back, coord);
        }
    }
}
