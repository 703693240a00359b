//! GPU vertex layout shared with the contouring compute shader.

use bytemuck::{Pod, Zeroable};

/// A mesh vertex as written by the dual-contouring kernel.
///
/// The layout matches the `Vertex` struct in `shaders/dual_contouring.wgsl`:
/// 32 bytes, position and normal padded out by the material index and an
/// explicit filler word so the struct tiles cleanly in a storage buffer.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct GpuVertex {
    /// Position in chunk-local space
    pub position: [f32; 3],
    /// Packed material index of the dominant voxel
    pub material: u32,
    /// Surface normal from the density gradient
    pub normal: [f32; 3],
    /// Padding to a 32-byte stride
    pub _pad: u32,
}

impl GpuVertex {
    /// Size of one vertex in bytes.
    pub const SIZE: usize = std::mem::size_of::<Self>();
}

impl Default for GpuVertex {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            material: 0,
            normal: [0.0, 1.0, 0.0],
            _pad: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_size() {
        // The WGSL side relies on a 32-byte stride.
        assert_eq!(GpuVertex::SIZE, 32);
    }

    #[test]
    fn test_vertex_default() {
        let vertex = GpuVertex::default();
        assert_eq!(vertex.material, 0);
        assert_eq!(vertex.normal, [0.0, 1.0, 0.0]);
    }
}
