//! Dual-contouring compute pipeline.
//!
//! One shader module with four entry points, dispatched in sequence per LOD
//! by the mesh-extraction worker:
//!
//! 1. `generate_vertices`: one invocation per interior cell
//! 2. `merge_vertices`: iterated at doubling strides, ping-ponging the
//!    vertex buffers, collapsing vertex density the way a parallel reduction
//!    collapses sums
//! 3. `populate_boundary`: re-contours the outer cell shell at the finest
//!    detail so chunk seams stay watertight across LOD boundaries
//! 4. `triangulate`: emits index triples and bumps the atomic vertex and
//!    triangle counters
//!
//! wgpu has no append/counter buffer type, so the counters live in their own
//! small storage buffers and are copied into the triangle buffer's two
//! reserved header slots with `copy_buffer_to_buffer` after the passes run.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use wgpu::{BindGroup, Buffer, CommandEncoder, ComputePipeline, Device};

/// Workgroup edge length used by every contouring pass.
pub const WORKGROUP_SIZE: u32 = 4;

/// Number of u32 header slots reserved at the front of the triangle buffer
/// (vertex count, triangle count).
pub const TRIANGLE_HEADER_SLOTS: u32 = 2;

/// Uniform parameters for the contouring passes.
///
/// Layout mirrors `ContourParams` in `dual_contouring.wgsl`.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub struct ContourParams {
    /// Chunk origin in world space
    pub world_offset: [f32; 3],
    /// Current merge stride (1 outside the merge pass)
    pub cell_stride: u32,
    /// Voxel counts along each axis
    pub voxels: [u32; 3],
    /// World-space voxel spacing
    pub voxel_spacing: f32,
}

impl ContourParams {
    /// Creates parameters for a chunk at `world_offset`.
    #[must_use]
    pub fn new(world_offset: Vec3, voxels: [u32; 3], voxel_spacing: f32, cell_stride: u32) -> Self {
        Self {
            world_offset: world_offset.to_array(),
            cell_stride,
            voxels,
            voxel_spacing,
        }
    }
}

/// Returns the number of workgroups covering `extent` invocations per axis.
#[must_use]
pub fn workgroup_count(extent: [u32; 3]) -> [u32; 3] {
    [
        extent[0].div_ceil(WORKGROUP_SIZE).max(1),
        extent[1].div_ceil(WORKGROUP_SIZE).max(1),
        extent[2].div_ceil(WORKGROUP_SIZE).max(1),
    ]
}

/// GPU compute pipeline for dual-contouring mesh extraction.
pub struct ContourPipeline {
    generate: ComputePipeline,
    merge: ComputePipeline,
    boundary: ComputePipeline,
    triangulate: ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

impl ContourPipeline {
    /// Creates the pipeline and its bind group layout.
    pub fn new(device: &Device) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Dual Contouring Shader"),
            source: wgpu::ShaderSource::Wgsl(
                include_str!("shaders/dual_contouring.wgsl").into(),
            ),
        });

        let storage_entry = |binding: u32, read_only: bool| wgpu::BindGroupLayoutEntry {
            binding,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: wgpu::BindingType::Buffer {
                ty: wgpu::BufferBindingType::Storage { read_only },
                has_dynamic_offset: false,
                min_binding_size: None,
            },
            count: None,
        };

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Contour Bind Group Layout"),
            entries: &[
                storage_entry(0, true),  // voxel volume
                storage_entry(1, false), // cell info lookup table
                storage_entry(2, false), // vertices in
                storage_entry(3, false), // vertices out
                storage_entry(4, false), // triangles
                storage_entry(5, false), // vertex counter
                storage_entry(6, false), // triangle counter
                wgpu::BindGroupLayoutEntry {
                    binding: 7,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Contour Pipeline Layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });

        let create = |label: &str, entry_point: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: Some(&layout),
                module: &shader,
                entry_point: Some(entry_point),
                compilation_options: wgpu::PipelineCompilationOptions::default(),
                cache: None,
            })
        };

        Self {
            generate: create("Contour Generate Pipeline", "generate_vertices"),
            merge: create("Contour Merge Pipeline", "merge_vertices"),
            boundary: create("Contour Boundary Pipeline", "populate_boundary"),
            triangulate: create("Contour Triangulate Pipeline", "triangulate"),
            bind_group_layout,
        }
    }

    /// Returns the bind group layout shared by all four passes.
    #[must_use]
    pub fn bind_group_layout(&self) -> &wgpu::BindGroupLayout {
        &self.bind_group_layout
    }

    /// Creates a bind group for one pass.
    #[allow(clippy::too_many_arguments)]
    #[must_use]
    pub fn create_bind_group(
        &self,
        device: &Device,
        voxel_volume: &Buffer,
        cell_info: &Buffer,
        vertices_in: &Buffer,
        vertices_out: &Buffer,
        triangles: &Buffer,
        vertex_counter: &Buffer,
        triangle_counter: &Buffer,
        params: &Buffer,
    ) -> BindGroup {
        fn entry(binding: u32, buffer: &Buffer) -> wgpu::BindGroupEntry<'_> {
            wgpu::BindGroupEntry {
                binding,
                resource: buffer.as_entire_binding(),
            }
        }

        device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Contour Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                entry(0, voxel_volume),
                entry(1, cell_info),
                entry(2, vertices_in),
                entry(3, vertices_out),
                entry(4, triangles),
                entry(5, vertex_counter),
                entry(6, triangle_counter),
                entry(7, params),
            ],
        })
    }

    fn dispatch(
        pipeline: &ComputePipeline,
        label: &str,
        encoder: &mut CommandEncoder,
        bind_group: &BindGroup,
        extent: [u32; 3],
    ) {
        let groups = workgroup_count(extent);
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(label),
            timestamp_writes: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, bind_group, &[]);
        pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
    }

    /// Dispatches the interior-vertex pass over `(cells - 2)` per axis.
    pub fn dispatch_generate(
        &self,
        encoder: &mut CommandEncoder,
        bind_group: &BindGroup,
        cells: [u32; 3],
    ) {
        let extent = [cells[0] - 2, cells[1] - 2, cells[2] - 2];
        Self::dispatch(&self.generate, "Contour Generate", encoder, bind_group, extent);
    }

    /// Dispatches one merge iteration over `cells / stride` per axis.
    pub fn dispatch_merge(
        &self,
        encoder: &mut CommandEncoder,
        bind_group: &BindGroup,
        cells: [u32; 3],
        stride: u32,
    ) {
        let extent = [cells[0] / stride, cells[1] / stride, cells[2] / stride];
        Self::dispatch(&self.merge, "Contour Merge", encoder, bind_group, extent);
    }

    /// Dispatches the boundary pass over the full cell count.
    pub fn dispatch_boundary(
        &self,
        encoder: &mut CommandEncoder,
        bind_group: &BindGroup,
        cells: [u32; 3],
    ) {
        Self::dispatch(&self.boundary, "Contour Boundary", encoder, bind_group, cells);
    }

    /// Dispatches the triangulation pass over `(cells - 1)` per axis.
    pub fn dispatch_triangulate(
        &self,
        encoder: &mut CommandEncoder,
        bind_group: &BindGroup,
        cells: [u32; 3],
    ) {
        let extent = [cells[0] - 1, cells[1] - 1, cells[2] - 1];
        Self::dispatch(
            &self.triangulate,
            "Contour Triangulate",
            encoder,
            bind_group,
            extent,
        );
    }
}

impl std::fmt::Debug for ContourPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContourPipeline").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::create_validated_instance;

    #[test]
    fn test_params_layout() {
        // The WGSL uniform block is 32 bytes.
        assert_eq!(std::mem::size_of::<ContourParams>(), 32);
    }

    #[test]
    fn test_workgroup_count() {
        assert_eq!(workgroup_count([8, 8, 8]), [2, 2, 2]);
        assert_eq!(workgroup_count([9, 8, 7]), [3, 2, 2]);
        // Degenerate extents still dispatch one group.
        assert_eq!(workgroup_count([0, 1, 4]), [1, 1, 1]);
    }

    #[test]
    fn test_pipeline_creation() {
        let instance = create_validated_instance();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::LowPower,
            compatible_surface: None,
            force_fallback_adapter: true,
        }));

        if let Some(adapter) = adapter {
            if let Ok((device, _queue)) = pollster::block_on(
                adapter.request_device(&wgpu::DeviceDescriptor::default(), None),
            ) {
                let _pipeline = ContourPipeline::new(&device);
            }
        }
    }
}
