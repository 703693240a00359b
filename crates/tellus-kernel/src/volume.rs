//! Density-field generation collaborator.
//!
//! The mesh pipeline treats density generation as opaque: anything that can
//! fill a chunk's voxel buffer behind [`VolumeGenerator`] works. The built-in
//! [`HeightfieldGenerator`] runs a WGSL heightfield kernel and applies
//! spherical edit operations; it exists so the kernel is usable (and
//! testable) without an external generator.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use tracing::debug;
use wgpu::util::DeviceExt;
use wgpu::{Buffer, Device, Queue};

use crate::config::VolumeConfig;
use crate::pipeline::workgroup_count;

/// Fill operation: lowers density toward the edit's distance field.
pub const EDIT_OP_FILL: u32 = 0;
/// Carve operation: removes material inside the edit's sphere.
pub const EDIT_OP_CARVE: u32 = 1;

/// One pending volumetric edit.
///
/// The pipeline treats the payload as opaque; only the generator interprets
/// it. Layout mirrors `VolumeEdit` in `volume.wgsl`.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct VolumeEdit {
    /// Edit center in world space
    pub center: [f32; 3],
    /// Sphere radius
    pub radius: f32,
    /// Material written by fill edits
    pub material: u32,
    /// `EDIT_OP_FILL` or `EDIT_OP_CARVE`
    pub operation: u32,
    /// Padding to a 32-byte stride
    pub _pad: [u32; 2],
}

impl VolumeEdit {
    /// Creates a fill edit placing `material`.
    #[must_use]
    pub fn fill(center: Vec3, radius: f32, material: u32) -> Self {
        Self {
            center: center.to_array(),
            radius,
            material,
            operation: EDIT_OP_FILL,
            _pad: [0; 2],
        }
    }

    /// Creates a carve edit removing material.
    #[must_use]
    pub fn carve(center: Vec3, radius: f32) -> Self {
        Self {
            center: center.to_array(),
            radius,
            material: 0,
            operation: EDIT_OP_CARVE,
            _pad: [0; 2],
        }
    }

    /// World-space bounds touched by this edit, slightly inflated so edits
    /// near a chunk boundary are processed by every nearby chunk.
    #[must_use]
    pub fn inflated_bounds(&self) -> (Vec3, Vec3) {
        const SCALE_INFLATION: f32 = 1.5;

        let center = Vec3::from_array(self.center);
        let half = Vec3::splat(self.radius * SCALE_INFLATION);
        (center - half, center + half)
    }
}

/// Uniform parameters for the volume kernels.
///
/// Layout mirrors `VolumeParams` in `volume.wgsl`.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
struct VolumeParams {
    world_offset: [f32; 3],
    voxel_spacing: f32,
    voxels: [u32; 3],
    edit_count: u32,
}

/// A density-field generator consuming a GPU-resident voxel buffer.
pub trait VolumeGenerator {
    /// Fills `volume` with freshly synthesized density for a chunk at
    /// `world_offset`. Enqueues GPU work and returns without waiting.
    fn generate(
        &self,
        device: &Device,
        queue: &Queue,
        volume: &Buffer,
        world_offset: Vec3,
        config: &VolumeConfig,
    );

    /// Applies pending edits to an already populated volume.
    fn apply_edits(
        &self,
        device: &Device,
        queue: &Queue,
        volume: &Buffer,
        world_offset: Vec3,
        edits: &[VolumeEdit],
        config: &VolumeConfig,
    );
}

/// Built-in heightfield density generator.
pub struct HeightfieldGenerator {
    generate: wgpu::ComputePipeline,
    apply_edits: wgpu::ComputePipeline,
    bind_group_layout: wgpu::BindGroupLayout,
}

impl HeightfieldGenerator {
    /// Creates the generator pipelines.
    pub fn new(device: &Device) -> Self {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Volume Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/volume.wgsl").into()),
        });

        let bind_group_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Volume Bind Group Layout"),
            entries: &[
                wgpu::BindGroupLayoutEntry {
                    binding: 0,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: false },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 1,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
                wgpu::BindGroupLayoutEntry {
                    binding: 2,
                    visibility: wgpu::ShaderStages::COMPUTE,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Storage { read_only: true },
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                },
            ],
        });

        let layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Volume Pipeline Layout"),
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
            generate: create("Volume Generate Pipeline", "generate"),
            apply_edits: create("Volume Edit Pipeline", "apply_edits"),
            bind_group_layout,
        }
    }

    fn dispatch(
        &self,
        device: &Device,
        queue: &Queue,
        pipeline: &wgpu::ComputePipeline,
        volume: &Buffer,
        world_offset: Vec3,
        edits: &[VolumeEdit],
        config: &VolumeConfig,
    ) {
        let params = VolumeParams {
            world_offset: world_offset.to_array(),
            voxel_spacing: config.voxel_spacing,
            voxels: [config.voxels_x, config.voxels_y, config.voxels_z],
            edit_count: edits.len() as u32,
        };
        let params_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Volume Params Buffer"),
            contents: bytemuck::bytes_of(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });

        // Storage bindings reject empty buffers; keep one zeroed edit slot.
        let edit_contents: Vec<VolumeEdit> = if edits.is_empty() {
            vec![VolumeEdit::zeroed()]
        } else {
            edits.to_vec()
        };
        let edits_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("Volume Edits Buffer"),
            contents: bytemuck::cast_slice(&edit_contents),
            usage: wgpu::BufferUsages::STORAGE,
        });

        let bind_group = device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("Volume Bind Group"),
            layout: &self.bind_group_layout,
            entries: &[
                wgpu::BindGroupEntry {
                    binding: 0,
                    resource: volume.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 1,
                    resource: params_buffer.as_entire_binding(),
                },
                wgpu::BindGroupEntry {
                    binding: 2,
                    resource: edits_buffer.as_entire_binding(),
                },
            ],
        });

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Volume Encoder"),
        });
        {
            let groups = workgroup_count([config.voxels_x, config.voxels_y, config.voxels_z]);
            let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                label: Some("Volume Pass"),
                timestamp_writes: None,
            });
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.dispatch_workgroups(groups[0], groups[1], groups[2]);
        }
        queue.submit(std::iter::once(encoder.finish()));
    }
}

impl VolumeGenerator for HeightfieldGenerator {
    fn generate(
        &self,
        device: &Device,
        queue: &Queue,
        volume: &Buffer,
        world_offset: Vec3,
        config: &VolumeConfig,
    ) {
        debug!("Generating volume at {world_offset}");
        self.dispatch(device, queue, &self.generate, volume, world_offset, &[], config);
    }

    fn apply_edits(
        &self,
        device: &Device,
        queue: &Queue,
        volume: &Buffer,
        world_offset: Vec3,
        edits: &[VolumeEdit],
        config: &VolumeConfig,
    ) {
        if edits.is_empty() {
            return;
        }
        debug!("Applying {} volume edits at {world_offset}", edits.len());
        self.dispatch(
            device,
            queue,
            &self.apply_edits,
            volume,
            world_offset,
            edits,
            config,
        );
    }
}

impl std::fmt::Debug for HeightfieldGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HeightfieldGenerator").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_edit_layout() {
        // The WGSL storage stride is 32 bytes.
        assert_eq!(std::mem::size_of::<VolumeEdit>(), 32);
        assert_eq!(std::mem::size_of::<VolumeParams>(), 32);
    }

    #[test]
    fn test_edit_constructors() {
        let fill = VolumeEdit::fill(Vec3::new(1.0, 2.0, 3.0), 4.0, 7);
        assert_eq!(fill.operation, EDIT_OP_FILL);
        assert_eq!(fill.material, 7);

        let carve = VolumeEdit::carve(Vec3::ZERO, 2.0);
        assert_eq!(carve.operation, EDIT_OP_CARVE);
    }

    #[test]
    fn test_inflated_bounds() {
        let edit = VolumeEdit::carve(Vec3::new(10.0, 0.0, 0.0), 2.0);
        let (min, max) = edit.inflated_bounds();
        assert!((min.x - 7.0).abs() < f32::EPSILON);
        assert!((max.x - 13.0).abs() < f32::EPSILON);
    }
}
