//! GPU validation helpers.
//!
//! In debug builds the wgpu validation layer is enabled to catch GPU errors
//! early; release builds run without it.

use tracing::info;

/// Returns wgpu instance flags with validation enabled for debug builds.
#[must_use]
pub fn gpu_instance_flags() -> wgpu::InstanceFlags {
    if cfg!(debug_assertions) {
        info!("GPU validation layer enabled (debug build)");
        wgpu::InstanceFlags::VALIDATION | wgpu::InstanceFlags::DEBUG
    } else {
        wgpu::InstanceFlags::empty()
    }
}

/// Creates a wgpu instance with appropriate validation settings.
#[must_use]
pub fn create_validated_instance() -> wgpu::Instance {
    wgpu::Instance::new(wgpu::InstanceDescriptor {
        backends: wgpu::Backends::all(),
        flags: gpu_instance_flags(),
        ..Default::default()
    })
}
