//! Kernel configuration.
//!
//! All tunables are supplied externally and may change at runtime. Instead of
//! dirty-event subscriptions, a [`SharedConfig`] carries an explicit version
//! counter; each owning component compares the counter at the start of its
//! tick and rebuilds its resources when it observes a newer version.

use std::sync::Arc;

use glam::Vec3;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tellus_common::{TellusError, TellusResult};

/// Default number of mesh-extraction workers.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Default readback size-inflation factor.
pub const DEFAULT_READBACK_INFLATION: f32 = 1.25;

/// Voxel-volume geometry shared by every chunk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VolumeConfig {
    /// Number of voxels along the x axis
    pub voxels_x: u32,
    /// Number of voxels along the y axis
    pub voxels_y: u32,
    /// Number of voxels along the z axis
    pub voxels_z: u32,
    /// World-space spacing between adjacent voxels
    pub voxel_spacing: f32,
}

impl Default for VolumeConfig {
    fn default() -> Self {
        Self {
            voxels_x: 33,
            voxels_y: 33,
            voxels_z: 33,
            voxel_spacing: 1.0,
        }
    }
}

impl VolumeConfig {
    /// Creates a cubic volume configuration.
    #[must_use]
    pub const fn cubic(voxels_along_axis: u32, voxel_spacing: f32) -> Self {
        Self {
            voxels_x: voxels_along_axis,
            voxels_y: voxels_along_axis,
            voxels_z: voxels_along_axis,
            voxel_spacing,
        }
    }

    /// Number of cells along each axis (one less than the voxel count).
    #[must_use]
    pub const fn cells(&self) -> [u32; 3] {
        [self.voxels_x - 1, self.voxels_y - 1, self.voxels_z - 1]
    }

    /// Total number of voxels in the volume.
    #[must_use]
    pub const fn voxel_count(&self) -> u32 {
        self.voxels_x * self.voxels_y * self.voxels_z
    }

    /// Total number of cells in the volume.
    #[must_use]
    pub const fn cell_count(&self) -> u32 {
        let [x, y, z] = self.cells();
        x * y * z
    }

    /// World-space dimensions of the voxel volume.
    #[must_use]
    pub fn volume_dimensions(&self) -> Vec3 {
        let [x, y, z] = self.cells();
        self.voxel_spacing * Vec3::new(x as f32, y as f32, z as f32)
    }

    /// World-space dimensions of one chunk.
    ///
    /// Neighboring chunks share a one-voxel overlap so their boundary cells
    /// line up; the chunk footprint is the volume deflated by that overlap
    /// along each axis.
    #[must_use]
    pub fn chunk_dimensions(&self) -> Vec3 {
        const VOXEL_OVERLAP: f32 = 1.0;

        let [x, y, z] = self.cells();
        let inflation = Vec3::new(
            1.0 + VOXEL_OVERLAP / (x as f32 - VOXEL_OVERLAP),
            1.0 + VOXEL_OVERLAP / (y as f32 - VOXEL_OVERLAP),
            1.0 + VOXEL_OVERLAP / (z as f32 - VOXEL_OVERLAP),
        );
        self.volume_dimensions() / inflation
    }

    /// Maximum number of vertices one LOD level can produce.
    #[must_use]
    pub const fn vertex_capacity(&self) -> u32 {
        self.cell_count()
    }

    /// Maximum number of triangle indices one LOD level can produce.
    ///
    /// Each interior cell junction can emit up to six triangles of three
    /// indices each.
    #[must_use]
    pub const fn index_capacity(&self) -> u32 {
        let [x, y, z] = self.cells();
        3 * 6 * (x - 1) * (y - 1) * (z - 1)
    }

    fn validate(&self) -> TellusResult<()> {
        if self.voxels_x < 4 || self.voxels_y < 4 || self.voxels_z < 4 {
            return Err(TellusError::Config(format!(
                "volume needs at least 4 voxels along each axis, got {}x{}x{}",
                self.voxels_x, self.voxels_y, self.voxels_z
            )));
        }
        if self.voxel_spacing <= 0.0 {
            return Err(TellusError::Config(format!(
                "voxel spacing must be positive, got {}",
                self.voxel_spacing
            )));
        }
        Ok(())
    }
}

/// Mesh-extraction pipeline tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContourConfig {
    /// Number of concurrent mesh-extraction workers (1..=16)
    pub worker_count: usize,
    /// Speculative readback inflation factor (1.0..=2.0)
    pub readback_inflation: f32,
    /// Number of tasks to pre-populate the task pool with
    pub initial_task_pool: usize,
}

impl Default for ContourConfig {
    fn default() -> Self {
        Self {
            worker_count: DEFAULT_WORKER_COUNT,
            readback_inflation: DEFAULT_READBACK_INFLATION,
            initial_task_pool: 0,
        }
    }
}

impl ContourConfig {
    fn validate(&self) -> TellusResult<()> {
        if !(1..=16).contains(&self.worker_count) {
            return Err(TellusError::Config(format!(
                "worker count must be in 1..=16, got {}",
                self.worker_count
            )));
        }
        if !(1.0..=2.0).contains(&self.readback_inflation) {
            return Err(TellusError::Config(format!(
                "readback inflation must be in [1.0, 2.0], got {}",
                self.readback_inflation
            )));
        }
        Ok(())
    }
}

/// Chunk-streaming tunables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamingConfig {
    /// Ascending LOD band distances; the last entry is the view distance
    pub lod_distances: Vec<f32>,
    /// Viewer must move this far before the world re-streams
    pub update_interval: f32,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            lod_distances: vec![60.0, 120.0, 240.0],
            update_interval: 20.0,
        }
    }
}

impl StreamingConfig {
    /// Number of LOD bands.
    #[must_use]
    pub fn max_lod(&self) -> usize {
        self.lod_distances.len()
    }

    /// Squared LOD band distances, ascending.
    #[must_use]
    pub fn lod_distances_squared(&self) -> Vec<f32> {
        self.lod_distances.iter().map(|d| d * d).collect()
    }

    /// Squared view distance (the outermost LOD band).
    #[must_use]
    pub fn view_distance_squared(&self) -> f32 {
        let view = self.lod_distances.last().copied().unwrap_or(0.0);
        view * view
    }

    /// Squared update-interval distance.
    #[must_use]
    pub fn update_interval_squared(&self) -> f32 {
        self.update_interval * self.update_interval
    }

    fn validate(&self) -> TellusResult<()> {
        if self.lod_distances.is_empty() {
            return Err(TellusError::Config(
                "at least one LOD distance is required".into(),
            ));
        }
        if !self.lod_distances.windows(2).all(|w| w[0] < w[1]) {
            return Err(TellusError::Config(format!(
                "LOD distances must be strictly ascending, got {:?}",
                self.lod_distances
            )));
        }
        if self.lod_distances[0] <= 0.0 || self.update_interval <= 0.0 {
            return Err(TellusError::Config(
                "LOD distances and update interval must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Aggregate kernel configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct KernelConfig {
    /// Voxel-volume geometry
    pub volume: VolumeConfig,
    /// Mesh-extraction tunables
    pub contour: ContourConfig,
    /// Chunk-streaming tunables
    pub streaming: StreamingConfig,
}

impl KernelConfig {
    /// Validates every section.
    pub fn validate(&self) -> TellusResult<()> {
        self.volume.validate()?;
        self.contour.validate()?;
        self.streaming.validate()
    }
}

struct Versioned {
    version: u64,
    config: KernelConfig,
}

/// Shared, versioned configuration handle.
///
/// Components keep the last version they acted on and compare it against
/// [`SharedConfig::version`] at the start of their tick; a newer version
/// means buffers must be rebuilt (after draining any outstanding readbacks)
/// and the world re-streamed.
#[derive(Clone)]
pub struct SharedConfig {
    inner: Arc<RwLock<Versioned>>,
}

impl SharedConfig {
    /// Creates a new shared configuration, validating it first.
    pub fn new(config: KernelConfig) -> TellusResult<Self> {
        config.validate()?;
        Ok(Self {
            inner: Arc::new(RwLock::new(Versioned { version: 1, config })),
        })
    }

    /// Returns the current configuration version.
    #[must_use]
    pub fn version(&self) -> u64 {
        self.inner.read().version
    }

    /// Returns a snapshot of the current configuration.
    #[must_use]
    pub fn snapshot(&self) -> KernelConfig {
        self.inner.read().config.clone()
    }

    /// Mutates the configuration and bumps the version counter.
    ///
    /// The mutation is rejected (and the version left untouched) if the
    /// resulting configuration fails validation.
    pub fn update(&self, mutate: impl FnOnce(&mut KernelConfig)) -> TellusResult<u64> {
        let mut guard = self.inner.write();
        let mut candidate = guard.config.clone();
        mutate(&mut candidate);
        candidate.validate()?;
        guard.config = candidate;
        guard.version += 1;
        Ok(guard.version)
    }
}

impl std::fmt::Debug for SharedConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.inner.read();
        f.debug_struct("SharedConfig")
            .field("version", &guard.version)
            .field("config", &guard.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(KernelConfig::default().validate().is_ok());
    }

    #[test]
    fn test_volume_derived_counts() {
        let volume = VolumeConfig::cubic(9, 1.0);
        assert_eq!(volume.cells(), [8, 8, 8]);
        assert_eq!(volume.voxel_count(), 9 * 9 * 9);
        assert_eq!(volume.cell_count(), 512);
        assert_eq!(volume.vertex_capacity(), 512);
        assert_eq!(volume.index_capacity(), 3 * 6 * 7 * 7 * 7);
    }

    #[test]
    fn test_chunk_dimensions_deflated_by_overlap() {
        let volume = VolumeConfig::cubic(9, 1.0);
        // 8 cells spanning 8 units, deflated by the shared voxel: 8 / (8/7).
        let dims = volume.chunk_dimensions();
        assert!((dims.x - 7.0).abs() < 1e-5);
        assert!((dims.y - 7.0).abs() < 1e-5);
        assert!((dims.z - 7.0).abs() < 1e-5);
    }

    #[test]
    fn test_streaming_validation() {
        let mut streaming = StreamingConfig::default();
        assert!(streaming.validate().is_ok());

        streaming.lod_distances = vec![100.0, 50.0];
        assert!(streaming.validate().is_err());

        streaming.lod_distances = vec![];
        assert!(streaming.validate().is_err());
    }

    #[test]
    fn test_contour_validation() {
        let mut contour = ContourConfig::default();
        assert!(contour.validate().is_ok());

        contour.readback_inflation = 2.5;
        assert!(contour.validate().is_err());

        contour.readback_inflation = 1.0;
        contour.worker_count = 0;
        assert!(contour.validate().is_err());
    }

    #[test]
    fn test_shared_config_versioning() {
        let shared = SharedConfig::new(KernelConfig::default()).unwrap();
        assert_eq!(shared.version(), 1);

        let version = shared
            .update(|config| config.contour.worker_count = 2)
            .unwrap();
        assert_eq!(version, 2);
        assert_eq!(shared.snapshot().contour.worker_count, 2);

        // An invalid update is rejected and does not bump the version.
        assert!(shared
            .update(|config| config.contour.readback_inflation = 9.0)
            .is_err());
        assert_eq!(shared.version(), 2);
        assert!((shared.snapshot().contour.readback_inflation - 1.25).abs() < f32::EPSILON);
    }
}
