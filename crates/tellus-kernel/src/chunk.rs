//! Chunk state and pooled chunk allocation.
//!
//! A chunk owns its GPU-resident density volume, the meshes of its last
//! completed extraction, and a set of discrete pending operations. The
//! streaming scheduler processes the pending operations each tick in a fixed
//! priority order: volume generation, volume import, edit application, then
//! mesh regeneration. Keeping them as explicit records (rather than a flag
//! bitmask) makes that ordering visible at the call sites.

use std::sync::Arc;

use glam::Vec3;
use tracing::debug;
use wgpu::{Buffer, BufferUsages, Device};

use tellus_common::ChunkCoord;

use crate::config::VolumeConfig;
use crate::vertex::GpuVertex;
use crate::volume::VolumeEdit;
use crate::worker::MeshRequest;

/// Discrete pending operations, processed in declaration order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PendingOps {
    /// Synthesize the density volume fresh.
    pub generate_volume: bool,
    /// Populate the density volume from a persisted file.
    pub import_volume: bool,
    /// Apply the queued volume edits.
    pub apply_edits: bool,
    /// Request mesh extraction at the target LOD.
    pub regenerate_mesh: bool,
}

impl PendingOps {
    /// Returns `true` when any operation is pending.
    #[must_use]
    pub const fn any(&self) -> bool {
        self.generate_volume || self.import_volume || self.apply_edits || self.regenerate_mesh
    }

    /// Clears every pending operation.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Host-side mesh data for one LOD level.
#[derive(Debug, Clone, Default)]
pub struct LodMeshData {
    /// Generated vertices
    pub vertices: Vec<GpuVertex>,
    /// Triangle indices
    pub indices: Vec<u32>,
}

/// One resident terrain chunk.
pub struct Chunk {
    coord: ChunkCoord,
    world_position: Vec3,
    volume: Option<Arc<Buffer>>,
    pub(crate) pending: PendingOps,
    pub(crate) edits: Vec<VolumeEdit>,
    meshes: Vec<LodMeshData>,
    pub(crate) request: Option<MeshRequest>,
    current_lod: Option<usize>,
    target_lod: usize,
    vertex_hints: Vec<u32>,
    index_hints: Vec<u32>,
}

impl Chunk {
    fn empty() -> Self {
        Self {
            coord: ChunkCoord::new(0, 0),
            world_position: Vec3::ZERO,
            volume: None,
            pending: PendingOps::default(),
            edits: Vec::new(),
            meshes: Vec::new(),
            request: None,
            current_lod: None,
            target_lod: 0,
            vertex_hints: Vec::new(),
            index_hints: Vec::new(),
        }
    }

    /// Reset-on-acquire: rebinds the chunk to a coordinate and guarantees a
    /// correctly sized density buffer.
    fn acquire(
        &mut self,
        device: &Device,
        config: &VolumeConfig,
        max_lod: usize,
        coord: ChunkCoord,
        world_position: Vec3,
    ) {
        debug_assert!(self.request.is_none(), "pooled chunk still holds a request");

        self.coord = coord;
        self.world_position = world_position;
        self.pending.clear();
        self.edits.clear();
        self.meshes = vec![LodMeshData::default(); max_lod];
        self.current_lod = None;
        self.target_lod = 0;
        // Without a previous generation, seed the readback sizing with the
        // full capacities so the first extraction never under-estimates.
        self.vertex_hints = vec![config.vertex_capacity(); max_lod];
        self.index_hints = vec![config.index_capacity(); max_lod];
        self.ensure_volume_buffer(device, config);
    }

    /// Creates (or recreates) the density buffer if its size is stale.
    fn ensure_volume_buffer(&mut self, device: &Device, config: &VolumeConfig) {
        let size = u64::from(config.voxel_count()) * 2 * std::mem::size_of::<u32>() as u64;
        let stale = self.volume.as_ref().map_or(true, |buffer| buffer.size() != size);
        if !stale {
            return;
        }

        debug!("Creating {size}-byte volume buffer for {}", self.coord);
        self.volume = Some(Arc::new(device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("Volume {}", self.coord)),
            size,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        })));
    }

    /// The chunk's grid coordinate.
    #[must_use]
    pub const fn coord(&self) -> ChunkCoord {
        self.coord
    }

    /// The chunk's world-space position (its center).
    #[must_use]
    pub const fn world_position(&self) -> Vec3 {
        self.world_position
    }

    /// The chunk's density buffer.
    ///
    /// Present from acquisition until release; pooled chunks may not have
    /// one.
    #[must_use]
    pub fn volume(&self) -> Option<&Arc<Buffer>> {
        self.volume.as_ref()
    }

    /// Per-LOD meshes of the last completed extraction.
    #[must_use]
    pub fn meshes(&self) -> &[LodMeshData] {
        &self.meshes
    }

    /// LOD of the last completed extraction, if any.
    #[must_use]
    pub const fn current_lod(&self) -> Option<usize> {
        self.current_lod
    }

    /// LOD the next extraction will target.
    #[must_use]
    pub const fn target_lod(&self) -> usize {
        self.target_lod
    }

    /// Whether a mesh request is currently in flight for this chunk.
    #[must_use]
    pub fn has_request_in_flight(&self) -> bool {
        self.request.is_some()
    }

    /// Count hints for the next extraction's readback sizing.
    #[must_use]
    pub fn count_hints(&self) -> (Vec<u32>, Vec<u32>) {
        (self.vertex_hints.clone(), self.index_hints.clone())
    }

    /// Queues fresh density synthesis.
    pub fn request_generate_volume(&mut self) {
        self.pending.generate_volume = true;
    }

    /// Queues a density import from persisted storage.
    pub fn request_import_volume(&mut self) {
        self.pending.import_volume = true;
    }

    /// Queues a volume edit, which also forces mesh regeneration.
    pub fn push_edit(&mut self, edit: VolumeEdit) {
        self.edits.push(edit);
        self.pending.apply_edits = true;
        self.pending.regenerate_mesh = true;
    }

    /// Sets the target LOD without queueing regeneration.
    ///
    /// Used at admission, where the follow-up operation (fresh synthesis or
    /// import) is responsible for the one mesh request.
    pub fn prime_target_lod(&mut self, lod: usize) {
        self.target_lod = lod;
    }

    /// Sets the target LOD and queues regeneration if it changed.
    pub fn set_target_lod(&mut self, lod: usize) {
        if self.target_lod != lod {
            self.target_lod = lod;
            self.pending.regenerate_mesh = true;
        }
    }

    /// Queues mesh regeneration at the current target LOD.
    pub fn request_regenerate_mesh(&mut self) {
        self.pending.regenerate_mesh = true;
    }

    /// Records a completed extraction.
    ///
    /// Stores the per-LOD meshes, remembers the exact counts as hints for
    /// the next generation's speculative readbacks, and frees the request
    /// slot.
    pub fn on_mesh_generated(&mut self, meshes: Vec<LodMeshData>) {
        self.vertex_hints = meshes
            .iter()
            .map(|mesh| mesh.vertices.len() as u32)
            .collect();
        self.index_hints = meshes
            .iter()
            .map(|mesh| mesh.indices.len() as u32)
            .collect();
        self.meshes = meshes;
        self.current_lod = Some(self.target_lod);
        self.request = None;
    }

    /// Releases the chunk before it returns to the pool.
    ///
    /// An in-flight request holds no long-term ownership of the chunk, but
    /// it must be canceled so its completion callback never fires for a
    /// coordinate that is no longer resident.
    fn release(&mut self) {
        if let Some(request) = self.request.take() {
            request.cancel();
        }
        self.pending.clear();
        self.edits.clear();
    }
}

impl std::fmt::Debug for Chunk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("coord", &self.coord)
            .field("current_lod", &self.current_lod)
            .field("target_lod", &self.target_lod)
            .field("pending", &self.pending)
            .field("request_in_flight", &self.request.is_some())
            .finish_non_exhaustive()
    }
}

/// Free-list allocator for chunks.
///
/// Chunks are reset on acquire, so releasing is cheap and the pool never
/// holds live requests.
#[derive(Debug, Default)]
pub struct ChunkPool {
    free: Vec<Chunk>,
}

impl ChunkPool {
    /// Creates an empty pool.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Acquires a chunk bound to `coord`, reusing a pooled one when
    /// available.
    pub fn acquire(
        &mut self,
        device: &Device,
        config: &VolumeConfig,
        max_lod: usize,
        coord: ChunkCoord,
        world_position: Vec3,
    ) -> Chunk {
        let mut chunk = self.free.pop().unwrap_or_else(Chunk::empty);
        chunk.acquire(device, config, max_lod, coord, world_position);
        chunk
    }

    /// Releases a chunk back to the pool, canceling any in-flight request.
    pub fn release(&mut self, mut chunk: Chunk) {
        chunk.release();
        self.free.push(chunk);
    }

    /// Number of pooled chunks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.free.len()
    }

    /// Returns `true` when the pool is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.free.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_ops_default_empty() {
        let ops = PendingOps::default();
        assert!(!ops.any());
    }

    #[test]
    fn test_pending_ops_clear() {
        let mut ops = PendingOps {
            generate_volume: true,
            regenerate_mesh: true,
            ..PendingOps::default()
        };
        assert!(ops.any());
        ops.clear();
        assert!(!ops.any());
    }

    #[test]
    fn test_set_target_lod_queues_only_on_change() {
        let mut chunk = Chunk::empty();

        chunk.set_target_lod(0);
        assert!(!chunk.pending.regenerate_mesh);

        chunk.set_target_lod(2);
        assert!(chunk.pending.regenerate_mesh);
        assert_eq!(chunk.target_lod(), 2);

        chunk.pending.clear();
        chunk.set_target_lod(2);
        assert!(!chunk.pending.regenerate_mesh);
    }

    #[test]
    fn test_push_edit_forces_regeneration() {
        let mut chunk = Chunk::empty();
        chunk.push_edit(VolumeEdit::carve(Vec3::ZERO, 2.0));
        assert!(chunk.pending.apply_edits);
        assert!(chunk.pending.regenerate_mesh);
        assert_eq!(chunk.edits.len(), 1);
    }

    #[test]
    fn test_on_mesh_generated_updates_hints() {
        let mut chunk = Chunk::empty();
        chunk.set_target_lod(1);

        let meshes = vec![
            LodMeshData {
                vertices: vec![GpuVertex::default(); 10],
                indices: vec![0; 24],
            },
            LodMeshData::default(),
        ];
        chunk.on_mesh_generated(meshes);

        assert_eq!(chunk.current_lod(), Some(1));
        let (vertex_hints, index_hints) = chunk.count_hints();
        assert_eq!(vertex_hints, vec![10, 0]);
        assert_eq!(index_hints, vec![24, 0]);
        assert!(!chunk.has_request_in_flight());
    }
}
