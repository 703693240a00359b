//! Chunk streaming scheduler.
//!
//! Keeps the set of resident chunks consistent with the viewer position:
//! evicts everything beyond the view distance, admits missing coordinates by
//! breadth-first expansion along the four cardinal directions, assigns each
//! chunk an LOD band by distance, and issues volume/mesh work through the
//! dispatcher. Updates are throttled to viewer movement beyond the
//! configured interval, so standing still costs nothing.

use std::path::PathBuf;
use std::sync::Arc;

use ahash::{AHashMap, AHashSet};
use glam::Vec3;
use parking_lot::Mutex;
use std::collections::VecDeque;
use tracing::{debug, info, warn};
use wgpu::{Device, Queue};

use tellus_common::{ChunkCoord, TellusResult};

use crate::chunk::{Chunk, ChunkPool, LodMeshData};
use crate::chunk_io;
use crate::config::SharedConfig;
use crate::dispatch::ContourDispatcher;
use crate::volume::{VolumeEdit, VolumeGenerator};
use crate::worker::LodMeshView;

/// A finished mesh generation waiting to be applied to its chunk.
struct MeshCompletion {
    coord: ChunkCoord,
    meshes: Vec<LodMeshData>,
}

type CompletionQueue = Arc<Mutex<Vec<MeshCompletion>>>;

/// Returns the LOD band for a squared viewer-to-chunk distance.
///
/// Thresholds are ascending squared distances. Distances beyond the last
/// threshold wrap to band 0, the finest level; that fallback is deliberate
/// and relied upon: chunks past the outermost band are evicted before the
/// wrap could ever be observed.
#[must_use]
pub fn lod_for_distance_squared(lod_distances_squared: &[f32], distance_squared: f32) -> usize {
    let band = lod_distances_squared.partition_point(|&threshold| threshold < distance_squared);
    if band == lod_distances_squared.len() {
        0
    } else {
        band
    }
}

/// The residency changes one streaming update wants to make.
#[derive(Debug, Default)]
pub struct StreamPlan {
    /// Resident coordinates now beyond the view distance.
    pub evict: Vec<ChunkCoord>,
    /// Coordinates to admit, with their LOD band.
    pub admit: Vec<(ChunkCoord, usize)>,
    /// Already-resident coordinates visited by the sweep, with their band.
    pub retarget: Vec<(ChunkCoord, usize)>,
}

/// Plans one streaming update: eviction sweep plus cardinal BFS admission.
///
/// Pure function of the viewer position and the resident set, so the
/// streaming policy is testable without a GPU.
#[must_use]
pub fn compute_stream_plan(
    viewer: Vec3,
    resident: &AHashSet<ChunkCoord>,
    chunk_dimensions: Vec3,
    lod_distances_squared: &[f32],
) -> StreamPlan {
    let view_distance_squared = lod_distances_squared.last().copied().unwrap_or(0.0);
    let mut plan = StreamPlan::default();

    for &coord in resident {
        if coord.distance_squared(chunk_dimensions, viewer) > view_distance_squared {
            plan.evict.push(coord);
        }
    }

    let mut visited: AHashSet<ChunkCoord> = AHashSet::new();
    let mut frontier: VecDeque<(ChunkCoord, usize)> = VecDeque::new();

    let enqueue = |coord: ChunkCoord,
                       visited: &mut AHashSet<ChunkCoord>,
                       frontier: &mut VecDeque<(ChunkCoord, usize)>| {
        if visited.insert(coord) {
            let distance_squared = coord.distance_squared(chunk_dimensions, viewer);
            if distance_squared <= view_distance_squared {
                let lod = lod_for_distance_squared(lod_distances_squared, distance_squared);
                frontier.push_back((coord, lod));
            }
        }
    };

    let origin = ChunkCoord::from_world_position(viewer, chunk_dimensions);
    enqueue(origin, &mut visited, &mut frontier);

    while let Some((coord, lod)) = frontier.pop_front() {
        if resident.contains(&coord) {
            plan.retarget.push((coord, lod));
        } else {
            plan.admit.push((coord, lod));
        }

        for neighbor in coord.cardinal_neighbors() {
            enqueue(neighbor, &mut visited, &mut frontier);
        }
    }

    plan
}

/// Streams terrain chunks around a moving viewer.
pub struct WorldStreamer {
    config: SharedConfig,
    seen_version: u64,
    chunk_dir: PathBuf,
    chunks: AHashMap<ChunkCoord, Chunk>,
    pool: ChunkPool,
    saved: AHashSet<ChunkCoord>,
    dirty_export: AHashSet<ChunkCoord>,
    exporting: bool,
    completions: CompletionQueue,
    last_viewer: Vec3,
    streamed_once: bool,
    // Derived values cached from the current config version.
    chunk_dimensions: Vec3,
    lod_distances_squared: Vec<f32>,
    update_interval_squared: f32,
    max_lod: usize,
}

impl WorldStreamer {
    /// Creates the streamer and inventories the chunk directory.
    pub fn new(config: SharedConfig, chunk_dir: PathBuf) -> Self {
        let snapshot = config.snapshot();
        let saved = chunk_io::scan_chunk_directory(&chunk_dir);

        info!(
            "Creating world streamer: {} LOD bands, view distance {}, {} saved chunks",
            snapshot.streaming.max_lod(),
            snapshot.streaming.lod_distances.last().copied().unwrap_or(0.0),
            saved.len()
        );

        Self {
            seen_version: config.version(),
            chunk_dimensions: snapshot.volume.chunk_dimensions(),
            lod_distances_squared: snapshot.streaming.lod_distances_squared(),
            update_interval_squared: snapshot.streaming.update_interval_squared(),
            max_lod: snapshot.streaming.max_lod(),
            config,
            chunk_dir,
            chunks: AHashMap::new(),
            pool: ChunkPool::new(),
            saved,
            dirty_export: AHashSet::new(),
            exporting: false,
            completions: Arc::new(Mutex::new(Vec::new())),
            last_viewer: Vec3::ZERO,
            streamed_once: false,
        }
    }

    /// Advances the streamer one tick.
    ///
    /// Order: react to a configuration change, apply finished mesh
    /// generations, re-stream if the viewer moved far enough, then process
    /// every chunk's pending operations in priority order.
    pub fn tick(
        &mut self,
        device: &Device,
        queue: &Queue,
        dispatcher: &mut ContourDispatcher,
        generator: &dyn VolumeGenerator,
        viewer: Vec3,
    ) {
        let version = self.config.version();
        if version != self.seen_version {
            self.apply_config_change(version);
        }

        self.apply_completions();

        let moved_squared = viewer.distance_squared(self.last_viewer);
        if !self.streamed_once || moved_squared >= self.update_interval_squared {
            self.last_viewer = viewer;
            self.streamed_once = true;
            self.update_world(device, viewer);
        }

        let coords: Vec<ChunkCoord> = self
            .chunks
            .iter()
            .filter(|(_, chunk)| chunk.pending.any())
            .map(|(&coord, _)| coord)
            .collect();
        for coord in coords {
            self.process_pending_ops(device, queue, dispatcher, generator, coord);
        }
    }

    fn apply_config_change(&mut self, version: u64) {
        info!(
            "Configuration changed (v{} -> v{version}), re-streaming world",
            self.seen_version
        );

        let snapshot = self.config.snapshot();
        self.chunk_dimensions = snapshot.volume.chunk_dimensions();
        self.lod_distances_squared = snapshot.streaming.lod_distances_squared();
        self.update_interval_squared = snapshot.streaming.update_interval_squared();
        self.max_lod = snapshot.streaming.max_lod();
        self.seen_version = version;

        // Release everything; the next tick re-streams from scratch and the
        // pool recreates stale volume buffers on acquire.
        for (_, chunk) in self.chunks.drain() {
            self.pool.release(chunk);
        }
        self.completions.lock().clear();
        self.streamed_once = false;
    }

    fn apply_completions(&mut self) {
        let completions: Vec<MeshCompletion> = self.completions.lock().drain(..).collect();
        for completion in completions {
            if let Some(chunk) = self.chunks.get_mut(&completion.coord) {
                chunk.on_mesh_generated(completion.meshes);
            }
        }
    }

    fn update_world(&mut self, device: &Device, viewer: Vec3) {
        let resident: AHashSet<ChunkCoord> = self.chunks.keys().copied().collect();
        let plan = compute_stream_plan(
            viewer,
            &resident,
            self.chunk_dimensions,
            &self.lod_distances_squared,
        );

        for coord in &plan.evict {
            if let Some(chunk) = self.chunks.remove(coord) {
                debug!("Evicting {coord}");
                self.pool.release(chunk);
            }
        }

        for &(coord, lod) in &plan.retarget {
            if let Some(chunk) = self.chunks.get_mut(&coord) {
                chunk.set_target_lod(lod);
            }
        }

        let volume_config = self.config.snapshot().volume;
        for &(coord, lod) in &plan.admit {
            let position = coord.world_position(self.chunk_dimensions);
            let mut chunk =
                self.pool
                    .acquire(device, &volume_config, self.max_lod, coord, position);
            chunk.prime_target_lod(lod);

            if self.saved.contains(&coord) {
                // Resume from persisted storage; the import op requests the
                // single mesh regeneration itself once the data is in place.
                chunk.request_import_volume();
            } else {
                chunk.request_generate_volume();
                chunk.request_regenerate_mesh();
            }

            self.chunks.insert(coord, chunk);
        }

        debug!(
            "Streamed world: {} resident, {} admitted, {} evicted",
            self.chunks.len(),
            plan.admit.len(),
            plan.evict.len()
        );
    }

    /// Processes one chunk's pending operations in fixed priority order:
    /// volume generation, volume import, edit application, mesh request.
    fn process_pending_ops(
        &mut self,
        device: &Device,
        queue: &Queue,
        dispatcher: &mut ContourDispatcher,
        generator: &dyn VolumeGenerator,
        coord: ChunkCoord,
    ) {
        let volume_config = self.config.snapshot().volume;
        let Some(chunk) = self.chunks.get_mut(&coord) else {
            return;
        };
        let Some(volume) = chunk.volume().cloned() else {
            return;
        };

        if chunk.pending.generate_volume {
            chunk.pending.generate_volume = false;
            generator.generate(device, queue, &volume, chunk.world_position(), &volume_config);
        }

        if chunk.pending.import_volume {
            chunk.pending.import_volume = false;
            match chunk_io::import_volume(queue, &volume, &self.chunk_dir, coord) {
                Ok(()) => chunk.request_regenerate_mesh(),
                Err(err) => {
                    // Treat unreadable saved state as no saved state.
                    warn!("Import failed for {coord}: {err}; synthesizing fresh");
                    generator.generate(
                        device,
                        queue,
                        &volume,
                        chunk.world_position(),
                        &volume_config,
                    );
                    chunk.request_regenerate_mesh();
                }
            }
        }

        if chunk.pending.apply_edits {
            chunk.pending.apply_edits = false;
            generator.apply_edits(
                device,
                queue,
                &volume,
                chunk.world_position(),
                &chunk.edits,
                &volume_config,
            );
            chunk.edits.clear();
            self.dirty_export.insert(coord);
        }

        // A chunk holds at most one outstanding mesh request; regeneration
        // waits until the previous request completes.
        if chunk.pending.regenerate_mesh && !chunk.has_request_in_flight() {
            chunk.pending.regenerate_mesh = false;

            let (vertex_hints, index_hints) = chunk.count_hints();
            let completions = Arc::clone(&self.completions);
            let callback = Box::new(move |views: &[LodMeshView<'_>]| {
                let meshes = views
                    .iter()
                    .map(|view| LodMeshData {
                        vertices: view.vertices.to_vec(),
                        indices: view.indices.to_vec(),
                    })
                    .collect();
                completions.lock().push(MeshCompletion { coord, meshes });
            });

            let request = dispatcher.request_mesh(
                device,
                queue,
                &volume,
                self.max_lod,
                vertex_hints,
                index_hints,
                chunk.world_position(),
                callback,
            );
            chunk.request = Some(request);
        }
    }

    /// Applies a volume edit to every resident chunk it touches.
    ///
    /// Returns the number of chunks affected. Edits are rejected while an
    /// export pass is running.
    pub fn apply_edit(&mut self, edit: VolumeEdit) -> usize {
        if self.exporting {
            debug!("Export in progress, edit skipped");
            return 0;
        }

        let (min, max) = edit.inflated_bounds();
        let min_coord = ChunkCoord::from_world_position(min, self.chunk_dimensions);
        let max_coord = ChunkCoord::from_world_position(max, self.chunk_dimensions);

        let mut touched = 0;
        for z in min_coord.z..=max_coord.z {
            for x in min_coord.x..=max_coord.x {
                let coord = ChunkCoord::new(x, z);
                if let Some(chunk) = self.chunks.get_mut(&coord) {
                    chunk.push_edit(edit);
                    self.dirty_export.insert(coord);
                    touched += 1;
                }
            }
        }
        touched
    }

    /// Exports every chunk touched by edits since the last export pass.
    ///
    /// Returns the number of chunks written. Failures are logged and skip
    /// the chunk; its dirty mark is dropped with the rest of the set, the
    /// way a failed save is surfaced rather than retried forever.
    pub fn export_dirty(&mut self, device: &Device, queue: &Queue) -> TellusResult<usize> {
        if self.exporting {
            debug!("Export already in progress");
            return Ok(0);
        }
        self.exporting = true;

        let coords: Vec<ChunkCoord> = self.dirty_export.drain().collect();
        let mut written = 0;
        for coord in coords {
            let Some(chunk) = self.chunks.get(&coord) else {
                continue;
            };
            let Some(volume) = chunk.volume() else {
                continue;
            };
            match chunk_io::export_volume(device, queue, volume, &self.chunk_dir, coord) {
                Ok(()) => {
                    self.saved.insert(coord);
                    written += 1;
                }
                Err(err) => warn!("Export failed for {coord}: {err}"),
            }
        }

        self.exporting = false;
        Ok(written)
    }

    /// Number of resident chunks.
    #[must_use]
    pub fn resident_count(&self) -> usize {
        self.chunks.len()
    }

    /// Whether a coordinate is resident.
    #[must_use]
    pub fn is_resident(&self, coord: ChunkCoord) -> bool {
        self.chunks.contains_key(&coord)
    }

    /// The resident chunk at `coord`, if any.
    #[must_use]
    pub fn chunk(&self, coord: ChunkCoord) -> Option<&Chunk> {
        self.chunks.get(&coord)
    }

    /// Iterates over all resident chunks.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    /// Coordinates known to have saved volume files.
    #[must_use]
    pub fn saved_coords(&self) -> &AHashSet<ChunkCoord> {
        &self.saved
    }

    /// World-space dimensions of one chunk under the current configuration.
    #[must_use]
    pub const fn chunk_dimensions(&self) -> Vec3 {
        self.chunk_dimensions
    }
}

impl std::fmt::Debug for WorldStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorldStreamer")
            .field("resident", &self.chunks.len())
            .field("pooled", &self.pool.len())
            .field("saved", &self.saved.len())
            .field("dirty_export", &self.dirty_export.len())
            .finish_non_exhaustive()
    }
}
