//! Mesh-extraction worker.
//!
//! A [`Worker`] owns, for the duration of one bound task, a full set of GPU
//! and host staging buffers per LOD level. Binding a task encodes the
//! four-pass contouring sequence for every LOD and starts speculative
//! readbacks; [`Worker::advance`] is then called once per tick until every
//! LOD has finalized.
//!
//! ## Speculative readback sizing
//!
//! Retrieving the generated vertices normally costs two sequential GPU round
//! trips: one for the counter, one for the data. Instead the counters are
//! copied into the head of the triangle buffer and a speculatively sized
//! readback of both buffers starts in the same submission. When the data
//! arrives the true counts are compared against what was retrieved; an
//! under-estimate (or a transfer fault) triggers a single exactly-sized
//! second readback. Best case one round trip per LOD, worst case two, never
//! more.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use glam::Vec3;
use tracing::{debug, warn};
use wgpu::util::DeviceExt;
use wgpu::{Buffer, BufferUsages, Device, Queue};

use crate::config::KernelConfig;
use crate::pipeline::{ContourParams, ContourPipeline, TRIANGLE_HEADER_SLOTS};
use crate::readback::ReadbackBuffer;
use crate::vertex::GpuVertex;

/// Result of polling a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerStatus {
    /// At least one LOD still has a readback outstanding.
    WaitingForReadback,
    /// Every LOD has finalized; the mesh data is ready.
    Done,
}

/// Per-LOD progress through the readback protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LodPhase {
    /// No extraction running for this LOD.
    Idle,
    /// First, speculatively sized readback outstanding.
    AwaitingFirst,
    /// Exactly-sized second readback outstanding.
    Retrying,
    /// Data accepted as final.
    Final,
}

/// A pooled mesh-generation task.
///
/// Tasks are reset on acquire, carry a shared cancel flag, and reference the
/// requesting chunk's density buffer only for the duration of the job.
pub struct MeshTask {
    pub(crate) volume: Option<Arc<Buffer>>,
    pub(crate) max_lod: usize,
    pub(crate) vertex_hints: Vec<u32>,
    pub(crate) index_hints: Vec<u32>,
    pub(crate) world_offset: Vec3,
    pub(crate) callback: Option<MeshCallback>,
    pub(crate) cancel: Arc<AtomicBool>,
}

impl MeshTask {
    pub(crate) fn empty() -> Self {
        Self {
            volume: None,
            max_lod: 0,
            vertex_hints: Vec::new(),
            index_hints: Vec::new(),
            world_offset: Vec3::ZERO,
            callback: None,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Reset-on-acquire: rebinds the task to a fresh request.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn bind(
        &mut self,
        volume: Arc<Buffer>,
        max_lod: usize,
        vertex_hints: Vec<u32>,
        index_hints: Vec<u32>,
        world_offset: Vec3,
        callback: MeshCallback,
    ) -> MeshRequest {
        self.volume = Some(volume);
        self.max_lod = max_lod;
        self.vertex_hints = vertex_hints;
        self.index_hints = index_hints;
        self.world_offset = world_offset;
        self.callback = Some(callback);
        self.cancel = Arc::new(AtomicBool::new(false));
        MeshRequest {
            canceled: Arc::clone(&self.cancel),
        }
    }

    /// Releases per-request resources before the task returns to the pool.
    pub(crate) fn release(&mut self) {
        self.volume = None;
        self.callback = None;
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for MeshTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MeshTask")
            .field("max_lod", &self.max_lod)
            .field("world_offset", &self.world_offset)
            .field("canceled", &self.is_canceled())
            .finish_non_exhaustive()
    }
}

/// Handle to an issued mesh-generation request.
///
/// Canceling a request that is still queued short-circuits it back to the
/// task pool; canceling a dispatched request lets the GPU cycle finish
/// naturally but suppresses the completion callback.
#[derive(Debug, Clone)]
pub struct MeshRequest {
    canceled: Arc<AtomicBool>,
}

impl MeshRequest {
    /// Cancels the request.
    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::Relaxed);
    }

    /// Returns whether the request has been canceled.
    #[must_use]
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Relaxed)
    }
}

/// One LOD's view of a finished extraction.
#[derive(Debug, Clone, Copy)]
pub struct LodMeshView<'a> {
    /// Exactly `vertex_count` generated vertices
    pub vertices: &'a [GpuVertex],
    /// Exactly `index_count` triangle indices
    pub indices: &'a [u32],
}

/// Callback invoked with the per-LOD mesh data of a completed task.
pub type MeshCallback = Box<dyn FnMut(&[LodMeshView<'_>])>;

/// One vertex buffer and its append counter; swapped as a unit while the
/// merge pass ping-pongs.
struct VertexStream {
    buffer: ReadbackBuffer,
    counter: Buffer,
}

impl VertexStream {
    fn new(device: &Device, label: &str, capacity: u32) -> Self {
        Self {
            buffer: ReadbackBuffer::new(
                device,
                label,
                GpuVertex::SIZE,
                capacity,
                BufferUsages::STORAGE | BufferUsages::COPY_DST,
            ),
            counter: create_counter(device, &format!("{label} counter")),
        }
    }
}

fn create_counter(device: &Device, label: &str) -> Buffer {
    device.create_buffer(&wgpu::BufferDescriptor {
        label: Some(label),
        size: std::mem::size_of::<u32>() as u64,
        usage: BufferUsages::STORAGE | BufferUsages::COPY_SRC | BufferUsages::COPY_DST,
        mapped_at_creation: false,
    })
}

struct LodState {
    cell_info: Buffer,
    front: VertexStream,
    back: VertexStream,
    triangles: ReadbackBuffer,
    triangle_counter: Buffer,
    host_vertices: Vec<GpuVertex>,
    host_triangles: Vec<u32>,
    phase: LodPhase,
    retried: bool,
    vertex_count: u32,
    index_count: u32,
}

impl LodState {
    fn new(device: &Device, lod: usize, vertex_capacity: u32, index_capacity: u32, cell_count: u32) -> Self {
        let cell_info = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("Cell Info LOD {lod}")),
            size: u64::from(cell_count) * std::mem::size_of::<u32>() as u64,
            usage: BufferUsages::STORAGE | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let triangle_capacity = index_capacity + TRIANGLE_HEADER_SLOTS;

        Self {
            cell_info,
            front: VertexStream::new(device, &format!("Vertices A LOD {lod}"), vertex_capacity),
            back: VertexStream::new(device, &format!("Vertices B LOD {lod}"), vertex_capacity),
            triangles: ReadbackBuffer::new(
                device,
                &format!("Triangles LOD {lod}"),
                std::mem::size_of::<u32>(),
                triangle_capacity,
                BufferUsages::STORAGE | BufferUsages::COPY_DST,
            ),
            triangle_counter: create_counter(device, &format!("Triangle Counter LOD {lod}")),
            host_vertices: vec![GpuVertex::default(); vertex_capacity as usize],
            host_triangles: vec![0; triangle_capacity as usize],
            phase: LodPhase::Idle,
            retried: false,
            vertex_count: 0,
            index_count: 0,
        }
    }
}

/// Estimates the element count of the next readback from the previous
/// generation's count, inflated by the configured factor and the LOD step.
#[must_use]
pub fn estimate_count(hint: u32, lod: usize, next_lod: usize, inflation: f32, capacity: u32) -> u32 {
    let factor = inflation * 2f32.powi((next_lod - lod) as i32);
    let estimate = (factor * hint as f32).round() as u32;
    estimate.clamp(1, capacity)
}

/// A mesh-extraction worker: one concurrent extraction job's buffers and
/// readback state machine.
pub struct Worker {
    lods: Vec<LodState>,
    voxels: [u32; 3],
    cells: [u32; 3],
    voxel_spacing: f32,
    inflation: f32,
    vertex_capacity: u32,
    index_capacity: u32,
}

impl Worker {
    /// Creates a worker with buffers sized from the configuration.
    pub fn new(device: &Device, config: &KernelConfig) -> Self {
        let volume = &config.volume;
        let max_lod = config.streaming.max_lod();
        let vertex_capacity = volume.vertex_capacity();
        let index_capacity = volume.index_capacity();

        let lods = (0..max_lod)
            .map(|lod| {
                LodState::new(
                    device,
                    lod,
                    vertex_capacity,
                    index_capacity,
                    volume.cell_count(),
                )
            })
            .collect();

        Self {
            lods,
            voxels: [volume.voxels_x, volume.voxels_y, volume.voxels_z],
            cells: volume.cells(),
            voxel_spacing: volume.voxel_spacing,
            inflation: config.contour.readback_inflation,
            vertex_capacity,
            index_capacity,
        }
    }

    /// Encodes the full contouring pass sequence for `task` and starts the
    /// first, speculatively sized readback for every LOD.
    ///
    /// Non-blocking: GPU work is submitted and the worker suspends until the
    /// next [`Self::advance`].
    pub fn generate(
        &mut self,
        device: &Device,
        queue: &Queue,
        pipeline: &ContourPipeline,
        task: &MeshTask,
    ) {
        let volume = task
            .volume
            .as_ref()
            .unwrap_or_else(|| unreachable!("task bound without a volume buffer"));

        for lod in 0..self.lods.len().min(task.max_lod) {
            self.encode_lod(device, queue, pipeline, volume, task, lod);
        }
        // LODs beyond the task's target finalize immediately as empty.
        for state in self.lods.iter_mut().skip(task.max_lod) {
            state.vertex_count = 0;
            state.index_count = 0;
            state.phase = LodPhase::Final;
        }
    }

    fn encode_lod(
        &mut self,
        device: &Device,
        queue: &Queue,
        pipeline: &ContourPipeline,
        volume: &Buffer,
        task: &MeshTask,
        lod: usize,
    ) {
        let voxels = self.voxels;
        let voxel_spacing = self.voxel_spacing;
        let cells = self.cells;
        let vertex_capacity = self.vertex_capacity;
        let index_capacity = self.index_capacity;
        let inflation = self.inflation;

        let state = &mut self.lods[lod];
        debug_assert_eq!(state.phase, LodPhase::Idle, "LOD {lod} already in flight");

        let params_at = |stride: u32| {
            let params = ContourParams::new(task.world_offset, voxels, voxel_spacing, stride);
            device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Contour Params Buffer"),
                contents: bytemuck::bytes_of(&params),
                usage: BufferUsages::UNIFORM,
            })
        };

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("Contour Encoder"),
        });

        // Zeroed cell info means "no vertex"; the counters restart at zero.
        encoder.clear_buffer(&state.cell_info, 0, None);
        encoder.clear_buffer(&state.front.counter, 0, None);
        encoder.clear_buffer(&state.triangle_counter, 0, None);

        // Pass 0: inner cell vertices at the finest detail.
        let finest = params_at(1);
        let bind_group = pipeline.create_bind_group(
            device,
            volume,
            &state.cell_info,
            state.back.buffer.buffer(),
            state.front.buffer.buffer(),
            state.triangles.buffer(),
            &state.front.counter,
            &state.triangle_counter,
            &finest,
        );
        pipeline.dispatch_generate(&mut encoder, &bind_group, cells);

        // Pass 1: merge vertices at doubling strides, ping-ponging the
        // vertex streams so each iteration reads what the previous wrote.
        let mut stride = 2;
        while stride <= (1 << lod) {
            encoder.clear_buffer(&state.back.counter, 0, None);
            let params = params_at(stride);
            let bind_group = pipeline.create_bind_group(
                device,
                volume,
                &state.cell_info,
                state.front.buffer.buffer(),
                state.back.buffer.buffer(),
                state.triangles.buffer(),
                &state.back.counter,
                &state.triangle_counter,
                &params,
            );
            pipeline.dispatch_merge(&mut encoder, &bind_group, cells, stride);
            std::mem::swap(&mut state.front, &mut state.back);
            stride <<= 1;
        }

        // Pass 2: re-populate the boundary shell at the finest detail.
        let bind_group = pipeline.create_bind_group(
            device,
            volume,
            &state.cell_info,
            state.back.buffer.buffer(),
            state.front.buffer.buffer(),
            state.triangles.buffer(),
            &state.front.counter,
            &state.triangle_counter,
            &finest,
        );
        pipeline.dispatch_boundary(&mut encoder, &bind_group, cells);

        // Pass 3: triangulate.
        let bind_group = pipeline.create_bind_group(
            device,
            volume,
            &state.cell_info,
            state.front.buffer.buffer(),
            state.back.buffer.buffer(),
            state.triangles.buffer(),
            &state.front.counter,
            &state.triangle_counter,
            &finest,
        );
        pipeline.dispatch_triangulate(&mut encoder, &bind_group, cells);

        // Copy the vertex and triangle counters into the triangle buffer's
        // reserved header slots so one readback returns counts and data.
        encoder.copy_buffer_to_buffer(&state.front.counter, 0, state.triangles.buffer(), 0, 4);
        encoder.copy_buffer_to_buffer(&state.triangle_counter, 0, state.triangles.buffer(), 4, 4);

        queue.submit(std::iter::once(encoder.finish()));

        let next_lod = lod + 1;
        let vertex_estimate = estimate_count(
            task.vertex_hints.get(lod).copied().unwrap_or(vertex_capacity),
            lod,
            next_lod,
            inflation,
            vertex_capacity,
        );
        let index_estimate = estimate_count(
            task.index_hints.get(lod).copied().unwrap_or(index_capacity),
            lod,
            next_lod,
            inflation,
            index_capacity,
        );

        state
            .front
            .buffer
            .start_readback(device, queue, vertex_estimate);
        state
            .triangles
            .start_readback(device, queue, index_estimate + TRIANGLE_HEADER_SLOTS);
        state.phase = LodPhase::AwaitingFirst;

        debug!(
            "LOD {lod}: dispatched, first readback sized {vertex_estimate}v / {index_estimate}i"
        );
    }

    /// Advances the readback state machine one step; call at most once per
    /// tick.
    pub fn advance(&mut self, device: &Device, queue: &Queue) -> WorkerStatus {
        let mut all_final = true;

        for (lod, state) in self.lods.iter_mut().enumerate() {
            match state.phase {
                LodPhase::Final => {}
                LodPhase::Idle => {
                    debug_assert!(false, "advance called with LOD {lod} idle");
                }
                LodPhase::AwaitingFirst | LodPhase::Retrying => {
                    let vertices_ready = state.front.buffer.is_data_available(device);
                    let triangles_ready = state.triangles.is_data_available(device);
                    if !(vertices_ready && triangles_ready) {
                        all_final = false;
                        continue;
                    }

                    let retrieved_vertices = state.front.buffer.end_readback(&mut state.host_vertices);
                    let retrieved_triangles = state.triangles.end_readback(&mut state.host_triangles);
                    let faulted = state.front.buffer.has_error() || state.triangles.has_error();

                    // The header slots carry the true counts.
                    if retrieved_triangles >= TRIANGLE_HEADER_SLOTS {
                        state.vertex_count = state.host_triangles[0].min(self.vertex_capacity);
                        state.index_count =
                            (3 * state.host_triangles[1]).min(self.index_capacity);
                    } else {
                        state.vertex_count = 0;
                        state.index_count = 0;
                    }

                    if state.phase == LodPhase::Retrying {
                        // The exactly-sized second readback is always final.
                        state.phase = LodPhase::Final;
                        continue;
                    }

                    let retrieved_indices =
                        retrieved_triangles.saturating_sub(TRIANGLE_HEADER_SLOTS);
                    let under_estimated = retrieved_vertices < state.vertex_count
                        || retrieved_indices < state.index_count;

                    if faulted || under_estimated {
                        if faulted {
                            warn!("GPU readback error detected on LOD {lod}; retrying");
                        }
                        // A fault leaves the true counts unknown; fall back to
                        // the full capacity so the retry cannot come up short.
                        let vertex_retry = if faulted {
                            self.vertex_capacity
                        } else {
                            state.vertex_count
                        };
                        let index_retry = if faulted {
                            self.index_capacity
                        } else {
                            state.index_count
                        };
                        state
                            .front
                            .buffer
                            .start_readback(device, queue, vertex_retry.max(1));
                        state.triangles.start_readback(
                            device,
                            queue,
                            index_retry + TRIANGLE_HEADER_SLOTS,
                        );
                        state.phase = LodPhase::Retrying;
                        state.retried = true;
                        all_final = false;
                    } else {
                        state.phase = LodPhase::Final;
                    }
                }
            }
        }

        if all_final {
            WorkerStatus::Done
        } else {
            WorkerStatus::WaitingForReadback
        }
    }

    /// Returns the per-LOD mesh data of a finished job.
    ///
    /// Valid only after [`Self::advance`] reported [`WorkerStatus::Done`].
    #[must_use]
    pub fn output(&self) -> Vec<LodMeshView<'_>> {
        self.lods
            .iter()
            .map(|state| {
                let vertex_count = state.vertex_count as usize;
                let index_count = state.index_count as usize;
                let index_start = TRIANGLE_HEADER_SLOTS as usize;
                LodMeshView {
                    vertices: &state.host_vertices[..vertex_count],
                    indices: &state.host_triangles[index_start..index_start + index_count],
                }
            })
            .collect()
    }

    /// Per-LOD vertex counts of the last finished job.
    #[must_use]
    pub fn vertex_counts(&self) -> Vec<u32> {
        self.lods.iter().map(|state| state.vertex_count).collect()
    }

    /// Per-LOD index counts of the last finished job.
    #[must_use]
    pub fn index_counts(&self) -> Vec<u32> {
        self.lods.iter().map(|state| state.index_count).collect()
    }

    /// Number of LODs whose last job needed the exactly-sized second
    /// readback.
    #[must_use]
    pub fn retried_lod_count(&self) -> usize {
        self.lods.iter().filter(|state| state.retried).count()
    }

    /// Returns the worker to its idle state after a job completes.
    pub fn reset(&mut self) {
        for state in &mut self.lods {
            debug_assert!(
                !state.front.buffer.readback_in_progress()
                    && !state.triangles.readback_in_progress(),
                "worker reset with readback outstanding"
            );
            state.phase = LodPhase::Idle;
            state.retried = false;
        }
    }

    /// Force-completes every outstanding readback, discarding the data.
    ///
    /// Must run before the worker's buffers are recreated or dropped while a
    /// job is in flight.
    pub fn drain(&mut self, device: &Device) {
        for state in &mut self.lods {
            state.front.buffer.drain(device);
            state.back.buffer.drain(device);
            state.triangles.drain(device);
            state.phase = LodPhase::Idle;
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("lods", &self.lods.len())
            .field("cells", &self.cells)
            .field("vertex_capacity", &self.vertex_capacity)
            .field("index_capacity", &self.index_capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_estimate_doubles_per_lod_step() {
        // inflation 1.25, one LOD step: round(1.25 * 2 * 100) = 250.
        assert_eq!(estimate_count(100, 0, 1, 1.25, 10_000), 250);
        // Two LOD steps quadruple.
        assert_eq!(estimate_count(100, 0, 2, 1.0, 10_000), 400);
    }

    #[test]
    fn test_estimate_clamps_to_capacity() {
        assert_eq!(estimate_count(10_000, 0, 1, 2.0, 512), 512);
    }

    #[test]
    fn test_estimate_floor_is_one() {
        // A zero hint must still request at least one element.
        assert_eq!(estimate_count(0, 0, 1, 1.5, 512), 1);
    }

    #[test]
    fn test_mesh_request_cancel() {
        // Binding needs a real buffer; skip without an adapter.
        let Some(buffer) = test_buffer() else {
            return;
        };

        let mut task = MeshTask::empty();
        assert!(!task.is_canceled());

        let request = task.bind(Arc::new(buffer), 1, vec![1], vec![1], Vec3::ZERO, Box::new(|_| {}));
        assert!(!request.is_canceled());
        request.cancel();
        assert!(request.is_canceled());
        assert!(task.is_canceled());
    }

    fn test_buffer() -> Option<Buffer> {
        let instance = crate::validation::create_validated_instance();
        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::LowPower,
            compatible_surface: None,
            force_fallback_adapter: true,
        }))?;
        let (device, _queue) =
            pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor::default(), None))
                .ok()?;
        Some(device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("test volume"),
            size: 4,
            usage: BufferUsages::STORAGE,
            mapped_at_creation: false,
        }))
    }
}
