//! Worker pool and mesh-request dispatcher.
//!
//! A fixed-size pool of [`Worker`]s plus a FIFO backlog of pooled tasks.
//! Requests bind an idle worker immediately when one exists; otherwise they
//! queue. The dispatcher advances every in-flight job exactly once per tick
//! and drains the backlog into workers that became idle since the previous
//! tick, so tasks are served FIFO once capacity frees up.

use std::collections::VecDeque;
use std::sync::Arc;

use glam::Vec3;
use tracing::{debug, info};
use wgpu::{Buffer, Device, Queue};

use crate::config::SharedConfig;
use crate::pipeline::ContourPipeline;
use crate::worker::{MeshCallback, MeshRequest, MeshTask, Worker, WorkerStatus};

struct Job {
    worker: Worker,
    task: MeshTask,
}

/// Dispatches mesh-generation requests onto a bounded worker pool.
pub struct ContourDispatcher {
    config: SharedConfig,
    seen_version: u64,
    pipeline: ContourPipeline,
    idle_workers: Vec<Worker>,
    jobs: Vec<Job>,
    backlog: VecDeque<MeshTask>,
    task_pool: Vec<MeshTask>,
    worker_count: usize,
}

impl ContourDispatcher {
    /// Creates the dispatcher, its pipeline, and the initial worker pool.
    pub fn new(device: &Device, config: SharedConfig) -> Self {
        let snapshot = config.snapshot();
        let worker_count = snapshot.contour.worker_count;

        info!(
            "Creating contour dispatcher with {worker_count} workers, {} LOD levels",
            snapshot.streaming.max_lod()
        );

        let pipeline = ContourPipeline::new(device);
        let idle_workers = (0..worker_count)
            .map(|_| Worker::new(device, &snapshot))
            .collect();
        let task_pool = (0..snapshot.contour.initial_task_pool)
            .map(|_| MeshTask::empty())
            .collect();

        Self {
            seen_version: config.version(),
            config,
            pipeline,
            idle_workers,
            jobs: Vec::new(),
            backlog: VecDeque::new(),
            task_pool,
            worker_count,
        }
    }

    /// Requests mesh generation for a chunk's density volume.
    ///
    /// The per-LOD count hints seed the speculative readback sizing; pass
    /// the counts of the chunk's previous generation, or the buffer
    /// capacities when no previous generation exists.
    #[allow(clippy::too_many_arguments)]
    pub fn request_mesh(
        &mut self,
        device: &Device,
        queue: &Queue,
        volume: &Arc<Buffer>,
        max_lod: usize,
        vertex_hints: Vec<u32>,
        index_hints: Vec<u32>,
        world_offset: Vec3,
        callback: MeshCallback,
    ) -> MeshRequest {
        let mut task = self.task_pool.pop().unwrap_or_else(MeshTask::empty);
        let request = task.bind(
            Arc::clone(volume),
            max_lod,
            vertex_hints,
            index_hints,
            world_offset,
            callback,
        );

        if let Some(worker) = self.idle_workers.pop() {
            self.dispatch(device, queue, worker, task);
        } else {
            debug!("No idle worker, queueing mesh request at {world_offset}");
            self.backlog.push_back(task);
        }

        request
    }

    fn dispatch(&mut self, device: &Device, queue: &Queue, mut worker: Worker, task: MeshTask) {
        debug_assert!(!task.is_canceled());
        worker.generate(device, queue, &self.pipeline, &task);
        self.jobs.push(Job { worker, task });
    }

    /// Advances the dispatcher one tick.
    ///
    /// Order: react to a configuration change, advance every in-flight job
    /// once, then drain the backlog into any workers that became idle. This
    /// is the single scheduling opportunity per tick.
    pub fn tick(&mut self, device: &Device, queue: &Queue) {
        let version = self.config.version();
        if version != self.seen_version {
            self.apply_config_change(device, version);
        }

        self.advance_jobs(device, queue);
        self.drain_backlog(device, queue);
    }

    fn advance_jobs(&mut self, device: &Device, queue: &Queue) {
        let mut index = 0;
        while index < self.jobs.len() {
            let status = self.jobs[index].worker.advance(device, queue);
            if status != WorkerStatus::Done {
                index += 1;
                continue;
            }

            let Job { mut worker, mut task } = self.jobs.swap_remove(index);

            // A task canceled after dispatch completes its readback cycle
            // normally; only the callback is suppressed.
            if !task.is_canceled() {
                let views = worker.output();
                if let Some(callback) = task.callback.as_mut() {
                    callback(&views);
                }
            }

            worker.reset();
            task.release();
            self.task_pool.push(task);

            // The pool may have shrunk while this worker was busy; excess
            // workers are torn down instead of returned.
            if self.idle_workers.len() + self.jobs.len() < self.worker_count {
                self.idle_workers.push(worker);
            } else {
                debug!("Worker pool over capacity, tearing worker down");
            }
        }
    }

    fn drain_backlog(&mut self, device: &Device, queue: &Queue) {
        while !self.idle_workers.is_empty() {
            let Some(mut task) = self.backlog.pop_front() else {
                break;
            };

            // Canceled while queued: straight back to the pool, no GPU work.
            if task.is_canceled() {
                task.release();
                self.task_pool.push(task);
                continue;
            }

            let worker = self
                .idle_workers
                .pop()
                .unwrap_or_else(|| unreachable!("idle stack checked above"));
            self.dispatch(device, queue, worker, task);
        }
    }

    fn apply_config_change(&mut self, device: &Device, version: u64) {
        info!(
            "Configuration changed (v{} -> v{version}), rebuilding worker pool",
            self.seen_version
        );

        // Buffers may not be recreated while readbacks are outstanding:
        // force-drain every in-flight job first. Their callbacks are
        // suppressed; the streaming layer re-requests after the re-stream.
        for job in &mut self.jobs {
            job.worker.drain(device);
        }
        for Job { mut task, .. } in self.jobs.drain(..) {
            task.release();
            self.task_pool.push(task);
        }
        for mut task in self.backlog.drain(..) {
            task.release();
            self.task_pool.push(task);
        }

        let snapshot = self.config.snapshot();
        self.worker_count = snapshot.contour.worker_count;
        self.idle_workers = (0..self.worker_count)
            .map(|_| Worker::new(device, &snapshot))
            .collect();
        self.seen_version = version;
    }

    /// Number of workers currently idle.
    #[must_use]
    pub fn idle_worker_count(&self) -> usize {
        self.idle_workers.len()
    }

    /// Number of jobs currently bound to workers.
    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.jobs.len()
    }

    /// Number of tasks waiting in the backlog.
    #[must_use]
    pub fn backlog_len(&self) -> usize {
        self.backlog.len()
    }

    /// Number of pooled, unbound tasks.
    #[must_use]
    pub fn pooled_task_count(&self) -> usize {
        self.task_pool.len()
    }

    /// Returns `true` when no job is in flight and the backlog is empty.
    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.jobs.is_empty() && self.backlog.is_empty()
    }
}

impl std::fmt::Debug for ContourDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContourDispatcher")
            .field("worker_count", &self.worker_count)
            .field("idle", &self.idle_workers.len())
            .field("in_flight", &self.jobs.len())
            .field("backlog", &self.backlog.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{KernelConfig, StreamingConfig, VolumeConfig};
    use crate::validation::create_validated_instance;
    use crate::volume::{HeightfieldGenerator, VolumeGenerator};

    fn create_test_device() -> Option<(Device, Queue)> {
        let instance = create_validated_instance();

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::LowPower,
            compatible_surface: None,
            force_fallback_adapter: true,
        }))?;

        pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor::default(), None)).ok()
    }

    fn small_config(worker_count: usize) -> SharedConfig {
        let mut config = KernelConfig {
            volume: VolumeConfig::cubic(9, 1.0),
            streaming: StreamingConfig {
                lod_distances: vec![40.0, 80.0],
                update_interval: 10.0,
            },
            ..KernelConfig::default()
        };
        config.contour.worker_count = worker_count;
        SharedConfig::new(config).unwrap()
    }

    fn create_volume(device: &Device, queue: &Queue, config: &SharedConfig) -> Arc<Buffer> {
        let snapshot = config.snapshot();
        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("test volume"),
            size: u64::from(snapshot.volume.voxel_count()) * 8,
            usage: wgpu::BufferUsages::STORAGE
                | wgpu::BufferUsages::COPY_DST
                | wgpu::BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });
        let generator = HeightfieldGenerator::new(device);
        generator.generate(device, queue, &buffer, Vec3::ZERO, &snapshot.volume);
        Arc::new(buffer)
    }

    fn run_until_idle(dispatcher: &mut ContourDispatcher, device: &Device, queue: &Queue) {
        for _ in 0..2000 {
            dispatcher.tick(device, queue);
            if dispatcher.is_idle() {
                return;
            }
            device.poll(wgpu::Maintain::Wait);
        }
        panic!("dispatcher never went idle");
    }

    #[test]
    fn test_pool_bound_and_fifo_overflow() {
        if let Some((device, queue)) = create_test_device() {
            let config = small_config(2);
            let mut dispatcher = ContourDispatcher::new(&device, config.clone());
            let volume = create_volume(&device, &queue, &config);

            for _ in 0..3 {
                let _request = dispatcher.request_mesh(
                    &device,
                    &queue,
                    &volume,
                    2,
                    vec![64, 64],
                    vec![128, 128],
                    Vec3::ZERO,
                    Box::new(|_| {}),
                );
            }

            // Exactly two dispatch immediately, the third queues.
            assert_eq!(dispatcher.in_flight_count(), 2);
            assert_eq!(dispatcher.backlog_len(), 1);
            assert_eq!(dispatcher.idle_worker_count(), 0);

            run_until_idle(&mut dispatcher, &device, &queue);
            assert_eq!(dispatcher.idle_worker_count(), 2);
            assert_eq!(dispatcher.pooled_task_count(), 3);
        }
    }

    #[test]
    fn test_cancel_queued_task_skips_gpu_work() {
        if let Some((device, queue)) = create_test_device() {
            let config = small_config(1);
            let mut dispatcher = ContourDispatcher::new(&device, config.clone());
            let volume = create_volume(&device, &queue, &config);

            let _busy = dispatcher.request_mesh(
                &device,
                &queue,
                &volume,
                2,
                vec![64, 64],
                vec![128, 128],
                Vec3::ZERO,
                Box::new(|_| {}),
            );
            let queued = dispatcher.request_mesh(
                &device,
                &queue,
                &volume,
                2,
                vec![64, 64],
                vec![128, 128],
                Vec3::ZERO,
                Box::new(|_| panic!("canceled queued task must not run")),
            );
            assert_eq!(dispatcher.backlog_len(), 1);

            queued.cancel();
            run_until_idle(&mut dispatcher, &device, &queue);

            // The queued task returned to the pool without ever binding a
            // worker; only the first job ran.
            assert_eq!(dispatcher.pooled_task_count(), 2);
            assert_eq!(dispatcher.idle_worker_count(), 1);
        }
    }

    #[test]
    fn test_cancel_dispatched_suppresses_callback() {
        if let Some((device, queue)) = create_test_device() {
            let config = small_config(1);
            let mut dispatcher = ContourDispatcher::new(&device, config.clone());
            let volume = create_volume(&device, &queue, &config);

            let request = dispatcher.request_mesh(
                &device,
                &queue,
                &volume,
                2,
                vec![64, 64],
                vec![128, 128],
                Vec3::ZERO,
                Box::new(|_| panic!("canceled dispatched task must not call back")),
            );
            assert_eq!(dispatcher.in_flight_count(), 1);

            request.cancel();
            run_until_idle(&mut dispatcher, &device, &queue);

            // The readback cycle still completed and reclaimed resources.
            assert_eq!(dispatcher.pooled_task_count(), 1);
            assert_eq!(dispatcher.idle_worker_count(), 1);
        }
    }

    #[test]
    fn test_config_change_rebuilds_pool() {
        if let Some((device, queue)) = create_test_device() {
            let config = small_config(2);
            let mut dispatcher = ContourDispatcher::new(&device, config.clone());
            let volume = create_volume(&device, &queue, &config);

            let _request = dispatcher.request_mesh(
                &device,
                &queue,
                &volume,
                2,
                vec![64, 64],
                vec![128, 128],
                Vec3::ZERO,
                Box::new(|_| panic!("callback must be suppressed across a config change")),
            );

            config
                .update(|config| config.contour.worker_count = 3)
                .unwrap();
            dispatcher.tick(&device, &queue);

            assert_eq!(dispatcher.in_flight_count(), 0);
            assert_eq!(dispatcher.idle_worker_count(), 3);
            assert_eq!(dispatcher.pooled_task_count(), 1);
        }
    }
}
