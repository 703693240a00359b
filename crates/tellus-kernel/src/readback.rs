//! Non-blocking GPU→host readback channel.
//!
//! A [`ReadbackBuffer`] pairs one device-resident storage buffer with a
//! MAP_READ staging buffer of the same capacity. Compute passes bind the
//! storage buffer; the owner starts a readback of up to N elements, polls for
//! completion once per tick, and finalizes the transfer into a host slice.
//! Nothing here blocks the tick thread; the only blocking entry point is
//! [`ReadbackBuffer::drain`], which exists so an outstanding transfer can be
//! forced to completion before the buffer is destroyed or recreated.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use wgpu::{Buffer, BufferUsages, Device, MapMode, Queue};

/// State of the readback channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadbackState {
    /// No readback outstanding.
    Idle,
    /// Copy submitted, map pending.
    InFlight,
    /// Staging buffer mapped, data ready to be read.
    Mapped,
    /// The device reported a transfer fault; no data to read.
    MapFailed,
}

/// One GPU storage buffer with an attached asynchronous readback path.
pub struct ReadbackBuffer {
    buffer: Buffer,
    staging: Buffer,
    element_size: u64,
    capacity: u32,
    requested: u32,
    state: ReadbackState,
    map_result: Arc<Mutex<Option<Result<(), wgpu::BufferAsyncError>>>>,
    error: bool,
    label: String,
}

impl ReadbackBuffer {
    /// Creates a storage buffer of `capacity` elements plus its staging pair.
    ///
    /// `usage` is OR'd into the storage buffer's usages; `COPY_SRC` is always
    /// present so the readback copy can be encoded.
    pub fn new(
        device: &Device,
        label: &str,
        element_size: usize,
        capacity: u32,
        usage: BufferUsages,
    ) -> Self {
        let size = element_size as u64 * u64::from(capacity);

        let buffer = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(label),
            size,
            usage: usage | BufferUsages::COPY_SRC,
            mapped_at_creation: false,
        });

        let staging = device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&format!("{label} staging")),
            size,
            usage: BufferUsages::COPY_DST | BufferUsages::MAP_READ,
            mapped_at_creation: false,
        });

        Self {
            buffer,
            staging,
            element_size: element_size as u64,
            capacity,
            requested: 0,
            state: ReadbackState::Idle,
            map_result: Arc::new(Mutex::new(None)),
            error: false,
            label: label.to_owned(),
        }
    }

    /// Returns the device-resident storage buffer for bind groups and copies.
    #[must_use]
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    /// Returns the element capacity of the buffer.
    #[must_use]
    pub const fn capacity(&self) -> u32 {
        self.capacity
    }

    /// Returns `true` while a readback is outstanding (started but not yet
    /// finalized with [`Self::end_readback`]).
    #[must_use]
    pub fn readback_in_progress(&self) -> bool {
        self.state != ReadbackState::Idle
    }

    /// Returns `true` if the last finished readback reported a transfer
    /// fault. Cleared by the next [`Self::start_readback`].
    #[must_use]
    pub const fn has_error(&self) -> bool {
        self.error
    }

    /// Starts a non-blocking readback of up to `count` elements.
    ///
    /// Encodes a device→staging copy, submits it, and begins the asynchronous
    /// map. Returns immediately. Starting a readback while one is outstanding
    /// is an invariant violation.
    pub fn start_readback(&mut self, device: &Device, queue: &Queue, count: u32) {
        debug_assert_eq!(
            self.state,
            ReadbackState::Idle,
            "readback already outstanding on {}",
            self.label
        );

        let count = count.clamp(1, self.capacity);
        let bytes = u64::from(count) * self.element_size;

        let mut encoder = device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some(&format!("{} readback copy", self.label)),
        });
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &self.staging, 0, bytes);
        queue.submit(std::iter::once(encoder.finish()));

        self.requested = count;
        self.error = false;
        *self.map_result.lock() = None;

        let result_slot = Arc::clone(&self.map_result);
        self.staging
            .slice(0..bytes)
            .map_async(MapMode::Read, move |result| {
                *result_slot.lock() = Some(result);
            });

        self.state = ReadbackState::InFlight;
        debug!("Started readback of {count} elements on {}", self.label);
    }

    /// Non-blocking poll for completion of the outstanding readback.
    pub fn is_data_available(&mut self, device: &Device) -> bool {
        match self.state {
            ReadbackState::Idle => false,
            ReadbackState::Mapped | ReadbackState::MapFailed => true,
            ReadbackState::InFlight => {
                device.poll(wgpu::Maintain::Poll);
                let Some(result) = self.map_result.lock().take() else {
                    return false;
                };
                match result {
                    Ok(()) => self.state = ReadbackState::Mapped,
                    Err(err) => {
                        warn!("GPU readback fault on {}: {err}", self.label);
                        self.error = true;
                        self.state = ReadbackState::MapFailed;
                    }
                }
                true
            }
        }
    }

    /// Finalizes the transfer into `host` and returns the element count
    /// retrieved.
    ///
    /// Must only be called once [`Self::is_data_available`] reports `true`.
    /// On a transfer fault nothing is copied, zero is returned, and
    /// [`Self::has_error`] stays set so the caller can re-issue an
    /// exactly-sized readback.
    pub fn end_readback<T: bytemuck::Pod>(&mut self, host: &mut [T]) -> u32 {
        debug_assert_ne!(
            self.state,
            ReadbackState::InFlight,
            "end_readback before data available on {}",
            self.label
        );
        debug_assert_eq!(std::mem::size_of::<T>() as u64, self.element_size);

        if self.state == ReadbackState::MapFailed {
            self.state = ReadbackState::Idle;
            return 0;
        }
        if self.state != ReadbackState::Mapped {
            return 0;
        }

        let bytes = u64::from(self.requested) * self.element_size;
        let copied = (self.requested as usize).min(host.len());
        {
            let mapped = self.staging.slice(0..bytes).get_mapped_range();
            let elements: &[T] = bytemuck::cast_slice(&mapped);
            host[..copied].copy_from_slice(&elements[..copied]);
        }
        self.staging.unmap();
        self.state = ReadbackState::Idle;

        copied as u32
    }

    /// Forces an outstanding readback to completion, discarding its data.
    ///
    /// Required before the buffer may be destroyed or recreated; leaving a
    /// transfer in flight across destruction leaks the mapping.
    pub fn drain(&mut self, device: &Device) {
        match self.state {
            ReadbackState::Idle => return,
            ReadbackState::InFlight => {
                while self.map_result.lock().is_none() {
                    device.poll(wgpu::Maintain::Wait);
                }
                let result = self.map_result.lock().take();
                match result {
                    Some(Ok(())) => self.state = ReadbackState::Mapped,
                    _ => {
                        self.error = true;
                        self.state = ReadbackState::MapFailed;
                    }
                }
            }
            ReadbackState::Mapped | ReadbackState::MapFailed => {}
        }

        if self.state == ReadbackState::Mapped {
            self.staging.unmap();
        }
        self.state = ReadbackState::Idle;
        debug!("Drained readback on {}", self.label);
    }
}

impl std::fmt::Debug for ReadbackBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadbackBuffer")
            .field("label", &self.label)
            .field("capacity", &self.capacity)
            .field("requested", &self.requested)
            .field("state", &self.state)
            .field("error", &self.error)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::create_validated_instance;

    fn create_test_device() -> Option<(Device, Queue)> {
        let instance = create_validated_instance();

        let adapter = pollster::block_on(instance.request_adapter(&wgpu::RequestAdapterOptions {
            power_preference: wgpu::PowerPreference::LowPower,
            compatible_surface: None,
            force_fallback_adapter: true,
        }))?;

        pollster::block_on(adapter.request_device(&wgpu::DeviceDescriptor::default(), None)).ok()
    }

    fn wait_for_data(buffer: &mut ReadbackBuffer, device: &Device) {
        for _ in 0..1000 {
            if buffer.is_data_available(device) {
                return;
            }
            device.poll(wgpu::Maintain::Wait);
        }
        panic!("readback never completed");
    }

    #[test]
    fn test_idle_channel_reports_no_data() {
        if let Some((device, _queue)) = create_test_device() {
            let mut buffer = ReadbackBuffer::new(
                &device,
                "test",
                std::mem::size_of::<u32>(),
                16,
                BufferUsages::STORAGE | BufferUsages::COPY_DST,
            );
            assert!(!buffer.readback_in_progress());
            assert!(!buffer.is_data_available(&device));
            assert!(!buffer.has_error());
        }
    }

    #[test]
    fn test_readback_round_trip() {
        if let Some((device, queue)) = create_test_device() {
            let mut buffer = ReadbackBuffer::new(
                &device,
                "test",
                std::mem::size_of::<u32>(),
                16,
                BufferUsages::STORAGE | BufferUsages::COPY_DST,
            );

            let data: Vec<u32> = (0..16).collect();
            queue.write_buffer(buffer.buffer(), 0, bytemuck::cast_slice(&data));

            buffer.start_readback(&device, &queue, 8);
            assert!(buffer.readback_in_progress());

            wait_for_data(&mut buffer, &device);

            let mut host = vec![0u32; 16];
            let retrieved = buffer.end_readback(&mut host);
            assert_eq!(retrieved, 8);
            assert_eq!(&host[..8], &data[..8]);
            assert!(!buffer.readback_in_progress());
            assert!(!buffer.has_error());
        }
    }

    #[test]
    fn test_readback_count_clamped_to_capacity() {
        if let Some((device, queue)) = create_test_device() {
            let mut buffer = ReadbackBuffer::new(
                &device,
                "test",
                std::mem::size_of::<u32>(),
                4,
                BufferUsages::STORAGE | BufferUsages::COPY_DST,
            );

            queue.write_buffer(buffer.buffer(), 0, bytemuck::cast_slice(&[7u32, 7, 7, 7]));
            buffer.start_readback(&device, &queue, 1000);
            wait_for_data(&mut buffer, &device);

            let mut host = vec![0u32; 4];
            assert_eq!(buffer.end_readback(&mut host), 4);
            assert_eq!(host, vec![7, 7, 7, 7]);
        }
    }

    #[test]
    fn test_drain_discards_in_flight_transfer() {
        if let Some((device, queue)) = create_test_device() {
            let mut buffer = ReadbackBuffer::new(
                &device,
                "test",
                std::mem::size_of::<u32>(),
                16,
                BufferUsages::STORAGE | BufferUsages::COPY_DST,
            );

            buffer.start_readback(&device, &queue, 16);
            buffer.drain(&device);
            assert!(!buffer.readback_in_progress());

            // The channel is reusable after a drain.
            buffer.start_readback(&device, &queue, 2);
            wait_for_data(&mut buffer, &device);
            let mut host = vec![0u32; 2];
            assert_eq!(buffer.end_readback(&mut host), 2);
        }
    }

    #[test]
    fn test_drain_on_idle_channel_is_noop() {
        if let Some((device, _queue)) = create_test_device() {
            let mut buffer = ReadbackBuffer::new(
                &device,
                "test",
                std::mem::size_of::<u32>(),
                16,
                BufferUsages::STORAGE | BufferUsages::COPY_DST,
            );
            buffer.drain(&device);
            assert!(!buffer.readback_in_progress());
        }
    }
}
